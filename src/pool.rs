//! Dedicated event-loop threads and the shared round-robin pool
//!
//! Every negotiated session is owned by exactly one [`EventLoop`]: a thread
//! running a single-threaded async runtime that drains a task channel in
//! submission order. Host calls are marshaled onto the owning loop with
//! [`EventLoop::run`], which blocks the caller until the loop has executed
//! the submitted task. Native callbacks for the session are dispatched on
//! the same thread, so host-initiated mutations and native events form one
//! total order per session without extra locking.
//!
//! Spinning up a loop per connection is wasteful under high connection
//! counts, so [`ThreadPool`] amortizes loops across connections: two
//! fixed-size rings (plain worker loops and I/O-capable loops) populated
//! lazily on first touch and handed out round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use futures::future::LocalBoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

/// Capability of an event-loop thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// Timer-capable loop for serialization work
    Worker,
    /// Loop whose runtime also drives socket I/O
    Io,
}

/// A dedicated thread executing submitted tasks strictly in order.
pub struct EventLoop {
    name: String,
    kind: LoopKind,
    thread_id: thread::ThreadId,
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawn a new loop thread. Thread or runtime start failure is fatal
    /// for the caller; no loop is created.
    pub fn spawn(name: &str, kind: LoopKind) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_name = name.to_string();
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut builder = tokio::runtime::Builder::new_current_thread();
                match kind {
                    LoopKind::Worker => builder.enable_time(),
                    LoopKind::Io => builder.enable_all(),
                };
                let runtime = match builder.build() {
                    Ok(runtime) => {
                        let _ = ready_tx.send(Ok(thread::current().id()));
                        runtime
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                runtime.block_on(async move {
                    while let Some(task) = rx.recv().await {
                        task().await;
                    }
                });
                debug!(name = %thread_name, "event loop drained and stopped");
            })
            .map_err(|err| Error::ThreadStart(err.to_string()))?;

        let thread_id = match ready_rx.recv() {
            Ok(Ok(id)) => id,
            Ok(Err(message)) => {
                let _ = join.join();
                return Err(Error::ThreadStart(message));
            }
            Err(_) => {
                let _ = join.join();
                return Err(Error::ThreadStart(
                    "event loop exited before signalling readiness".to_string(),
                ));
            }
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            thread_id,
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        })
    }

    /// Loop name, as given at spawn time
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loop capability
    pub fn kind(&self) -> LoopKind {
        self.kind
    }

    /// Blocking call: submit `f` to the loop and block the calling thread
    /// until the loop has executed it, returning its value.
    ///
    /// Submitting from the loop's own thread would deadlock and is
    /// rejected with [`Error::InvalidState`].
    pub fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + 'static,
        T: Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Err(Error::InvalidState(
                "blocking submit from the loop's own thread".to_string(),
            ));
        }

        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("event loop stopped".to_string()))?;

        let (done_tx, done_rx) = std::sync::mpsc::sync_channel::<T>(1);
        let task: Task = Box::new(move || {
            Box::pin(async move {
                let value = f().await;
                let _ = done_tx.send(value);
            })
        });
        tx.send(task)
            .map_err(|_| Error::InvalidState("event loop stopped".to_string()))?;

        done_rx
            .recv()
            .map_err(|_| Error::InvalidState("event loop terminated".to_string()))
    }

    /// Stop the loop: already-queued tasks are drained, then the thread
    /// exits and is joined.
    pub fn stop(&self) {
        self.tx.lock().take();
        if thread::current().id() == self.thread_id {
            // Stopping from inside a task; the loop exits on its own once
            // the queue drains and nobody is left to join it here.
            return;
        }
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                warn!(name = %self.name, "event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Rings {
    workers: Vec<Option<Arc<EventLoop>>>,
    io_workers: Vec<Option<Arc<EventLoop>>>,
}

/// Fixed-size ring of lazily-created event loops, handed out round-robin.
///
/// Both rings (plain and I/O-capable) share one advancing cursor. A slot is
/// populated at most once: readers check it under a shared lock and only
/// the first thread to find it empty re-checks and fills it under the
/// exclusive lock.
pub struct ThreadPool {
    rings: RwLock<Rings>,
    cursor: AtomicUsize,
    size: usize,
}

#[derive(Clone, Copy)]
enum Ring {
    Worker,
    Io,
}

impl ThreadPool {
    /// Create a pool with `size` slots per ring (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            rings: RwLock::new(Rings {
                workers: vec![None; size],
                io_workers: vec![None; size],
            }),
            cursor: AtomicUsize::new(0),
            size,
        }
    }

    /// Slots per ring
    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquire a loop for serialization work.
    pub fn acquire(&self) -> Result<Arc<EventLoop>> {
        self.slot(Ring::Worker)
    }

    /// Acquire an I/O-capable loop.
    pub fn acquire_io(&self) -> Result<Arc<EventLoop>> {
        self.slot(Ring::Io)
    }

    fn slot(&self, ring: Ring) -> Result<Arc<EventLoop>> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.size;

        {
            let rings = self.rings.read();
            let slots = match ring {
                Ring::Worker => &rings.workers,
                Ring::Io => &rings.io_workers,
            };
            if let Some(event_loop) = &slots[index] {
                return Ok(event_loop.clone());
            }
        }

        let mut rings = self.rings.write();
        let slots = match ring {
            Ring::Worker => &mut rings.workers,
            Ring::Io => &mut rings.io_workers,
        };
        // Re-check: another thread may have populated the slot between the
        // shared unlock and this exclusive acquisition.
        if let Some(event_loop) = &slots[index] {
            return Ok(event_loop.clone());
        }
        let (prefix, kind) = match ring {
            Ring::Worker => ("pool-worker", LoopKind::Worker),
            Ring::Io => ("pool-io", LoopKind::Io),
        };
        let event_loop = Arc::new(EventLoop::spawn(&format!("{prefix}-{index}"), kind)?);
        slots[index] = Some(event_loop.clone());
        debug!(slot = index, kind = ?kind, "pool slot populated");
        Ok(event_loop)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let rings = self.rings.get_mut();
        for slot in rings.workers.iter().chain(rings.io_workers.iter()) {
            if let Some(event_loop) = slot {
                event_loop.stop();
            }
        }
    }
}
