//! Opaque handles, host contexts and the adapter arena
//!
//! Every adapter the host can touch lives in a [`HandleTable`] keyed by an
//! opaque [`Handle`]. The table owns the adapter (native wrapper plus its
//! event-sink state) as one unit; removing the entry is what releases the
//! adapter. Handles are minted from one process-wide counter so no two live
//! adapters of any kind ever share an identifier.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-local identifier standing for one adapter instance.
///
/// A handle is valid from creation success until the matching `delete_*`
/// call on the [`Bridge`](crate::Bridge) returns; afterwards every
/// operation on it reports [`Error::UnknownHandle`](crate::Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub(crate) fn next() -> Self {
        Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw integer value, for host-side bookkeeping and logging
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque host correlation value carried unmodified through every event.
///
/// The adapter never interprets it; it exists purely so the host can map
/// events back to its own per-object state. Mutable via the `set_*_context`
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostContext(pub u64);

/// Arena mapping handles to live adapters of one family.
pub(crate) struct HandleTable<T> {
    entries: DashMap<Handle, Arc<T>>,
}

impl<T> HandleTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, handle: Handle, value: Arc<T>) {
        self.entries.insert(handle, value);
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<Arc<T>> {
        self.entries.get(&handle).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        self.entries.remove(&handle).map(|(_, value)| value)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An adapter's event sink together with its host context.
///
/// The sink is swappable: adapters born from native events start with a
/// no-op sink until the host attaches its own, and teardown swaps the
/// no-op back in before the native resource is closed so a late native
/// callback can never reach a dangling sink.
pub(crate) struct EventSlot<E: ?Sized> {
    sink: Mutex<Arc<E>>,
    context: AtomicU64,
}

impl<E: ?Sized> EventSlot<E> {
    pub(crate) fn new(sink: Arc<E>, context: HostContext) -> Self {
        Self {
            sink: Mutex::new(sink),
            context: AtomicU64::new(context.0),
        }
    }

    pub(crate) fn sink(&self) -> Arc<E> {
        self.sink.lock().clone()
    }

    pub(crate) fn set_sink(&self, sink: Arc<E>) {
        *self.sink.lock() = sink;
    }

    pub(crate) fn context(&self) -> HostContext {
        HostContext(self.context.load(Ordering::Relaxed))
    }

    pub(crate) fn set_context(&self, context: HostContext) {
        self.context.store(context.0, Ordering::Relaxed);
    }
}
