//! Stream adapter
//!
//! Wraps one bidirectional transport stream. Outbound, exactly one send is
//! in flight at a time; the buffer is released when `on_send_complete`
//! fires. Inbound, everything natively available for one receive event is
//! coalesced into a single contiguous buffer and delivery pauses until the
//! host returns credit via `receive_complete`; an unconsumed tail is
//! re-delivered as the next receive event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::handle::{EventSlot, Handle, HostContext};
use crate::quic::events::{NoopStreamEvents, StreamEvents};
use crate::quic::QuicDriver;

const RECV_CHUNK_BYTES: usize = 64 * 1024;
const RECV_EVENT_CAP_BYTES: usize = 256 * 1024;

/// Adapter around one bidirectional stream
pub struct Stream {
    handle: Handle,
    driver: Arc<QuicDriver>,
    slot: Arc<EventSlot<dyn StreamEvents>>,
    send: Mutex<Option<quinn::SendStream>>,
    started: AtomicBool,
    send_in_flight: AtomicBool,
    ack_tx: mpsc::UnboundedSender<usize>,
    armed: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    closed_flag: AtomicBool,
    shutdown_fired: AtomicBool,
}

impl Stream {
    /// Actively open a stream on `conn`. The open completes asynchronously:
    /// `on_start_complete` on success, `on_shutdown_complete` on failure.
    pub(crate) fn open(
        conn: quinn::Connection,
        driver: Arc<QuicDriver>,
        events: Arc<dyn StreamEvents>,
        ctx: HostContext,
    ) -> Arc<Self> {
        let (stream, ack_rx) = Self::build(driver.clone(), events, ctx, true, false, None);
        let task = stream.clone();
        driver.spawn(async move {
            match conn.open_bi().await {
                Ok((send, recv)) => {
                    *task.send.lock().await = Some(send);
                    task.started.store(true, Ordering::Release);
                    task.slot
                        .sink()
                        .on_start_complete(task.handle, task.slot.context());
                    task.receive_loop(recv, ack_rx).await;
                }
                Err(err) => {
                    debug!(stream = %task.handle, error = %err, "stream open failed");
                    task.fire_shutdown();
                }
            }
        });
        stream
    }

    /// Wrap a peer-initiated stream the native stack already created.
    /// Events go to a no-op sink, and no data is read, until the host
    /// attaches a sink.
    pub(crate) fn adopt(
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        driver: Arc<QuicDriver>,
    ) -> Arc<Self> {
        let (stream, ack_rx) = Self::build(
            driver.clone(),
            Arc::new(NoopStreamEvents),
            HostContext::default(),
            false,
            true,
            Some(send),
        );
        let task = stream.clone();
        driver.spawn(async move {
            if !task.wait_armed().await {
                return;
            }
            task.receive_loop(recv, ack_rx).await;
        });
        stream
    }

    fn build(
        driver: Arc<QuicDriver>,
        events: Arc<dyn StreamEvents>,
        ctx: HostContext,
        armed: bool,
        started: bool,
        send: Option<quinn::SendStream>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<usize>) {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (armed_tx, _) = watch::channel(armed);
        let (closed_tx, _) = watch::channel(false);
        let stream = Arc::new(Self {
            handle: Handle::next(),
            driver,
            slot: Arc::new(EventSlot::new(events, ctx)),
            send: Mutex::new(send),
            started: AtomicBool::new(started),
            send_in_flight: AtomicBool::new(false),
            ack_tx,
            armed: armed_tx,
            closed: closed_tx,
            closed_flag: AtomicBool::new(false),
            shutdown_fired: AtomicBool::new(false),
        });
        (stream, ack_rx)
    }

    /// Adapter handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Attach the host event sink and context; for adopted streams this
    /// also starts the receive loop.
    pub fn set_events(&self, events: Arc<dyn StreamEvents>, ctx: HostContext) {
        self.slot.set_sink(events);
        self.slot.set_context(ctx);
        let _ = self.armed.send(true);
    }

    /// Update the host context carried by subsequent events
    pub fn set_context(&self, ctx: HostContext) {
        self.slot.set_context(ctx);
    }

    /// Queue one buffer for sending. Admission only: returns `false` when
    /// the stream is not started, already closed, or a send is still in
    /// flight. The copied buffer is released exactly once, when
    /// `on_send_complete` fires.
    pub fn send(self: Arc<Self>, data: &[u8]) -> bool {
        if self.closed_flag.load(Ordering::Acquire) || !self.started.load(Ordering::Acquire) {
            return false;
        }
        if self.send_in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }

        let payload = Bytes::copy_from_slice(data);
        let task = self.clone();
        self.driver.spawn(async move {
            let mut guard = task.send.lock().await;
            let sent = match guard.as_mut() {
                Some(send) => send.write_all(&payload).await.is_ok(),
                None => false,
            };
            drop(guard);
            task.send_in_flight.store(false, Ordering::Release);
            if sent {
                task.slot
                    .sink()
                    .on_send_complete(task.handle, task.slot.context());
            } else {
                task.fire_shutdown();
            }
        });
        true
    }

    /// Return flow-control credit for `consumed` bytes of the last
    /// delivered receive buffer. A partial acknowledgement re-delivers the
    /// remaining tail as the next receive event.
    pub fn receive_complete(&self, consumed: usize) {
        let _ = self.ack_tx.send(consumed);
    }

    async fn wait_armed(&self) -> bool {
        let mut armed = self.armed.subscribe();
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return false;
            }
            if *armed.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = armed.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut recv: quinn::RecvStream,
        mut ack_rx: mpsc::UnboundedReceiver<usize>,
    ) {
        let mut closed = self.closed.subscribe();
        let mut pending: Option<Bytes> = None;
        loop {
            let payload = match pending.take() {
                Some(tail) => tail,
                None => {
                    let chunk = tokio::select! {
                        chunk = read_event(&mut recv) => chunk,
                        _ = closed_signal(&mut closed) => None,
                    };
                    match chunk {
                        Some(bytes) => bytes,
                        None => break,
                    }
                }
            };

            self.slot
                .sink()
                .on_receive(self.handle, &payload, self.slot.context());

            let consumed = tokio::select! {
                ack = ack_rx.recv() => match ack {
                    Some(consumed) => consumed,
                    None => break,
                },
                _ = closed_signal(&mut closed) => break,
            };
            if consumed < payload.len() {
                pending = Some(payload.slice(consumed..));
            }
        }
        self.fire_shutdown();
    }

    fn fire_shutdown(&self) {
        if !self.shutdown_fired.swap(true, Ordering::AcqRel) {
            self.slot
                .sink()
                .on_shutdown_complete(self.handle, self.slot.context());
        }
    }

    /// Tear the stream down: unregister the sink, finish the send side and
    /// stop the receive loop. Idempotent.
    pub(crate) fn shutdown(self: Arc<Self>) {
        if self.closed_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slot.set_sink(Arc::new(NoopStreamEvents));
        let _ = self.closed.send(true);
        let task = self.clone();
        self.driver.spawn(async move {
            let mut guard = task.send.lock().await;
            if let Some(mut send) = guard.take() {
                let _ = send.finish();
            }
        });
        debug!(stream = %self.handle, "stream closed");
    }
}

async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Read everything natively available for one receive event, concatenating
/// every fragment into one contiguous buffer.
async fn read_event(recv: &mut quinn::RecvStream) -> Option<Bytes> {
    let first = match recv.read_chunk(RECV_CHUNK_BYTES, true).await {
        Ok(Some(chunk)) => chunk.bytes,
        Ok(None) | Err(_) => return None,
    };
    let mut total = first.len();
    let mut fragments = vec![first];
    while total < RECV_EVENT_CAP_BYTES {
        match recv.read_chunk(RECV_CHUNK_BYTES, true).now_or_never() {
            Some(Ok(Some(chunk))) => {
                total += chunk.bytes.len();
                fragments.push(chunk.bytes);
            }
            _ => break,
        }
    }
    Some(coalesce(fragments))
}

fn coalesce(fragments: Vec<Bytes>) -> Bytes {
    if fragments.len() == 1 {
        return fragments.into_iter().next().unwrap_or_default();
    }
    let total = fragments.iter().map(Bytes::len).sum();
    let mut buffer = BytesMut::with_capacity(total);
    for fragment in &fragments {
        buffer.extend_from_slice(fragment);
    }
    buffer.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_concatenates_fragments() {
        let fragments = vec![Bytes::from(vec![1u8; 10]), Bytes::from(vec![2u8; 20])];
        let merged = coalesce(fragments);
        assert_eq!(merged.len(), 30);
        assert!(merged[..10].iter().all(|b| *b == 1));
        assert!(merged[10..].iter().all(|b| *b == 2));
    }

    #[test]
    fn test_coalesce_single_fragment_is_passthrough() {
        let fragment = Bytes::from_static(b"payload");
        let merged = coalesce(vec![fragment.clone()]);
        assert_eq!(merged, fragment);
    }

    #[test]
    fn test_coalesce_empty_input() {
        assert!(coalesce(Vec::new()).is_empty());
    }
}
