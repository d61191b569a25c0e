//! Host-facing event sinks for the stream-transport stack
//!
//! All callbacks are invoked from the transport driver's worker threads;
//! events for one connection or stream are delivered in order on that
//! resource's task, with no ordering guarantee across resources.

use crate::handle::{Handle, HostContext};

/// Host event sink for one transport connection
#[allow(unused_variables)]
pub trait ConnectionEvents: Send + Sync + 'static {
    /// Handshake completed
    fn on_connected(&self, conn: Handle, ctx: HostContext) {}

    /// The connection is gone: idle timeout, peer shutdown or transport
    /// shutdown all arrive here, exactly once.
    fn on_shutdown_complete(&self, conn: Handle, ctx: HostContext) {}

    /// The peer opened a stream; the adapter is registered under `stream`
    /// with a no-op sink until the host attaches one.
    fn on_peer_stream(&self, conn: Handle, stream: Handle, ctx: HostContext) {}
}

/// Host event sink for one transport stream
#[allow(unused_variables)]
pub trait StreamEvents: Send + Sync + 'static {
    /// An actively opened stream finished starting
    fn on_start_complete(&self, stream: Handle, ctx: HostContext) {}

    /// Data arrived, coalesced into one contiguous buffer. Delivery
    /// pauses until the host acknowledges consumption via
    /// `stream_receive_complete`.
    fn on_receive(&self, stream: Handle, data: &[u8], ctx: HostContext) {}

    /// The pending send finished and its buffer was released
    fn on_send_complete(&self, stream: Handle, ctx: HostContext) {}

    /// The stream is gone, exactly once
    fn on_shutdown_complete(&self, stream: Handle, ctx: HostContext) {}
}

/// Host event sink for one listener
#[allow(unused_variables)]
pub trait ListenerEvents: Send + Sync + 'static {
    /// An inbound session completed its handshake; the adapter is
    /// registered under `conn` with a no-op sink until the host attaches
    /// one.
    fn on_new_connection(&self, listener: Handle, conn: Handle, ctx: HostContext) {}

    /// The accept loop ended
    fn on_stop_complete(&self, listener: Handle, ctx: HostContext) {}
}

pub(crate) struct NoopConnectionEvents;

impl ConnectionEvents for NoopConnectionEvents {}

pub(crate) struct NoopStreamEvents;

impl StreamEvents for NoopStreamEvents {}

pub(crate) struct NoopListenerEvents;

impl ListenerEvents for NoopListenerEvents {}
