//! The uniform handle-based surface
//!
//! [`Bridge`] owns the arenas for every adapter family plus the transport
//! driver. Hosts create adapters through it, drive them by handle, and
//! destroy them with the `delete_*` calls, which perform each family's
//! documented teardown order before releasing the arena entry. A handle
//! that is stale or belongs to another family reports
//! [`Error::UnknownHandle`].

use std::sync::Arc;

use crate::config::{ChannelConfig, ConnectConfig, ListenConfig, PeerConfig};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleTable, HostContext};
use crate::pool::ThreadPool;
use crate::quic::events::{ConnectionEvents, ListenerEvents, StreamEvents};
use crate::quic::{Connection, Listener, QuicDriver, Stream};
use crate::rtc::events::{ChannelEvents, PeerEvents, SdpType, SessionError};
use crate::rtc::{DataChannel, PeerConnection, MAX_SEND_QUEUE_SIZE};

/// Owner of all adapter arenas and the transport driver
pub struct Bridge {
    driver: Arc<QuicDriver>,
    peers: Arc<HandleTable<PeerConnection>>,
    channels: Arc<HandleTable<DataChannel>>,
    connections: Arc<HandleTable<Connection>>,
    streams: Arc<HandleTable<Stream>>,
    listeners: Arc<HandleTable<Listener>>,
}

impl Bridge {
    /// Create an empty bridge. Fails only if the transport driver's worker
    /// threads cannot start.
    pub fn new() -> Result<Self> {
        Ok(Self {
            driver: QuicDriver::new()?,
            peers: Arc::new(HandleTable::new()),
            channels: Arc::new(HandleTable::new()),
            connections: Arc::new(HandleTable::new()),
            streams: Arc::new(HandleTable::new()),
            listeners: Arc::new(HandleTable::new()),
        })
    }

    fn peer(&self, handle: Handle) -> Result<Arc<PeerConnection>> {
        self.peers.get(handle).ok_or(Error::UnknownHandle(handle))
    }

    fn channel(&self, handle: Handle) -> Result<Arc<DataChannel>> {
        self.channels.get(handle).ok_or(Error::UnknownHandle(handle))
    }

    fn connection(&self, handle: Handle) -> Result<Arc<Connection>> {
        self.connections
            .get(handle)
            .ok_or(Error::UnknownHandle(handle))
    }

    fn stream(&self, handle: Handle) -> Result<Arc<Stream>> {
        self.streams.get(handle).ok_or(Error::UnknownHandle(handle))
    }

    fn listener(&self, handle: Handle) -> Result<Arc<Listener>> {
        self.listeners
            .get(handle)
            .ok_or(Error::UnknownHandle(handle))
    }

    // ------------------------------------------------------------------
    // Negotiated sessions
    // ------------------------------------------------------------------

    /// Create and start a peer connection. `pool` shares signaling loops
    /// across connections; without it the session owns a dedicated loop.
    pub fn new_peer_connection(
        &self,
        config: &PeerConfig,
        pool: Option<&ThreadPool>,
        events: Arc<dyn PeerEvents>,
        ctx: HostContext,
    ) -> Result<Handle> {
        let peer = PeerConnection::open(config, pool, events, ctx, self.channels.clone())?;
        let handle = peer.handle();
        self.peers.insert(handle, peer);
        Ok(handle)
    }

    /// Request an offer; the result arrives via `on_offer`.
    pub fn create_offer(&self, peer: Handle) -> Result<()> {
        self.peer(peer)?.create_offer()
    }

    /// Request an answer; the result arrives via `on_answer`.
    pub fn create_answer(&self, peer: Handle) -> Result<()> {
        self.peer(peer)?.create_answer()
    }

    /// Apply a local description; completion arrives via
    /// `on_set_local_description`.
    pub fn set_local_description(&self, peer: Handle, sdp_type: SdpType, sdp: &str) -> Result<()> {
        self.peer(peer)?.set_description(true, sdp_type, sdp)
    }

    /// Apply a remote description; completion arrives via
    /// `on_set_remote_description`.
    pub fn set_remote_description(&self, peer: Handle, sdp_type: SdpType, sdp: &str) -> Result<()> {
        self.peer(peer)?.set_description(false, sdp_type, sdp)
    }

    /// Current local description, if any
    pub fn local_description(&self, peer: Handle) -> Result<Option<(SdpType, String)>> {
        self.peer(peer)?.description(true)
    }

    /// Current remote description, if any
    pub fn remote_description(&self, peer: Handle) -> Result<Option<(SdpType, String)>> {
        self.peer(peer)?.description(false)
    }

    /// Enqueue a remote ICE candidate; parse failures are synchronous
    pub fn add_ice_candidate(
        &self,
        peer: Handle,
        mid: &str,
        mline_index: u16,
        candidate: &str,
    ) -> Result<()> {
        self.peer(peer)?.add_ice_candidate(mid, mline_index, candidate)
    }

    /// Create a data channel on the session
    pub fn create_data_channel(
        &self,
        peer: Handle,
        config: &ChannelConfig,
        events: Arc<dyn ChannelEvents>,
        ctx: HostContext,
    ) -> Result<Handle> {
        let channel = self.peer(peer)?.create_data_channel(config, events, ctx)?;
        Ok(channel.handle())
    }

    /// Update the session's host context
    pub fn set_peer_context(&self, peer: Handle, ctx: HostContext) -> Result<()> {
        self.peer(peer)?.set_context(ctx);
        Ok(())
    }

    /// Close the session and release its handle
    pub fn delete_peer_connection(&self, peer: Handle) -> Result<()> {
        let adapter = self.peer(peer)?;
        adapter.shutdown();
        self.peers.remove(peer);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data channels
    // ------------------------------------------------------------------

    /// Queue one message; `false` means the send was not admitted
    pub fn channel_send(&self, channel: Handle, data: &[u8]) -> Result<bool> {
        Ok(self.channel(channel)?.send(data))
    }

    /// Attach the host sink to a channel delivered via `on_data_channel`
    pub fn set_channel_events(
        &self,
        channel: Handle,
        events: Arc<dyn ChannelEvents>,
        ctx: HostContext,
    ) -> Result<()> {
        self.channel(channel)?.set_events(events, ctx);
        Ok(())
    }

    /// Update the channel's host context
    pub fn set_channel_context(&self, channel: Handle, ctx: HostContext) -> Result<()> {
        self.channel(channel)?.set_context(ctx);
        Ok(())
    }

    /// Channel label
    pub fn channel_label(&self, channel: Handle) -> Result<String> {
        Ok(self.channel(channel)?.label())
    }

    /// True when the channel has no retransmit/lifetime limit
    pub fn channel_reliable(&self, channel: Handle) -> Result<bool> {
        Ok(self.channel(channel)?.reliable())
    }

    /// True when messages are delivered in order
    pub fn channel_ordered(&self, channel: Handle) -> Result<bool> {
        Ok(self.channel(channel)?.ordered())
    }

    /// Application protocol tag
    pub fn channel_protocol(&self, channel: Handle) -> Result<String> {
        Ok(self.channel(channel)?.protocol())
    }

    /// True when the channel was negotiated out of band
    pub fn channel_negotiated(&self, channel: Handle) -> Result<bool> {
        Ok(self.channel(channel)?.negotiated())
    }

    /// Channel state as an integer code
    pub fn channel_state(&self, channel: Handle) -> Result<i32> {
        Ok(self.channel(channel)?.state_code())
    }

    /// Most recent native channel error, `None` when clean
    pub fn channel_last_error(&self, channel: Handle) -> Result<Option<SessionError>> {
        Ok(self.channel(channel)?.last_error())
    }

    /// Messages sent so far
    pub fn channel_messages_sent(&self, channel: Handle) -> Result<u32> {
        Ok(self.channel(channel)?.messages_sent())
    }

    /// Messages received so far
    pub fn channel_messages_received(&self, channel: Handle) -> Result<u32> {
        Ok(self.channel(channel)?.messages_received())
    }

    /// Bytes sent so far
    pub fn channel_bytes_sent(&self, channel: Handle) -> Result<u64> {
        Ok(self.channel(channel)?.bytes_sent())
    }

    /// Bytes received so far
    pub fn channel_bytes_received(&self, channel: Handle) -> Result<u64> {
        Ok(self.channel(channel)?.bytes_received())
    }

    /// Currently queued outbound bytes
    pub fn channel_buffered_amount(&self, channel: Handle) -> Result<u64> {
        Ok(self.channel(channel)?.buffered_amount())
    }

    /// Maximum allowed send-queue size in bytes
    pub fn channel_max_send_queue_size(&self, channel: Handle) -> Result<u64> {
        Ok(self.channel(channel)?.max_send_queue_size())
    }

    /// Unregister, close and release a channel
    pub fn delete_data_channel(&self, channel: Handle) -> Result<()> {
        let adapter = self.channel(channel)?;
        adapter.shutdown();
        self.channels.remove(channel);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stream transport
    // ------------------------------------------------------------------

    /// Create an idle outbound connection adapter
    pub fn new_connection(&self, events: Arc<dyn ConnectionEvents>, ctx: HostContext) -> Handle {
        let conn = Connection::new(self.driver.clone(), events, ctx, self.streams.clone());
        let handle = conn.handle();
        self.connections.insert(handle, conn);
        handle
    }

    /// Configure credentials and start the handshake
    pub fn connection_start(&self, conn: Handle, config: &ConnectConfig) -> Result<()> {
        self.connection(conn)?.start(config)
    }

    /// Local or remote address, cached after first resolution
    pub fn connection_address(&self, conn: Handle, local: bool) -> Result<Option<String>> {
        Ok(self.connection(conn)?.address(local))
    }

    /// Reconfigure the idle timeout (only before start)
    pub fn set_connection_idle_timeout(&self, conn: Handle, idle_timeout_ms: u64) -> Result<()> {
        self.connection(conn)?.set_idle_timeout(idle_timeout_ms)
    }

    /// Attach the host sink to a connection delivered via
    /// `on_new_connection`
    pub fn set_connection_events(
        &self,
        conn: Handle,
        events: Arc<dyn ConnectionEvents>,
        ctx: HostContext,
    ) -> Result<()> {
        self.connection(conn)?.set_events(events, ctx);
        Ok(())
    }

    /// Update the connection's host context
    pub fn set_connection_context(&self, conn: Handle, ctx: HostContext) -> Result<()> {
        self.connection(conn)?.set_context(ctx);
        Ok(())
    }

    /// Actively open a stream on the connection
    pub fn open_stream(
        &self,
        conn: Handle,
        events: Arc<dyn StreamEvents>,
        ctx: HostContext,
    ) -> Result<Handle> {
        Ok(self.connection(conn)?.open_stream(events, ctx)?.handle())
    }

    /// Accept the next peer-initiated stream, blocking until one arrives
    pub fn accept_stream(
        &self,
        conn: Handle,
        events: Arc<dyn StreamEvents>,
        ctx: HostContext,
    ) -> Result<Handle> {
        Ok(self.connection(conn)?.accept_stream(events, ctx)?.handle())
    }

    /// Close the connection (session before configuration) and release it
    pub fn delete_connection(&self, conn: Handle) -> Result<()> {
        let adapter = self.connection(conn)?;
        adapter.shutdown();
        self.connections.remove(conn);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Queue one buffer; `false` means the send was not admitted
    pub fn stream_send(&self, stream: Handle, data: &[u8]) -> Result<bool> {
        Ok(self.stream(stream)?.send(data))
    }

    /// Return flow-control credit for the last delivered receive buffer
    pub fn stream_receive_complete(&self, stream: Handle, consumed: usize) -> Result<()> {
        self.stream(stream)?.receive_complete(consumed);
        Ok(())
    }

    /// Attach the host sink to a stream delivered via `on_peer_stream`
    pub fn set_stream_events(
        &self,
        stream: Handle,
        events: Arc<dyn StreamEvents>,
        ctx: HostContext,
    ) -> Result<()> {
        self.stream(stream)?.set_events(events, ctx);
        Ok(())
    }

    /// Update the stream's host context
    pub fn set_stream_context(&self, stream: Handle, ctx: HostContext) -> Result<()> {
        self.stream(stream)?.set_context(ctx);
        Ok(())
    }

    /// Finish, stop and release a stream
    pub fn delete_stream(&self, stream: Handle) -> Result<()> {
        let adapter = self.stream(stream)?;
        adapter.shutdown();
        self.streams.remove(stream);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Load credentials, bind, and start accepting sessions
    pub fn new_listener(
        &self,
        config: &ListenConfig,
        events: Arc<dyn ListenerEvents>,
        ctx: HostContext,
    ) -> Result<Handle> {
        let listener = Listener::start(
            config,
            self.driver.clone(),
            events,
            ctx,
            self.connections.clone(),
            self.streams.clone(),
        )?;
        let handle = listener.handle();
        self.listeners.insert(handle, listener);
        Ok(handle)
    }

    /// Bound local address of the listener
    pub fn listener_address(&self, listener: Handle) -> Result<Option<String>> {
        Ok(self.listener(listener)?.address())
    }

    /// Update the listener's host context
    pub fn set_listener_context(&self, listener: Handle, ctx: HostContext) -> Result<()> {
        self.listener(listener)?.set_context(ctx);
        Ok(())
    }

    /// Stop accepting and release the listener
    pub fn delete_listener(&self, listener: Handle) -> Result<()> {
        let adapter = self.listener(listener)?;
        adapter.shutdown();
        self.listeners.remove(listener);
        Ok(())
    }

    /// Upper bound for one queued data-channel send burst
    pub fn max_send_queue_size(&self) -> u64 {
        MAX_SEND_QUEUE_SIZE
    }

    /// Number of live adapters, for host-side diagnostics
    pub fn live_adapters(&self) -> usize {
        self.peers.len()
            + self.channels.len()
            + self.connections.len()
            + self.streams.len()
            + self.listeners.len()
    }
}
