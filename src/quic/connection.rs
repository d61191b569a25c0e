//! Connection adapter
//!
//! Wraps one secure multiplexed transport session. Client connections are
//! created idle, configured, then started; server connections arrive from a
//! listener with the native session already established. Handshake failure
//! and every later termination (idle timeout, peer or transport shutdown)
//! surface as a single `on_shutdown_complete` event, never as an error
//! return.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::ConnectConfig;
use crate::error::{Error, Result};
use crate::handle::{EventSlot, Handle, HandleTable, HostContext};
use crate::quic::events::{ConnectionEvents, NoopConnectionEvents, StreamEvents};
use crate::quic::stream::Stream;
use crate::quic::{tls, QuicDriver};

/// Adapter around one transport connection
pub struct Connection {
    handle: Handle,
    driver: Arc<QuicDriver>,
    slot: Arc<EventSlot<dyn ConnectionEvents>>,
    streams: Arc<HandleTable<Stream>>,
    endpoint: Mutex<Option<quinn::Endpoint>>,
    owns_endpoint: bool,
    conn: Mutex<Option<quinn::Connection>>,
    idle_override: Mutex<Option<u64>>,
    started: AtomicBool,
    armed: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    closed_flag: AtomicBool,
    accept_waiters: Mutex<VecDeque<oneshot::Sender<Handle>>>,
    shutdown_fired: AtomicBool,
    local_addr: Mutex<Option<String>>,
    remote_addr: Mutex<Option<String>>,
}

impl Connection {
    /// Create an idle client connection; `start` opens it.
    pub(crate) fn new(
        driver: Arc<QuicDriver>,
        events: Arc<dyn ConnectionEvents>,
        ctx: HostContext,
        streams: Arc<HandleTable<Stream>>,
    ) -> Arc<Self> {
        Self::build(driver, Arc::new(EventSlot::new(events, ctx)), streams, None, None, true, true)
    }

    /// Wrap an accepted server-side session. Events go to a no-op sink, and
    /// nothing is delivered, until the host attaches a sink.
    pub(crate) fn adopt(
        conn: quinn::Connection,
        endpoint: quinn::Endpoint,
        driver: Arc<QuicDriver>,
        streams: Arc<HandleTable<Stream>>,
    ) -> Arc<Self> {
        let adapter = Self::build(
            driver.clone(),
            Arc::new(EventSlot::new(
                Arc::new(NoopConnectionEvents),
                HostContext::default(),
            )),
            streams,
            Some(endpoint),
            Some(conn.clone()),
            false,
            false,
        );
        adapter.started.store(true, Ordering::Release);
        let task = adapter.clone();
        driver.spawn(async move {
            if !task.wait_armed().await {
                return;
            }
            task.slot
                .sink()
                .on_connected(task.handle, task.slot.context());
            task.accept_streams(conn).await;
        });
        adapter
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        driver: Arc<QuicDriver>,
        slot: Arc<EventSlot<dyn ConnectionEvents>>,
        streams: Arc<HandleTable<Stream>>,
        endpoint: Option<quinn::Endpoint>,
        conn: Option<quinn::Connection>,
        owns_endpoint: bool,
        armed: bool,
    ) -> Arc<Self> {
        let (armed_tx, _) = watch::channel(armed);
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            handle: Handle::next(),
            driver,
            slot,
            streams,
            endpoint: Mutex::new(endpoint),
            owns_endpoint,
            conn: Mutex::new(conn),
            idle_override: Mutex::new(None),
            started: AtomicBool::new(false),
            armed: armed_tx,
            closed: closed_tx,
            closed_flag: AtomicBool::new(false),
            accept_waiters: Mutex::new(VecDeque::new()),
            shutdown_fired: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
        })
    }

    /// Adapter handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Build the per-connection configuration and credentials, bind a
    /// client endpoint and start the handshake. Configuration errors are
    /// synchronous; handshake failure arrives as `on_shutdown_complete`.
    pub fn start(self: Arc<Self>, config: &ConnectConfig) -> Result<()> {
        config.validate()?;
        if self.closed_flag.load(Ordering::Acquire) {
            return Err(Error::InvalidState("connection closed".to_string()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("connection already started".to_string()));
        }

        let idle_timeout_ms = (*self.idle_override.lock()).unwrap_or(config.idle_timeout_ms);
        let client_config = tls::client_config(config, idle_timeout_ms)?;

        let mut endpoint = self
            .driver
            .block_on(async { quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0))) })
            .map_err(|err| Error::Transport(format!("bind client endpoint: {err}")))?;
        endpoint.set_default_client_config(client_config);
        *self.endpoint.lock() = Some(endpoint.clone());

        let server_name = config.server_name.clone();
        let port = config.port;
        let task = self.clone();
        self.driver.spawn(async move {
            // The client endpoint is IPv4-bound; prefer an IPv4 address.
            let addr = match tokio::net::lookup_host((server_name.as_str(), port)).await {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    match addrs
                        .iter()
                        .find(|addr| addr.is_ipv4())
                        .or_else(|| addrs.first())
                        .copied()
                    {
                        Some(addr) => addr,
                        None => {
                            warn!(server = %server_name, "no address for server");
                            task.fire_shutdown();
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(server = %server_name, error = %err, "name resolution failed");
                    task.fire_shutdown();
                    return;
                }
            };
            let connecting = match endpoint.connect(addr, &server_name) {
                Ok(connecting) => connecting,
                Err(err) => {
                    warn!(server = %server_name, error = %err, "connect rejected");
                    task.fire_shutdown();
                    return;
                }
            };
            let conn = match connecting.await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(server = %server_name, error = %err, "handshake failed");
                    task.fire_shutdown();
                    return;
                }
            };
            info!(conn = %task.handle, remote = %conn.remote_address(), "connected");
            *task.conn.lock() = Some(conn.clone());
            if !task.wait_armed().await {
                return;
            }
            task.slot
                .sink()
                .on_connected(task.handle, task.slot.context());
            task.accept_streams(conn).await;
        });
        Ok(())
    }

    /// Attach the host event sink and context; for adopted connections
    /// this also releases queued events.
    pub fn set_events(&self, events: Arc<dyn ConnectionEvents>, ctx: HostContext) {
        self.slot.set_sink(events);
        self.slot.set_context(ctx);
        let _ = self.armed.send(true);
    }

    /// Update the host context carried by subsequent events
    pub fn set_context(&self, ctx: HostContext) {
        self.slot.set_context(ctx);
    }

    /// Reconfigure the idle timeout. Only valid before `start`; the
    /// transport cannot renegotiate the timeout of a live session.
    pub fn set_idle_timeout(&self, idle_timeout_ms: u64) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "idle timeout is fixed once the connection starts".to_string(),
            ));
        }
        *self.idle_override.lock() = Some(idle_timeout_ms);
        Ok(())
    }

    /// Local or remote address, resolved lazily and cached
    pub fn address(&self, local: bool) -> Option<String> {
        let cache = if local {
            &self.local_addr
        } else {
            &self.remote_addr
        };
        if let Some(addr) = cache.lock().clone() {
            return Some(addr);
        }
        let resolved = if local {
            self.endpoint
                .lock()
                .as_ref()
                .and_then(|endpoint| endpoint.local_addr().ok())
                .map(|addr| addr.to_string())
        } else {
            self.conn
                .lock()
                .as_ref()
                .map(|conn| conn.remote_address().to_string())
        };
        if let Some(addr) = &resolved {
            *cache.lock() = Some(addr.clone());
        }
        resolved
    }

    /// Actively open a new stream on this connection.
    pub fn open_stream(
        &self,
        events: Arc<dyn StreamEvents>,
        ctx: HostContext,
    ) -> Result<Arc<Stream>> {
        let conn = self
            .conn
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("connection not established".to_string()))?;
        let stream = Stream::open(conn, self.driver.clone(), events, ctx);
        self.streams.insert(stream.handle(), stream.clone());
        Ok(stream)
    }

    /// Accept the next peer-initiated stream, blocking the caller until
    /// one arrives or the connection goes away. Streams not claimed by a
    /// pending accept are announced via `on_peer_stream` instead.
    pub fn accept_stream(
        &self,
        events: Arc<dyn StreamEvents>,
        ctx: HostContext,
    ) -> Result<Arc<Stream>> {
        if self.closed_flag.load(Ordering::Acquire) {
            return Err(Error::InvalidState("connection closed".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.accept_waiters.lock().push_back(tx);
        let handle = rx
            .blocking_recv()
            .map_err(|_| Error::InvalidState("connection closed".to_string()))?;
        let stream = self
            .streams
            .get(handle)
            .ok_or(Error::UnknownHandle(handle))?;
        stream.set_events(events, ctx);
        Ok(stream)
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

    async fn accept_streams(self: Arc<Self>, conn: quinn::Connection) {
        loop {
            match conn.accept_bi().await {
                Ok((send, recv)) => {
                    let stream = Stream::adopt(send, recv, self.driver.clone());
                    self.streams.insert(stream.handle(), stream.clone());
                    let waiter = self.accept_waiters.lock().pop_front();
                    let claimed = match waiter {
                        Some(tx) => tx.send(stream.handle()).is_ok(),
                        None => false,
                    };
                    if !claimed {
                        self.slot.sink().on_peer_stream(
                            self.handle,
                            stream.handle(),
                            self.slot.context(),
                        );
                    }
                }
                Err(err) => {
                    debug!(conn = %self.handle, reason = %err, "connection ended");
                    break;
                }
            }
        }
        self.accept_waiters.lock().clear();
        self.fire_shutdown();
    }

    fn fire_shutdown(&self) {
        if !self.shutdown_fired.swap(true, Ordering::AcqRel) {
            self.accept_waiters.lock().clear();
            self.slot
                .sink()
                .on_shutdown_complete(self.handle, self.slot.context());
        }
    }

    /// Tear the connection down: unregister the sink, close the native
    /// session, then release its configuration (the client endpoint), in
    /// that order. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.closed_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slot.set_sink(Arc::new(NoopConnectionEvents));
        let _ = self.closed.send(true);
        self.accept_waiters.lock().clear();
        if let Some(conn) = self.conn.lock().take() {
            conn.close(quinn::VarInt::from_u32(0), b"closed");
        }
        if self.owns_endpoint {
            if let Some(endpoint) = self.endpoint.lock().take() {
                endpoint.close(quinn::VarInt::from_u32(0), b"");
            }
        }
        debug!(conn = %self.handle, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
