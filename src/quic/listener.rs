//! Listener adapter
//!
//! Binds a local address with server credentials and turns each completed
//! inbound handshake into a [`Connection`] adapter delivered through
//! `on_new_connection`. A session that fails its handshake is logged and
//! discarded without ever surfacing an adapter.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ListenConfig;
use crate::error::{Error, Result};
use crate::handle::{EventSlot, Handle, HandleTable, HostContext};
use crate::quic::connection::Connection;
use crate::quic::events::{ListenerEvents, NoopListenerEvents};
use crate::quic::stream::Stream;
use crate::quic::{tls, QuicDriver};

/// Adapter around one server endpoint
pub struct Listener {
    handle: Handle,
    slot: Arc<EventSlot<dyn ListenerEvents>>,
    endpoint: Mutex<Option<quinn::Endpoint>>,
    closed: AtomicBool,
    stop_fired: AtomicBool,
}

impl Listener {
    /// Load credentials, bind and start accepting. Credential and bind
    /// failures are synchronous; no listener is created.
    pub(crate) fn start(
        config: &ListenConfig,
        driver: Arc<QuicDriver>,
        events: Arc<dyn ListenerEvents>,
        ctx: HostContext,
        connections: Arc<HandleTable<Connection>>,
        streams: Arc<HandleTable<Stream>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let server_config = tls::server_config(config)?;
        let bind_addr: SocketAddr = config
            .bind_addr
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad bind address '{}'", config.bind_addr)))?;

        let endpoint = driver
            .block_on(async { quinn::Endpoint::server(server_config, bind_addr) })
            .map_err(|err| Error::Transport(format!("bind {bind_addr}: {err}")))?;

        let listener = Arc::new(Self {
            handle: Handle::next(),
            slot: Arc::new(EventSlot::new(events, ctx)),
            endpoint: Mutex::new(Some(endpoint.clone())),
            closed: AtomicBool::new(false),
            stop_fired: AtomicBool::new(false),
        });
        info!(listener = %listener.handle, addr = %bind_addr, "listener started");

        let task = listener.clone();
        let accept_driver = driver.clone();
        driver.spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let task = task.clone();
                let driver = accept_driver.clone();
                let connections = connections.clone();
                let streams = streams.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            let adapter =
                                Connection::adopt(conn, endpoint, driver, streams);
                            connections.insert(adapter.handle(), adapter.clone());
                            debug!(
                                listener = %task.handle,
                                conn = %adapter.handle(),
                                "inbound connection accepted"
                            );
                            task.slot.sink().on_new_connection(
                                task.handle,
                                adapter.handle(),
                                task.slot.context(),
                            );
                        }
                        Err(err) => {
                            debug!(listener = %task.handle, error = %err, "inbound handshake failed");
                        }
                    }
                });
            }
            task.fire_stop();
        });

        Ok(listener)
    }

    /// Adapter handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Update the host context carried by subsequent events
    pub fn set_context(&self, ctx: HostContext) {
        self.slot.set_context(ctx);
    }

    /// Bound local address
    pub fn address(&self) -> Option<String> {
        self.endpoint
            .lock()
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok())
            .map(|addr| addr.to_string())
    }

    fn fire_stop(&self) {
        if !self.stop_fired.swap(true, Ordering::AcqRel) {
            self.slot
                .sink()
                .on_stop_complete(self.handle, self.slot.context());
        }
    }

    /// Stop accepting and release the endpoint. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slot.set_sink(Arc::new(NoopListenerEvents));
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close(quinn::VarInt::from_u32(0), b"");
        }
        debug!(listener = %self.handle, "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
