//! Adapters for the secure multiplexed stream transport
//!
//! The transport library runs on worker threads owned by [`QuicDriver`];
//! adapters spawn their event tasks there and invoke host sinks from those
//! threads. [`Connection`], [`Stream`] and [`Listener`] wrap the native
//! objects; hosts observe them through the sink traits in [`events`].

pub mod events;

mod connection;
mod listener;
mod stream;
mod tls;

use std::future::Future;
use std::sync::Arc;

pub use connection::Connection;
pub use listener::Listener;
pub use stream::Stream;

use crate::error::{Error, Result};

/// Worker runtime that stands in for the transport library's internal
/// threads; every transport adapter task runs here.
pub(crate) struct QuicDriver {
    runtime: tokio::runtime::Runtime,
}

impl QuicDriver {
    pub(crate) fn new() -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("quic-driver")
            .enable_all()
            .build()
            .map_err(|err| Error::ThreadStart(err.to_string()))?;
        Ok(Arc::new(Self { runtime }))
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }
}
