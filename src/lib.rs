//! Unified transport adapters for embedding hosts
//!
//! This crate exposes two heterogeneous asynchronous transport stacks
//! (WebRTC negotiated sessions with data channels, and QUIC multiplexed
//! stream connections) through one uniform, callback-driven, handle-based
//! surface that a host process can drive without knowing either native
//! object model.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Host process                                            │
//! │  ↓ handles + event-sink trait objects                    │
//! │  Bridge                                                  │
//! │  ├─ PeerConnection / DataChannel  (webrtc)               │
//! │  │    └─ signaling EventLoop (owned or ThreadPool slot)  │
//! │  ├─ Connection / Stream / Listener  (quinn)              │
//! │  │    └─ transport driver worker threads                 │
//! │  └─ ThreadPool (lazy round-robin loop rings)             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every adapter is owned by an arena inside [`Bridge`] and referenced by
//! an opaque [`Handle`]; events carry an opaque [`HostContext`] the host
//! set at creation time. Peer-connection operations are marshaled onto the
//! session's signaling loop as blocking calls, which gives each session a
//! total order of host mutations and native events; transport callbacks
//! are delivered on the driver's worker threads, in order per resource.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerlink::{Bridge, HostContext, PeerConfig};
//! use peerlink::rtc::events::{PeerEvents, SessionError};
//! use peerlink::Handle;
//!
//! struct Signals;
//!
//! impl PeerEvents for Signals {
//!     fn on_offer(&self, peer: Handle, result: Result<String, SessionError>, _ctx: HostContext) {
//!         if let Ok(sdp) = result {
//!             println!("offer for {peer}: {} bytes", sdp.len());
//!         }
//!     }
//! }
//!
//! # fn main() -> peerlink::Result<()> {
//! let bridge = Bridge::new()?;
//! let peer = bridge.new_peer_connection(
//!     &PeerConfig::default(),
//!     None,
//!     Arc::new(Signals),
//!     HostContext(1),
//! )?;
//! bridge.create_offer(peer)?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

mod bridge;
mod handle;

pub mod config;
pub mod error;
pub mod pool;
pub mod quic;
pub mod rtc;

pub use bridge::Bridge;
pub use config::{
    ChannelConfig, ConnectConfig, IceServerConfig, ListenConfig, PeerConfig,
    DEFAULT_IDLE_TIMEOUT_MS,
};
pub use error::{Error, Result};
pub use handle::{Handle, HostContext};
pub use pool::{EventLoop, LoopKind, ThreadPool};
pub use rtc::events::{NegotiationError, SdpParseError, SdpType, SessionError};
pub use rtc::MAX_SEND_QUEUE_SIZE;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
