//! Adapters for the signaling-negotiated media stack
//!
//! [`PeerConnection`] wraps one negotiated session and serializes every
//! host call onto the session's signaling loop; [`DataChannel`] wraps one
//! negotiated channel. Hosts observe both through the sink traits in
//! [`events`].

pub mod events;

mod channel;
mod peer;

pub use channel::{DataChannel, MAX_SEND_QUEUE_SIZE};
pub use peer::PeerConnection;
