//! Host-facing event sinks and diagnostics for the media stack
//!
//! Hosts implement [`PeerEvents`] and [`ChannelEvents`] and register them at
//! adapter creation. Every method carries the adapter's handle and the
//! host context current at dispatch time; state transitions are forwarded
//! verbatim as integer codes in the numbering native implementations use,
//! with no interpretation in between.

use std::fmt;

use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::handle::{Handle, HostContext};

/// Session-level error, formatted as
/// `type:'<TYPE>' message:'<MESSAGE>' error_detail:'<DETAIL>'`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    /// Coarse error category
    pub kind: String,
    /// Human-readable message from the native stack
    pub message: String,
    /// Additional detail, `NONE` when absent
    pub detail: String,
}

impl SessionError {
    pub(crate) fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn from_webrtc(err: &webrtc::Error) -> Self {
        Self::new("INTERNAL_ERROR", err.to_string(), "NONE")
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type:'{}' message:'{}' error_detail:'{}'",
            self.kind, self.message, self.detail
        )
    }
}

/// Description or candidate parse error, formatted as
/// `line:'<N>' description:'<TEXT>'`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpParseError {
    /// Line the parser reported, 0 when the parser has no line tracking
    pub line: u32,
    /// Parser description, verbatim
    pub description: String,
}

impl SdpParseError {
    pub(crate) fn from_webrtc(err: &webrtc::Error) -> Self {
        Self {
            line: 0,
            description: err.to_string(),
        }
    }
}

impl fmt::Display for SdpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line:'{}' description:'{}'", self.line, self.description)
    }
}

/// Failure reported through a set-description event sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The description text failed to parse; nothing was applied
    Parse(SdpParseError),
    /// The native stack rejected the parsed description
    Session(SessionError),
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::Parse(err) => err.fmt(f),
            NegotiationError::Session(err) => err.fmt(f),
        }
    }
}

/// Session description type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    /// Initial offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Roll back to the previous stable description
    Rollback,
}

impl SdpType {
    /// Integer code used across the boundary
    pub fn code(self) -> i32 {
        match self {
            SdpType::Offer => 0,
            SdpType::Pranswer => 1,
            SdpType::Answer => 2,
            SdpType::Rollback => 3,
        }
    }

    /// Decode a boundary integer code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SdpType::Offer),
            1 => Some(SdpType::Pranswer),
            2 => Some(SdpType::Answer),
            3 => Some(SdpType::Rollback),
            _ => None,
        }
    }

    pub(crate) fn from_rtc(value: RTCSdpType) -> Option<Self> {
        match value {
            RTCSdpType::Offer => Some(SdpType::Offer),
            RTCSdpType::Pranswer => Some(SdpType::Pranswer),
            RTCSdpType::Answer => Some(SdpType::Answer),
            RTCSdpType::Rollback => Some(SdpType::Rollback),
            _ => None,
        }
    }
}

/// Host event sink for one negotiated media session.
///
/// All methods default to no-ops so hosts implement only what they consume.
#[allow(unused_variables)]
pub trait PeerEvents: Send + Sync + 'static {
    /// Signaling state transition
    fn on_signaling_change(&self, peer: Handle, state: i32, ctx: HostContext) {}

    /// Overall connection state transition
    fn on_connection_change(&self, peer: Handle, state: i32, ctx: HostContext) {}

    /// ICE connection state transition
    fn on_ice_connection_change(&self, peer: Handle, state: i32, ctx: HostContext) {}

    /// Standardized ICE connection state transition
    fn on_standardized_ice_connection_change(&self, peer: Handle, state: i32, ctx: HostContext) {}

    /// ICE gathering state transition
    fn on_ice_gathering_change(&self, peer: Handle, state: i32, ctx: HostContext) {}

    /// A local ICE candidate is ready for the remote side
    fn on_ice_candidate(
        &self,
        peer: Handle,
        mid: &str,
        mline_index: u16,
        candidate: &str,
        ctx: HostContext,
    ) {
    }

    /// The session needs renegotiation
    fn on_negotiation_needed(&self, peer: Handle, ctx: HostContext) {}

    /// Result of a `create_offer` call
    fn on_offer(&self, peer: Handle, result: Result<String, SessionError>, ctx: HostContext) {}

    /// Result of a `create_answer` call
    fn on_answer(&self, peer: Handle, result: Result<String, SessionError>, ctx: HostContext) {}

    /// Completion of a local set-description, `None` on success
    fn on_set_local_description(
        &self,
        peer: Handle,
        error: Option<NegotiationError>,
        ctx: HostContext,
    ) {
    }

    /// Completion of a remote set-description, `None` on success
    fn on_set_remote_description(
        &self,
        peer: Handle,
        error: Option<NegotiationError>,
        ctx: HostContext,
    ) {
    }

    /// The remote side opened a data channel; the adapter is registered
    /// under `channel` with a no-op sink until the host attaches one.
    fn on_data_channel(
        &self,
        peer: Handle,
        label: &str,
        id: u16,
        channel: Handle,
        ctx: HostContext,
    ) {
    }
}

/// Host event sink for one data channel
#[allow(unused_variables)]
pub trait ChannelEvents: Send + Sync + 'static {
    /// Channel state transition (integer code)
    fn on_state_change(&self, channel: Handle, state: i32, ctx: HostContext) {}

    /// An inbound message arrived
    fn on_message(&self, channel: Handle, data: &[u8], is_string: bool, ctx: HostContext) {}

    /// The send queue depth changed after a successful send
    fn on_buffered_amount_change(&self, channel: Handle, buffered: u64, ctx: HostContext) {}
}

pub(crate) struct NoopPeerEvents;

impl PeerEvents for NoopPeerEvents {}

pub(crate) struct NoopChannelEvents;

impl ChannelEvents for NoopChannelEvents {}

/// Integer code for a signaling state
pub fn signaling_state_code(state: RTCSignalingState) -> i32 {
    match state {
        RTCSignalingState::Stable => 0,
        RTCSignalingState::HaveLocalOffer => 1,
        RTCSignalingState::HaveLocalPranswer => 2,
        RTCSignalingState::HaveRemoteOffer => 3,
        RTCSignalingState::HaveRemotePranswer => 4,
        RTCSignalingState::Closed => 5,
        _ => -1,
    }
}

/// Integer code for an overall connection state
pub fn connection_state_code(state: RTCPeerConnectionState) -> i32 {
    match state {
        RTCPeerConnectionState::New => 0,
        RTCPeerConnectionState::Connecting => 1,
        RTCPeerConnectionState::Connected => 2,
        RTCPeerConnectionState::Disconnected => 3,
        RTCPeerConnectionState::Failed => 4,
        RTCPeerConnectionState::Closed => 5,
        _ => -1,
    }
}

/// Integer code for an ICE connection state
pub fn ice_connection_state_code(state: RTCIceConnectionState) -> i32 {
    match state {
        RTCIceConnectionState::New => 0,
        RTCIceConnectionState::Checking => 1,
        RTCIceConnectionState::Connected => 2,
        RTCIceConnectionState::Completed => 3,
        RTCIceConnectionState::Failed => 4,
        RTCIceConnectionState::Disconnected => 5,
        RTCIceConnectionState::Closed => 6,
        _ => -1,
    }
}

/// Integer code for an ICE gathering state
pub fn ice_gathering_state_code(state: RTCIceGathererState) -> i32 {
    match state {
        RTCIceGathererState::New => 0,
        RTCIceGathererState::Gathering => 1,
        RTCIceGathererState::Complete => 2,
        _ => -1,
    }
}

/// Integer code for a data channel state
pub fn data_channel_state_code(state: RTCDataChannelState) -> i32 {
    match state {
        RTCDataChannelState::Connecting => 0,
        RTCDataChannelState::Open => 1,
        RTCDataChannelState::Closing => 2,
        RTCDataChannelState::Closed => 3,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_format() {
        let err = SessionError::new("INVALID_PARAMETER", "bad sdp", "NONE");
        assert_eq!(
            err.to_string(),
            "type:'INVALID_PARAMETER' message:'bad sdp' error_detail:'NONE'"
        );
    }

    #[test]
    fn test_parse_error_format() {
        let err = SdpParseError {
            line: 3,
            description: "unexpected token".to_string(),
        };
        assert_eq!(err.to_string(), "line:'3' description:'unexpected token'");
    }

    #[test]
    fn test_negotiation_error_delegates_format() {
        let err = NegotiationError::Parse(SdpParseError {
            line: 0,
            description: "x".to_string(),
        });
        assert_eq!(err.to_string(), "line:'0' description:'x'");
    }

    #[test]
    fn test_sdp_type_codes_roundtrip() {
        for t in [
            SdpType::Offer,
            SdpType::Pranswer,
            SdpType::Answer,
            SdpType::Rollback,
        ] {
            assert_eq!(SdpType::from_code(t.code()), Some(t));
        }
        assert_eq!(SdpType::from_code(9), None);
    }

    #[test]
    fn test_state_codes_match_native_numbering() {
        assert_eq!(signaling_state_code(RTCSignalingState::Stable), 0);
        assert_eq!(signaling_state_code(RTCSignalingState::HaveRemoteOffer), 3);
        assert_eq!(signaling_state_code(RTCSignalingState::Closed), 5);
        assert_eq!(connection_state_code(RTCPeerConnectionState::Connected), 2);
        assert_eq!(ice_connection_state_code(RTCIceConnectionState::Completed), 3);
        assert_eq!(ice_connection_state_code(RTCIceConnectionState::Disconnected), 5);
        assert_eq!(ice_gathering_state_code(RTCIceGathererState::Complete), 2);
        assert_eq!(data_channel_state_code(RTCDataChannelState::Open), 1);
        assert_eq!(data_channel_state_code(RTCDataChannelState::Closed), 3);
    }
}
