//! Peer connection adapter
//!
//! Wraps one negotiated media session. The native session is owned by a
//! single signaling loop (created here, or shared via the thread pool) and
//! every host-initiated operation is marshaled onto that loop as a blocking
//! call; native callbacks fire on the same loop, so each session sees one
//! total order of mutations and events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{ChannelConfig, PeerConfig};
use crate::error::{Error, Result};
use crate::handle::{EventSlot, Handle, HandleTable, HostContext};
use crate::pool::{EventLoop, LoopKind, ThreadPool};
use crate::rtc::channel::DataChannel;
use crate::rtc::events::{
    connection_state_code, ice_connection_state_code, ice_gathering_state_code,
    signaling_state_code, ChannelEvents, NegotiationError, NoopPeerEvents, PeerEvents,
    SdpParseError, SdpType, SessionError,
};

#[derive(Debug, Clone, Copy)]
enum SdpRole {
    Offer,
    Answer,
}

/// Persistent sink for offer/answer creation results. One per role, created
/// at session start and reused for every create call over the session's
/// lifetime.
struct DescriptionSink {
    role: SdpRole,
    peer: Handle,
    slot: Arc<EventSlot<dyn PeerEvents>>,
}

impl DescriptionSink {
    fn deliver(&self, result: std::result::Result<RTCSessionDescription, webrtc::Error>) {
        let outcome = result
            .map(|desc| desc.sdp)
            .map_err(|err| SessionError::from_webrtc(&err));
        let role = self.role;
        let peer = self.peer;
        let slot = self.slot.clone();
        tokio::spawn(async move {
            let ctx = slot.context();
            match role {
                SdpRole::Offer => slot.sink().on_offer(peer, outcome, ctx),
                SdpRole::Answer => slot.sink().on_answer(peer, outcome, ctx),
            }
        });
    }
}

/// Adapter around one native peer connection
pub struct PeerConnection {
    handle: Handle,
    signaling: Arc<EventLoop>,
    owns_loop: bool,
    pc: Arc<RTCPeerConnection>,
    slot: Arc<EventSlot<dyn PeerEvents>>,
    channels: Arc<HandleTable<DataChannel>>,
    offer_sink: Arc<DescriptionSink>,
    answer_sink: Arc<DescriptionSink>,
    closed: AtomicBool,
}

impl PeerConnection {
    /// Build the factory and native session on a fresh or pooled signaling
    /// loop. Any construction failure is returned synchronously and leaves
    /// nothing behind.
    pub(crate) fn open(
        config: &PeerConfig,
        pool: Option<&ThreadPool>,
        events: Arc<dyn PeerEvents>,
        ctx: HostContext,
        channels: Arc<HandleTable<DataChannel>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (signaling, owns_loop) = match pool {
            Some(pool) => (pool.acquire_io()?, false),
            None => (
                Arc::new(EventLoop::spawn("rtc-signaling", LoopKind::Io)?),
                true,
            ),
        };

        let handle = Handle::next();
        let slot: Arc<EventSlot<dyn PeerEvents>> = Arc::new(EventSlot::new(events, ctx));

        let build_config = config.clone();
        let pc = signaling.run(move || async move { build_session(&build_config).await })??;

        let adapter = Arc::new(Self {
            handle,
            signaling,
            owns_loop,
            pc,
            slot: slot.clone(),
            channels,
            offer_sink: Arc::new(DescriptionSink {
                role: SdpRole::Offer,
                peer: handle,
                slot: slot.clone(),
            }),
            answer_sink: Arc::new(DescriptionSink {
                role: SdpRole::Answer,
                peer: handle,
                slot,
            }),
            closed: AtomicBool::new(false),
        });
        adapter.install_handlers();

        info!(peer = %handle, pooled = pool.is_some(), "peer connection created");
        Ok(adapter)
    }

    fn install_handlers(&self) {
        let slot = self.slot.clone();
        let peer = self.handle;
        self.pc.on_signaling_state_change(Box::new(move |state| {
            let slot = slot.clone();
            Box::pin(async move {
                slot.sink()
                    .on_signaling_change(peer, signaling_state_code(state), slot.context());
            })
        }));

        let slot = self.slot.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let slot = slot.clone();
                Box::pin(async move {
                    slot.sink().on_connection_change(
                        peer,
                        connection_state_code(state),
                        slot.context(),
                    );
                })
            }));

        // webrtc-rs implements the standardized ICE state machine; the one
        // native hook feeds both the legacy and the standardized sink.
        let slot = self.slot.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state| {
                let slot = slot.clone();
                Box::pin(async move {
                    let code = ice_connection_state_code(state);
                    let ctx = slot.context();
                    let sink = slot.sink();
                    sink.on_ice_connection_change(peer, code, ctx);
                    sink.on_standardized_ice_connection_change(peer, code, ctx);
                })
            }));

        let slot = self.slot.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state| {
                let slot = slot.clone();
                Box::pin(async move {
                    slot.sink().on_ice_gathering_change(
                        peer,
                        ice_gathering_state_code(state),
                        slot.context(),
                    );
                })
            }));

        let slot = self.slot.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let slot = slot.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            slot.sink().on_ice_candidate(
                                peer,
                                init.sdp_mid.as_deref().unwrap_or(""),
                                init.sdp_mline_index.unwrap_or(0),
                                &init.candidate,
                                slot.context(),
                            );
                        }
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "ICE candidate serialization failed");
                        }
                    }
                })
            }));

        let slot = self.slot.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let slot = slot.clone();
            Box::pin(async move {
                slot.sink().on_negotiation_needed(peer, slot.context());
            })
        }));

        let slot = self.slot.clone();
        let channels = self.channels.clone();
        let signaling = self.signaling.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let channels = channels.clone();
                let signaling = signaling.clone();
                Box::pin(async move {
                    let label = dc.label().to_string();
                    let id = dc.id();
                    let channel = DataChannel::adopt(dc, signaling);
                    channels.insert(channel.handle(), channel.clone());
                    debug!(peer = %peer, channel = %channel.handle(), label = %label, "incoming data channel");
                    slot.sink()
                        .on_data_channel(peer, &label, id, channel.handle(), slot.context());
                })
            }));
    }

    /// Adapter handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Update the host context carried by subsequent events
    pub fn set_context(&self, ctx: HostContext) {
        self.slot.set_context(ctx);
    }

    /// Ask the native session for an offer. The result arrives through the
    /// persistent offer sink as an `on_offer` event, never via this call.
    pub fn create_offer(&self) -> Result<()> {
        let pc = self.pc.clone();
        let sink = self.offer_sink.clone();
        self.signaling.run(move || async move {
            sink.deliver(pc.create_offer(None).await);
        })
    }

    /// Ask the native session for an answer; delivery mirrors
    /// [`create_offer`](Self::create_offer).
    pub fn create_answer(&self) -> Result<()> {
        let pc = self.pc.clone();
        let sink = self.answer_sink.clone();
        self.signaling.run(move || async move {
            sink.deliver(pc.create_answer(None).await);
        })
    }

    /// Apply a session description. Parse failures and native completion
    /// are both reported through the local/remote set-description event;
    /// a parse failure leaves the previous description untouched.
    pub fn set_description(&self, is_local: bool, sdp_type: SdpType, sdp: &str) -> Result<()> {
        let pc = self.pc.clone();
        let slot = self.slot.clone();
        let peer = self.handle;
        let sdp = sdp.to_string();
        self.signaling.run(move || async move {
            let parsed = match sdp_type {
                SdpType::Offer => RTCSessionDescription::offer(sdp),
                SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
                SdpType::Answer => RTCSessionDescription::answer(sdp),
                SdpType::Rollback => {
                    let mut desc = RTCSessionDescription::default();
                    desc.sdp_type = RTCSdpType::Rollback;
                    Ok(desc)
                }
            };
            let desc = match parsed {
                Ok(desc) => desc,
                Err(err) => {
                    dispatch_set_result(
                        slot,
                        peer,
                        is_local,
                        Some(NegotiationError::Parse(SdpParseError::from_webrtc(&err))),
                    );
                    return;
                }
            };
            let applied = if is_local {
                pc.set_local_description(desc).await
            } else {
                pc.set_remote_description(desc).await
            };
            dispatch_set_result(
                slot,
                peer,
                is_local,
                applied
                    .err()
                    .map(|err| NegotiationError::Session(SessionError::from_webrtc(&err))),
            );
        })
    }

    /// Read back the current local or remote description
    pub fn description(&self, is_local: bool) -> Result<Option<(SdpType, String)>> {
        let pc = self.pc.clone();
        self.signaling.run(move || async move {
            let desc = if is_local {
                pc.local_description().await
            } else {
                pc.remote_description().await
            };
            desc.and_then(|desc| SdpType::from_rtc(desc.sdp_type).map(|t| (t, desc.sdp)))
        })
    }

    /// Enqueue a remote ICE candidate. Parse failure is synchronous;
    /// success has no further confirmation.
    pub fn add_ice_candidate(&self, mid: &str, mline_index: u16, candidate: &str) -> Result<()> {
        let pc = self.pc.clone();
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: Some(mid.to_string()),
            sdp_mline_index: Some(mline_index),
            username_fragment: None,
        };
        self.signaling
            .run(move || async move { pc.add_ice_candidate(init).await })?
            .map_err(|err| Error::IceCandidate(SdpParseError::from_webrtc(&err).to_string()))
    }

    /// Create a data channel on the session. The returned adapter is
    /// already registered as its own event sink.
    pub fn create_data_channel(
        &self,
        config: &ChannelConfig,
        events: Arc<dyn ChannelEvents>,
        ctx: HostContext,
    ) -> Result<Arc<DataChannel>> {
        config.validate()?;
        let pc = self.pc.clone();
        let signaling = self.signaling.clone();
        let config = config.clone();
        let channel = self.signaling.run(move || async move {
            let init = RTCDataChannelInit {
                ordered: Some(config.ordered),
                max_retransmits: config.max_retransmits,
                max_packet_life_time: config.max_packet_life_time,
                protocol: if config.protocol.is_empty() {
                    None
                } else {
                    Some(config.protocol.clone())
                },
                negotiated: config.negotiated,
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&config.label, Some(init))
                .await
                .map_err(|err| Error::DataChannel(SessionError::from_webrtc(&err).to_string()))?;
            Ok::<_, Error>(DataChannel::create(dc, signaling, events, ctx, &config))
        })??;
        self.channels.insert(channel.handle(), channel.clone());
        debug!(peer = %self.handle, channel = %channel.handle(), "data channel created");
        Ok(channel)
    }

    /// Close the native session and, for owned loops, stop the signaling
    /// thread. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slot.set_sink(Arc::new(NoopPeerEvents));
        let pc = self.pc.clone();
        let _ = self.signaling.run(move || async move {
            let _ = pc.close().await;
        });
        if self.owns_loop {
            self.signaling.stop();
        }
        debug!(peer = %self.handle, "peer connection closed");
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_set_result(
    slot: Arc<EventSlot<dyn PeerEvents>>,
    peer: Handle,
    is_local: bool,
    error: Option<NegotiationError>,
) {
    tokio::spawn(async move {
        let ctx = slot.context();
        if is_local {
            slot.sink().on_set_local_description(peer, error, ctx);
        } else {
            slot.sink().on_set_remote_description(peer, error, ctx);
        }
    });
}

async fn build_session(config: &PeerConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| Error::PeerConnection(format!("codec registration failed: {err}")))?;

    let registry = register_default_interceptors(Default::default(), &mut media_engine)
        .map_err(|err| Error::PeerConnection(format!("interceptor registration failed: {err}")))?;

    let mut setting_engine = SettingEngine::default();
    if config.min_port.is_some() || config.max_port.is_some() {
        let min = config.min_port.unwrap_or(0);
        let max = config.max_port.unwrap_or(u16::MAX);
        let udp = EphemeralUDP::new(min, max)
            .map_err(|err| Error::InvalidConfig(format!("port range {min}..{max}: {err}")))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp));
    }

    let ice_servers: Vec<RTCIceServer> = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect();

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .map_err(|err| {
            Error::PeerConnection(SessionError::from_webrtc(&err).to_string())
        })?;

    Ok(Arc::new(pc))
}
