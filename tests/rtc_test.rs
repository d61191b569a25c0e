//! Peer connection and data channel behavior, including a full loopback
//! negotiation with trickled candidates.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use peerlink::rtc::events::{ChannelEvents, NegotiationError, PeerEvents, SessionError};
use peerlink::{
    Bridge, ChannelConfig, Error, Handle, HostContext, PeerConfig, SdpType, ThreadPool,
};

const LONG: Duration = Duration::from_secs(15);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone)]
enum PeerEvent {
    Offer(Result<String, SessionError>),
    Answer(Result<String, SessionError>),
    SetLocal(Option<NegotiationError>),
    SetRemote(Option<NegotiationError>),
    Candidate {
        mid: String,
        index: u16,
        sdp: String,
    },
    IncomingChannel {
        label: String,
        handle: Handle,
    },
}

struct PeerRecorder {
    tx: Mutex<Sender<PeerEvent>>,
}

impl PeerRecorder {
    fn pair() -> (Arc<Self>, Receiver<PeerEvent>) {
        let (tx, rx) = channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }

    fn push(&self, event: PeerEvent) {
        let _ = self.tx.lock().unwrap().send(event);
    }
}

impl PeerEvents for PeerRecorder {
    fn on_offer(&self, _peer: Handle, result: Result<String, SessionError>, _ctx: HostContext) {
        self.push(PeerEvent::Offer(result));
    }

    fn on_answer(&self, _peer: Handle, result: Result<String, SessionError>, _ctx: HostContext) {
        self.push(PeerEvent::Answer(result));
    }

    fn on_set_local_description(
        &self,
        _peer: Handle,
        error: Option<NegotiationError>,
        _ctx: HostContext,
    ) {
        self.push(PeerEvent::SetLocal(error));
    }

    fn on_set_remote_description(
        &self,
        _peer: Handle,
        error: Option<NegotiationError>,
        _ctx: HostContext,
    ) {
        self.push(PeerEvent::SetRemote(error));
    }

    fn on_ice_candidate(
        &self,
        _peer: Handle,
        mid: &str,
        mline_index: u16,
        candidate: &str,
        _ctx: HostContext,
    ) {
        self.push(PeerEvent::Candidate {
            mid: mid.to_string(),
            index: mline_index,
            sdp: candidate.to_string(),
        });
    }

    fn on_data_channel(
        &self,
        _peer: Handle,
        label: &str,
        _id: u16,
        channel: Handle,
        _ctx: HostContext,
    ) {
        self.push(PeerEvent::IncomingChannel {
            label: label.to_string(),
            handle: channel,
        });
    }
}

#[derive(Debug, Clone)]
enum ChanEvent {
    State(i32),
    Message(Vec<u8>),
}

struct ChanRecorder {
    tx: Mutex<Sender<ChanEvent>>,
}

impl ChanRecorder {
    fn pair() -> (Arc<Self>, Receiver<ChanEvent>) {
        let (tx, rx) = channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }
}

impl ChannelEvents for ChanRecorder {
    fn on_state_change(&self, _channel: Handle, state: i32, _ctx: HostContext) {
        let _ = self.tx.lock().unwrap().send(ChanEvent::State(state));
    }

    fn on_message(&self, _channel: Handle, data: &[u8], _is_string: bool, _ctx: HostContext) {
        let _ = self.tx.lock().unwrap().send(ChanEvent::Message(data.to_vec()));
    }
}

fn wait_event<E, T>(
    rx: &Receiver<E>,
    timeout: Duration,
    mut pick: impl FnMut(E) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(remaining) {
            Ok(event) => {
                if let Some(value) = pick(event) {
                    return Some(value);
                }
            }
            Err(_) => return None,
        }
    }
}

#[test]
fn two_offers_reuse_the_persistent_sink() {
    let bridge = Bridge::new().unwrap();
    let (recorder, rx) = PeerRecorder::pair();
    let peer = bridge
        .new_peer_connection(&PeerConfig::default(), None, recorder, HostContext(1))
        .unwrap();
    let (chan_recorder, _chan_rx) = ChanRecorder::pair();
    bridge
        .create_data_channel(
            peer,
            &ChannelConfig::reliable("warmup"),
            chan_recorder,
            HostContext(2),
        )
        .unwrap();

    bridge.create_offer(peer).unwrap();
    bridge.create_offer(peer).unwrap();

    for _ in 0..2 {
        let sdp = wait_event(&rx, LONG, |event| match event {
            PeerEvent::Offer(Ok(sdp)) => Some(sdp),
            _ => None,
        })
        .expect("offer event");
        assert!(sdp.contains("application"));
    }

    bridge.delete_peer_connection(peer).unwrap();
}

#[test]
fn channel_getters_reflect_creation_flags() {
    let bridge = Bridge::new().unwrap();
    let (recorder, _rx) = PeerRecorder::pair();
    let peer = bridge
        .new_peer_connection(&PeerConfig::default(), None, recorder, HostContext(0))
        .unwrap();

    let config = ChannelConfig {
        label: "flags".to_string(),
        ordered: false,
        max_retransmits: Some(3),
        max_packet_life_time: None,
        protocol: "proto-x".to_string(),
        negotiated: Some(7),
    };
    let (chan_recorder, _chan_rx) = ChanRecorder::pair();
    let chan = bridge
        .create_data_channel(peer, &config, chan_recorder, HostContext(0))
        .unwrap();

    assert_eq!(bridge.channel_label(chan).unwrap(), "flags");
    assert!(!bridge.channel_reliable(chan).unwrap());
    assert!(!bridge.channel_ordered(chan).unwrap());
    assert_eq!(bridge.channel_protocol(chan).unwrap(), "proto-x");
    assert!(bridge.channel_negotiated(chan).unwrap());
    assert!(bridge.channel_last_error(chan).unwrap().is_none());
    assert_eq!(
        bridge.channel_max_send_queue_size(chan).unwrap(),
        peerlink::MAX_SEND_QUEUE_SIZE
    );

    bridge.delete_data_channel(chan).unwrap();
    bridge.delete_peer_connection(peer).unwrap();
}

#[test]
fn send_on_unopened_channel_fails_without_counting() {
    let bridge = Bridge::new().unwrap();
    let (recorder, _rx) = PeerRecorder::pair();
    let peer = bridge
        .new_peer_connection(&PeerConfig::default(), None, recorder, HostContext(0))
        .unwrap();
    let (chan_recorder, _chan_rx) = ChanRecorder::pair();
    let chan = bridge
        .create_data_channel(
            peer,
            &ChannelConfig::reliable("quiet"),
            chan_recorder,
            HostContext(0),
        )
        .unwrap();

    // No negotiation happened, so the channel is still connecting.
    assert!(!bridge.channel_send(chan, b"too early").unwrap());
    assert_eq!(bridge.channel_messages_sent(chan).unwrap(), 0);
    assert_eq!(bridge.channel_bytes_sent(chan).unwrap(), 0);
    assert_eq!(bridge.channel_state(chan).unwrap(), 0);

    bridge.delete_peer_connection(peer).unwrap();
}

#[test]
fn invalid_local_description_reports_parse_error_and_keeps_none() {
    let bridge = Bridge::new().unwrap();
    let (recorder, rx) = PeerRecorder::pair();
    let peer = bridge
        .new_peer_connection(&PeerConfig::default(), None, recorder, HostContext(0))
        .unwrap();

    bridge
        .set_local_description(peer, SdpType::Offer, "this is not a description")
        .unwrap();

    let error = wait_event(&rx, LONG, |event| match event {
        PeerEvent::SetLocal(Some(error)) => Some(error),
        _ => None,
    })
    .expect("parse error event");
    match &error {
        NegotiationError::Parse(parse) => {
            assert!(!parse.description.is_empty());
            assert!(error.to_string().starts_with("line:'"));
        }
        other => panic!("expected parse error, got {other:?}"),
    }

    assert!(bridge.local_description(peer).unwrap().is_none());
    bridge.delete_peer_connection(peer).unwrap();
}

#[test]
fn bad_ice_candidate_fails_synchronously() {
    let bridge = Bridge::new().unwrap();
    let (recorder, _rx) = PeerRecorder::pair();
    let peer = bridge
        .new_peer_connection(&PeerConfig::default(), None, recorder, HostContext(0))
        .unwrap();

    let err = bridge
        .add_ice_candidate(peer, "0", 0, "candidate:garbage")
        .unwrap_err();
    assert!(matches!(err, Error::IceCandidate(_)));

    bridge.delete_peer_connection(peer).unwrap();
}

#[test]
fn local_description_roundtrip() {
    let bridge = Bridge::new().unwrap();
    let (recorder, rx) = PeerRecorder::pair();
    let peer = bridge
        .new_peer_connection(&PeerConfig::default(), None, recorder, HostContext(0))
        .unwrap();
    let (chan_recorder, _chan_rx) = ChanRecorder::pair();
    bridge
        .create_data_channel(
            peer,
            &ChannelConfig::reliable("rt"),
            chan_recorder,
            HostContext(0),
        )
        .unwrap();

    bridge.create_offer(peer).unwrap();
    let offer = wait_event(&rx, LONG, |event| match event {
        PeerEvent::Offer(Ok(sdp)) => Some(sdp),
        _ => None,
    })
    .expect("offer event");

    bridge
        .set_local_description(peer, SdpType::Offer, &offer)
        .unwrap();
    let error = wait_event(&rx, LONG, |event| match event {
        PeerEvent::SetLocal(error) => Some(error),
        _ => None,
    })
    .expect("set-local completion");
    assert!(error.is_none(), "unexpected error: {error:?}");

    let (sdp_type, sdp) = bridge.local_description(peer).unwrap().expect("description");
    assert_eq!(sdp_type, SdpType::Offer);
    assert!(!sdp.is_empty());

    bridge.delete_peer_connection(peer).unwrap();
}

#[test]
fn pooled_peers_share_signaling_loops() {
    let bridge = Bridge::new().unwrap();
    let pool = ThreadPool::new(2);
    let mut peers = Vec::new();
    let mut receivers = Vec::new();
    for i in 0..3 {
        let (recorder, rx) = PeerRecorder::pair();
        let peer = bridge
            .new_peer_connection(&PeerConfig::default(), Some(&pool), recorder, HostContext(i))
            .unwrap();
        let (chan_recorder, _chan_rx) = ChanRecorder::pair();
        bridge
            .create_data_channel(
                peer,
                &ChannelConfig::reliable("pooled"),
                chan_recorder,
                HostContext(i),
            )
            .unwrap();
        bridge.create_offer(peer).unwrap();
        peers.push(peer);
        receivers.push(rx);
    }

    for rx in &receivers {
        assert!(wait_event(rx, LONG, |event| match event {
            PeerEvent::Offer(Ok(_)) => Some(()),
            _ => None,
        })
        .is_some());
    }
    for peer in peers {
        bridge.delete_peer_connection(peer).unwrap();
    }
}

#[test]
fn stale_handles_are_rejected() {
    let bridge = Bridge::new().unwrap();
    let (recorder, _rx) = PeerRecorder::pair();
    let peer = bridge
        .new_peer_connection(&PeerConfig::default(), None, recorder, HostContext(0))
        .unwrap();
    bridge.delete_peer_connection(peer).unwrap();

    assert!(matches!(
        bridge.create_offer(peer),
        Err(Error::UnknownHandle(_))
    ));
    assert!(matches!(
        bridge.delete_peer_connection(peer),
        Err(Error::UnknownHandle(_))
    ));
}

#[test]
fn data_channel_end_to_end() {
    init_tracing();
    let bridge = Bridge::new().unwrap();
    let (rec_a, rx_a) = PeerRecorder::pair();
    let (rec_b, rx_b) = PeerRecorder::pair();
    let a = bridge
        .new_peer_connection(&PeerConfig::default(), None, rec_a, HostContext(1))
        .unwrap();
    let b = bridge
        .new_peer_connection(&PeerConfig::default(), None, rec_b, HostContext(2))
        .unwrap();

    let (chan_rec_a, chan_rx_a) = ChanRecorder::pair();
    let chan_a = bridge
        .create_data_channel(
            a,
            &ChannelConfig::reliable("data"),
            chan_rec_a,
            HostContext(11),
        )
        .unwrap();

    // Offer/answer exchange.
    bridge.create_offer(a).unwrap();
    let offer = wait_event(&rx_a, LONG, |event| match event {
        PeerEvent::Offer(Ok(sdp)) => Some(sdp),
        _ => None,
    })
    .expect("offer");
    bridge.set_local_description(a, SdpType::Offer, &offer).unwrap();
    bridge.set_remote_description(b, SdpType::Offer, &offer).unwrap();
    bridge.create_answer(b).unwrap();
    let answer = wait_event(&rx_b, LONG, |event| match event {
        PeerEvent::Answer(Ok(sdp)) => Some(sdp),
        _ => None,
    })
    .expect("answer");
    bridge.set_local_description(b, SdpType::Answer, &answer).unwrap();
    bridge.set_remote_description(a, SdpType::Answer, &answer).unwrap();

    // Trickle candidates both ways until the offerer's channel opens.
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut a_open = false;
    let mut incoming: Option<Handle> = None;
    while !a_open && Instant::now() < deadline {
        while let Ok(event) = rx_a.try_recv() {
            if let PeerEvent::Candidate { mid, index, sdp } = event {
                let _ = bridge.add_ice_candidate(b, &mid, index, &sdp);
            }
        }
        while let Ok(event) = rx_b.try_recv() {
            match event {
                PeerEvent::Candidate { mid, index, sdp } => {
                    let _ = bridge.add_ice_candidate(a, &mid, index, &sdp);
                }
                PeerEvent::IncomingChannel { label, handle } => {
                    assert_eq!(label, "data");
                    incoming = Some(handle);
                }
                _ => {}
            }
        }
        while let Ok(event) = chan_rx_a.try_recv() {
            if matches!(event, ChanEvent::State(1)) {
                a_open = true;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert!(a_open, "offerer channel did not open");

    // Adopt the incoming channel on the answerer.
    let incoming = incoming
        .or_else(|| {
            wait_event(&rx_b, LONG, |event| match event {
                PeerEvent::IncomingChannel { handle, .. } => Some(handle),
                _ => None,
            })
        })
        .expect("incoming channel");
    let (chan_rec_b, chan_rx_b) = ChanRecorder::pair();
    bridge
        .set_channel_events(incoming, chan_rec_b, HostContext(22))
        .unwrap();
    let open_deadline = Instant::now() + Duration::from_secs(10);
    while bridge.channel_state(incoming).unwrap() != 1 && Instant::now() < open_deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(bridge.channel_state(incoming).unwrap(), 1);

    // One message across, counters on both ends.
    assert!(bridge.channel_send(chan_a, b"hello over sctp").unwrap());
    let message = wait_event(&chan_rx_b, LONG, |event| match event {
        ChanEvent::Message(data) => Some(data),
        _ => None,
    })
    .expect("message on answerer");
    assert_eq!(message, b"hello over sctp");
    assert_eq!(bridge.channel_messages_sent(chan_a).unwrap(), 1);
    assert!(bridge.channel_bytes_sent(chan_a).unwrap() >= message.len() as u64);
    assert_eq!(bridge.channel_messages_received(incoming).unwrap(), 1);

    bridge.delete_data_channel(chan_a).unwrap();
    bridge.delete_data_channel(incoming).unwrap();
    bridge.delete_peer_connection(a).unwrap();
    bridge.delete_peer_connection(b).unwrap();
}
