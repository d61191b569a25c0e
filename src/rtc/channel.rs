//! Data channel adapter
//!
//! Wraps one negotiated data channel: admission-checked sends, property
//! queries over the native flags, running traffic counters and last-error
//! capture. Teardown order matters and is fixed: the event sink is
//! unregistered first, then the native channel is closed, then the native
//! reference is released, so an in-flight native callback can never land
//! in a sink that is already gone.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::config::ChannelConfig;
use crate::handle::{EventSlot, Handle, HostContext};
use crate::pool::EventLoop;
use crate::rtc::events::{
    data_channel_state_code, ChannelEvents, NoopChannelEvents, SessionError,
};

/// Upper bound on queued outbound bytes; sends that would exceed it are
/// rejected by the admission check.
pub const MAX_SEND_QUEUE_SIZE: u64 = 16 * 1024 * 1024;

/// Adapter around one native data channel
pub struct DataChannel {
    handle: Handle,
    dc: Arc<RTCDataChannel>,
    signaling: Arc<EventLoop>,
    slot: Arc<EventSlot<dyn ChannelEvents>>,
    reliable: bool,
    messages_sent: AtomicU32,
    messages_received: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_error: Mutex<Option<SessionError>>,
    closed: AtomicBool,
}

impl DataChannel {
    /// Wrap a channel created by the local side; the host sink is live
    /// from the first native event.
    pub(crate) fn create(
        dc: Arc<RTCDataChannel>,
        signaling: Arc<EventLoop>,
        events: Arc<dyn ChannelEvents>,
        ctx: HostContext,
        config: &ChannelConfig,
    ) -> Arc<Self> {
        Self::build(dc, signaling, events, ctx, config.is_reliable())
    }

    /// Wrap a channel announced by the remote side. Events go to a no-op
    /// sink until the host attaches one via `set_events`.
    pub(crate) fn adopt(dc: Arc<RTCDataChannel>, signaling: Arc<EventLoop>) -> Arc<Self> {
        let reliable = dc.max_retransmits() == 0 && dc.max_packet_lifetime() == 0;
        Self::build(dc, signaling, Arc::new(NoopChannelEvents), HostContext::default(), reliable)
    }

    fn build(
        dc: Arc<RTCDataChannel>,
        signaling: Arc<EventLoop>,
        events: Arc<dyn ChannelEvents>,
        ctx: HostContext,
        reliable: bool,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            handle: Handle::next(),
            dc,
            signaling,
            slot: Arc::new(EventSlot::new(events, ctx)),
            reliable,
            messages_sent: AtomicU32::new(0),
            messages_received: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        channel.clone().install_handlers();
        channel
    }

    fn install_handlers(self: Arc<Self>) {
        let weak = Arc::downgrade(&self);
        self.dc.on_open(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.fire_state_change();
                }
            })
        }));

        let weak = Arc::downgrade(&self);
        self.dc.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.fire_state_change();
                }
            })
        }));

        let weak = Arc::downgrade(&self);
        self.dc.on_error(Box::new(move |err| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    debug!(channel = %channel.handle, error = %err, "data channel error");
                    *channel.last_error.lock() = Some(SessionError::from_webrtc(&err));
                }
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(&self);
        self.dc.on_message(Box::new(move |message: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel.deliver_message(&message);
                }
            })
        }));
    }

    fn fire_state_change(&self) {
        let code = data_channel_state_code(self.dc.ready_state());
        self.slot
            .sink()
            .on_state_change(self.handle, code, self.slot.context());
    }

    fn deliver_message(&self, message: &DataChannelMessage) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(message.data.len() as u64, Ordering::Relaxed);
        self.slot.sink().on_message(
            self.handle,
            &message.data,
            message.is_string,
            self.slot.context(),
        );
    }

    /// Adapter handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Attach the host event sink and context. Used for channels that
    /// arrived via the incoming-channel event.
    pub fn set_events(&self, events: Arc<dyn ChannelEvents>, ctx: HostContext) {
        self.slot.set_sink(events);
        self.slot.set_context(ctx);
    }

    /// Update the host context carried by subsequent events
    pub fn set_context(&self, ctx: HostContext) {
        self.slot.set_context(ctx);
    }

    /// Queue one message for sending.
    ///
    /// Pure admission check: returns `false` when the channel is not open,
    /// when the queued amount would exceed [`MAX_SEND_QUEUE_SIZE`], or when
    /// the native send is rejected. A rejected send changes no counters and
    /// is never retried here.
    pub fn send(self: Arc<Self>, data: &[u8]) -> bool {
        if self.closed.load(Ordering::Acquire)
            || self.dc.ready_state() != RTCDataChannelState::Open
        {
            return false;
        }

        let payload = Bytes::copy_from_slice(data);
        let len = payload.len() as u64;
        let this = self.clone();
        let outcome = self.signaling.run(move || async move {
            let queued = this.dc.buffered_amount().await as u64;
            if queued.saturating_add(len) > MAX_SEND_QUEUE_SIZE {
                return false;
            }
            match this.dc.send(&payload).await {
                Ok(_) => {
                    this.messages_sent.fetch_add(1, Ordering::Relaxed);
                    this.bytes_sent.fetch_add(len, Ordering::Relaxed);
                    let buffered = this.dc.buffered_amount().await as u64;
                    this.slot.sink().on_buffered_amount_change(
                        this.handle,
                        buffered,
                        this.slot.context(),
                    );
                    true
                }
                Err(err) => {
                    *this.last_error.lock() = Some(SessionError::from_webrtc(&err));
                    false
                }
            }
        });
        outcome.unwrap_or(false)
    }

    /// Channel label
    pub fn label(&self) -> String {
        self.dc.label().to_string()
    }

    /// True when the channel delivers without retransmit/lifetime limits
    pub fn reliable(&self) -> bool {
        self.reliable
    }

    /// True when messages are delivered in order
    pub fn ordered(&self) -> bool {
        self.dc.ordered()
    }

    /// Application protocol tag
    pub fn protocol(&self) -> String {
        self.dc.protocol().to_string()
    }

    /// True when the channel was negotiated out of band
    pub fn negotiated(&self) -> bool {
        self.dc.negotiated()
    }

    /// Current state as an integer code
    pub fn state_code(&self) -> i32 {
        data_channel_state_code(self.dc.ready_state())
    }

    /// Most recent native error, `None` when clean
    pub fn last_error(&self) -> Option<SessionError> {
        self.last_error.lock().clone()
    }

    /// Messages sent so far
    pub fn messages_sent(&self) -> u32 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Messages received so far
    pub fn messages_received(&self) -> u32 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Bytes sent so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received so far
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Currently queued outbound bytes
    pub fn buffered_amount(&self) -> u64 {
        let dc = self.dc.clone();
        self.signaling
            .run(move || async move { dc.buffered_amount().await as u64 })
            .unwrap_or(0)
    }

    /// Maximum allowed send-queue size in bytes
    pub fn max_send_queue_size(&self) -> u64 {
        MAX_SEND_QUEUE_SIZE
    }

    /// Tear the channel down: unregister the sink, close the native
    /// channel, and leave the final release to the arena. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slot.set_sink(Arc::new(NoopChannelEvents));
        let dc = self.dc.clone();
        let _ = self.signaling.run(move || async move {
            let _ = dc.close().await;
        });
        debug!(channel = %self.handle, "data channel closed");
    }
}
