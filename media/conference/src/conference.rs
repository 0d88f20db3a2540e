//! # Conference
//!
//! The [`Conference`] is the top level object. It owns the sessions (one per media type and RTP session), the
//! participants and the event queue, and it receives the callbacks of the media pipeline through
//! [`RtpPipelineHooks`].
//!
//! The conference is sans-io: time driven work happens in [`Conference::poll`], which must be called again after
//! [`Conference::timeout`] elapsed. Events are retrieved with [`Conference::pop_event`].

use crate::{
    Error,
    backend::MediaBackend,
    caps::Caps,
    codec::{MediaType, ParamType, copy_filtered},
    config::{ConferenceConfig, SessionConfig, TfrcMode},
    dtmf::DtmfMessage,
    event::{ConferenceEvent, EventQueue},
    negotiation::lookup_by_pt,
    rate_control::OutgoingRtp,
    session::{Session, SessionId},
    srtp::SrtpParameters,
    substream::SubStreamId,
};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::distr::{Alphanumeric, SampleString};
use slotmap::SlotMap;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

slotmap::new_key_type! {
    /// Identifier of a participant, unique within its conference
    pub struct ParticipantId;
}

/// A remote participant, identified by its RTCP CNAME
#[derive(Debug, Clone)]
pub struct Participant {
    id: ParticipantId,
    cname: Arc<str>,
}

impl Participant {
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn cname(&self) -> &str {
        &self.cname
    }
}

/// Callbacks of the media pipeline into the conference
///
/// Implemented by [`Conference`]. Every callback is keyed by the session the pipeline element belongs to, callbacks
/// for unknown or disposed sessions are ignored. Callbacks must not be made from within a [`MediaBackend`] call
/// which holds a session's lock, unless stated otherwise by that call.
pub trait RtpPipelineHooks {
    /// Caps of a payload type to configure the jitterbuffer and depayloader with
    fn request_pt_map(&self, session: SessionId, pt: u8) -> Option<Caps>;

    /// A new SSRC/payload type combination appeared on the receive path
    ///
    /// Returns the sub-stream the packets belong to, `None` drops them.
    fn new_recv_pad(&self, session: SessionId, ssrc: u32, pt: u8) -> Option<SubStreamId>;

    fn bye_ssrc(&self, session: SessionId, ssrc: u32);

    /// RTCP SDES carried the CNAME of a SSRC
    fn ssrc_cname(&self, session: SessionId, ssrc: u32, cname: &str);

    fn ssrc_validated(&self, session: SessionId, ssrc: u32);

    /// Key to decrypt a SSRC with, `None` drops its packets
    fn request_decryption_key(&self, session: SessionId, ssrc: u32) -> Option<SrtpParameters>;

    /// Answer to [`MediaBackend::block_send_path`]
    fn send_path_blocked(&self, session: SessionId);

    /// Answer to [`MediaBackend::block_discovery_path`]
    fn discovery_path_blocked(&self, session: SessionId);

    /// Output caps of the encoder on the discovery branch
    fn discovery_caps(&self, session: SessionId, caps: &Caps);

    /// Output caps of the encoder on the send path
    fn send_caps(&self, session: SessionId, caps: &Caps);

    /// A special source processed or dropped a telephony event
    fn telephony_message(&self, session: SessionId, message: &DtmfMessage);

    fn incoming_rtp(&self, session: SessionId, packet: &[u8]);

    fn incoming_rtcp(&self, session: SessionId, packet: &[u8]);

    /// A RTP packet is about to leave, returns the packet to send and the time to hold it back
    fn outgoing_rtp(&self, session: SessionId, packet: Bytes) -> OutgoingRtp;
}

struct ConferenceState {
    sessions: Vec<Session>,
    next_session_id: SessionId,
    participants: SlotMap<ParticipantId, Arc<str>>,
}

struct ConferenceInner {
    config: ConferenceConfig,
    cname: String,
    backend: Arc<dyn MediaBackend>,
    events: EventQueue,
    state: Mutex<ConferenceState>,
}

/// RTP conference, see the [module docs](self)
#[derive(Clone)]
pub struct Conference {
    inner: Arc<ConferenceInner>,
}

impl fmt::Debug for Conference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conference")
            .field("cname", &self.inner.cname)
            .finish_non_exhaustive()
    }
}

impl Conference {
    pub fn new(config: ConferenceConfig, backend: Arc<dyn MediaBackend>) -> Self {
        let cname = config
            .sdes_cname
            .clone()
            .unwrap_or_else(|| format!("{}@ezk", Alphanumeric.sample_string(&mut rand::rng(), 16)));

        log::debug!("Created conference with cname {cname}");

        Self {
            inner: Arc::new(ConferenceInner {
                config,
                cname,
                backend,
                events: EventQueue::default(),
                state: Mutex::new(ConferenceState {
                    sessions: Vec::new(),
                    next_session_id: SessionId(1),
                    participants: SlotMap::with_key(),
                }),
            }),
        }
    }

    /// CNAME sent by all sessions of this conference
    pub fn sdes_cname(&self) -> &str {
        &self.inner.cname
    }

    /// Add a participant, the CNAME associates its SSRCs with its streams
    pub fn new_participant(&self, cname: &str) -> Result<Participant, Error> {
        if cname.is_empty() {
            return Err(Error::InvalidArguments("The participant's cname must not be empty".into()));
        }

        let cname: Arc<str> = Arc::from(cname);
        let id = self.inner.state.lock().participants.insert(cname.clone());

        Ok(Participant { id, cname })
    }

    /// Create a session with the conference's defaults, TFRC is only used for video
    pub fn new_session(&self, media_type: MediaType) -> Result<Session, Error> {
        let tfrc = if media_type == MediaType::Video {
            self.inner.config.tfrc
        } else {
            TfrcMode::Disabled
        };

        self.new_session_with_config(
            media_type,
            SessionConfig {
                no_rtcp_timeout: self.inner.config.no_rtcp_timeout,
                tfrc,
                ..SessionConfig::default()
            },
        )
    }

    pub fn new_session_with_config(&self, media_type: MediaType, config: SessionConfig) -> Result<Session, Error> {
        let id = self.inner.state.lock().next_session_id.step();

        let session = Session::new(
            id,
            media_type,
            config,
            self.inner.backend.clone(),
            self.inner.events.clone(),
        )?;

        self.inner.state.lock().sessions.push(session.clone());

        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner
            .state
            .lock()
            .sessions
            .iter()
            .find(|session| session.id() == id && !session.is_disposed())
            .cloned()
    }

    /// All sessions which have not been disposed
    pub fn sessions(&self) -> Vec<Session> {
        let mut state = self.inner.state.lock();
        state.sessions.retain(|session| !session.is_disposed());
        state.sessions.clone()
    }

    /// Wake the task driving the conference, e.g. when a transmitter has new events
    pub fn wake(&self) {
        self.inner.events.wake();
    }

    /// Take the next event
    ///
    /// Transmitter events are collected when the queue is empty.
    pub fn pop_event(&self) -> Option<ConferenceEvent> {
        if let Some(event) = self.inner.events.pop() {
            return Some(event);
        }

        for session in self.sessions() {
            session.inner.poll_transmitters();
        }

        self.inner.events.pop()
    }

    pub fn has_events(&self) -> bool {
        !self.inner.events.is_empty()
    }

    /// Duration until [`poll`](Self::poll) must be called again
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.sessions()
            .iter()
            .fold(None, |timeout, session| crate::opt_min(timeout, session.inner.timeout(now)))
    }

    /// Drive time based work: unbound SSRCs without RTCP and TFRC timers
    pub fn poll(&self, now: Instant) {
        for session in self.sessions() {
            session.inner.poll(now);
            session.inner.poll_transmitters();
        }
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn notify(&self) -> Arc<tokio::sync::Notify> {
        self.inner.events.notify()
    }
}

impl RtpPipelineHooks for Conference {
    fn request_pt_map(&self, session: SessionId, pt: u8) -> Option<Caps> {
        let session = self.session(session)?;
        let state = session.inner.state.lock();

        let Some(ca) = lookup_by_pt(&state.associations, i32::from(pt), false) else {
            log::debug!("No codec for pt {pt} in session {}", session.id());
            return None;
        };

        Some(copy_filtered(&ca.codec, ParamType::CONFIG).to_rtp_caps())
    }

    fn new_recv_pad(&self, session: SessionId, ssrc: u32, pt: u8) -> Option<SubStreamId> {
        self.session(session)?.inner.new_recv_pad(ssrc, pt)
    }

    fn bye_ssrc(&self, session: SessionId, ssrc: u32) {
        if let Some(session) = self.session(session) {
            session.inner.bye_ssrc(ssrc);
        }
    }

    fn ssrc_cname(&self, session: SessionId, ssrc: u32, cname: &str) {
        if let Some(session) = self.session(session) {
            session.inner.ssrc_cname(ssrc, cname);
        }
    }

    fn ssrc_validated(&self, session: SessionId, ssrc: u32) {
        if let Some(session) = self.session(session) {
            session.inner.ssrc_validated(ssrc);
        }
    }

    fn request_decryption_key(&self, session: SessionId, ssrc: u32) -> Option<SrtpParameters> {
        self.session(session)?.inner.request_decryption_key(ssrc)
    }

    fn send_path_blocked(&self, session: SessionId) {
        if let Some(session) = self.session(session) {
            session.inner.send_path_blocked();
        }
    }

    fn discovery_path_blocked(&self, session: SessionId) {
        if let Some(session) = self.session(session) {
            session.inner.discovery_path_blocked();
        }
    }

    fn discovery_caps(&self, session: SessionId, caps: &Caps) {
        if let Some(session) = self.session(session) {
            session.inner.discovery_caps(caps);
        }
    }

    fn send_caps(&self, session: SessionId, caps: &Caps) {
        if let Some(session) = self.session(session) {
            session.inner.send_caps(caps);
        }
    }

    fn telephony_message(&self, session: SessionId, message: &DtmfMessage) {
        if let Some(session) = self.session(session) {
            session.inner.telephony_message(message);
        }
    }

    fn incoming_rtp(&self, session: SessionId, packet: &[u8]) {
        if let Some(session) = self.session(session) {
            session.inner.incoming_rtp(packet);
        }
    }

    fn incoming_rtcp(&self, session: SessionId, packet: &[u8]) {
        if let Some(session) = self.session(session) {
            session.inner.incoming_rtcp(packet);
        }
    }

    fn outgoing_rtp(&self, session: SessionId, packet: Bytes) -> OutgoingRtp {
        match self.session(session) {
            Some(session) => session.inner.outgoing_rtp(packet),
            None => OutgoingRtp {
                packet,
                delay: Duration::ZERO,
            },
        }
    }
}
