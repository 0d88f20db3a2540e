//! # RTP session
//!
//! A [`Session`] carries one media type to all remote participants. It owns the negotiated codec associations,
//! the send path (one encoder at a time plus the special sources) and the receive sub-streams, which it assigns to
//! [`Stream`]s by SSRC.
//!
//! All state lives behind a single lock. Building encoders, decoders, the discovery branch and transmitters is
//! done with the lock released, the state is checked for changes made in the meantime afterwards.

use crate::{
    Error,
    backend::MediaBackend,
    caps::Caps,
    codec::{Codec, CodecBlueprint, CodecPreference, MediaType},
    conference::Participant,
    config::{SessionConfig, TfrcMode},
    dtmf::DtmfQueue,
    event::{ConferenceEvent, ErrorSource, EventQueue},
    hdrext::RtpHeaderExtension,
    negotiation::{
        CodecAssociation, ValidPreference, associations_to_codecs, lookup_by_codec_for_sending,
        validate_preferences,
    },
    rate_control::RateControl,
    special_source::{SpecialSourceKind, SpecialSources},
    srtp::SrtpParameters,
    stream::{Direction, Stream, StreamId, StreamState},
    substream::{SubStream, SubStreamId},
};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use slotmap::SlotMap;
use std::{
    cell::Cell,
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

mod codecs;
mod discovery;
mod recv;
mod rtp;
mod send;
mod transmitter;

pub(crate) use codecs::negotiate;

/// Identifier of a session, unique within its conference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub(crate) u32);

impl SessionId {
    pub(crate) fn step(&mut self) -> Self {
        let id = *self;
        self.0 += 1;
        id
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) type StateGuard<'a> = MutexGuard<'a, SessionState>;

thread_local! {
    /// Number of session calls in progress on this thread
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as being inside a session call until dropped
///
/// Backend calls and pipeline hooks made while it is alive run on the thread that drives the pipeline.
pub(crate) struct CallScope(());

impl CallScope {
    pub(crate) fn new() -> Self {
        CALL_DEPTH.set(CALL_DEPTH.get() + 1);
        Self(())
    }

    /// Is the current thread inside any session call
    pub(crate) fn is_active() -> bool {
        CALL_DEPTH.get() > 0
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        CALL_DEPTH.set(CALL_DEPTH.get().saturating_sub(1));
    }
}

/// Guard returned by [`SessionInner::enter`]
pub(crate) struct Entered<'a> {
    _disposed: RwLockReadGuard<'a, bool>,
    _scope: CallScope,
}

#[derive(Default)]
pub(crate) struct SendState {
    /// Codec set with [`Session::set_send_codec`]
    pub(crate) requested_codec: Option<Codec>,
    /// Association the current encoder was built from
    pub(crate) current: Option<CodecAssociation>,
    /// Waiting for the send path to block
    pub(crate) block_pending: bool,
    /// The send path is blocked, after a failed replacement it stays blocked until the codecs change
    pub(crate) blocked: bool,
    /// The encoder is being replaced
    pub(crate) swapping: bool,
    pub(crate) has_encoder: bool,
    pub(crate) valve_open: bool,
    /// Additional codecs produced by the encoder
    pub(crate) other_codecs: Vec<Codec>,
    pub(crate) special_sources: SpecialSources,
    /// Bits per second, 0 lets the encoder choose
    pub(crate) bitrate: u32,
    pub(crate) streams_sending: usize,
}

#[derive(Default)]
pub(crate) struct DiscoveryState {
    pub(crate) block_pending: bool,
    /// Association the discovery encoder runs for
    pub(crate) active: Option<CodecAssociation>,
    /// Configuration was discovered but not announced yet
    pub(crate) gathered: bool,
}

pub(crate) struct SessionState {
    pub(crate) config: SessionConfig,
    pub(crate) disposed: bool,

    pub(crate) blueprints: Vec<Arc<CodecBlueprint>>,
    pub(crate) special_kinds: Vec<SpecialSourceKind>,
    pub(crate) preferences: Vec<CodecPreference>,
    pub(crate) valid_preferences: Vec<ValidPreference>,
    pub(crate) preferences_generation: u64,
    pub(crate) input_caps: Caps,
    pub(crate) output_caps: Caps,

    pub(crate) associations: Vec<CodecAssociation>,
    /// Incremented every time the associations are replaced
    pub(crate) codecs_generation: u64,
    pub(crate) hdrext: Vec<RtpHeaderExtension>,

    pub(crate) streams: SlotMap<StreamId, StreamState>,
    /// Streams in creation order, negotiation visits them in this order
    pub(crate) stream_order: Vec<StreamId>,
    pub(crate) substreams: SlotMap<SubStreamId, SubStream>,
    pub(crate) ssrc_streams: HashMap<u32, StreamId>,
    /// SSRCs bound with [`Stream::add_id`], they survive a BYE
    pub(crate) ssrc_manual: HashSet<u32>,

    pub(crate) send: SendState,
    pub(crate) discovery: DiscoveryState,
    pub(crate) dtmf: DtmfQueue,
    pub(crate) encryption: Option<SrtpParameters>,
    pub(crate) ssrc: u32,
    pub(crate) rate_control: Option<RateControl>,
}

impl SessionState {
    pub(crate) fn stream_ids(&self) -> Vec<StreamId> {
        self.stream_order.clone()
    }
}

pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    pub(crate) media_type: MediaType,
    pub(crate) backend: Arc<dyn MediaBackend>,
    pub(crate) events: EventQueue,
    disposed: RwLock<bool>,
    pub(crate) state: Mutex<SessionState>,
}

/// A RTP session of a [`Conference`](crate::Conference)
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("media_type", &self.inner.media_type)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        media_type: MediaType,
        config: SessionConfig,
        backend: Arc<dyn MediaBackend>,
        events: EventQueue,
    ) -> Result<Self, Error> {
        let special_kinds: Vec<SpecialSourceKind> = SpecialSourceKind::ALL
            .into_iter()
            .filter(|kind| backend.supports_special_source(*kind))
            .collect();

        let mut blueprints: Vec<Arc<CodecBlueprint>> = backend
            .blueprints(media_type)
            .into_iter()
            .filter(|bp| bp.codec.media_type == media_type)
            .map(Arc::new)
            .collect();

        for kind in &special_kinds {
            kind.add_blueprints(&mut blueprints);
        }

        let rate_control = (config.tfrc == TfrcMode::Enabled).then(|| RateControl::new(Instant::now()));

        let state = SessionState {
            config,
            disposed: false,
            blueprints,
            special_kinds,
            preferences: Vec::new(),
            valid_preferences: Vec::new(),
            preferences_generation: 0,
            input_caps: Caps::new_any(),
            output_caps: Caps::new_any(),
            associations: Vec::new(),
            codecs_generation: 0,
            hdrext: Vec::new(),
            streams: SlotMap::with_key(),
            stream_order: Vec::new(),
            substreams: SlotMap::with_key(),
            ssrc_streams: HashMap::new(),
            ssrc_manual: HashSet::new(),
            send: SendState::default(),
            discovery: DiscoveryState::default(),
            dtmf: DtmfQueue::default(),
            encryption: None,
            ssrc: rand::random(),
            rate_control,
        };

        let inner = Arc::new(SessionInner {
            id,
            media_type,
            backend,
            events,
            disposed: RwLock::new(false),
            state: Mutex::new(state),
        });

        inner.update_codecs(&mut inner.state.lock())?;

        log::debug!("Created {media_type} session {id}");

        Ok(Self { inner })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn media_type(&self) -> MediaType {
        self.inner.media_type
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Create the stream of `participant` in this session
    ///
    /// Every participant can have a single stream per session.
    pub fn new_stream(&self, participant: &Participant, direction: Direction) -> Result<Stream, Error> {
        let _entered = self.inner.enter()?;
        let mut state = self.inner.state.lock();

        if state
            .streams
            .values()
            .any(|stream| stream.participant == participant.id())
        {
            return Err(Error::AlreadyExists(format!(
                "There already is a stream for participant {} in session {}",
                participant.cname(),
                self.inner.id
            )));
        }

        let stream = state
            .streams
            .insert(StreamState::new(participant.id(), participant.cname().into(), direction));
        state.stream_order.push(stream);

        log::debug!("Created stream for {} in session {}", participant.cname(), self.inner.id);

        if direction.contains(Direction::SEND) {
            self.inner.update_sending(&mut state);
        }

        Ok(Stream::new(stream, &self.inner))
    }

    /// Set the codec preferences and renegotiate
    ///
    /// Fails with [`Error::NoCodecsLeft`] if no codec remains, the previous preferences stay in effect.
    pub fn set_codec_preferences(&self, preferences: Vec<CodecPreference>) -> Result<(), Error> {
        let _entered = self.inner.enter()?;

        let blueprints = self.inner.state.lock().blueprints.clone();

        // Parsing profiles may be slow, the lock is not held
        let valid = validate_preferences(self.inner.media_type, &blueprints, &preferences, |profile, direction| {
            self.inner.backend.parse_profile(profile, direction)
        });

        let mut state = self.inner.state.lock();

        let old_preferences = std::mem::replace(&mut state.preferences, preferences);
        let old_valid = std::mem::replace(&mut state.valid_preferences, valid);
        state.preferences_generation += 1;
        let generation = state.preferences_generation;

        match self.inner.update_codecs(&mut state) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Only restore if nobody else set preferences in the meantime
                if state.preferences_generation == generation {
                    state.preferences = old_preferences;
                    state.valid_preferences = old_valid;
                }

                Err(e)
            }
        }
    }

    pub fn codec_preferences(&self) -> Vec<CodecPreference> {
        self.inner.state.lock().preferences.clone()
    }

    /// Select the codec to send with, it must be one of [`Session::codecs`]
    pub fn set_send_codec(&self, codec: &Codec) -> Result<(), Error> {
        let _entered = self.inner.enter()?;
        let mut state = self.inner.state.lock();

        if lookup_by_codec_for_sending(&state.associations, codec).is_none() {
            return Err(Error::InvalidArguments(format!(
                "The passed codec is not part of the list of codecs: {codec}"
            )));
        }

        state.send.requested_codec = Some(codec.clone());
        self.inner.verify_send_codec_bin(&mut state);

        Ok(())
    }

    /// Queue the start of a telephony event, completion is reported with
    /// [`ConferenceEvent::TelephonyEventStarted`]
    pub fn start_telephony_event(&self, number: u8, volume: u8) -> bool {
        let Ok(_entered) = self.inner.enter() else {
            return false;
        };

        let mut state = self.inner.state.lock();

        if !state.dtmf.start(number, volume) {
            return false;
        }

        self.inner.pump_telephony_events(&mut state);
        true
    }

    /// Queue the stop of the running telephony event
    pub fn stop_telephony_event(&self) -> bool {
        let Ok(_entered) = self.inner.enter() else {
            return false;
        };

        let mut state = self.inner.state.lock();

        if !state.dtmf.stop() {
            return false;
        }

        self.inner.pump_telephony_events(&mut state);
        true
    }

    /// Encrypt outgoing packets with the given parameters, `None` sends in the clear
    pub fn set_encryption_parameters(&self, parameters: Option<SrtpParameters>) -> Result<(), Error> {
        let _entered = self.inner.enter()?;

        if let Some(parameters) = &parameters {
            parameters.validate()?;
        }

        let mut state = self.inner.state.lock();

        self.inner
            .backend
            .set_encryption(self.inner.id, parameters.as_ref())?;

        state.encryption = parameters;

        Ok(())
    }

    pub fn encryption_parameters(&self) -> Option<SrtpParameters> {
        self.inner.state.lock().encryption.clone()
    }

    /// Restrict the raw caps accepted by encoders (`sink`) and produced by decoders (`src`)
    ///
    /// Fails with [`Error::NoCodecsLeft`] if no codec can handle the caps, nothing changes in that case.
    pub fn set_allowed_caps(&self, sink: Option<Caps>, src: Option<Caps>) -> Result<(), Error> {
        let _entered = self.inner.enter()?;
        let mut state = self.inner.state.lock();

        let old_sink = sink.map(|caps| std::mem::replace(&mut state.input_caps, caps));
        let old_src = src.map(|caps| std::mem::replace(&mut state.output_caps, caps));

        if let Err(e) = self.inner.update_codecs(&mut state) {
            if let Some(caps) = old_sink {
                state.input_caps = caps;
            }

            if let Some(caps) = old_src {
                state.output_caps = caps;
            }

            return Err(e);
        }

        Ok(())
    }

    pub fn allowed_sink_caps(&self) -> Caps {
        self.inner.state.lock().input_caps.clone()
    }

    pub fn allowed_src_caps(&self) -> Caps {
        self.inner.state.lock().output_caps.clone()
    }

    /// The negotiated codecs, `None` while the configuration of any codec has yet to be discovered
    pub fn codecs(&self) -> Option<Vec<Codec>> {
        let state = self.inner.state.lock();

        if state.associations.iter().any(discovery::awaits_config) {
            return None;
        }

        Some(associations_to_codecs(&state.associations, true))
    }

    /// The negotiated codecs without any configuration parameters
    pub fn codecs_without_config(&self) -> Vec<Codec> {
        associations_to_codecs(&self.inner.state.lock().associations, false)
    }

    pub fn codec_associations(&self) -> Vec<CodecAssociation> {
        self.inner.state.lock().associations.clone()
    }

    /// Codec the current encoder was built for
    pub fn current_send_codec(&self) -> Option<Codec> {
        self.inner
            .state
            .lock()
            .send
            .current
            .as_ref()
            .map(|ca| ca.codec.clone())
    }

    pub fn rtp_header_extensions(&self) -> Vec<RtpHeaderExtension> {
        self.inner.state.lock().hdrext.clone()
    }

    pub fn set_rtp_header_extension_preferences(&self, preferences: Vec<RtpHeaderExtension>) -> Result<(), Error> {
        let _entered = self.inner.enter()?;
        let mut state = self.inner.state.lock();

        let old = std::mem::replace(&mut state.config.rtp_header_extension_preferences, preferences);

        if let Err(e) = self.inner.update_codecs(&mut state) {
            state.config.rtp_header_extension_preferences = old;
            return Err(e);
        }

        Ok(())
    }

    /// SSRC used to send media
    pub fn ssrc(&self) -> u32 {
        self.inner.state.lock().ssrc
    }

    /// Bitrate for the encoder in bits per second, ignored while TFRC controls the rate
    pub fn set_send_bitrate(&self, bitrate: u32) -> Result<(), Error> {
        let _entered = self.inner.enter()?;
        let mut state = self.inner.state.lock();

        if bitrate != 0 {
            state.send.bitrate = bitrate;
        }

        self.inner.apply_bitrate(&mut state);

        Ok(())
    }

    pub fn send_bitrate(&self) -> u32 {
        self.inner.state.lock().send.bitrate
    }

    /// Tear down the session
    ///
    /// Pending blocks, discovery and timers are cancelled, all media elements are removed. Every later call fails
    /// with [`Error::Disposed`].
    ///
    /// The pipeline can't be torn down from the thread driving it. Calling this from within a [`MediaBackend`]
    /// call or a pipeline hook logs an error and leaves the session untouched.
    pub fn dispose(&self) -> Result<(), Error> {
        if CallScope::is_active() {
            log::error!(
                "Session {} must not be disposed from the thread driving its pipeline",
                self.inner.id
            );

            return Err(Error::InvalidArguments(
                "session disposed from within a pipeline call".into(),
            ));
        }

        let _scope = CallScope::new();
        let mut disposed = self.inner.disposed.write();

        if *disposed {
            return Err(Error::disposed("session"));
        }

        *disposed = true;

        let mut state = self.inner.state.lock();
        self.inner.dispose_locked(&mut state);

        log::debug!("Disposed session {}", self.inner.id);

        Ok(())
    }
}

impl SessionInner {
    /// Guard entering the session, fails if the session is disposed
    pub(crate) fn enter(&self) -> Result<Entered<'_>, Error> {
        // Hooks may be called from within backend calls made while entered
        let guard = self.disposed.read_recursive();

        if *guard {
            return Err(Error::disposed("session"));
        }

        Ok(Entered {
            _disposed: guard,
            _scope: CallScope::new(),
        })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        *self.disposed.read_recursive()
    }

    pub(crate) fn emit(&self, event: ConferenceEvent) {
        self.events.push(event);
    }

    pub(crate) fn error(&self, error: Error) {
        self.events.error(ErrorSource::Session(self.id), error);
    }

    pub(crate) fn stream_error(&self, stream: StreamId, error: Error) {
        self.events.error(ErrorSource::Stream(self.id, stream), error);
    }

    fn dispose_locked(&self, state: &mut StateGuard<'_>) {
        state.disposed = true;

        if state.send.block_pending || state.send.blocked {
            state.send.block_pending = false;
            state.send.blocked = false;
            self.backend.unblock_send_path(self.id);
        }

        state.discovery = DiscoveryState::default();
        self.backend.stop_discovery(self.id);

        self.backend.set_input_valve(self.id, true);
        state.send.valve_open = false;

        for kind in state.send.special_sources.take_all() {
            self.backend.stop_special_source(self.id, kind);
        }

        if state.send.has_encoder {
            state.send.has_encoder = false;
            self.backend.remove_encoder(self.id);
        }

        state.send.current = None;

        for (id, substream) in state.substreams.drain() {
            if substream.decoder.is_some() {
                self.backend.remove_decoder(self.id, id);
            }
        }

        for (_, mut stream) in state.streams.drain() {
            stream.stop_transmitter();
        }

        state.stream_order.clear();
        state.ssrc_streams.clear();
        state.ssrc_manual.clear();
        state.dtmf.clear();
        state.rate_control = None;
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock();

        if state.disposed {
            return None;
        }

        let no_rtcp = state
            .substreams
            .values()
            .filter_map(|substream| substream.no_rtcp_deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));

        let rate_control = state
            .rate_control
            .as_ref()
            .and_then(|rate_control| rate_control.timeout(now));

        crate::opt_min(no_rtcp, rate_control)
    }

    pub(crate) fn poll(&self, now: Instant) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        self.poll_no_rtcp_timers(&mut state, now);
        self.poll_rate_control(&mut state, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_step() {
        let mut next = SessionId(1);

        assert_eq!(next.step(), SessionId(1));
        assert_eq!(next.step().get(), 2);
        assert_eq!(next.to_string(), "3");
    }
}
