//! # Streams
//!
//! A [`Stream`] connects one participant to a session. It holds the participant's remote codecs and header
//! extensions, its transmitter and its direction. Its state lives inside the session, the handle only refers to it.

use crate::{
    Error,
    backend::StreamTransmitter,
    candidate::Candidate,
    codec::Codec,
    conference::ParticipantId,
    hdrext::RtpHeaderExtension,
    session::{SessionId, SessionInner, StateGuard},
    srtp::SrtpParameters,
};
use bitflags::bitflags;
use parking_lot::MutexGuard;
use std::{
    fmt,
    sync::{Arc, Weak},
};

bitflags! {
    /// Media direction of a stream or header extension
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Direction: u8 {
        const SEND = 1;
        const RECV = 1 << 1;
        const BOTH = Self::SEND.bits() | Self::RECV.bits();
    }
}

impl Direction {
    pub const NONE: Self = Self::empty();
}

slotmap::new_key_type! {
    /// Identifier of a stream, unique within its session
    pub struct StreamId;
}

pub(crate) enum TransmitterSlot {
    None,
    /// Being created with the session lock released
    Creating,
    Ready(Box<dyn StreamTransmitter>),
}

pub(crate) struct StreamState {
    pub(crate) participant: ParticipantId,
    pub(crate) cname: String,
    pub(crate) direction: Direction,
    /// Codecs as set by the application
    pub(crate) remote_codecs: Vec<Codec>,
    /// Session codecs including the configuration the remote sent for them
    pub(crate) negotiated_codecs: Vec<Codec>,
    /// Codecs currently decoded
    pub(crate) recv_codecs: Vec<Codec>,
    pub(crate) hdrext: Vec<RtpHeaderExtension>,
    pub(crate) decryption: Option<SrtpParameters>,
    pub(crate) require_encryption: bool,
    pub(crate) transmitter: TransmitterSlot,
}

impl StreamState {
    pub(crate) fn new(participant: ParticipantId, cname: String, direction: Direction) -> Self {
        Self {
            participant,
            cname,
            direction,
            remote_codecs: Vec::new(),
            negotiated_codecs: Vec::new(),
            recv_codecs: Vec::new(),
            hdrext: Vec::new(),
            decryption: None,
            require_encryption: false,
            transmitter: TransmitterSlot::None,
        }
    }

    pub(crate) fn has_transmitter(&self) -> bool {
        matches!(self.transmitter, TransmitterSlot::Ready(..))
    }

    pub(crate) fn transmitter(&mut self) -> Result<&mut dyn StreamTransmitter, Error> {
        match &mut self.transmitter {
            TransmitterSlot::Ready(transmitter) => Ok(transmitter.as_mut()),
            _ => Err(Error::InvalidArguments("The stream has no transmitter".into())),
        }
    }

    pub(crate) fn stop_transmitter(&mut self) {
        if let TransmitterSlot::Ready(mut transmitter) = std::mem::replace(&mut self.transmitter, TransmitterSlot::None)
        {
            transmitter.stop();
        }
    }
}

/// Handle to the stream of a participant in a [`Session`](crate::Session)
#[derive(Clone)]
pub struct Stream {
    id: StreamId,
    session_id: SessionId,
    session: Weak<SessionInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("session", &self.session_id)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(id: StreamId, session: &Arc<SessionInner>) -> Self {
        Self {
            id,
            session_id: session.id,
            session: Arc::downgrade(session),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Run `f` with the locked session, fails if the session or this stream is gone
    fn with_state<R>(
        &self,
        f: impl FnOnce(&SessionInner, &mut StateGuard<'_>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let session = self.session.upgrade().ok_or_else(|| Error::disposed("session"))?;
        let _entered = session.enter()?;
        let mut state = session.state.lock();

        if !state.streams.contains_key(self.id) {
            return Err(Error::disposed("stream"));
        }

        f(&session, &mut state)
    }

    /// Read from the stream's state, `None` if it is gone
    fn read<R>(&self, f: impl FnOnce(&StreamState) -> R) -> Option<R> {
        let session = self.session.upgrade()?;
        let state = session.state.lock();

        state.streams.get(self.id).map(f)
    }

    pub fn participant(&self) -> Option<ParticipantId> {
        self.read(|stream| stream.participant)
    }

    pub fn direction(&self) -> Direction {
        self.read(|stream| stream.direction).unwrap_or(Direction::NONE)
    }

    /// Change the direction, sending requires a transmitter and received media is dropped without `RECV`
    pub fn set_direction(&self, direction: Direction) -> Result<(), Error> {
        self.with_state(|session, state| {
            let stream = &mut state.streams[self.id];

            if stream.direction == direction {
                return Ok(());
            }

            log::debug!("Stream {:?} direction {:?} -> {direction:?}", self.id, stream.direction);

            stream.direction = direction;

            if let TransmitterSlot::Ready(transmitter) = &mut stream.transmitter {
                transmitter.set_sending(direction.contains(Direction::SEND));
            }

            session.update_substreams_receiving(state, self.id);
            session.update_sending(state);

            Ok(())
        })
    }

    /// Set the codecs the remote participant supports and renegotiate the session
    ///
    /// The remote codecs only replace the previous ones if the negotiation succeeds.
    pub fn set_remote_codecs(&self, codecs: Vec<Codec>) -> Result<(), Error> {
        self.with_state(|session, state| {
            if codecs.is_empty() {
                return Err(Error::InvalidArguments(
                    "You can not set an empty list of remote codecs".into(),
                ));
            }

            for codec in &codecs {
                if codec.encoding_name.is_empty() {
                    return Err(Error::InvalidArguments(format!(
                        "The codec must have an encoding name: {codec}"
                    )));
                }

                if !(0..=127).contains(&codec.id) {
                    return Err(Error::InvalidArguments(format!(
                        "The codec id must be between 0 and 127: {codec}"
                    )));
                }

                if codec.media_type != session.media_type {
                    return Err(Error::InvalidArguments(format!(
                        "The media type of {codec} is not {}",
                        session.media_type
                    )));
                }
            }

            let negotiated = crate::session::negotiate(state, Some((self.id, &codecs)))?;

            state.streams[self.id].remote_codecs = codecs;
            session.apply_negotiation(state, negotiated);

            Ok(())
        })
    }

    pub fn remote_codecs(&self) -> Vec<Codec> {
        self.read(|stream| stream.remote_codecs.clone())
            .unwrap_or_default()
    }

    /// Codecs negotiated with this stream's participant, including the configuration they sent
    pub fn negotiated_codecs(&self) -> Vec<Codec> {
        self.read(|stream| stream.negotiated_codecs.clone())
            .unwrap_or_default()
    }

    /// Codecs currently being received from this stream
    pub fn current_recv_codecs(&self) -> Vec<Codec> {
        self.read(|stream| stream.recv_codecs.clone())
            .unwrap_or_default()
    }

    /// Set the header extensions offered by the remote participant
    pub fn set_rtp_header_extensions(&self, extensions: Vec<RtpHeaderExtension>) -> Result<(), Error> {
        self.with_state(|session, state| {
            let old = std::mem::replace(&mut state.streams[self.id].hdrext, extensions);

            if state.streams[self.id].remote_codecs.is_empty() {
                return Ok(());
            }

            if let Err(e) = session.update_codecs(state) {
                if let Some(stream) = state.streams.get_mut(self.id) {
                    stream.hdrext = old;
                }

                return Err(e);
            }

            Ok(())
        })
    }

    pub fn rtp_header_extensions(&self) -> Vec<RtpHeaderExtension> {
        self.read(|stream| stream.hdrext.clone()).unwrap_or_default()
    }

    /// Create the transmitter of this stream and start gathering local candidates
    ///
    /// A stream has at most one transmitter, a second call fails with [`Error::AlreadyExists`].
    pub fn set_transmitter(&self, name: &str, parameters: &[(String, String)]) -> Result<(), Error> {
        self.with_state(|session, state| {
            let stream = &mut state.streams[self.id];

            if !matches!(stream.transmitter, TransmitterSlot::None) {
                return Err(Error::AlreadyExists("The stream already has a transmitter".into()));
            }

            stream.transmitter = TransmitterSlot::Creating;
            let participant = stream.participant;

            let result = MutexGuard::unlocked(state, || {
                session
                    .backend
                    .create_transmitter(session.id, participant, name, parameters)
            });

            let Some(stream) = state.streams.get_mut(self.id) else {
                if let Ok(mut transmitter) = result {
                    transmitter.stop();
                }

                return Err(Error::disposed("stream"));
            };

            let mut transmitter = match result {
                Ok(transmitter) => transmitter,
                Err(e) => {
                    stream.transmitter = TransmitterSlot::None;
                    return Err(e);
                }
            };

            transmitter.set_sending(stream.direction.contains(Direction::SEND));

            if let Err(e) = transmitter.gather_local_candidates() {
                transmitter.stop();
                stream.transmitter = TransmitterSlot::None;
                return Err(e);
            }

            log::debug!("Created {name} transmitter for stream {:?}", self.id);

            stream.transmitter = TransmitterSlot::Ready(transmitter);
            session.update_sending(state);

            Ok(())
        })
    }

    pub fn add_remote_candidates(&self, candidates: &[Candidate]) -> Result<(), Error> {
        if candidates.is_empty() {
            return Err(Error::InvalidArguments("The list of candidates is empty".into()));
        }

        self.with_state(|_, state| {
            state.streams[self.id]
                .transmitter()?
                .add_remote_candidates(candidates)
        })
    }

    /// Use exactly these remote candidates, skipping connectivity checks
    pub fn force_remote_candidates(&self, candidates: &[Candidate]) -> Result<(), Error> {
        if candidates.is_empty() {
            return Err(Error::InvalidArguments("The list of candidates is empty".into()));
        }

        self.with_state(|_, state| {
            state.streams[self.id]
                .transmitter()?
                .force_remote_candidates(candidates)
        })
    }

    /// Set the parameters to decrypt this participant's packets with, `None` removes them
    ///
    /// The keys of the stream's SSRCs are cleared, the decrypter requests them again with
    /// [`RtpPipelineHooks::request_decryption_key`](crate::RtpPipelineHooks::request_decryption_key).
    pub fn set_decryption_parameters(&self, parameters: Option<SrtpParameters>) -> Result<(), Error> {
        if let Some(parameters) = &parameters {
            parameters.validate()?;
        }

        self.with_state(|session, state| {
            if state.streams[self.id].decryption == parameters {
                return Ok(());
            }

            for (ssrc, _) in state.ssrc_streams.iter().filter(|(_, stream)| **stream == self.id) {
                session.backend.set_decryption_key(session.id, *ssrc, None);
            }

            state.streams[self.id].decryption = parameters;

            Ok(())
        })
    }

    /// Drop unencrypted packets from this participant
    pub fn set_require_encryption(&self, require: bool) -> Result<(), Error> {
        self.with_state(|session, state| {
            let stream = &mut state.streams[self.id];

            if stream.require_encryption == require {
                return Ok(());
            }

            stream.require_encryption = require;

            // Keys are requested again and answered with the new requirement
            for (ssrc, _) in state.ssrc_streams.iter().filter(|(_, stream)| **stream == self.id) {
                session.backend.set_decryption_key(session.id, *ssrc, None);
            }

            Ok(())
        })
    }

    /// Associate a SSRC with this stream without waiting for its CNAME
    pub fn add_id(&self, ssrc: u32) -> Result<(), Error> {
        self.with_state(|session, state| {
            session.add_ssrc_stream(state, ssrc, self.id, true);
            Ok(())
        })
    }

    /// Remove the stream from its session
    ///
    /// The transmitter is stopped and all sub-streams of the participant are torn down. If the stream had remote
    /// codecs the session is renegotiated without them.
    pub fn dispose(&self) -> Result<(), Error> {
        self.with_state(|session, state| {
            session.remove_stream_substreams(state, self.id);

            let Some(mut stream) = state.streams.remove(self.id) else {
                return Ok(());
            };

            state.stream_order.retain(|id| *id != self.id);
            stream.stop_transmitter();

            log::debug!("Disposed stream {:?} of session {}", self.id, session.id);

            session.update_sending(state);

            if !stream.remote_codecs.is_empty()
                && let Err(e) = session.update_codecs(state)
            {
                session.error(e);
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flags() {
        assert_eq!(Direction::SEND | Direction::RECV, Direction::BOTH);
        assert!(Direction::BOTH.contains(Direction::SEND));
        assert!(!Direction::NONE.contains(Direction::RECV));

        let mut direction = Direction::BOTH;
        direction &= Direction::RECV;
        assert_eq!(direction, Direction::RECV);
    }
}
