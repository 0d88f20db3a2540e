//! Receive path: sub-streams per remote SSRC, their decoders and the assignment of SSRCs to streams

use super::{SessionInner, StateGuard};
use crate::{
    codec::Codec,
    event::ConferenceEvent,
    srtp::SrtpParameters,
    stream::{Direction, StreamId},
    substream::{DecoderUpdate, SubStream, SubStreamId, decoder_source, decoder_update, recv_codec},
};
use parking_lot::MutexGuard;
use std::time::{Duration, Instant};

impl SessionInner {
    /// Check the decoders of all sub-streams against the current codecs
    pub(crate) fn verify_substreams(&self, state: &mut StateGuard<'_>) {
        let ids: Vec<SubStreamId> = state.substreams.keys().collect();

        for id in ids {
            self.verify_substream(state, id);
        }
    }

    /// Make sure the sub-stream's decoder matches its payload type
    ///
    /// A sub-stream whose payload type has no codec is removed. Returns if the sub-stream still exists.
    fn verify_substream(&self, state: &mut StateGuard<'_>, id: SubStreamId) -> bool {
        loop {
            let Some(substream) = state.substreams.get(id) else {
                return false;
            };

            let stream = substream.stream;
            let ssrc = substream.ssrc;

            let (codec, association) = match recv_codec(&state.associations, &state.streams, stream, substream.pt) {
                Ok(found) => found,
                Err(e) => {
                    match stream {
                        Some(stream) => self.stream_error(stream, e),
                        None => self.error(e),
                    }

                    self.remove_substream(state, id);
                    return false;
                }
            };

            let (codec, association) = match decoder_update(substream, codec, association) {
                DecoderUpdate::Unchanged => return true,
                DecoderUpdate::Codec(codec) => {
                    state.substreams[id].codec = Some(codec);
                    self.update_recv_codecs(state, stream);
                    return true;
                }
                DecoderUpdate::Rebuild(codec, association) => (codec, association),
            };

            log::debug!("Building decoder for {codec} (ssrc {ssrc:#010x}) in session {}", self.id);

            let generation = state.codecs_generation;

            let result = MutexGuard::unlocked(state, || {
                self.backend
                    .build_decoder(self.id, id, ssrc, &codec, &association)
            });

            if !state.substreams.contains_key(id) {
                if result.is_ok() {
                    self.backend.remove_decoder(self.id, id);
                }

                return false;
            }

            if state.codecs_generation != generation {
                log::debug!("Codecs changed while building a decoder, verifying again");
                continue;
            }

            return match result {
                Ok(()) => {
                    let substream = &mut state.substreams[id];
                    substream.codec = Some(codec);
                    substream.decoder = decoder_source(&association);

                    self.update_recv_codecs(state, stream);
                    true
                }
                Err(e) => {
                    match stream {
                        Some(stream) => self.stream_error(stream, e),
                        None => self.error(e),
                    }

                    self.remove_substream(state, id);
                    false
                }
            };
        }
    }

    /// Recompute the codecs currently decoded for a stream
    pub(crate) fn update_recv_codecs(&self, state: &mut StateGuard<'_>, stream: Option<StreamId>) {
        let Some(stream) = stream else {
            return;
        };

        let mut codecs: Vec<Codec> = Vec::new();

        for substream in state.substreams.values() {
            if substream.stream != Some(stream) {
                continue;
            }

            let Some(codec) = &substream.codec else {
                continue;
            };

            if !codecs.iter().any(|existing| existing.id == codec.id) {
                codecs.push(codec.clone());
            }
        }

        let Some(stream_state) = state.streams.get_mut(stream) else {
            return;
        };

        if stream_state.recv_codecs != codecs {
            stream_state.recv_codecs = codecs.clone();

            self.emit(ConferenceEvent::RecvCodecsChanged {
                session: self.id,
                stream,
                codecs,
            });
        }
    }

    pub(crate) fn remove_substream(&self, state: &mut StateGuard<'_>, id: SubStreamId) {
        let Some(substream) = state.substreams.remove(id) else {
            return;
        };

        log::debug!("Removing sub-stream of ssrc {:#010x} in session {}", substream.ssrc, self.id);

        if substream.decoder.is_some() {
            self.backend.remove_decoder(self.id, id);
        }

        self.update_recv_codecs(state, substream.stream);
    }

    /// A new payload type of a remote SSRC appeared on the receive path
    pub(crate) fn new_recv_pad(&self, ssrc: u32, pt: u8) -> Option<SubStreamId> {
        let _entered = self.enter().ok()?;
        let mut state = self.state.lock();

        if let Some((id, _)) = state
            .substreams
            .iter()
            .find(|(_, substream)| substream.ssrc == ssrc && substream.pt == pt)
        {
            return Some(id);
        }

        log::debug!("New receive pad for ssrc {ssrc:#010x} pt {pt} in session {}", self.id);

        let no_rtcp_timeout = state.config.no_rtcp_timeout;

        let mut stream = state.ssrc_streams.get(&ssrc).copied();

        if stream.is_none() && no_rtcp_timeout == 0 && state.streams.len() == 1 {
            stream = state.streams.keys().next();

            if let Some(stream) = stream {
                log::debug!("Binding ssrc {ssrc:#010x} to the only stream of session {}", self.id);
                state.ssrc_streams.insert(ssrc, stream);
            }
        }

        let mut substream = SubStream::new(ssrc, pt);
        substream.stream = stream;

        let id = state.substreams.insert(substream);

        if !self.verify_substream(&mut state, id) {
            return None;
        }

        match stream {
            Some(stream) => self.attach_substream(&mut state, id, stream),
            None if no_rtcp_timeout > 0 => {
                let timeout = Duration::from_millis(no_rtcp_timeout.unsigned_abs());
                state.substreams[id].no_rtcp_deadline = Some(Instant::now() + timeout);
            }
            None if no_rtcp_timeout == 0 => {
                log::warn!(
                    "Can't bind ssrc {ssrc:#010x} without RTCP, session {} has {} streams",
                    self.id,
                    state.streams.len()
                );
            }
            None => {}
        }

        Some(id)
    }

    /// Assign a sub-stream to a stream and apply the stream's direction to it
    fn attach_substream(&self, state: &mut StateGuard<'_>, id: SubStreamId, stream: StreamId) {
        let Some(receiving) = state
            .streams
            .get(stream)
            .map(|stream| stream.direction.contains(Direction::RECV))
        else {
            return;
        };

        let Some(substream) = state.substreams.get_mut(id) else {
            return;
        };

        let previous = substream.stream.replace(stream);
        substream.no_rtcp_deadline = None;
        substream.receiving = receiving;

        self.backend.set_substream_receiving(self.id, id, receiving);

        if previous != Some(stream) {
            self.update_recv_codecs(state, previous);

            // The stream may have negotiated different parameters for the payload type
            if !self.verify_substream(state, id) {
                return;
            }
        }

        self.update_recv_codecs(state, Some(stream));
    }

    /// Apply a stream's direction to all of its sub-streams
    pub(crate) fn update_substreams_receiving(&self, state: &mut StateGuard<'_>, stream: StreamId) {
        let Some(receiving) = state
            .streams
            .get(stream)
            .map(|stream| stream.direction.contains(Direction::RECV))
        else {
            return;
        };

        for (id, substream) in state.substreams.iter_mut() {
            if substream.stream == Some(stream) && substream.receiving != receiving {
                substream.receiving = receiving;
                self.backend.set_substream_receiving(self.id, id, receiving);
            }
        }
    }

    /// Map `ssrc` to `stream` and move all of its sub-streams there
    pub(crate) fn add_ssrc_stream(&self, state: &mut StateGuard<'_>, ssrc: u32, stream: StreamId, manual: bool) {
        if state.ssrc_streams.insert(ssrc, stream) != Some(stream) {
            log::debug!("Associated ssrc {ssrc:#010x} with stream {stream:?} in session {}", self.id);

            // The key is requested again and looked up through the new mapping
            self.backend.set_decryption_key(self.id, ssrc, None);
        }

        if manual {
            state.ssrc_manual.insert(ssrc);
        }

        let substreams: Vec<SubStreamId> = state
            .substreams
            .iter()
            .filter(|(_, substream)| substream.ssrc == ssrc && substream.stream != Some(stream))
            .map(|(id, _)| id)
            .collect();

        for id in substreams {
            self.attach_substream(state, id, stream);
        }
    }

    /// RTCP SDES revealed the CNAME of a remote SSRC
    pub(crate) fn ssrc_cname(&self, ssrc: u32, cname: &str) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        let stream = state
            .stream_order
            .iter()
            .copied()
            .find(|id| state.streams.get(*id).is_some_and(|stream| stream.cname == cname));

        let Some(stream) = stream else {
            log::debug!("No stream for cname {cname} (ssrc {ssrc:#010x}) in session {}", self.id);
            return;
        };

        self.add_ssrc_stream(&mut state, ssrc, stream, false);
    }

    /// A remote SSRC left with RTCP BYE or timed out
    pub(crate) fn bye_ssrc(&self, ssrc: u32) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        log::debug!("Ssrc {ssrc:#010x} left session {}", self.id);

        if !state.ssrc_manual.contains(&ssrc) {
            state.ssrc_streams.remove(&ssrc);
        }

        let substreams: Vec<SubStreamId> = state
            .substreams
            .iter()
            .filter(|(_, substream)| substream.ssrc == ssrc)
            .map(|(id, _)| id)
            .collect();

        for id in substreams {
            self.remove_substream(&mut state, id);
        }
    }

    /// The jitterbuffer validated a new remote SSRC
    pub(crate) fn ssrc_validated(&self, ssrc: u32) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let state = self.state.lock();

        // A new receiver needs a key frame to start decoding
        if state.send.has_encoder {
            log::debug!("Requesting key unit for new ssrc {ssrc:#010x} in session {}", self.id);
            self.backend.request_key_unit(self.id);
        }
    }

    /// Key to decrypt packets of a remote SSRC
    ///
    /// `None` rejects the packets, the null parameters accept them unencrypted.
    pub(crate) fn request_decryption_key(&self, ssrc: u32) -> Option<SrtpParameters> {
        let _entered = self.enter().ok()?;
        let state = self.state.lock();

        let Some(stream) = state
            .ssrc_streams
            .get(&ssrc)
            .and_then(|stream| state.streams.get(*stream))
        else {
            let require = state.streams.values().any(|stream| stream.require_encryption);
            return (!require).then(SrtpParameters::null);
        };

        match &stream.decryption {
            Some(parameters) => Some(parameters.clone()),
            None if stream.require_encryption => None,
            None => Some(SrtpParameters::null()),
        }
    }

    /// Bind sub-streams which didn't get a CNAME in time to the only stream of the session
    pub(crate) fn poll_no_rtcp_timers(&self, state: &mut StateGuard<'_>, now: Instant) {
        let expired: Vec<(SubStreamId, u32)> = state
            .substreams
            .iter_mut()
            .filter(|(_, substream)| substream.no_rtcp_deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, substream)| {
                substream.no_rtcp_deadline = None;
                (id, substream.ssrc)
            })
            .collect();

        for (id, ssrc) in expired {
            if state.streams.len() != 1 {
                log::debug!(
                    "No RTCP for ssrc {ssrc:#010x} in time, session {} has {} streams",
                    self.id,
                    state.streams.len()
                );
                continue;
            }

            let Some(stream) = state.stream_order.first().copied() else {
                continue;
            };

            if state.substreams.get(id).is_some_and(|substream| substream.stream.is_none()) {
                log::debug!("No RTCP for ssrc {ssrc:#010x} in time, binding it to the only stream");
                self.add_ssrc_stream(state, ssrc, stream, false);
            }
        }
    }

    /// Remove everything a stream owns on the receive side
    pub(crate) fn remove_stream_substreams(&self, state: &mut StateGuard<'_>, stream: StreamId) {
        state.ssrc_streams.retain(|ssrc, mapped| {
            if *mapped == stream {
                self.backend.set_decryption_key(self.id, *ssrc, None);
                false
            } else {
                true
            }
        });

        let ssrc_streams = state.ssrc_streams.clone();
        state.ssrc_manual.retain(|ssrc| ssrc_streams.contains_key(ssrc));

        let substreams: Vec<SubStreamId> = state
            .substreams
            .iter()
            .filter(|(_, substream)| substream.stream == Some(stream))
            .map(|(id, _)| id)
            .collect();

        for id in substreams {
            self.remove_substream(state, id);
        }
    }
}
