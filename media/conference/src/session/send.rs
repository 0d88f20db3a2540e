//! Send path: encoder selection and replacement, special sources, the input valve and telephony events

use super::{SessionInner, StateGuard};
use crate::{
    Error,
    codec::Codec,
    dtmf::{DtmfMessage, DtmfNotification},
    event::ConferenceEvent,
    negotiation::{CodecAssociation, associations_to_send_codecs, lookup_by_codec_for_sending},
    stream::Direction,
};
use parking_lot::MutexGuard;

/// Returns if both associations are realized by the same encoder
fn same_builder(a: &CodecAssociation, b: &CodecAssociation) -> bool {
    let same_blueprint = match (&a.blueprint, &b.blueprint) {
        (Some(a), Some(b)) => std::sync::Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    };

    same_blueprint && a.send_profile == b.send_profile
}

impl SessionInner {
    /// Make sure the encoder matches the selected send codec, blocking the send path to replace it if required
    pub(crate) fn verify_send_codec_bin(&self, state: &mut StateGuard<'_>) {
        if state.disposed || state.send.block_pending || state.send.swapping {
            return;
        }

        if state.send.blocked {
            // A previous replacement failed, the path is still blocked
            self.swap_send_codec(state);
            return;
        }

        log::debug!("Blocking the send path of session {}", self.id);

        state.send.block_pending = true;
        self.backend.block_send_path(self.id);
    }

    /// No more data flows into the encoder
    pub(crate) fn send_path_blocked(&self) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        if !state.send.block_pending {
            log::debug!("Unexpected send path block in session {}", self.id);
            return;
        }

        state.send.block_pending = false;
        state.send.blocked = true;

        self.swap_send_codec(&mut state);
    }

    /// Choose the association to send with
    ///
    /// The codec requested by the application wins if it is still valid, otherwise the first association with a
    /// usable encoder is taken.
    fn select_send_codec(&self, state: &mut StateGuard<'_>) -> Result<CodecAssociation, Error> {
        if let Some(requested) = &state.send.requested_codec {
            if let Some(ca) = lookup_by_codec_for_sending(&state.associations, requested) {
                return Ok(ca.clone());
            }

            log::warn!("The requested send codec {requested} no longer exists, picking the first valid one");
            state.send.requested_codec = None;
        }

        state
            .associations
            .iter()
            .find(|ca| ca.is_valid_for_sending(true))
            .cloned()
            .ok_or_else(|| Error::NegotiationFailed("Could not get a valid send codec".into()))
    }

    /// Bitrate to configure the encoder of `association` with
    fn encoder_bitrate(&self, state: &StateGuard<'_>, association: &CodecAssociation) -> u32 {
        match &state.rate_control {
            Some(rate_control) if rate_control.is_enabled(association.codec.id) => rate_control.send_bitrate(),
            _ => state.send.bitrate,
        }
    }

    /// Replace the encoder while the send path is blocked
    fn swap_send_codec(&self, state: &mut StateGuard<'_>) {
        state.send.swapping = true;

        loop {
            if state.disposed {
                break;
            }

            let association = match self.select_send_codec(state) {
                Ok(association) => association,
                Err(e) => {
                    // Stay blocked until the codecs change
                    self.error(e);
                    break;
                }
            };

            let unchanged = state.send.has_encoder
                && state.send.current.as_ref().is_some_and(|current| {
                    current.send_codec == association.send_codec && same_builder(current, &association)
                });

            if unchanged {
                log::debug!("Send codec of session {} unchanged", self.id);

                state.send.current = Some(association);
                self.send_codec_ready(state);
                break;
            }

            if state.send.valve_open {
                self.backend.set_input_valve(self.id, true);
                state.send.valve_open = false;
            }

            if state.send.has_encoder {
                self.backend.remove_encoder(self.id);
                state.send.has_encoder = false;
                state.send.current = None;
                state.send.other_codecs.clear();
            }

            let generation = state.codecs_generation;
            let requested = state.send.requested_codec.clone();
            let send_codecs = associations_to_send_codecs(&state.associations);
            let bitrate = self.encoder_bitrate(state, &association);

            log::debug!("Building encoder for {} in session {}", association.codec, self.id);

            let result = MutexGuard::unlocked(state, || {
                self.backend
                    .build_encoder(self.id, &association, &send_codecs, bitrate)
            });

            if state.disposed || state.codecs_generation != generation || state.send.requested_codec != requested {
                if result.is_ok() {
                    self.backend.remove_encoder(self.id);
                }

                log::debug!("Send codec selection changed while building the encoder");
                continue;
            }

            match result {
                Ok(other_codecs) => {
                    state.send.has_encoder = true;
                    state.send.other_codecs = other_codecs;
                    state.send.current = Some(association);

                    self.send_codec_ready(state);
                }
                Err(e) => self.error(e),
            }

            break;
        }

        state.send.swapping = false;
    }

    /// The encoder is in place, attach the special sources, announce the codec and let data flow again
    fn send_codec_ready(&self, state: &mut StateGuard<'_>) {
        let Some(codec) = state.send.current.as_ref().map(|ca| ca.codec.clone()) else {
            return;
        };

        self.update_special_sources(state, &codec);

        let mut secondary_codecs = state
            .send
            .special_sources
            .secondary_codecs(&state.associations, &codec);
        secondary_codecs.extend(state.send.other_codecs.iter().cloned());

        self.emit(ConferenceEvent::SendCodecChanged {
            session: self.id,
            codec,
            secondary_codecs,
        });

        state.send.blocked = false;
        self.backend.unblock_send_path(self.id);

        self.update_valve(state);
        self.pump_telephony_events(state);
    }

    fn update_special_sources(&self, state: &mut StateGuard<'_>, selected: &Codec) {
        let state = &mut **state;

        for kind in state
            .send
            .special_sources
            .take_outdated(&state.associations, selected)
        {
            self.backend.stop_special_source(self.id, kind);
        }

        let missing = state
            .send
            .special_sources
            .missing(&state.special_kinds, &state.associations, selected);

        for (kind, codec) in missing {
            log::debug!("Starting special source {kind:?} with {codec}");

            match self.backend.start_special_source(self.id, kind, &codec) {
                Ok(()) => {
                    state.send.special_sources.insert(kind, codec);
                }
                Err(e) => self.error(e),
            }
        }
    }

    /// Open the input valve once an encoder exists and any stream sends
    pub(crate) fn update_valve(&self, state: &mut StateGuard<'_>) {
        let open = state.send.has_encoder && state.send.streams_sending > 0;

        if open != state.send.valve_open {
            log::debug!("{} the input of session {}", if open { "Opening" } else { "Closing" }, self.id);

            state.send.valve_open = open;
            self.backend.set_input_valve(self.id, !open);
        }
    }

    /// Recount the streams which send, after a direction or transmitter changed
    pub(crate) fn update_sending(&self, state: &mut StateGuard<'_>) {
        let sending = state
            .streams
            .values()
            .filter(|stream| stream.direction.contains(Direction::SEND) && stream.has_transmitter())
            .count();

        state.send.streams_sending = sending;

        let bitrate_changed = state
            .rate_control
            .as_mut()
            .is_some_and(|rate_control| rate_control.set_sending(sending > 0));

        if bitrate_changed {
            self.apply_bitrate(state);
        }

        self.update_valve(state);
    }

    /// Hand the current bitrate to the encoder
    pub(crate) fn apply_bitrate(&self, state: &mut StateGuard<'_>) {
        if !state.send.has_encoder {
            return;
        }

        let Some(current) = &state.send.current else {
            return;
        };

        let bitrate = self.encoder_bitrate(state, current);
        self.backend.set_encoder_bitrate(self.id, bitrate);
    }

    /// Hand queued telephony events to the special sources, one at a time
    pub(crate) fn pump_telephony_events(&self, state: &mut StateGuard<'_>) {
        if !state.send.has_encoder {
            return;
        }

        'events: while let Some(event) = state.dtmf.next_event() {
            if self.backend.send_telephony_event(self.id, &event) {
                return;
            }

            while let Some(fallback) = state.dtmf.fallback() {
                log::debug!("Telephony event {} not accepted, trying in-band", fallback.number);

                if self.backend.send_telephony_event(self.id, &fallback) {
                    continue 'events;
                }
            }

            state.dtmf.send_failed();
        }
    }

    /// A special source processed or dropped a telephony event
    pub(crate) fn telephony_message(&self, message: &DtmfMessage) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        match state.dtmf.handle_message(message) {
            Some(DtmfNotification::Started { method, number, volume }) => {
                self.emit(ConferenceEvent::TelephonyEventStarted {
                    session: self.id,
                    method,
                    number,
                    volume,
                });
            }
            Some(DtmfNotification::Stopped { method }) => {
                self.emit(ConferenceEvent::TelephonyEventStopped {
                    session: self.id,
                    method,
                });
            }
            None => {}
        }

        self.pump_telephony_events(&mut state);
    }
}
