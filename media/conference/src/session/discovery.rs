//! Discovery of codec configuration
//!
//! Some decoders need configuration which only the encoder produces (e.g. Theora headers). Such a codec can't be
//! announced until a dummy encoder has run on the discovery branch and reported its output caps. Codecs are
//! discovered one after another, [`ConferenceEvent::CodecsChanged`] is emitted once all of them are complete.

use super::{SessionInner, SessionState, StateGuard};
use crate::{
    caps::Caps,
    codec::{Codec, has_config_data_named},
    event::ConferenceEvent,
    negotiation::CodecAssociation,
};
use parking_lot::MutexGuard;

/// The association misses configuration which the discovery branch can produce
pub(crate) fn awaits_config(ca: &CodecAssociation) -> bool {
    ca.need_config && ca.is_valid_for_sending(true)
}

/// Copy all configuration parameters found in `caps` into `codec`, returns if anything changed
fn merge_config(codec: &mut Codec, caps: &Caps) -> bool {
    let mut changed = false;

    for structure in caps.structures() {
        for (name, value) in structure.fields() {
            if !has_config_data_named(codec, name) {
                continue;
            }

            let Some(value) = value.as_str() else {
                continue;
            };

            if codec.param_value(name) != Some(value) {
                log::trace!("Discovered {name}={value} for {codec}");

                codec.set_param(name, value);
                changed = true;
            }
        }
    }

    changed
}

/// Replace the association list with a copy in which `f` updated the association at `index`
///
/// Readers holding the previous list keep a consistent view, the new generation tells them it is outdated.
fn replace_association(state: &mut SessionState, index: usize, f: impl FnOnce(&mut CodecAssociation)) {
    let mut associations = state.associations.clone();
    f(&mut associations[index]);

    state.associations = associations;
    state.codecs_generation += 1;
}

impl SessionInner {
    /// Start discovering the configuration of the next codec which needs it
    pub(crate) fn start_codec_param_gathering(&self, state: &mut StateGuard<'_>) {
        if state.disposed || state.discovery.block_pending {
            return;
        }

        if !state.associations.iter().any(awaits_config) {
            if state.discovery.active.is_some() {
                self.stop_discovery(state);
            }

            return;
        }

        log::debug!("Blocking the discovery path of session {}", self.id);

        state.discovery.block_pending = true;
        self.backend.block_discovery_path(self.id);
    }

    fn stop_discovery(&self, state: &mut StateGuard<'_>) {
        log::debug!("Stopping codec discovery of session {}", self.id);

        state.discovery.active = None;
        state.discovery.block_pending = false;
        self.backend.stop_discovery(self.id);

        if std::mem::take(&mut state.discovery.gathered) {
            self.emit(ConferenceEvent::CodecsChanged { session: self.id });
        }
    }

    /// The discovery branch is blocked, replace its encoder with one for the next codec
    pub(crate) fn discovery_path_blocked(&self) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        if !state.discovery.block_pending {
            return;
        }

        state.discovery.block_pending = false;

        let Some(next) = state.associations.iter().find(|ca| awaits_config(ca)).cloned() else {
            self.stop_discovery(&mut state);
            return;
        };

        let unchanged = state
            .discovery
            .active
            .as_ref()
            .is_some_and(|active| active.codec == next.codec && active.send_profile == next.send_profile);

        if unchanged {
            self.backend.unblock_discovery_path(self.id);
            return;
        }

        log::debug!("Discovering the configuration of {} in session {}", next.codec, self.id);

        state.discovery.active = None;

        let result = MutexGuard::unlocked(&mut state, || self.backend.start_discovery(self.id, &next));

        if state.disposed {
            return;
        }

        match result {
            Ok(()) => {
                state.discovery.active = Some(next);
                self.backend.unblock_discovery_path(self.id);
            }
            Err(e) => {
                self.error(e);
                self.stop_discovery(&mut state);
            }
        }
    }

    /// The discovery encoder produced its output caps
    pub(crate) fn discovery_caps(&self, caps: &Caps) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        let Some(active) = state.discovery.active.clone() else {
            log::debug!("Ignoring discovery caps, nothing is being discovered");
            return;
        };

        let Some(index) = state
            .associations
            .iter()
            .position(|ca| ca.codec.id == active.codec.id && awaits_config(ca))
        else {
            log::debug!("Codec {} no longer needs discovery", active.codec);
            self.start_codec_param_gathering(&mut state);
            return;
        };

        replace_association(&mut state, index, |ca| {
            merge_config(&mut ca.codec, caps);
            ca.need_config = false;
        });
        state.discovery.gathered = true;

        if state.associations.iter().any(awaits_config) {
            self.start_codec_param_gathering(&mut state);
        } else {
            self.stop_discovery(&mut state);
        }
    }

    /// The real encoder produced its output caps, its configuration is announced as well
    pub(crate) fn send_caps(&self, caps: &Caps) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();

        let Some(pt) = state.send.current.as_ref().map(|ca| ca.codec.id) else {
            return;
        };

        let Some(index) = state
            .associations
            .iter()
            .position(|ca| ca.codec.id == pt && ca.is_active())
        else {
            return;
        };

        let mut codec = state.associations[index].codec.clone();

        if !merge_config(&mut codec, caps) {
            return;
        }

        replace_association(&mut state, index, |ca| {
            ca.codec = codec;
            ca.need_config = false;
        });

        if state.associations.iter().any(awaits_config) {
            state.discovery.gathered = true;
        } else {
            self.emit(ConferenceEvent::CodecsChanged { session: self.id });
        }
    }
}
