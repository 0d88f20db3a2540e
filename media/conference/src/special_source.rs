//! # Special sources
//!
//! Auxiliary sources feeding the RTP muxer next to the main encoder: RFC 4733 telephone events, in-band DTMF tones
//! and comfort noise. Each kind contributes blueprints, may refuse negotiated codecs it can't serve and decides from
//! the selected send codec which codec it produces, if any.

use crate::{
    codec::{BlueprintCapability, Codec, CodecBlueprint, ID_ANY, MediaType},
    negotiation::{CodecAssociation, lookup_by_pt},
};
use std::sync::Arc;

const TELEPHONE_EVENT: &str = "telephone-event";
const CN: &str = "CN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialSourceKind {
    /// RFC 4733 RTP events
    DtmfEvent,
    /// DTMF tones encoded with the main codec
    DtmfSound,
    /// RFC 3389 comfort noise
    ComfortNoise,
}

impl SpecialSourceKind {
    pub const ALL: [Self; 3] = [Self::DtmfEvent, Self::DtmfSound, Self::ComfortNoise];

    fn encoding_name(self) -> Option<&'static str> {
        match self {
            Self::DtmfEvent => Some(TELEPHONE_EVENT),
            Self::DtmfSound => None,
            Self::ComfortNoise => Some(CN),
        }
    }

    /// Add the blueprints of the codecs this source produces, one per clock rate of the sending audio blueprints
    pub(crate) fn add_blueprints(self, blueprints: &mut Vec<Arc<CodecBlueprint>>) {
        let Some(encoding_name) = self.encoding_name() else {
            return;
        };

        let mut clock_rates: Vec<u32> = blueprints
            .iter()
            .filter(|bp| bp.codec.media_type == MediaType::Audio && bp.can_send() && !is_special_codec(&bp.codec))
            .map(|bp| bp.codec.clock_rate)
            .filter(|clock_rate| *clock_rate != 0)
            .collect();

        clock_rates.sort_unstable();
        clock_rates.dedup();

        for clock_rate in clock_rates {
            let exists = blueprints
                .iter()
                .any(|bp| bp.codec.name_matches(encoding_name) && bp.codec.clock_rate == clock_rate);

            if exists {
                continue;
            }

            let codec = match self {
                Self::DtmfEvent => Codec::new(ID_ANY, TELEPHONE_EVENT, MediaType::Audio, clock_rate)
                    .with_param("events", "0-15"),
                _ if clock_rate == Codec::CN.clock_rate => Codec::CN,
                _ => Codec::new(ID_ANY, CN, MediaType::Audio, clock_rate),
            };

            log::trace!("Adding {self:?} blueprint for {codec}");

            blueprints.push(Arc::new(CodecBlueprint::new(codec, BlueprintCapability::Both)));
        }
    }

    /// Disable negotiated codecs of this source which have no main codec of the same clock rate to go along with
    pub(crate) fn negotiation_filter(self, associations: &mut [CodecAssociation]) {
        let Some(encoding_name) = self.encoding_name() else {
            return;
        };

        for i in 0..associations.len() {
            let ca = &associations[i];

            if !ca.is_active() || !ca.codec.name_matches(encoding_name) {
                continue;
            }

            let clock_rate = ca.codec.clock_rate;

            let has_main_codec = associations.iter().any(|other| {
                other.is_valid_for_sending(false)
                    && !is_special_codec(&other.codec)
                    && other.codec.clock_rate == clock_rate
            });

            if !has_main_codec {
                log::debug!(
                    "Disabling {} which has no main codec at clock rate {clock_rate}",
                    associations[i].codec
                );

                associations[i].disable = true;
            }
        }
    }

    /// Codec this source would produce alongside `selected`
    pub(crate) fn codec(self, associations: &[CodecAssociation], selected: &Codec) -> Option<Codec> {
        if selected.media_type != MediaType::Audio {
            return None;
        }

        match self {
            Self::DtmfEvent | Self::ComfortNoise => {
                let encoding_name = self.encoding_name()?;

                associations
                    .iter()
                    .find(|ca| {
                        ca.is_valid_for_sending(true)
                            && ca.codec.name_matches(encoding_name)
                            && ca.codec.clock_rate == selected.clock_rate
                    })
                    .map(|ca| ca.codec.clone())
            }
            Self::DtmfSound => {
                let is_law = selected.name_matches("PCMU") || selected.name_matches("PCMA");

                (is_law && selected.clock_rate == 8000).then(|| selected.clone())
            }
        }
    }
}

fn is_special_codec(codec: &Codec) -> bool {
    codec.name_matches(TELEPHONE_EVENT) || codec.name_matches(CN)
}

#[derive(Debug)]
struct SpecialSource {
    kind: SpecialSourceKind,
    codec: Codec,
}

/// Special sources currently attached to a session's send path
#[derive(Debug, Default)]
pub(crate) struct SpecialSources {
    sources: Vec<SpecialSource>,
}

impl SpecialSources {
    /// Remove the sources whose codec changed or which are no longer needed, the caller must stop them
    pub(crate) fn take_outdated(
        &mut self,
        associations: &[CodecAssociation],
        selected: &Codec,
    ) -> Vec<SpecialSourceKind> {
        let mut outdated = vec![];

        self.sources.retain(|source| {
            let keep = source
                .kind
                .codec(associations, selected)
                .is_some_and(|codec| codec == source.codec);

            if !keep {
                log::debug!("Removing special source {:?}", source.kind);
                outdated.push(source.kind);
            }

            keep
        });

        outdated
    }

    /// Sources which are required but don't exist yet
    pub(crate) fn missing(
        &self,
        kinds: &[SpecialSourceKind],
        associations: &[CodecAssociation],
        selected: &Codec,
    ) -> Vec<(SpecialSourceKind, Codec)> {
        kinds
            .iter()
            .filter(|kind| !self.contains(**kind))
            .filter_map(|kind| Some((*kind, kind.codec(associations, selected)?)))
            .collect()
    }

    /// Returns false if a source of the same kind has been added in the meantime
    pub(crate) fn insert(&mut self, kind: SpecialSourceKind, codec: Codec) -> bool {
        if self.contains(kind) {
            return false;
        }

        self.sources.push(SpecialSource { kind, codec });
        true
    }

    pub(crate) fn contains(&self, kind: SpecialSourceKind) -> bool {
        self.sources.iter().any(|source| source.kind == kind)
    }

    /// Codecs of all sources which don't share the payload type of `main`
    pub(crate) fn secondary_codecs(&self, associations: &[CodecAssociation], main: &Codec) -> Vec<Codec> {
        self.sources
            .iter()
            .filter(|source| source.codec.id != main.id)
            .filter_map(|source| lookup_by_pt(associations, source.codec.id, false))
            .map(|ca| ca.codec.clone())
            .collect()
    }

    pub(crate) fn take_all(&mut self) -> Vec<SpecialSourceKind> {
        self.sources.drain(..).map(|source| source.kind).collect()
    }
}
