//! # Codec negotiation
//!
//! Turns the locally available [`CodecBlueprint`]s, the application's [`CodecPreference`]s and the codecs offered
//! by every remote stream into a list of [`CodecAssociation`]s keyed by payload type.
//!
//! Negotiation runs in phases, each being a function over immutable inputs returning a new list:
//!
//! 1. [`validate_preferences`] drops preferences that can never be satisfied
//! 2. [`create_local_codec_associations`] builds the local offer, keeping payload types of the previous list
//! 3. [`negotiate_stream_codecs`] intersects the offer with the codecs of one remote stream
//! 4. [`finish_codec_negotiation`] keeps previously offered payload types as receive-only and discovered
//!    configuration
//!
//! [`stream_negotiated_codecs`] finally projects the result onto a single stream.

use crate::codec::{Codec, CodecBlueprint, ParamType, copy_filtered};
use std::sync::Arc;

mod distribute;
mod local;
mod remote;

pub use distribute::stream_negotiated_codecs;
pub use local::{ValidPreference, create_local_codec_associations, validate_preferences};
pub use remote::{finish_codec_negotiation, negotiate_stream_codecs};

/// First payload type of the dynamic range
pub const DYNAMIC_PT_START: i32 = 96;

/// Last payload type of the dynamic range
pub const DYNAMIC_PT_END: i32 = 127;

/// A negotiated codec and how it is realized locally
#[derive(Debug, Clone)]
pub struct CodecAssociation {
    /// Codec to advertise and to build receivers from
    pub codec: Codec,
    /// Codec to build the encoder from, without decoder configuration
    pub send_codec: Option<Codec>,
    /// Local handler, `None` if the codec only exists through a profile
    pub blueprint: Option<Arc<CodecBlueprint>>,
    pub send_profile: Option<String>,
    pub recv_profile: Option<String>,
    /// The payload type is held by the application and never used for media
    pub reserved: bool,
    /// Offered by the remote but refused
    pub disable: bool,
    /// Offered by us earlier but not confirmed, packets are accepted but never sent
    pub recv_only: bool,
    /// Configuration the decoder requires has not been discovered yet
    pub need_config: bool,
}

impl CodecAssociation {
    pub(crate) fn new(codec: Codec) -> Self {
        Self {
            send_codec: Some(copy_filtered(&codec, ParamType::CONFIG)),
            codec,
            blueprint: None,
            send_profile: None,
            recv_profile: None,
            reserved: false,
            disable: false,
            recv_only: false,
            need_config: false,
        }
    }

    pub(crate) fn reserved(codec: Codec) -> Self {
        Self {
            send_codec: None,
            reserved: true,
            ..Self::new(codec)
        }
    }

    pub(crate) fn disabled(codec: Codec) -> Self {
        Self {
            send_codec: None,
            disable: true,
            ..Self::new(codec)
        }
    }

    /// Neither disabled nor reserved
    pub fn is_active(&self) -> bool {
        !self.disable && !self.reserved
    }

    /// Returns if this association may be selected to send media
    ///
    /// With `needs_codecbin` the association must also be realizable, through a blueprint which can send or a send
    /// profile.
    pub fn is_valid_for_sending(&self, needs_codecbin: bool) -> bool {
        if self.send_codec.is_none() || self.disable || self.reserved || self.recv_only {
            return false;
        }

        !needs_codecbin
            || self.blueprint.as_ref().is_some_and(|bp| bp.can_send())
            || self.send_profile.is_some()
    }

    pub(crate) fn set_id(&mut self, id: i32) {
        self.codec.id = id;

        if let Some(send_codec) = &mut self.send_codec {
            send_codec.id = id;
        }
    }

    pub(crate) fn same_blueprint(&self, blueprint: &Arc<CodecBlueprint>) -> bool {
        self.blueprint
            .as_ref()
            .is_some_and(|bp| Arc::ptr_eq(bp, blueprint))
    }
}

/// Find the association using payload type `pt`
///
/// Disabled and reserved associations are only returned with `want_disabled`.
pub fn lookup_by_pt(
    associations: &[CodecAssociation],
    pt: i32,
    want_disabled: bool,
) -> Option<&CodecAssociation> {
    associations
        .iter()
        .find(|ca| ca.codec.id == pt && (want_disabled || ca.is_active()))
}

/// First association matching `f`, reserved associations are always skipped
pub(crate) fn lookup_custom(
    associations: &[CodecAssociation],
    want_disabled: bool,
    mut f: impl FnMut(&CodecAssociation) -> bool,
) -> Option<&CodecAssociation> {
    associations
        .iter()
        .filter(|ca| !ca.reserved && (want_disabled || !ca.disable))
        .find(|ca| f(ca))
}

/// Find the association whose codec equals `codec`
pub fn lookup_by_codec<'a>(
    associations: &'a [CodecAssociation],
    codec: &Codec,
) -> Option<&'a CodecAssociation> {
    associations.iter().find(|ca| ca.codec == *codec)
}

/// Find the association valid for sending whose send codec equals `codec`, ignoring configuration parameters
pub fn lookup_by_codec_for_sending<'a>(
    associations: &'a [CodecAssociation],
    codec: &Codec,
) -> Option<&'a CodecAssociation> {
    let codec = copy_filtered(codec, ParamType::CONFIG);

    associations.iter().find(|ca| {
        ca.is_valid_for_sending(false) && ca.send_codec.as_ref().is_some_and(|sc| *sc == codec)
    })
}

fn is_advertised(ca: &CodecAssociation) -> bool {
    ca.is_active() && !ca.recv_only
}

/// Codecs of all advertised associations
pub fn associations_to_codecs(associations: &[CodecAssociation], include_config: bool) -> Vec<Codec> {
    associations
        .iter()
        .filter(|ca| is_advertised(ca))
        .map(|ca| {
            if include_config {
                ca.codec.clone()
            } else {
                copy_filtered(&ca.codec, ParamType::CONFIG)
            }
        })
        .collect()
}

/// Send codecs of all advertised associations
pub fn associations_to_send_codecs(associations: &[CodecAssociation]) -> Vec<Codec> {
    associations
        .iter()
        .filter(|ca| is_advertised(ca))
        .filter_map(|ca| ca.send_codec.clone())
        .collect()
}

/// Compare the active associations of two lists, a change of the receive-only state counts as difference
pub fn associations_are_equal(a: &[CodecAssociation], b: &[CodecAssociation]) -> bool {
    let mut a = a.iter().filter(|ca| ca.is_active());
    let mut b = b.iter().filter(|ca| ca.is_active());

    loop {
        match (a.next(), b.next()) {
            (None, None) => return true,
            (Some(a), Some(b)) => {
                if a.recv_only != b.recv_only || a.codec != b.codec {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Lowest dynamic payload type unused in both lists
fn first_free_dynamic_pt(a: &[CodecAssociation], b: &[CodecAssociation]) -> Option<i32> {
    (DYNAMIC_PT_START..=DYNAMIC_PT_END)
        .find(|pt| lookup_by_pt(a, *pt, true).is_none() && lookup_by_pt(b, *pt, true).is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BlueprintCapability, MediaType};

    fn ca(codec: Codec) -> CodecAssociation {
        let blueprint = Arc::new(CodecBlueprint::new(codec.clone(), BlueprintCapability::Both));

        CodecAssociation {
            blueprint: Some(blueprint),
            ..CodecAssociation::new(codec)
        }
    }

    #[test]
    fn valid_for_sending() {
        let pcmu = ca(Codec::PCMU);
        assert!(pcmu.is_valid_for_sending(true));

        let recv_only = CodecAssociation {
            recv_only: true,
            ..pcmu.clone()
        };
        assert!(!recv_only.is_valid_for_sending(false));

        let profile_only = CodecAssociation::new(Codec::new(96, "X", MediaType::Audio, 8000));
        assert!(profile_only.is_valid_for_sending(false));
        assert!(!profile_only.is_valid_for_sending(true));

        let with_send_profile = CodecAssociation {
            send_profile: Some("identity".into()),
            ..profile_only
        };
        assert!(with_send_profile.is_valid_for_sending(true));

        let receiver = CodecAssociation {
            blueprint: Some(Arc::new(CodecBlueprint::new(Codec::PCMA, BlueprintCapability::Recv))),
            ..CodecAssociation::new(Codec::PCMA)
        };
        assert!(!receiver.is_valid_for_sending(true));

        assert!(!CodecAssociation::reserved(Codec::PCMA).is_valid_for_sending(false));
        assert!(!CodecAssociation::disabled(Codec::PCMA).is_valid_for_sending(false));
    }

    #[test]
    fn lookups() {
        let list = vec![
            ca(Codec::PCMU),
            CodecAssociation::disabled(Codec::PCMA),
            ca(Codec::new(96, "THEORA", MediaType::Video, 90000).with_param("configuration", "abc")),
        ];

        assert!(lookup_by_pt(&list, 0, false).is_some());
        assert!(lookup_by_pt(&list, 8, false).is_none());
        assert!(lookup_by_pt(&list, 8, true).is_some());

        let theora = Codec::new(96, "THEORA", MediaType::Video, 90000);
        assert!(lookup_by_codec(&list, &theora).is_none());
        assert!(lookup_by_codec_for_sending(&list, &theora).is_some());

        assert_eq!(associations_to_codecs(&list, true).len(), 2);
        assert_eq!(
            associations_to_codecs(&list, false)[1].param_value("configuration"),
            None
        );
        assert_eq!(first_free_dynamic_pt(&list, &[]), Some(97));
    }

    #[test]
    fn list_equality() {
        let a = vec![ca(Codec::PCMU), CodecAssociation::disabled(Codec::PCMA)];
        let b = vec![ca(Codec::PCMU)];

        assert!(associations_are_equal(&a, &b));

        let c = vec![CodecAssociation {
            recv_only: true,
            ..ca(Codec::PCMU)
        }];

        assert!(!associations_are_equal(&a, &c));
        assert!(!associations_are_equal(&a, &[]));
    }
}
