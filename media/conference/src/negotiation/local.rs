use super::{CodecAssociation, first_free_dynamic_pt, lookup_by_pt, lookup_custom};
use crate::{
    Error,
    backend::{ProfileBin, ProfileDirection},
    caps::Caps,
    codec::{
        Codec, CodecBlueprint, CodecPreference, ID_ANY, MediaType, ParamType, codec_sdp_compare,
        copy_filtered, sdp_negotiate_codec,
    },
};
use std::sync::Arc;

/// A preference which passed [`validate_preferences`]
#[derive(Debug, Clone)]
pub struct ValidPreference {
    pub preference: CodecPreference,
    /// Raw caps accepted by the send profile
    pub input_caps: Option<Caps>,
    /// Raw caps produced by the receive profile
    pub output_caps: Option<Caps>,
}

impl ValidPreference {
    fn codec(&self) -> &Codec {
        &self.preference.codec
    }
}

/// Drop all preferences which cannot be satisfied
///
/// A preference must be of the session's media type and match a blueprint, unless it reserves a payload type or
/// describes a codec through a receive profile. Profiles are parsed with `parse_profile` and must have exactly one
/// raw pad and a RTP pad matching the codec.
pub fn validate_preferences(
    media_type: MediaType,
    blueprints: &[Arc<CodecBlueprint>],
    preferences: &[CodecPreference],
    mut parse_profile: impl FnMut(&str, ProfileDirection) -> Result<ProfileBin, Error>,
) -> Vec<ValidPreference> {
    let mut valid = Vec::with_capacity(preferences.len());

    for preference in preferences {
        let codec = &preference.codec;

        if codec.media_type != media_type {
            log::debug!("Ignoring preference {codec}, media type is not {media_type}");
            continue;
        }

        let mut validated = ValidPreference {
            preference: preference.clone(),
            input_caps: None,
            output_caps: None,
        };

        if preference.is_reservation() {
            valid.push(validated);
            continue;
        }

        let has_blueprint = blueprints.iter().any(|bp| {
            bp.codec.name_matches(&codec.encoding_name)
                && clock_rates_match(bp.codec.clock_rate, codec.clock_rate)
                && codec_sdp_compare(&bp.codec, codec)
        });

        if let Some(profile) = &preference.recv_profile {
            match validate_profile(codec, profile, ProfileDirection::Recv, &mut parse_profile) {
                Some(caps) => validated.output_caps = Some(caps),
                None => continue,
            }
        }

        if let Some(profile) = &preference.send_profile {
            match validate_profile(codec, profile, ProfileDirection::Send, &mut parse_profile) {
                Some(caps) => validated.input_caps = Some(caps),
                None => continue,
            }
        }

        if !has_blueprint {
            let profile_only = preference.recv_profile.is_some()
                && !codec.encoding_name.is_empty()
                && codec.clock_rate != 0;

            if !profile_only {
                log::debug!("Preferred codec {codec} could not be matched with a blueprint");
                continue;
            }
        }

        valid.push(validated);
    }

    valid
}

/// Both may omit the clock rate, but not both of them
fn clock_rates_match(a: u32, b: u32) -> bool {
    match (a, b) {
        (0, 0) => false,
        (0, _) | (_, 0) => true,
        (a, b) => a == b,
    }
}

/// Returns the raw caps of the profile
fn validate_profile(
    codec: &Codec,
    profile: &str,
    direction: ProfileDirection,
    parse_profile: &mut impl FnMut(&str, ProfileDirection) -> Result<ProfileBin, Error>,
) -> Option<Caps> {
    let bin = match parse_profile(profile, direction) {
        Ok(bin) => bin,
        Err(e) => {
            log::warn!("Could not build profile ({profile}): {e}");
            return None;
        }
    };

    let (rtp_pads, raw_pads) = match direction {
        ProfileDirection::Send => (&bin.src_caps, &bin.sink_caps),
        ProfileDirection::Recv => (&bin.sink_caps, &bin.src_caps),
    };

    let caps = codec.to_rtp_caps();

    if !rtp_pads.iter().any(|pad| pad.can_intersect(&caps)) {
        log::warn!("Invalid profile ({profile}), has no RTP pad that matches the codec");
        return None;
    }

    let src_pads_ok = match direction {
        ProfileDirection::Send => !bin.src_caps.is_empty(),
        ProfileDirection::Recv => bin.src_caps.len() == 1,
    };

    if !src_pads_ok || bin.sink_caps.len() != 1 {
        log::warn!(
            "Invalid profile ({profile}), has {} src and {} sink pads",
            bin.src_caps.len(),
            bin.sink_caps.len()
        );
        return None;
    }

    raw_pads.first().cloned()
}

fn find_matching_blueprint<'b>(
    codec: &Codec,
    blueprints: &'b [Arc<CodecBlueprint>],
) -> Option<&'b Arc<CodecBlueprint>> {
    let caps = codec.to_rtp_caps();

    blueprints.iter().find(|bp| caps.can_intersect(&bp.rtp_caps))
}

/// Returns if a preference disables the blueprint
fn is_disabled(preferences: &[ValidPreference], blueprint: &CodecBlueprint) -> bool {
    preferences
        .iter()
        .filter(|pref| pref.codec().is_disabled())
        .any(|pref| pref.codec().to_rtp_caps().can_intersect(&blueprint.rtp_caps))
}

fn verify_caps(
    preference: Option<&ValidPreference>,
    blueprint: Option<&CodecBlueprint>,
    input_caps: &Caps,
    output_caps: &Caps,
) -> bool {
    let pref_input = preference.and_then(|pref| pref.input_caps.as_ref());
    let pref_output = preference.and_then(|pref| pref.output_caps.as_ref());

    if let Some(caps) = pref_input.or(blueprint.map(|bp| &bp.input_caps))
        && !input_caps.can_intersect(caps)
    {
        log::trace!("Rejected codec by input caps, filter: {input_caps} caps: {caps}");
        return false;
    }

    if let Some(caps) = pref_output.or(blueprint.map(|bp| &bp.output_caps))
        && !output_caps.can_intersect(caps)
    {
        log::trace!("Rejected codec by output caps, filter: {output_caps} caps: {caps}");
        return false;
    }

    true
}

/// Returns if the previous association may keep its payload type for the preferred codec
fn keeps_payload_type(old: &CodecAssociation, codec: &Codec) -> bool {
    let Some(old_send_codec) = &old.send_codec else {
        return false;
    };

    sdp_negotiate_codec(&old.codec, ParamType::BOTH | ParamType::CONFIG, codec, ParamType::ALL).is_some()
        && sdp_negotiate_codec(
            old_send_codec,
            ParamType::SEND,
            codec,
            ParamType::SEND | ParamType::SEND_AVOID_NEGO,
        )
        .is_some()
}

/// Insert associations valid for sending before the first one that isn't
///
/// Keeps telephone-event, comfort noise and alike at the end of the list.
pub(super) fn insert_local(list: &mut Vec<CodecAssociation>, ca: CodecAssociation) {
    if ca.is_valid_for_sending(true)
        && let Some(position) = list.iter().position(|other| !other.is_valid_for_sending(true))
    {
        list.insert(position, ca);
    } else {
        list.push(ca);
    }
}

fn no_dynamic_pt_left() -> Error {
    Error::NoCodecsLeft("ran out of dynamic payload types".into())
}

/// Build the local offer from the blueprints and preferences
///
/// Payload types of the `current` associations are kept where the codec did not change. Codecs of blueprints
/// which are not mentioned in the preferences are appended unless disabled by a preference.
pub fn create_local_codec_associations(
    blueprints: &[Arc<CodecBlueprint>],
    preferences: &[ValidPreference],
    current: &[CodecAssociation],
    input_caps: &Caps,
    output_caps: &Caps,
) -> Result<Vec<CodecAssociation>, Error> {
    if blueprints.is_empty() {
        return Err(Error::NoCodecsLeft("no codec blueprints available".into()));
    }

    log::debug!("Creating local codec associations");

    let mut associations: Vec<CodecAssociation> = Vec::new();

    for pref in preferences {
        let codec = pref.codec();

        // Negative preferences only filter blueprints below
        if codec.is_disabled() {
            continue;
        }

        if pref.preference.is_reservation() {
            log::debug!("Add reserved payload type {}", codec.id);
            associations.push(CodecAssociation::reserved(codec.clone()));
            continue;
        }

        let blueprint = find_matching_blueprint(codec, blueprints);

        if blueprint.is_none() && pref.preference.recv_profile.is_none() {
            log::trace!(
                "Could not find matching blueprint for preferred codec {}/{}",
                codec.media_type,
                codec.encoding_name
            );
            continue;
        }

        if !verify_caps(Some(pref), blueprint.map(|bp| &**bp), input_caps, output_caps) {
            continue;
        }

        let old = if codec.id == ID_ANY {
            lookup_custom(current, true, |ca| codec_sdp_compare(codec, &ca.codec))
        } else {
            lookup_by_pt(current, codec.id, false)
        };

        let old_id = old
            .filter(|old| keeps_payload_type(old, codec))
            .map(|old| old.codec.id);

        let mut ca = CodecAssociation::new(codec.clone());
        ca.blueprint = blueprint.cloned();
        ca.send_profile = pref.preference.send_profile.clone();
        ca.recv_profile = pref.preference.recv_profile.clone();

        if let Some(id) = old_id {
            ca.codec.id = id;
        }

        if let Some(bp) = blueprint {
            // The preference has no payload type, but the blueprint has a static one
            if ca.codec.id == ID_ANY && bp.codec.pt().is_some() {
                ca.codec.id = bp.codec.id;
            }

            if ca.codec.clock_rate == 0 {
                ca.codec.clock_rate = bp.codec.clock_rate;
            }

            if ca.codec.channels == 0 {
                ca.codec.channels = bp.codec.channels;
            }

            for param in &bp.codec.optional_params {
                if ca.codec.param(&param.name).is_none() {
                    ca.codec.add_param(param.name.clone(), param.value.clone());
                }
            }
        }

        ca.send_codec = Some(copy_filtered(&ca.codec, ParamType::CONFIG));

        log::trace!("Added preferred codec {}", ca.codec);

        insert_local(&mut associations, ca);
    }

    // Everything left without payload type gets a dynamic one
    for i in 0..associations.len() {
        if associations[i].reserved || associations[i].codec.id >= 0 {
            continue;
        }

        let pt = first_free_dynamic_pt(current, &associations).ok_or_else(no_dynamic_pt_left)?;

        associations[i].set_id(pt);
    }

    for bp in blueprints {
        if bp.codec.clock_rate == 0 {
            continue;
        }

        if associations.iter().any(|ca| ca.same_blueprint(bp)) {
            continue;
        }

        if is_disabled(preferences, bp) {
            log::debug!("Codec {} disabled by config", bp.codec);
            continue;
        }

        // Keep only the payload type of previous associations of this blueprint, the rest is renegotiated
        let mut reused = false;

        for old in current.iter().filter(|ca| ca.same_blueprint(bp) && !ca.reserved) {
            if lookup_by_pt(&associations, old.codec.id, true).is_some() {
                continue;
            }

            if sdp_negotiate_codec(&old.codec, ParamType::CONFIG, &bp.codec, ParamType::ALL).is_none() {
                continue;
            }

            if !verify_caps(None, Some(bp), input_caps, output_caps) {
                continue;
            }

            let mut ca = CodecAssociation::new(bp.codec.clone());
            ca.blueprint = Some(bp.clone());
            ca.set_id(old.codec.id);

            insert_local(&mut associations, ca);
            reused = true;
        }

        if reused {
            continue;
        }

        // A blueprint which doesn't negotiate against itself is broken
        if sdp_negotiate_codec(&bp.codec, ParamType::ALL, &bp.codec, ParamType::ALL).is_none() {
            continue;
        }

        if !verify_caps(None, Some(bp), input_caps, output_caps) {
            continue;
        }

        let mut ca = CodecAssociation::new(bp.codec.clone());
        ca.blueprint = Some(bp.clone());

        if ca.codec.pt().is_none() || lookup_by_pt(&associations, ca.codec.id, true).is_some() {
            let pt = first_free_dynamic_pt(current, &associations).ok_or_else(no_dynamic_pt_left)?;

            ca.set_id(pt);
        }

        log::trace!("Added discovered codec {} from blueprint", ca.codec);

        insert_local(&mut associations, ca);
    }

    if !associations.iter().any(|ca| ca.is_valid_for_sending(true)) {
        log::warn!("All codecs disabled by preferences");
        return Err(Error::NoCodecsLeft(
            "codec config would leave no valid local codecs".into(),
        ));
    }

    Ok(associations)
}
