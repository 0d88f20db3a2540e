use super::{CodecAssociation, lookup_by_pt, lookup_custom};
use crate::{
    Error,
    codec::{Codec, ParamType, has_config_data_named, needs_config, sdp_negotiate_codec},
};

/// Remove all feedback parameters from `codec` which `original` doesn't have
fn intersect_feedback_params(codec: &mut Codec, original: &Codec) {
    codec.feedback_params.retain(|fb| original.has_feedback(fb));
}

fn negotiate_stream_codec(
    old: &CodecAssociation,
    remote: &Codec,
    multi_stream: bool,
) -> Option<(Codec, Codec)> {
    let remote_mask = if multi_stream {
        ParamType::SEND | ParamType::SEND_AVOID_NEGO
    } else {
        ParamType::SEND
    };

    let old_send_codec = old.send_codec.as_ref()?;

    let mut codec = sdp_negotiate_codec(&old.codec, ParamType::ALL, remote, remote_mask)?;

    let send_mask = if multi_stream {
        ParamType::BOTH | ParamType::SEND_AVOID_NEGO
    } else {
        ParamType::BOTH
    };

    let mut send_codec = sdp_negotiate_codec(
        old_send_codec,
        send_mask,
        remote,
        ParamType::SEND | ParamType::SEND_AVOID_NEGO,
    )?;

    intersect_feedback_params(&mut codec, &old.codec);
    intersect_feedback_params(&mut send_codec, old_send_codec);

    if multi_stream {
        codec.minimum_reporting_interval = old.codec.minimum_reporting_interval;
        send_codec.minimum_reporting_interval = old_send_codec.minimum_reporting_interval;
    }

    Some((codec, send_codec))
}

/// Intersect the local associations with the codecs of a single remote stream
///
/// Every remote codec results in one association, either negotiated against a local association or disabled.
/// The local association with the same payload type is tried first. With `multi_stream` the payload types of the
/// local associations are kept instead of taking the remote ones.
pub fn negotiate_stream_codecs(
    remote_codecs: &[Codec],
    current: &[CodecAssociation],
    multi_stream: bool,
) -> Result<Vec<CodecAssociation>, Error> {
    log::debug!(
        "Negotiating stream codecs (for {})",
        if multi_stream { "multiple streams" } else { "a single stream" }
    );

    let mut associations = Vec::with_capacity(remote_codecs.len());

    for remote in remote_codecs {
        log::debug!("Remote codec {remote}");

        let same_pt = lookup_by_pt(current, remote.id, false).and_then(|old| {
            log::trace!("Have local codec in the same PT, lets try it first");

            negotiate_stream_codec(old, remote, multi_stream).map(|result| (old, result))
        });

        let negotiated = same_pt.or_else(|| {
            current
                .iter()
                .filter(|old| old.is_active())
                .find_map(|old| {
                    let (mut codec, mut send_codec) = negotiate_stream_codec(old, remote, multi_stream)?;

                    // Multiple peers must agree on the locally allocated payload type
                    if multi_stream {
                        codec.id = old.codec.id;
                        send_codec.id = old.codec.id;
                    }

                    Some((old, (codec, send_codec)))
                })
        });

        match negotiated {
            Some((old, (codec, send_codec))) => {
                log::debug!("Negotiated codec {codec}");

                associations.push(CodecAssociation {
                    codec,
                    send_codec: Some(send_codec),
                    blueprint: old.blueprint.clone(),
                    send_profile: old.send_profile.clone(),
                    recv_profile: old.recv_profile.clone(),
                    reserved: false,
                    disable: false,
                    recv_only: false,
                    need_config: old.need_config,
                });
            }
            None => {
                log::debug!("Could not find a valid intersection for codec {remote}");

                associations.push(CodecAssociation::disabled(remote.clone()));
            }
        }
    }

    if !associations.iter().any(|ca| ca.is_valid_for_sending(true)) {
        return Err(Error::NegotiationFailed(
            "there was no intersection between the remote codecs and the local ones".into(),
        ));
    }

    Ok(associations)
}

/// Compare the send codecs of two associations ignoring the payload type
fn same_send_codec_ignoring_pt(old: &CodecAssociation, new: &CodecAssociation) -> bool {
    if old.disable || old.reserved {
        return false;
    }

    let (Some(old_send_codec), Some(new_send_codec)) = (&old.send_codec, &new.send_codec) else {
        return false;
    };

    if old_send_codec.id == new_send_codec.id {
        old_send_codec == new_send_codec
    } else {
        old_send_codec.clone().with_id(new_send_codec.id) == *new_send_codec
    }
}

fn keep_config_from_old_codec(codec: &mut Codec, old: &Codec) {
    for param in &old.optional_params {
        if codec.param(&param.name).is_none() && has_config_data_named(codec, &param.name) {
            codec.add_param(param.name.clone(), param.value.clone());
        }
    }
}

/// Last step of the negotiation after all remote streams have been intersected
///
/// Payload types offered before but not part of the result are kept as receive-only, some peers send on payload
/// types they did not answer with. Configuration discovered for an unchanged send codec is carried over.
pub fn finish_codec_negotiation(
    old: &[CodecAssociation],
    mut new: Vec<CodecAssociation>,
) -> Vec<CodecAssociation> {
    for pt in 0..=127 {
        if lookup_by_pt(&new, pt, true).is_some() {
            continue;
        }

        if let Some(local) = lookup_by_pt(old, pt, false) {
            new.push(CodecAssociation {
                recv_only: true,
                ..local.clone()
            });
        }
    }

    for ca in &mut new {
        if ca.disable || ca.reserved || ca.recv_only {
            ca.need_config = false;
            continue;
        }

        if let Some(old) = lookup_custom(old, true, |old| same_send_codec_ignoring_pt(old, ca)) {
            keep_config_from_old_codec(&mut ca.codec, &old.codec);
        }

        ca.need_config = needs_config(&ca.codec);
    }

    new
}
