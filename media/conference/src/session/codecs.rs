//! Running the codec negotiation of a session and applying its result

use super::{SessionInner, SessionState, StateGuard};
use crate::{
    Error,
    codec::Codec,
    event::ConferenceEvent,
    hdrext::{
        RtpHeaderExtension, UsedIds, create_local_header_extensions, finish_header_extensions_nego,
        negotiate_stream_header_extensions,
    },
    negotiation::{
        CodecAssociation, associations_are_equal, create_local_codec_associations, finish_codec_negotiation,
        negotiate_stream_codecs, stream_negotiated_codecs,
    },
    rate_control::filter_codecs,
    stream::StreamId,
};

/// Result of a negotiation which has not been applied yet
pub(crate) struct Negotiated {
    pub(crate) associations: Vec<CodecAssociation>,
    pub(crate) hdrext: Vec<RtpHeaderExtension>,
}

impl SessionInner {
    /// Renegotiate with the current inputs and apply the result
    pub(crate) fn update_codecs(&self, state: &mut StateGuard<'_>) -> Result<(), Error> {
        let negotiated = negotiate(state, None)?;
        self.apply_negotiation(state, negotiated);

        Ok(())
    }

    /// Store a negotiation result and bring the streams, receive sub-streams and the send path up to date
    pub(crate) fn apply_negotiation(&self, state: &mut StateGuard<'_>, negotiated: Negotiated) {
        let Negotiated { associations, hdrext } = negotiated;

        let is_new = state.associations.is_empty() || !associations_are_equal(&state.associations, &associations);

        state.associations = associations;
        state.hdrext = hdrext;
        state.codecs_generation += 1;

        let mut any_remote = false;

        {
            let state = &mut **state;

            if let Some(rate_control) = &mut state.rate_control {
                rate_control.codecs_updated(&state.associations, &state.hdrext);
            }

            for &id in &state.stream_order {
                let Some(stream) = state.streams.get_mut(id) else {
                    continue;
                };

                if stream.remote_codecs.is_empty() {
                    continue;
                }

                any_remote = true;

                let negotiated_codecs = stream_negotiated_codecs(&state.associations, &stream.remote_codecs);

                if negotiated_codecs != stream.negotiated_codecs {
                    stream.negotiated_codecs = negotiated_codecs;

                    self.emit(ConferenceEvent::NegotiatedCodecsChanged {
                        session: self.id,
                        stream: id,
                    });
                }
            }
        }

        if is_new {
            log::debug!("Codecs of session {} changed", self.id);
            self.backend.clear_pt_map(self.id);
        }

        self.verify_substreams(state);
        self.start_codec_param_gathering(state);

        if any_remote {
            self.verify_send_codec_bin(state);
        }

        if is_new {
            self.emit(ConferenceEvent::CodecsChanged { session: self.id });
        }
    }
}

/// Negotiate the local codecs against the remote codecs of all streams
///
/// With `replace` the remote codecs of the given stream are taken from the argument instead, so a new offer can be
/// checked before it is stored.
pub(crate) fn negotiate(state: &SessionState, replace: Option<(StreamId, &[Codec])>) -> Result<Negotiated, Error> {
    let multi_stream = state
        .stream_order
        .iter()
        .filter(|id| !remote_codecs(state, replace, **id).is_empty())
        .count()
        > 1;

    let mut used_ids = UsedIds::default();

    let mut hdrext = create_local_header_extensions(
        &state.hdrext,
        &state.config.rtp_header_extension_preferences,
        &mut used_ids,
    );

    let mut associations = create_local_codec_associations(
        &state.blueprints,
        &state.valid_preferences,
        &state.associations,
        &state.input_caps,
        &state.output_caps,
    )?;

    for id in &state.stream_order {
        let remote = remote_codecs(state, replace, *id);

        if remote.is_empty() {
            continue;
        }

        associations = negotiate_stream_codecs(remote, &associations, multi_stream)?;

        if let Some(stream) = state.streams.get(*id) {
            hdrext = negotiate_stream_header_extensions(hdrext, &stream.hdrext, !multi_stream, &mut used_ids);
        }
    }

    let mut associations = finish_codec_negotiation(&state.associations, associations);

    for kind in &state.special_kinds {
        kind.negotiation_filter(&mut associations);
    }

    if state.rate_control.is_some() {
        filter_codecs(&mut associations, &mut hdrext);
    }

    let hdrext = finish_header_extensions_nego(hdrext, &mut used_ids);

    if !associations.iter().any(|ca| ca.is_active()) {
        return Err(Error::NoCodecsLeft("negotiation resulted in an empty codec list".into()));
    }

    Ok(Negotiated { associations, hdrext })
}

fn remote_codecs<'a>(state: &'a SessionState, replace: Option<(StreamId, &'a [Codec])>, id: StreamId) -> &'a [Codec] {
    match replace {
        Some((replaced, codecs)) if replaced == id => codecs,
        _ => state
            .streams
            .get(id)
            .map(|stream| stream.remote_codecs.as_slice())
            .unwrap_or_default(),
    }
}
