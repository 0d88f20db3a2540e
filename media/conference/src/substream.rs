use crate::{
    Error,
    codec::{Codec, CodecBlueprint, ParamType, copy_filtered},
    negotiation::{CodecAssociation, lookup_by_pt},
    stream::{StreamId, StreamState},
};
use slotmap::SlotMap;
use std::{sync::Arc, time::Instant};

slotmap::new_key_type! {
    /// Receive path of a single remote SSRC
    pub struct SubStreamId;
}

/// What a decoder was built from, a change requires rebuilding it
#[derive(Debug, Clone)]
pub(crate) enum DecoderSource {
    Profile(String),
    Blueprint(Arc<CodecBlueprint>),
}

impl DecoderSource {
    fn of(association: &CodecAssociation) -> Option<Self> {
        if let Some(profile) = &association.recv_profile {
            Some(Self::Profile(profile.clone()))
        } else {
            association.blueprint.clone().map(Self::Blueprint)
        }
    }

    fn matches(&self, association: &CodecAssociation) -> bool {
        match (self, Self::of(association)) {
            (Self::Profile(a), Some(Self::Profile(b))) => *a == b,
            (Self::Blueprint(a), Some(Self::Blueprint(b))) => Arc::ptr_eq(a, &b),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SubStream {
    pub(crate) ssrc: u32,
    pub(crate) pt: u8,
    /// `None` while waiting to be associated with a stream
    pub(crate) stream: Option<StreamId>,
    /// Codec the decoder currently decodes
    pub(crate) codec: Option<Codec>,
    pub(crate) decoder: Option<DecoderSource>,
    pub(crate) receiving: bool,
    /// Bind to the only stream of the session if no RTCP arrived until then
    pub(crate) no_rtcp_deadline: Option<Instant>,
}

impl SubStream {
    pub(crate) fn new(ssrc: u32, pt: u8) -> Self {
        Self {
            ssrc,
            pt,
            stream: None,
            codec: None,
            decoder: None,
            receiving: false,
            no_rtcp_deadline: None,
        }
    }
}

/// How an existing decoder must be adjusted to decode `codec`
#[derive(Debug)]
pub(crate) enum DecoderUpdate {
    Unchanged,
    /// Same decoder, only the codec description changed
    Codec(Codec),
    Rebuild(Codec, CodecAssociation),
}

/// Pick the codec to decode payload type `pt` with, preferring the codec negotiated for `stream`
pub(crate) fn recv_codec(
    associations: &[CodecAssociation],
    streams: &SlotMap<StreamId, StreamState>,
    stream: Option<StreamId>,
    pt: u8,
) -> Result<(Codec, CodecAssociation), Error> {
    if associations.is_empty() {
        return Err(Error::Internal("No codecs yet".into()));
    }

    let association = lookup_by_pt(associations, i32::from(pt), false)
        .ok_or_else(|| Error::UnknownCodec(format!("There is no negotiated codec with pt {pt}")))?;

    let negotiated = stream
        .and_then(|stream| streams.get(stream))
        .and_then(|stream| {
            stream
                .negotiated_codecs
                .iter()
                .find(|codec| codec.id == i32::from(pt))
        });

    let codec = match negotiated {
        Some(codec) => codec.clone(),
        None => copy_filtered(&association.codec, ParamType::CONFIG),
    };

    Ok((codec, association.clone()))
}

pub(crate) fn decoder_update(substream: &SubStream, codec: Codec, association: CodecAssociation) -> DecoderUpdate {
    let same_decoder = substream
        .decoder
        .as_ref()
        .is_some_and(|decoder| decoder.matches(&association));

    if !same_decoder {
        return DecoderUpdate::Rebuild(codec, association);
    }

    if substream.codec.as_ref() == Some(&codec) {
        DecoderUpdate::Unchanged
    } else {
        DecoderUpdate::Codec(codec)
    }
}

pub(crate) fn decoder_source(association: &CodecAssociation) -> Option<DecoderSource> {
    DecoderSource::of(association)
}
