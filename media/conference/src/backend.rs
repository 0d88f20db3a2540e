//! # Media backend
//!
//! The conference decides which media elements a session needs, a [`MediaBackend`] realizes them. Encoders,
//! decoders, the discovery branch and transmitters are built with the session lock released, all other calls are
//! made while holding it and must not call back into the conference. Results the backend learns about later are
//! reported through [`RtpPipelineHooks`](crate::RtpPipelineHooks).

use crate::{
    Error,
    candidate::{Candidate, Component, ComponentState},
    caps::Caps,
    codec::{Codec, CodecBlueprint, MediaType},
    conference::ParticipantId,
    dtmf::DtmfEvent,
    negotiation::CodecAssociation,
    session::SessionId,
    special_source::SpecialSourceKind,
    srtp::SrtpParameters,
    substream::SubStreamId,
};
use bytes::Bytes;

/// Direction of a codec profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileDirection {
    /// Raw media in, RTP out
    Send,
    /// RTP in, raw media out
    Recv,
}

/// Pads of a parsed codec profile
#[derive(Debug, Clone, Default)]
pub struct ProfileBin {
    /// Caps of every sink pad
    pub sink_caps: Vec<Caps>,
    /// Caps of every source pad
    pub src_caps: Vec<Caps>,
}

pub trait MediaBackend: Send + Sync {
    /// Codecs which can be encoded or decoded for the given media type
    fn blueprints(&self, media_type: MediaType) -> Vec<CodecBlueprint>;

    /// Returns if an auxiliary source of this kind can be attached to send paths
    fn supports_special_source(&self, kind: SpecialSourceKind) -> bool {
        let _ = kind;
        true
    }

    /// Parse a codec profile description into its pads
    fn parse_profile(&self, profile: &str, direction: ProfileDirection) -> Result<ProfileBin, Error> {
        let _ = direction;
        Err(Error::NotImplemented(format!("codec profiles are not supported ({profile})")))
    }

    /// Open or close the valve between the media input and the encoder
    fn set_input_valve(&self, session: SessionId, drop: bool);

    /// Block the encoder's input, [`send_path_blocked`](crate::RtpPipelineHooks::send_path_blocked) must be called
    /// once no more data flows
    fn block_send_path(&self, session: SessionId);

    fn unblock_send_path(&self, session: SessionId);

    /// Build the encoder for `association`, replacing nothing
    ///
    /// `send_codecs` lists the send codecs of all advertised associations for encoders that produce more than one
    /// payload type. Returns the additional codecs the encoder produces next to the main one.
    fn build_encoder(
        &self,
        session: SessionId,
        association: &CodecAssociation,
        send_codecs: &[Codec],
        bitrate: u32,
    ) -> Result<Vec<Codec>, Error>;

    fn remove_encoder(&self, session: SessionId);

    /// Bitrate in bits per second, 0 lets the encoder choose
    fn set_encoder_bitrate(&self, session: SessionId, bitrate: u32);

    /// Ask the encoder to produce a key frame including all codec headers
    fn request_key_unit(&self, session: SessionId);

    /// Build the decoder of a receive sub-stream, replacing any decoder the sub-stream has
    fn build_decoder(
        &self,
        session: SessionId,
        substream: SubStreamId,
        ssrc: u32,
        codec: &Codec,
        association: &CodecAssociation,
    ) -> Result<(), Error>;

    fn remove_decoder(&self, session: SessionId, substream: SubStreamId);

    /// Let decoded media of a sub-stream through or drop it
    fn set_substream_receiving(&self, session: SessionId, substream: SubStreamId, receiving: bool);

    /// Block the discovery branch, [`discovery_path_blocked`](crate::RtpPipelineHooks::discovery_path_blocked)
    /// must be called once no more data flows
    fn block_discovery_path(&self, session: SessionId);

    fn unblock_discovery_path(&self, session: SessionId);

    /// Run a dummy encoder for `association` on the discovery branch and report its output caps through
    /// [`discovery_caps`](crate::RtpPipelineHooks::discovery_caps)
    fn start_discovery(&self, session: SessionId, association: &CodecAssociation) -> Result<(), Error>;

    /// Tear down the discovery branch, this also removes a pending block
    fn stop_discovery(&self, session: SessionId);

    fn start_special_source(&self, session: SessionId, kind: SpecialSourceKind, codec: &Codec) -> Result<(), Error>;

    fn stop_special_source(&self, session: SessionId, kind: SpecialSourceKind);

    /// Hand a telephony event to the special sources
    ///
    /// Returns false if no source is able to take it. Sources report back through
    /// [`telephony_message`](crate::RtpPipelineHooks::telephony_message).
    fn send_telephony_event(&self, session: SessionId, event: &DtmfEvent) -> bool;

    /// The payload type mapping changed, forget all cached payload type caps
    fn clear_pt_map(&self, session: SessionId);

    /// Configure the encryption of outgoing packets, `None` sends in the clear
    fn set_encryption(&self, session: SessionId, parameters: Option<&SrtpParameters>) -> Result<(), Error> {
        match parameters {
            Some(parameters) if !parameters.is_null() => {
                Err(Error::NotImplemented(format!("no SRTP support, can't encrypt session {session}")))
            }
            _ => Ok(()),
        }
    }

    /// Install or remove the decryption key of a remote SSRC
    fn set_decryption_key(&self, session: SessionId, ssrc: u32, parameters: Option<&SrtpParameters>) {
        let _ = (session, ssrc, parameters);
    }

    /// Create the transmitter of a stream
    fn create_transmitter(
        &self,
        session: SessionId,
        participant: ParticipantId,
        name: &str,
        parameters: &[(String, String)],
    ) -> Result<Box<dyn StreamTransmitter>, Error>;

    /// Send a RTCP packet generated by the conference
    fn send_rtcp(&self, session: SessionId, packet: Bytes);
}

/// Events produced by a [`StreamTransmitter`]
#[derive(Debug)]
pub enum TransmitterEvent {
    NewLocalCandidate(Candidate),
    LocalCandidatesPrepared,
    NewActiveCandidatePair { local: Candidate, remote: Candidate },
    StateChanged { component: Component, state: ComponentState },
    Error(Error),
    /// A packet from a remote address known to belong to this stream's peer was received
    KnownSourcePacketReceived { component: Component, packet: Bytes },
}

/// Network side of a stream
pub trait StreamTransmitter: Send {
    fn add_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<(), Error>;

    /// Use exactly these candidates, skipping connectivity checks
    ///
    /// Returns [`Error::NotImplemented`] if the transmitter only supports
    /// [`add_remote_candidates`](Self::add_remote_candidates).
    fn force_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<(), Error> {
        let _ = candidates;
        Err(Error::NotImplemented(
            "transmitter doesn't support forcing remote candidates".into(),
        ))
    }

    fn set_sending(&mut self, sending: bool);

    fn gather_local_candidates(&mut self) -> Result<(), Error>;

    fn stop(&mut self);

    fn pop_event(&mut self) -> Option<TransmitterEvent>;
}
