#![allow(dead_code)]

use bytes::Bytes;
use ezk_conference::{
    Conference, ConferenceEvent, Error, MediaBackend, ParticipantId, SessionId, StreamTransmitter, TransmitterEvent,
    backend::{ProfileBin, ProfileDirection},
    candidate::Candidate,
    caps::Caps,
    codec::{BlueprintCapability, Codec, CodecBlueprint, ID_ANY, MediaType},
    config::ConferenceConfig,
    dtmf::{DtmfEvent, DtmfMethod},
    negotiation::CodecAssociation,
    special_source::SpecialSourceKind,
    srtp::SrtpParameters,
    substream::SubStreamId,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Everything the conference asked the backend to do
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    SetInputValve { drop: bool },
    BlockSendPath,
    UnblockSendPath,
    BuildEncoder { codec: Codec, bitrate: u32 },
    RemoveEncoder,
    SetEncoderBitrate(u32),
    RequestKeyUnit,
    BuildDecoder { substream: SubStreamId, ssrc: u32, codec: Codec },
    RemoveDecoder(SubStreamId),
    SetSubstreamReceiving(SubStreamId, bool),
    BlockDiscoveryPath,
    UnblockDiscoveryPath,
    StartDiscovery(Codec),
    StopDiscovery,
    StartSpecialSource(SpecialSourceKind, Codec),
    StopSpecialSource(SpecialSourceKind),
    SendTelephonyEvent(DtmfEvent),
    ClearPtMap,
    SetDecryptionKey(u32, bool),
    CreateTransmitter(String),
    SendRtcp(Bytes),
}

/// Shared view on a [`MockTransmitter`] handed to the conference
#[derive(Debug, Default)]
pub(crate) struct TransmitterLog {
    pub(crate) sending: bool,
    pub(crate) gathering: bool,
    pub(crate) stopped: bool,
    pub(crate) remote_candidates: Vec<Candidate>,
    pub(crate) events: VecDeque<TransmitterEvent>,
}

pub(crate) struct MockTransmitter {
    log: Arc<Mutex<TransmitterLog>>,
}

impl StreamTransmitter for MockTransmitter {
    fn add_remote_candidates(&mut self, candidates: &[Candidate]) -> Result<(), Error> {
        self.log.lock().remote_candidates.extend_from_slice(candidates);
        Ok(())
    }

    fn set_sending(&mut self, sending: bool) {
        self.log.lock().sending = sending;
    }

    fn gather_local_candidates(&mut self) -> Result<(), Error> {
        self.log.lock().gathering = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.log.lock().stopped = true;
    }

    fn pop_event(&mut self) -> Option<TransmitterEvent> {
        self.log.lock().events.pop_front()
    }
}

pub(crate) struct MockBackend {
    blueprints: Vec<CodecBlueprint>,
    special_sources: bool,
    calls: Mutex<Vec<Call>>,
    /// Methods the special sources accept telephony events for
    pub(crate) telephony_methods: Mutex<Vec<DtmfMethod>>,
    pub(crate) fail_encoder: Mutex<bool>,
    /// Called from within the next `build_encoder`
    pub(crate) on_build_encoder: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pub(crate) transmitters: Mutex<Vec<Arc<Mutex<TransmitterLog>>>>,
}

impl MockBackend {
    pub(crate) fn new(blueprints: Vec<CodecBlueprint>) -> Arc<Self> {
        Self::build(blueprints, true)
    }

    /// Backend whose send paths can't carry any special source
    pub(crate) fn without_special_sources(blueprints: Vec<CodecBlueprint>) -> Arc<Self> {
        Self::build(blueprints, false)
    }

    fn build(blueprints: Vec<CodecBlueprint>, special_sources: bool) -> Arc<Self> {
        Arc::new(Self {
            blueprints,
            special_sources,
            calls: Mutex::new(Vec::new()),
            telephony_methods: Mutex::new(vec![DtmfMethod::RtpEvent, DtmfMethod::Sound]),
            fail_encoder: Mutex::new(false),
            on_build_encoder: Mutex::new(None),
            transmitters: Mutex::new(Vec::new()),
        })
    }

    /// Drain all calls recorded so far
    pub(crate) fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub(crate) fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| f(call)).count()
    }

    pub(crate) fn transmitter(&self, index: usize) -> Arc<Mutex<TransmitterLog>> {
        self.transmitters.lock()[index].clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl MediaBackend for MockBackend {
    fn blueprints(&self, media_type: MediaType) -> Vec<CodecBlueprint> {
        self.blueprints
            .iter()
            .filter(|bp| bp.codec.media_type == media_type)
            .cloned()
            .collect()
    }

    fn supports_special_source(&self, _: SpecialSourceKind) -> bool {
        self.special_sources
    }

    fn parse_profile(&self, profile: &str, _: ProfileDirection) -> Result<ProfileBin, Error> {
        if profile.is_empty() {
            return Err(Error::InvalidArguments("empty profile".into()));
        }

        Ok(ProfileBin {
            sink_caps: vec![Caps::new_any()],
            src_caps: vec![Caps::new_any()],
        })
    }

    fn set_input_valve(&self, _: SessionId, drop: bool) {
        self.record(Call::SetInputValve { drop });
    }

    fn block_send_path(&self, _: SessionId) {
        self.record(Call::BlockSendPath);
    }

    fn unblock_send_path(&self, _: SessionId) {
        self.record(Call::UnblockSendPath);
    }

    fn build_encoder(
        &self,
        _: SessionId,
        association: &CodecAssociation,
        _: &[Codec],
        bitrate: u32,
    ) -> Result<Vec<Codec>, Error> {
        let callback = self.on_build_encoder.lock().take();
        if let Some(callback) = callback {
            callback();
        }

        if *self.fail_encoder.lock() {
            return Err(Error::Construction(format!("no encoder for {}", association.codec)));
        }

        self.record(Call::BuildEncoder {
            codec: association.codec.clone(),
            bitrate,
        });

        Ok(Vec::new())
    }

    fn remove_encoder(&self, _: SessionId) {
        self.record(Call::RemoveEncoder);
    }

    fn set_encoder_bitrate(&self, _: SessionId, bitrate: u32) {
        self.record(Call::SetEncoderBitrate(bitrate));
    }

    fn request_key_unit(&self, _: SessionId) {
        self.record(Call::RequestKeyUnit);
    }

    fn build_decoder(
        &self,
        _: SessionId,
        substream: SubStreamId,
        ssrc: u32,
        codec: &Codec,
        _: &CodecAssociation,
    ) -> Result<(), Error> {
        self.record(Call::BuildDecoder {
            substream,
            ssrc,
            codec: codec.clone(),
        });

        Ok(())
    }

    fn remove_decoder(&self, _: SessionId, substream: SubStreamId) {
        self.record(Call::RemoveDecoder(substream));
    }

    fn set_substream_receiving(&self, _: SessionId, substream: SubStreamId, receiving: bool) {
        self.record(Call::SetSubstreamReceiving(substream, receiving));
    }

    fn block_discovery_path(&self, _: SessionId) {
        self.record(Call::BlockDiscoveryPath);
    }

    fn unblock_discovery_path(&self, _: SessionId) {
        self.record(Call::UnblockDiscoveryPath);
    }

    fn start_discovery(&self, _: SessionId, association: &CodecAssociation) -> Result<(), Error> {
        self.record(Call::StartDiscovery(association.codec.clone()));
        Ok(())
    }

    fn stop_discovery(&self, _: SessionId) {
        self.record(Call::StopDiscovery);
    }

    fn start_special_source(&self, _: SessionId, kind: SpecialSourceKind, codec: &Codec) -> Result<(), Error> {
        self.record(Call::StartSpecialSource(kind, codec.clone()));
        Ok(())
    }

    fn stop_special_source(&self, _: SessionId, kind: SpecialSourceKind) {
        self.record(Call::StopSpecialSource(kind));
    }

    fn send_telephony_event(&self, _: SessionId, event: &DtmfEvent) -> bool {
        self.record(Call::SendTelephonyEvent(event.clone()));

        self.telephony_methods.lock().contains(&event.method)
    }

    fn clear_pt_map(&self, _: SessionId) {
        self.record(Call::ClearPtMap);
    }

    fn set_encryption(&self, _: SessionId, _: Option<&SrtpParameters>) -> Result<(), Error> {
        Ok(())
    }

    fn set_decryption_key(&self, _: SessionId, ssrc: u32, parameters: Option<&SrtpParameters>) {
        self.record(Call::SetDecryptionKey(ssrc, parameters.is_some()));
    }

    fn create_transmitter(
        &self,
        _: SessionId,
        _: ParticipantId,
        name: &str,
        _: &[(String, String)],
    ) -> Result<Box<dyn StreamTransmitter>, Error> {
        if name != "nice" && name != "rawudp" {
            return Err(Error::Construction(format!("unknown transmitter {name}")));
        }

        self.record(Call::CreateTransmitter(name.into()));

        let log = Arc::new(Mutex::new(TransmitterLog::default()));
        self.transmitters.lock().push(log.clone());

        Ok(Box::new(MockTransmitter { log }))
    }

    fn send_rtcp(&self, _: SessionId, packet: Bytes) {
        self.record(Call::SendRtcp(packet));
    }
}

pub(crate) fn audio_blueprints() -> Vec<CodecBlueprint> {
    vec![
        CodecBlueprint::new(Codec::PCMU, BlueprintCapability::Both),
        CodecBlueprint::new(Codec::PCMA, BlueprintCapability::Both),
        CodecBlueprint::new(speex(ID_ANY), BlueprintCapability::Both),
    ]
}

pub(crate) fn speex(id: i32) -> Codec {
    Codec::new(id, "SPEEX", MediaType::Audio, 16000)
}

pub(crate) fn make_conference(blueprints: Vec<CodecBlueprint>) -> (Conference, Arc<MockBackend>) {
    conference_with_backend(MockBackend::new(blueprints))
}

pub(crate) fn conference_with_backend(backend: Arc<MockBackend>) -> (Conference, Arc<MockBackend>) {
    init_logger();

    let conference = Conference::new(
        ConferenceConfig {
            sdes_cname: Some("local@test".into()),
            ..ConferenceConfig::default()
        },
        backend.clone(),
    );

    (conference, backend)
}

/// Pop all queued events
pub(crate) fn events(conference: &Conference) -> Vec<ConferenceEvent> {
    std::iter::from_fn(|| conference.pop_event()).collect()
}

/// A minimal RTP packet
pub(crate) fn rtp_packet(pt: u8, seq: u16, ssrc: u32) -> Bytes {
    let mut packet = vec![0x80, pt];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0]);
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(&[0u8; 160]);
    Bytes::from(packet)
}
