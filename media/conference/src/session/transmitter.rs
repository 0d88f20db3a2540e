use super::SessionInner;
use crate::{
    backend::TransmitterEvent,
    candidate::Component,
    event::ConferenceEvent,
    rtcp,
    stream::{StreamId, TransmitterSlot},
};
use bytes::Bytes;

/// SSRC of the sender of a RTP or RTCP packet
fn packet_ssrc(component: Component, packet: &[u8]) -> Option<u32> {
    if component == Component::Rtcp || rtcp::is_rtcp(packet) {
        rtcp::report_sender_ssrc(packet)
    } else {
        rtp_types::RtpPacket::parse(packet).ok().map(|parsed| parsed.ssrc())
    }
}

impl SessionInner {
    /// Drain the events of all transmitters, translating them into conference events
    pub(crate) fn poll_transmitters(&self) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();
        let mut known_sources: Vec<(StreamId, Component, Bytes)> = Vec::new();

        for id in state.stream_ids() {
            let Some(stream) = state.streams.get_mut(id) else {
                continue;
            };

            let TransmitterSlot::Ready(transmitter) = &mut stream.transmitter else {
                continue;
            };

            while let Some(event) = transmitter.pop_event() {
                let session = self.id;

                match event {
                    TransmitterEvent::NewLocalCandidate(candidate) => {
                        self.emit(ConferenceEvent::NewLocalCandidate {
                            session,
                            stream: id,
                            candidate,
                        });
                    }
                    TransmitterEvent::LocalCandidatesPrepared => {
                        self.emit(ConferenceEvent::LocalCandidatesPrepared { session, stream: id });
                    }
                    TransmitterEvent::NewActiveCandidatePair { local, remote } => {
                        self.emit(ConferenceEvent::NewActiveCandidatePair {
                            session,
                            stream: id,
                            local,
                            remote,
                        });
                    }
                    TransmitterEvent::StateChanged {
                        component,
                        state: component_state,
                    } => {
                        self.emit(ConferenceEvent::ComponentStateChanged {
                            session,
                            stream: id,
                            component,
                            state: component_state,
                        });
                    }
                    TransmitterEvent::Error(error) => self.stream_error(id, error),
                    TransmitterEvent::KnownSourcePacketReceived { component, packet } => {
                        known_sources.push((id, component, packet));
                    }
                }
            }
        }

        for (stream, component, packet) in known_sources {
            let Some(ssrc) = packet_ssrc(component, &packet) else {
                continue;
            };

            if !state.ssrc_streams.contains_key(&ssrc) {
                log::debug!("Packet of ssrc {ssrc:#010x} came from the address of stream {stream:?}");
                self.add_ssrc_stream(&mut state, ssrc, stream, false);
            }
        }
    }
}
