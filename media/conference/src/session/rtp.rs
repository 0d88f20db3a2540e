//! Packets passing through the session: key unit requests and TFRC rate control

use super::{SessionInner, StateGuard};
use crate::{
    rate_control::{OutgoingRtp, has_key_request_feedback},
    rtcp,
};
use bytes::Bytes;
use std::time::{Duration, Instant};

impl SessionInner {
    /// A RTP packet was received
    pub(crate) fn incoming_rtp(&self, packet: &[u8]) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();
        let ssrc = state.ssrc;

        let Some(rate_control) = &mut state.rate_control else {
            return;
        };

        if let Some(feedback) = rate_control.incoming_rtp(packet, ssrc, Instant::now()) {
            self.backend.send_rtcp(self.id, feedback);
        }
    }

    /// A (compound) RTCP packet was received
    pub(crate) fn incoming_rtcp(&self, packet: &[u8]) {
        let Ok(_entered) = self.enter() else {
            return;
        };

        let mut state = self.state.lock();
        let ssrc = state.ssrc;

        let pli = rtcp::packets(packet).any(|packet| {
            packet.pt == rtcp::PT_PSFB && packet.count == rtcp::FMT_PLI && packet.media_ssrc() == Some(ssrc)
        });

        if pli
            && state.send.has_encoder
            && let Some(current) = &state.send.current
            && has_key_request_feedback(&current.codec)
        {
            log::debug!("Received PLI in session {}, requesting key unit", self.id);
            self.backend.request_key_unit(self.id);
        }

        let bitrate_changed = state
            .rate_control
            .as_mut()
            .is_some_and(|rate_control| rate_control.incoming_rtcp(packet, ssrc, Instant::now()));

        if bitrate_changed {
            self.apply_bitrate(&mut state);
        }
    }

    /// A RTP packet is about to be sent, returns the packet to send and how long to hold it back
    pub(crate) fn outgoing_rtp(&self, packet: Bytes) -> OutgoingRtp {
        let unchanged = |packet| OutgoingRtp {
            packet,
            delay: Duration::ZERO,
        };

        let Ok(_entered) = self.enter() else {
            return unchanged(packet);
        };

        let mut state = self.state.lock();

        let Some(rate_control) = &mut state.rate_control else {
            return unchanged(packet);
        };

        let pt = rtp_types::RtpPacket::parse(&packet[..])
            .ok()
            .map(|parsed| i32::from(parsed.payload_type()));

        if !pt.is_some_and(|pt| rate_control.is_enabled(pt)) {
            return unchanged(packet);
        }

        rate_control.outgoing_rtp(packet, Instant::now())
    }

    pub(crate) fn poll_rate_control(&self, state: &mut StateGuard<'_>, now: Instant) {
        let ssrc = state.ssrc;

        let Some(rate_control) = &mut state.rate_control else {
            return;
        };

        let output = rate_control.poll(ssrc, now);

        for feedback in output.feedback {
            self.backend.send_rtcp(self.id, feedback);
        }

        if output.bitrate_changed {
            self.apply_bitrate(state);
        }
    }
}
