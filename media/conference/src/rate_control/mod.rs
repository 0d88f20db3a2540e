//! # TFRC rate control of a session
//!
//! Glues the [`tfrc`] state machines to the packets of a session. Every remote SSRC is tracked with a receiver half
//! (loss accounting of its packets and feedback towards it) and a sender half (our sending rate as reported by it).
//!
//! Outgoing RTP packets carry the `rtt-sendts` header extension with the sender's averaged RTT and a send
//! timestamp. The remote echoes the timestamp in RTPFB feedback reports which are used to compute the RTT and the
//! allowed sending rate. The rate of the remote which sent the last report becomes the session's send bitrate.

use crate::{
    codec::Codec,
    hdrext::{RTT_SENDTS_URI, RtpHeaderExtension},
    negotiation::CodecAssociation,
    rtcp,
    stream::Direction,
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tfrc::{DEFAULT_MSS, IsDataLimited, MAX_RTT, SECOND, TfrcReceiver, TfrcSender};

mod extension;

const TFRC: &str = "tfrc";
const ONE_32BIT_CYCLE: u64 = 1 << 32;
/// Timestamps going backwards by more than this are considered a wraparound
const TS_WRAP_THRESHOLD: i64 = 5 * 60 * SECOND as i64;
/// Sequence numbers going backwards by more than this are considered a wraparound
const SEQ_WRAP_THRESHOLD: i32 = 3000;
/// About one packet
const INITIAL_BYTE_RESERVOIR: i64 = 1500;
/// Per packet overhead accounted for when pacing
const PACKET_OVERHEAD: usize = 10;
const EXTENSION_LEN: usize = 7;

/// An outgoing RTP packet after rate control
#[derive(Debug, Clone)]
pub struct OutgoingRtp {
    pub packet: Bytes,
    /// How long to hold the packet back to stay within the allowed sending rate
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExtensionConfig {
    id: u8,
    two_byte: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceRef {
    /// Sender state used before any remote sent feedback
    Initial,
    Remote(u32),
}

#[derive(Debug, Default)]
struct TrackedSource {
    // Sender side
    sender: Option<TfrcSender>,
    idl: IsDataLimited,
    send_ts_base: u64,
    send_ts_cycles: u64,
    fb_last_ts: u64,
    fb_ts_cycles: u64,

    // Receiver side
    receiver: Option<TfrcReceiver>,
    seq_cycles: u64,
    last_seq: u16,
    ts_cycles: u64,
    last_ts: u32,
    last_now: u64,
    last_rtt: u32,
    send_feedback: bool,
    got_nohdr_pkt: bool,
}

impl TrackedSource {
    fn add_sender(&mut self, now: u64, initial_rate: u32) {
        self.sender = Some(TfrcSender::new(DEFAULT_MSS, now, initial_rate));
        self.idl = IsDataLimited::new();
        self.send_ts_base = now;
        self.send_ts_cycles = 0;
        self.fb_last_ts = 0;
        self.fb_ts_cycles = 0;
    }

    fn clear_sender(&mut self) {
        self.sender = None;
        self.idl = IsDataLimited::new();
    }

    fn reset_receiver(&mut self, now: u64) {
        self.seq_cycles = 0;
        self.last_seq = 0;
        self.ts_cycles = 0;
        self.last_now = 0;
        self.last_rtt = 0;
        self.receiver = Some(TfrcReceiver::new(now));
    }
}

/// Output of [`RateControl::poll`]
#[derive(Debug, Default)]
pub(crate) struct RateControlOutput {
    /// Feedback packets to send
    pub(crate) feedback: Vec<Bytes>,
    /// The send bitrate changed
    pub(crate) bitrate_changed: bool,
}

#[derive(Debug)]
pub(crate) struct RateControl {
    epoch: Instant,
    sources: HashMap<u32, TrackedSource>,
    /// Sender state used before the first remote source is known, adopted by it
    initial: Option<TrackedSource>,
    last_src: Option<SourceRef>,

    sending: bool,
    send_bitrate: u32,
    byte_reservoir: i64,
    last_sent: Option<u64>,

    extension: Option<ExtensionConfig>,
    pts: [bool; 128],
}

impl RateControl {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            sources: HashMap::new(),
            initial: None,
            last_src: None,
            sending: false,
            send_bitrate: DEFAULT_MSS * 8,
            byte_reservoir: INITIAL_BYTE_RESERVOIR,
            last_sent: None,
            extension: None,
            pts: [false; 128],
        }
    }

    fn micros(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX)
    }

    fn instant(&self, micros: u64) -> Instant {
        self.epoch + Duration::from_micros(micros)
    }

    /// Send bitrate in bits per second
    pub(crate) fn send_bitrate(&self) -> u32 {
        self.send_bitrate
    }

    /// Returns if rate control is active for packets of payload type `pt`
    pub(crate) fn is_enabled(&self, pt: i32) -> bool {
        self.extension.is_some() && usize::try_from(pt).is_ok_and(|pt| pt < 128 && self.pts[pt])
    }

    /// Apply a new negotiation result
    ///
    /// Rate control is enabled for every codec with the `tfrc` and `nack pli` feedback parameters, key frames must
    /// be requested by the receiver when the rate drops.
    pub(crate) fn codecs_updated(&mut self, associations: &[CodecAssociation], extensions: &[RtpHeaderExtension]) {
        self.pts = [false; 128];

        for ca in associations {
            let Some(pt) = ca.codec.pt() else {
                continue;
            };

            if ca.codec.feedback(TFRC, "").is_some() && has_key_request_feedback(&ca.codec) {
                self.pts[usize::from(pt)] = true;
            }
        }

        self.extension = extensions
            .iter()
            .find(|ext| ext.uri.eq_ignore_ascii_case(RTT_SENDTS_URI) && ext.direction == Direction::BOTH)
            .and_then(|ext| {
                let id = u8::try_from(ext.id).ok()?;

                Some(ExtensionConfig {
                    id,
                    two_byte: id > 14,
                })
            });

        log::debug!("Rate control extension: {:?}", self.extension);
    }

    /// The session started or stopped sending, stopping discards all sender state
    ///
    /// Returns if the send bitrate changed.
    pub(crate) fn set_sending(&mut self, sending: bool) -> bool {
        if self.sending == sending {
            return false;
        }

        self.sending = sending;

        if sending {
            return false;
        }

        self.initial = None;
        self.last_src = None;

        for src in self.sources.values_mut() {
            src.clear_sender();
        }

        self.update_bitrate("stop")
    }

    /// Get or create the state of a remote source
    ///
    /// The first remote source takes over the initial sender state so the send timestamps it echoes stay valid.
    fn remote_source(&mut self, ssrc: u32) -> &mut TrackedSource {
        if !self.sources.contains_key(&ssrc) {
            let src = match self.initial.take() {
                Some(src) => {
                    if self.last_src == Some(SourceRef::Initial) {
                        self.last_src = Some(SourceRef::Remote(ssrc));
                    }

                    src
                }
                None => {
                    if self.last_src.is_none() {
                        self.last_src = Some(SourceRef::Remote(ssrc));
                    }

                    TrackedSource::default()
                }
            };

            self.sources.insert(ssrc, src);
        }

        self.sources.entry(ssrc).or_default()
    }

    fn last_sender(&self) -> Option<&TfrcSender> {
        match self.last_src? {
            SourceRef::Initial => self.initial.as_ref()?.sender.as_ref(),
            SourceRef::Remote(ssrc) => self.sources.get(&ssrc)?.sender.as_ref(),
        }
    }

    fn update_bitrate(&mut self, reason: &str) -> bool {
        let byte_rate = self.last_sender().map_or(DEFAULT_MSS, TfrcSender::send_rate);
        let bitrate = byte_rate.saturating_mul(8);

        if bitrate == self.send_bitrate {
            return false;
        }

        log::debug!("Send rate changed ({reason}): {} -> {bitrate}", self.send_bitrate);

        self.send_bitrate = bitrate;
        true
    }

    /// Process an outgoing RTP packet, adding the RTT & send timestamp extension and computing its pacing delay
    pub(crate) fn outgoing_rtp(&mut self, packet: Bytes, now: Instant) -> OutgoingRtp {
        let unchanged = |packet| OutgoingRtp {
            packet,
            delay: Duration::ZERO,
        };

        let Some(extension) = self.extension else {
            return unchanged(packet);
        };

        if !self.sending {
            return unchanged(packet);
        }

        let now = self.micros(now);
        let delay = self.pace(packet.len(), now);

        let initial_rate = self.send_bitrate / 8;

        let src = match *self.last_src.get_or_insert(SourceRef::Initial) {
            SourceRef::Remote(ssrc) => self.sources.entry(ssrc).or_default(),
            SourceRef::Initial => self.initial.get_or_insert_with(TrackedSource::default),
        };

        if src.sender.is_none() {
            src.add_sender(now, initial_rate);
        }

        let averaged_rtt = src.sender.as_ref().map_or(0, TfrcSender::averaged_rtt);
        let send_ts = now - src.send_ts_base;

        if send_ts > src.send_ts_cycles + ONE_32BIT_CYCLE {
            src.send_ts_cycles += ONE_32BIT_CYCLE;
        }

        let mut value = [0u8; EXTENSION_LEN];
        value[..3].copy_from_slice(&(averaged_rtt.min(0xFF_FFFF) as u32).to_be_bytes()[1..]);
        value[3..].copy_from_slice(&(send_ts as u32).to_be_bytes());

        let packet = match extension::set_element(&packet, extension.id, extension.two_byte, &value) {
            Some(modified) => modified,
            None => {
                log::warn!("Could not add rate control extension to RTP packet");
                packet
            }
        };

        let size = u32::try_from(packet.len()).unwrap_or(u32::MAX);
        let data_limited = delay.is_zero();

        for src in self.sources.values_mut().chain(self.initial.as_mut()) {
            if let Some(sender) = &mut src.sender {
                if !data_limited {
                    src.idl.not_limited_now(now);
                }

                sender.sending_packet(size);
            }
        }

        log::trace!("Sending RTP with rate control, delay {delay:?}");

        OutgoingRtp { packet, delay }
    }

    /// Leaky bucket allowing one RTT worth of bytes to accumulate
    fn pace(&mut self, size: usize, now: u64) -> Duration {
        let (send_rate, bytes_for_one_rtt) = match self.last_sender() {
            Some(sender) => {
                let rate = sender.send_rate();
                (rate, u64::from(rate) * sender.averaged_rtt() / SECOND)
            }
            None => (DEFAULT_MSS, 0),
        };

        if let Some(last_sent) = self.last_sent
            && last_sent < now
        {
            let earned = (now - last_sent) * u64::from(send_rate) / SECOND;
            self.byte_reservoir = self.byte_reservoir.saturating_add(i64::try_from(earned).unwrap_or(i64::MAX));
        }

        self.last_sent = Some(now);

        if bytes_for_one_rtt != 0 {
            self.byte_reservoir = self
                .byte_reservoir
                .min(i64::try_from(bytes_for_one_rtt).unwrap_or(i64::MAX));
        }

        self.byte_reservoir -= (size + PACKET_OVERHEAD) as i64;

        if self.byte_reservoir >= 0 || send_rate == 0 {
            return Duration::ZERO;
        }

        let micros = self.byte_reservoir.unsigned_abs() * SECOND / u64::from(send_rate);

        Duration::from_micros(micros.max(1))
    }

    /// Process an incoming RTP packet
    ///
    /// Returns a feedback packet if one must be sent right away.
    pub(crate) fn incoming_rtp(&mut self, packet: &[u8], local_ssrc: u32, now: Instant) -> Option<Bytes> {
        let parsed = rtp_types::RtpPacket::parse(packet).ok()?;

        let ssrc = parsed.ssrc();
        let pt = usize::from(parsed.payload_type());
        let seq = parsed.sequence_number();

        let value = self
            .extension
            .filter(|_| pt < 128 && self.pts[pt])
            .and_then(|extension| {
                let (profile, data) = parsed.extension()?;

                extension::elements(profile, data)
                    .find(|(id, _)| *id == extension.id)
                    .map(|(_, data)| data)
            })
            .and_then(|data| <[u8; EXTENSION_LEN]>::try_from(data).ok());

        let Some(value) = value else {
            if let Some(src) = self.sources.get_mut(&ssrc) {
                src.got_nohdr_pkt = true;
            }

            return None;
        };

        let now_us = self.micros(now);
        let src = self.remote_source(ssrc);
        src.got_nohdr_pkt = false;

        let rtt = u32::from_be_bytes([0, value[0], value[1], value[2]]);
        let ts = u32::from_be_bytes([value[3], value[4], value[5], value[6]]);

        if src.receiver.is_none() {
            src.receiver = Some(TfrcReceiver::new(now_us));
        } else if rtt == 0 && src.last_rtt != 0 {
            log::debug!("Sender {ssrc:#010x} was reset");
            src.reset_receiver(now_us);
        }

        let seq_delta = i32::from(seq) - i32::from(src.last_seq);
        if seq < src.last_seq && seq_delta < -SEQ_WRAP_THRESHOLD {
            src.seq_cycles += 1 << 16;
        }
        src.last_seq = seq;
        let ext_seq = u64::from(seq) + src.seq_cycles;

        let ts_delta = i64::from(ts) - i64::from(src.last_ts);
        if ts < src.last_ts && ts_delta < -TS_WRAP_THRESHOLD {
            src.ts_cycles += ONE_32BIT_CYCLE;
        }
        src.last_ts = ts;
        let ext_ts = u64::from(ts) + src.ts_cycles;

        let size = u32::try_from(packet.len()).unwrap_or(u32::MAX);

        let receiver = src.receiver.as_mut()?;
        let mut send_now = receiver.got_packet(ext_ts, now_us, ext_seq, u64::from(rtt), size);

        // First packet with an RTT, arm the feedback timer
        if rtt != 0 && src.last_rtt == 0 {
            let expiry = receiver.feedback_timer_expiry();

            if expiry != 0 && expiry <= now_us && receiver.feedback_timer_expired(now_us) {
                send_now = true;
            }
        }

        src.last_now = now_us;
        src.last_rtt = rtt;

        if !send_now {
            return None;
        }

        src.send_feedback = true;
        build_feedback(src, ssrc, local_ssrc, now_us)
    }

    /// Process an incoming RTCP packet
    ///
    /// Returns if the send bitrate changed.
    pub(crate) fn incoming_rtcp(&mut self, data: &[u8], local_ssrc: u32, now: Instant) -> bool {
        let mut changed = false;

        for packet in rtcp::packets(data) {
            if packet.pt != rtcp::PT_RTPFB || packet.count != rtcp::FMT_TFRC || packet.length != 6 {
                continue;
            }

            if packet.media_ssrc() != Some(local_ssrc) {
                continue;
            }

            let (Some(sender_ssrc), &[t0, t1, t2, t3, d0, d1, d2, d3, x0, x1, x2, x3, l0, l1, l2, l3, ..]) =
                (packet.sender_ssrc(), packet.fci())
            else {
                continue;
            };

            let ts = u64::from(u32::from_be_bytes([t0, t1, t2, t3]));
            let delay = u64::from(u32::from_be_bytes([d0, d1, d2, d3]));
            let receive_rate = u32::from_be_bytes([x0, x1, x2, x3]);
            let loss_event_rate = f64::from(u32::from_be_bytes([l0, l1, l2, l3])) / f64::from(u32::MAX);

            log::trace!(
                "Got TFRC feedback last_sent_ts: {ts} delay: {delay} receive_rate: {receive_rate} \
                 loss_event_rate: {loss_event_rate}"
            );

            if !self.sending {
                continue;
            }

            let now = self.micros(now);
            let initial_rate = self.send_bitrate / 8;
            let src = self.remote_source(sender_ssrc);

            if src.sender.is_none() {
                src.add_sender(now, initial_rate);
            }

            // Only use the RTT of the most recent reports
            if ts < src.fb_last_ts {
                if src.fb_ts_cycles + ONE_32BIT_CYCLE == src.send_ts_cycles {
                    src.fb_ts_cycles = src.send_ts_cycles;
                } else {
                    log::debug!("Ignoring TFRC feedback with older timestamp, probably reordered");
                    continue;
                }
            }

            src.fb_last_ts = ts;
            let ts = ts + src.fb_ts_cycles + src.send_ts_base;

            if ts > now || now - ts < delay {
                log::warn!("Ignoring TFRC feedback from the future (ts: {ts} now: {now} delay: {delay})");
                continue;
            }

            let rtt = (now - ts - delay).max(1);

            if rtt > MAX_RTT {
                log::warn!("Impossible RTT {rtt}us, ignoring");
                continue;
            }

            let Some(sender) = &mut src.sender else {
                continue;
            };

            if sender.averaged_rtt() == 0 {
                sender.on_first_rtt(now);
            }

            let is_data_limited = src.idl.received_feedback(now, ts, sender.averaged_rtt());

            sender.on_feedback(now, rtt, receive_rate, loss_event_rate, is_data_limited);

            self.last_src = Some(SourceRef::Remote(sender_ssrc));

            changed |= self.update_bitrate("fb");
        }

        changed
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        let mut deadline: Option<u64> = None;

        for src in self.sources.values().chain(self.initial.as_ref()) {
            if self.sending
                && let Some(sender) = &src.sender
            {
                deadline = crate::opt_min(deadline, Some(sender.no_feedback_timer_expiry()));
            }

            if let Some(receiver) = &src.receiver
                && receiver.feedback_timer_expiry() != 0
            {
                deadline = crate::opt_min(deadline, Some(receiver.feedback_timer_expiry()));
            }
        }

        deadline.map(|deadline| self.instant(deadline).saturating_duration_since(now))
    }

    pub(crate) fn poll(&mut self, local_ssrc: u32, now: Instant) -> RateControlOutput {
        let now = self.micros(now);
        let mut output = RateControlOutput::default();
        let mut sender_expired = false;

        for (ssrc, src) in self.sources.iter_mut() {
            if self.sending
                && let Some(sender) = &mut src.sender
                && sender.no_feedback_timer_expiry() <= now
            {
                sender.no_feedback_timer_expired(now);
                sender_expired = true;
            }

            let Some(receiver) = &mut src.receiver else {
                continue;
            };

            let expiry = receiver.feedback_timer_expiry();

            if expiry != 0 && expiry <= now && receiver.feedback_timer_expired(now) {
                src.send_feedback = true;

                if let Some(packet) = build_feedback(src, *ssrc, local_ssrc, now) {
                    output.feedback.push(packet);
                }
            }
        }

        if self.sending
            && let Some(sender) = self.initial.as_mut().and_then(|src| src.sender.as_mut())
            && sender.no_feedback_timer_expiry() <= now
        {
            sender.no_feedback_timer_expired(now);
            sender_expired = true;
        }

        if sender_expired {
            output.bitrate_changed = self.update_bitrate("tm");
        }

        output
    }
}

/// Build the feedback report for `src` if one is due
fn build_feedback(src: &mut TrackedSource, media_ssrc: u32, local_ssrc: u32, now: u64) -> Option<Bytes> {
    if src.got_nohdr_pkt || !src.send_feedback {
        return None;
    }

    let feedback = src.receiver.as_mut()?.send_feedback(now)?;
    src.send_feedback = false;

    let delay = u32::try_from(now.saturating_sub(src.last_now)).unwrap_or(u32::MAX);
    let loss = (feedback.loss_event_rate.clamp(0.0, 1.0) * f64::from(u32::MAX)) as u32;

    let mut fci = [0u8; 16];
    fci[0..4].copy_from_slice(&src.last_ts.to_be_bytes());
    fci[4..8].copy_from_slice(&delay.to_be_bytes());
    fci[8..12].copy_from_slice(&feedback.receive_rate.to_be_bytes());
    fci[12..16].copy_from_slice(&loss.to_be_bytes());

    log::trace!("Sending TFRC feedback to {media_ssrc:#010x}: {feedback:?}");

    Some(rtcp::feedback(rtcp::PT_RTPFB, rtcp::FMT_TFRC, local_ssrc, media_ssrc, &fci))
}

pub(crate) fn has_key_request_feedback(codec: &Codec) -> bool {
    codec.feedback("nack", "pli").is_some()
}

/// Keep TFRC feedback and the RTT & send timestamp extension only if both have been negotiated
///
/// The extension is dropped if duplicated or if no codec valid for sending has `tfrc` feedback. Without a
/// bidirectional extension the `tfrc` feedback parameter is removed from all codecs.
pub(crate) fn filter_codecs(associations: &mut [CodecAssociation], extensions: &mut Vec<RtpHeaderExtension>) {
    let has_codec_feedback = associations
        .iter()
        .any(|ca| ca.is_valid_for_sending(true) && ca.codec.feedback(TFRC, "").is_some());

    let mut has_extension = false;

    extensions.retain(|ext| {
        if !ext.uri.eq_ignore_ascii_case(RTT_SENDTS_URI) {
            return true;
        }

        if has_extension || !has_codec_feedback {
            log::warn!("Removing {RTT_SENDTS_URI} extension, no tfrc feedback negotiated or duplicated");
            return false;
        }

        if ext.direction == Direction::BOTH {
            has_extension = true;
        }

        true
    });

    if !has_codec_feedback || has_extension {
        return;
    }

    for ca in associations {
        if ca.codec.feedback(TFRC, "").is_some() {
            log::warn!("Removing tfrc feedback from {}, {RTT_SENDTS_URI} was not negotiated", ca.codec);

            ca.codec.remove_feedback(TFRC, "");
        }
    }
}
