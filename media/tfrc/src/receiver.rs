use crate::{SECOND, equation::compute_first_loss_interval, scale_round};
use std::collections::VecDeque;

/// Number of packets to receive after a loss before declaring the loss event
const NDUPACK: u64 = 3;
const LOSS_EVENTS_MAX: usize = 9;
const LOSS_INTERVALS_MAX: usize = 8;
const MAX_HISTORY_SIZE: usize = LOSS_EVENTS_MAX * 2;
const MIN_HISTORY_DURATION: u64 = 10;

const WEIGHTS: [f64; LOSS_INTERVALS_MAX] = [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];

/// Range of consecutively received packets
#[derive(Debug, Clone, Copy)]
struct ReceivedInterval {
    first_timestamp: u64,
    first_seqnum: u64,
    first_recvtime: u64,

    last_timestamp: u64,
    last_seqnum: u64,
    last_recvtime: u64,
}

impl ReceivedInterval {
    fn new(timestamp: u64, seqnum: u64, now: u64) -> Self {
        Self {
            first_timestamp: timestamp,
            first_seqnum: seqnum,
            first_recvtime: now,
            last_timestamp: timestamp,
            last_seqnum: seqnum,
            last_recvtime: now,
        }
    }
}

/// Feedback report values produced by [`TfrcReceiver::send_feedback`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    /// Loss event rate in `0.0..=1.0`
    pub loss_event_rate: f64,
    /// Receive rate in bytes per second
    pub receive_rate: u32,
}

/// TFRC receiver state (RFC 5348 section 6)
#[derive(Debug)]
pub struct TfrcReceiver {
    received_intervals: VecDeque<ReceivedInterval>,

    sp: bool,

    sender_rtt: u64,
    receive_rate: u32,
    max_receive_rate: u32,
    max_receive_rate_ss: u32,
    feedback_timer_expiry: u64,

    first_loss_interval: u64,

    loss_event_rate: f64,

    feedback_sent_on_last_timer: bool,

    received_bytes: u64,
    prev_received_bytes: u64,
    received_bytes_reset_time: u64,
    prev_received_bytes_reset_time: u64,
    received_packets: u64,
    prev_received_packets: u64,
    sender_rtt_on_last_feedback: u64,
}

/// A loss event as found while walking the gaps between received intervals
#[derive(Debug, Default, Clone, Copy)]
struct LossEvent {
    timestamp: u64,
    seqnum: u64,
    pktcount: u64,
}

impl TfrcReceiver {
    pub fn new(now: u64) -> Self {
        Self {
            received_intervals: VecDeque::new(),
            sp: false,
            sender_rtt: 0,
            receive_rate: 0,
            max_receive_rate: 0,
            max_receive_rate_ss: 0,
            feedback_timer_expiry: 0,
            first_loss_interval: 0,
            loss_event_rate: 0.0,
            feedback_sent_on_last_timer: false,
            received_bytes: 0,
            prev_received_bytes: 0,
            received_bytes_reset_time: now,
            prev_received_bytes_reset_time: now,
            received_packets: 0,
            prev_received_packets: 0,
            sender_rtt_on_last_feedback: 0,
        }
    }

    /// Create a receiver using the small-packet variant (RFC 4828)
    pub fn new_sp(now: u64) -> Self {
        Self {
            sp: true,
            ..Self::new(now)
        }
    }

    /// Walk the gaps between received intervals and compute the loss event rate (RFC 5348 section 5)
    fn calculate_loss_event_rate(&mut self, now: u64) -> f64 {
        let rtt = self.sender_rtt;

        if rtt == 0 || self.received_intervals.len() < 2 {
            return 0.0;
        }

        let mut events = [LossEvent::default(); LOSS_EVENTS_MAX];
        // Index of the newest loss event, events are stored in a ring
        let mut max_index: i64 = -1;
        let mut max_seqnum = 0;

        let slot = |i: i64| (i.rem_euclid(LOSS_EVENTS_MAX as i64)) as usize;

        let intervals = self.received_intervals.make_contiguous();

        for pair in intervals.windows(2) {
            let (prev, current) = (&pair[0], &pair[1]);

            max_seqnum = current.last_seqnum;

            let seq_gap = current.first_seqnum - prev.last_seqnum;
            let ts_gap = current.first_timestamp.saturating_sub(prev.last_timestamp);

            // The loss is entirely within one RTT of the start of the last loss event, merge it
            if max_index >= 0 && current.first_timestamp < events[slot(max_index)].timestamp + rtt {
                events[slot(max_index)].pktcount += seq_gap;
                continue;
            }

            let (mut start_ts, mut start_seqnum);

            if max_index >= 0 && prev.last_timestamp < events[slot(max_index)].timestamp + rtt {
                // The previous loss event ends in the middle of this gap, close it and start a new one
                start_ts = events[slot(max_index)].timestamp + rtt;
                start_seqnum = prev.last_seqnum
                    + scale_round(seq_gap, start_ts - prev.last_timestamp, 1 + ts_gap);
                events[slot(max_index)].pktcount +=
                    start_seqnum.saturating_sub(prev.last_seqnum + 1);
            } else {
                // The gap starts an entirely new loss event
                start_ts = prev.last_timestamp + scale_round(1, ts_gap, seq_gap);
                start_seqnum = prev.last_seqnum + 1;
            }

            // One or more loss events start in this gap, all but the last one are one RTT long
            while start_ts <= current.first_timestamp {
                max_index += 1;
                let idx = slot(max_index);

                events[idx].timestamp = start_ts;
                events[idx].seqnum = start_seqnum;

                if ts_gap == 0 {
                    // No time passed during the gap, count all of it as a single event
                    events[idx].pktcount = current.first_seqnum - start_seqnum;
                    break;
                }

                start_ts += rtt;
                start_seqnum = prev.last_seqnum
                    + scale_round(seq_gap, start_ts - prev.last_timestamp, ts_gap);

                // Make sure the event has at least one packet in it
                if start_seqnum <= events[idx].seqnum {
                    start_seqnum = events[idx].seqnum + 1;
                    start_ts = prev.last_timestamp
                        + scale_round(ts_gap, start_seqnum - prev.last_seqnum, seq_gap);
                }

                if start_seqnum >= current.first_seqnum {
                    // The next event would start at a received packet
                    events[idx].pktcount = current.first_seqnum.saturating_sub(events[idx].seqnum);
                    break;
                }

                events[idx].pktcount = start_seqnum - events[idx].seqnum;
            }
        }

        if max_index < 0 || (max_index < 1 && self.max_receive_rate == 0) {
            return 0.0;
        }

        let mut loss_intervals = [0u64; LOSS_EVENTS_MAX];
        let newest = events[slot(max_index)];

        // RFC 5348 section 5.3: size of the loss events
        loss_intervals[0] = max_seqnum.saturating_sub(newest.seqnum) + 1;

        let mut max_interval = 1;
        let mut i = max_index - 1;

        while max_interval < LOSS_INTERVALS_MAX && i >= 0 && i > max_index - LOSS_EVENTS_MAX as i64 {
            let cur = events[slot(i)];
            let next = events[slot(i + 1)];

            // Small-packet variant: short loss events are divided by the number of lost packets,
            // RFC 4828 section 3
            loss_intervals[max_interval] =
                if self.sp && next.timestamp - cur.timestamp < 2 * rtt {
                    next.seqnum.saturating_sub(cur.seqnum) / cur.pktcount.max(1)
                } else {
                    next.seqnum.saturating_sub(cur.seqnum)
                };

            i -= 1;
            max_interval += 1;
        }

        // The first loss interval is still in use, RFC 5348 section 6.3.1
        if max_interval < LOSS_INTERVALS_MAX {
            if self.first_loss_interval == 0 {
                self.first_loss_interval = compute_first_loss_interval(
                    f64::from(self.max_receive_rate_ss),
                    rtt as f64,
                    f64::from(self.max_receive_rate),
                ) as u64;

                log::trace!(
                    "computed first loss interval {} (rtt={rtt} s={} rate={})",
                    self.first_loss_interval,
                    self.max_receive_rate_ss,
                    self.max_receive_rate
                );
            }

            loss_intervals[max_interval] = self.first_loss_interval;
            max_interval += 1;
        }

        // RFC 5348 section 5.4: average loss rate
        let mut i_tot1 = 0.0;
        let mut w_tot = 0.0;

        for i in 1..max_interval {
            i_tot1 += loss_intervals[i] as f64 * WEIGHTS[i - 1];
            w_tot += WEIGHTS[i - 1];
        }

        // RFC 4828 section 3: ignore the open interval while the current event is young
        let i_tot = if self.sp && now.saturating_sub(newest.timestamp) < 2 * rtt {
            i_tot1
        } else {
            let i_tot0: f64 = (0..max_interval - 1)
                .map(|i| loss_intervals[i] as f64 * WEIGHTS[i])
                .sum();

            i_tot0.max(i_tot1)
        };

        if i_tot <= 0.0 {
            return 0.0;
        }

        (w_tot / i_tot).min(1.0)
    }

    /// Record a received packet (RFC 5348 section 6.1)
    ///
    /// `seqnum` must be extended past 16 bit wraparounds by the caller. `sender_rtt` is the RTT
    /// reported by the sender, 0 until the sender knows it.
    ///
    /// Returns `true` if a feedback report should be sent now.
    pub fn got_packet(
        &mut self,
        timestamp: u64,
        now: u64,
        seqnum: u64,
        sender_rtt: u64,
        packet_size: u32,
    ) -> bool {
        let mut recalculate_loss_rate = false;
        let mut send_now = false;
        // Without an RTT all history is kept
        let mut history_too_short = sender_rtt == 0;

        self.received_bytes += u64::from(packet_size);
        self.received_packets += 1;

        if self.sender_rtt != 0 {
            self.sender_rtt = (0.9 * self.sender_rtt as f64) as u64 + sender_rtt / 10;
        } else {
            self.sender_rtt = sender_rtt;
        }

        // RFC 5348 section 6.3: first packet received
        if self.received_intervals.is_empty() || self.sender_rtt == 0 {
            if self.sender_rtt != 0 {
                self.feedback_timer_expiry = now + self.sender_rtt;
            }

            send_now = true;
        }

        // Step 1: add the packet to the history
        let mut current: Option<usize> = None;
        let mut prev: Option<usize> = None;
        let mut item = self.received_intervals.len().checked_sub(1);

        while let Some(idx) = item {
            current = Some(idx);
            prev = idx.checked_sub(1);

            let interval = self.received_intervals[idx];

            if seqnum == interval.last_seqnum + 1 {
                // Extend the interval forward
                let interval = &mut self.received_intervals[idx];
                interval.last_seqnum = seqnum;
                interval.last_timestamp = timestamp;
                interval.last_recvtime = now;
            } else if seqnum >= interval.first_seqnum && seqnum <= interval.last_seqnum {
                // Duplicate, ignore
            } else if seqnum > interval.last_seqnum + 1 {
                // Loss, start a new interval
                prev = Some(idx);
                self.received_intervals
                    .push_back(ReceivedInterval::new(timestamp, seqnum, now));
                current = Some(self.received_intervals.len() - 1);
            } else if seqnum + 1 == interval.first_seqnum {
                // Extend the interval backwards
                let interval = &mut self.received_intervals[idx];
                interval.first_seqnum = seqnum;
                interval.first_timestamp = timestamp;
                interval.first_recvtime = now;
            } else if seqnum < interval.first_seqnum
                && prev.is_none_or(|p| seqnum > self.received_intervals[p].last_seqnum + 1)
            {
                // Fills part of a gap, insert a new interval in the middle
                self.received_intervals
                    .insert(idx, ReceivedInterval::new(timestamp, seqnum, now));
                current = Some(idx);
                prev = idx.checked_sub(1);
            } else {
                item = idx.checked_sub(1);
                continue;
            }

            break;
        }

        if !history_too_short {
            history_too_short = match (
                self.received_intervals.back(),
                self.received_intervals.front(),
            ) {
                (Some(newest), Some(oldest)) => {
                    newest.last_timestamp.saturating_sub(oldest.first_timestamp)
                        < MIN_HISTORY_DURATION * self.sender_rtt
                }
                _ => true,
            };
        }

        let mut current = match current {
            Some(current) => current,
            None => {
                // First packet
                self.received_intervals
                    .push_front(ReceivedInterval::new(timestamp, seqnum, now));
                0
            }
        };

        if !history_too_short && self.received_intervals.len() > MAX_HISTORY_SIZE && current != 0
        {
            self.received_intervals.pop_front();
            current -= 1;
            prev = prev.and_then(|p| p.checked_sub(1));
        }

        let interval = self.received_intervals[current];

        if prev.is_some() && interval.last_seqnum - interval.first_seqnum == NDUPACK {
            recalculate_loss_rate = true;
        }

        if let Some(p) =
            prev.filter(|&p| self.received_intervals[p].last_seqnum + 1 == interval.first_seqnum)
        {
            // The gap closed, merge both intervals
            let removed = self.received_intervals[p];
            let interval = &mut self.received_intervals[current];
            interval.first_seqnum = removed.first_seqnum;
            interval.first_timestamp = removed.first_timestamp;
            interval.first_recvtime = removed.first_recvtime;

            self.received_intervals.remove(p);

            recalculate_loss_rate = true;
        }

        // Steps 2, 3 & 4: recalculate the loss event rate and possibly send feedback
        if self.sender_rtt != 0 && (recalculate_loss_rate || !self.feedback_sent_on_last_timer) {
            let new_loss_event_rate = self.calculate_loss_event_rate(now);

            if new_loss_event_rate > self.loss_event_rate || !self.feedback_sent_on_last_timer {
                send_now |= self.feedback_timer_expired(now);
            }
        }

        send_now
    }

    /// The feedback timer expired
    ///
    /// Returns `true` if a feedback report should be sent, otherwise the timer was rearmed.
    pub fn feedback_timer_expired(&mut self, now: u64) -> bool {
        if self.received_bytes == 0 || self.prev_received_bytes_reset_time == now {
            debug_assert!(self.sender_rtt != 0);
            self.feedback_timer_expiry = now + self.sender_rtt;
            self.feedback_sent_on_last_timer = false;
            false
        } else {
            true
        }
    }

    /// Compute the values of a feedback report and reset the receive rate measurement
    ///
    /// Returns `None` if a report was already produced at `now`.
    pub fn send_feedback(&mut self, now: u64) -> Option<Feedback> {
        if now == self.prev_received_bytes_reset_time {
            return None;
        }

        let (received_bytes, received_packets, received_bytes_reset_time);

        if now.saturating_sub(self.received_bytes_reset_time) > self.sender_rtt_on_last_feedback {
            self.prev_received_bytes_reset_time = self.received_bytes_reset_time;
            self.prev_received_bytes = self.received_bytes;
            self.prev_received_packets = self.received_packets;
            received_bytes = self.received_bytes;
            received_packets = self.received_packets;
            received_bytes_reset_time = self.received_bytes_reset_time;
        } else {
            self.prev_received_bytes += self.received_bytes;
            self.prev_received_packets += self.received_packets;
            received_bytes = self.prev_received_bytes;
            received_packets = self.prev_received_packets;
            received_bytes_reset_time = self.prev_received_bytes_reset_time;
        }

        self.received_bytes_reset_time = now;
        self.received_bytes = 0;
        self.received_packets = 0;

        let receive_rate = scale_round(
            SECOND,
            received_bytes,
            now.saturating_sub(received_bytes_reset_time),
        );
        self.receive_rate = u32::try_from(receive_rate).unwrap_or(u32::MAX);

        if self.sender_rtt_on_last_feedback != 0
            && self.receive_rate > self.max_receive_rate
            && received_packets != 0
        {
            self.max_receive_rate = self.receive_rate;
            self.max_receive_rate_ss =
                u32::try_from(received_bytes / received_packets).unwrap_or(u32::MAX);
        }

        self.loss_event_rate = self.calculate_loss_event_rate(now);

        if self.sender_rtt != 0 {
            self.feedback_timer_expiry = now + self.sender_rtt;
        }
        self.sender_rtt_on_last_feedback = self.sender_rtt;
        self.feedback_sent_on_last_timer = true;

        log::trace!(
            "feedback p={} receive_rate={}",
            self.loss_event_rate,
            self.receive_rate
        );

        Some(Feedback {
            loss_event_rate: self.loss_event_rate,
            receive_rate: self.receive_rate,
        })
    }

    /// Time at which the feedback timer expires, 0 while no RTT is known
    pub fn feedback_timer_expiry(&self) -> u64 {
        self.feedback_timer_expiry
    }

    /// The averaged RTT as reported by the sender
    pub fn sender_rtt(&self) -> u64 {
        self.sender_rtt
    }

    /// The loss event rate computed for the last feedback report
    pub fn loss_event_rate(&self) -> f64 {
        self.loss_event_rate
    }
}
