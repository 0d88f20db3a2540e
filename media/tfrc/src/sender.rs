use crate::{
    DEFAULT_MSS, MAX_RTT, MIN_NOFEEDBACK_TIMER, SECOND, calculate_bitrate, compute_initial_rate,
};

const RECEIVE_RATE_HISTORY_SIZE: usize = 4;

/// Per packet header size assumed by the small-packet variant (RFC 4828 section 3)
const HEADER_SIZE: u64 = 40;

/// Maximum backoff interval in seconds
const T_MBI: u32 = 64;

#[derive(Debug, Default, Clone, Copy)]
struct ReceiveRateItem {
    timestamp: u64,
    rate: u32,
}

/// TFRC sender state (RFC 5348 section 4)
#[derive(Debug)]
pub struct TfrcSender {
    /// Rate computed from the TCP throughput equation
    computed_rate: u32,

    /// Use the small-packet variant
    sp: bool,
    /// Average packet size, scaled by 16
    average_packet_size: u32,
    /// Report `inst_rate` instead of `rate`
    use_inst_rate: bool,

    mss: u32,
    /// Maximum allowed sending rate
    rate: u32,
    /// Allowed sending rate corrected by the instantaneous RTT
    inst_rate: u32,
    averaged_rtt: u64,
    sqmean_rtt: u64,
    last_sqrt_rtt: u64,
    /// Time last doubled during slow start
    tld: u64,

    nofeedback_timer_expiry: u64,
    retransmission_timeout: u64,

    receive_rate_history: [ReceiveRateItem; RECEIVE_RATE_HISTORY_SIZE],

    last_loss_event_rate: f64,

    sent_packet: bool,
}

impl TfrcSender {
    /// Create a new sender as described in RFC 5348 section 4.2
    ///
    /// `initial_rate` of 0 starts at one segment per second.
    pub fn new(segment_size: u32, now: u64, initial_rate: u32) -> Self {
        let retransmission_timeout = 2 * SECOND;

        Self {
            computed_rate: 0,
            sp: false,
            average_packet_size: segment_size << 4,
            use_inst_rate: true,
            mss: DEFAULT_MSS,
            rate: if initial_rate != 0 {
                initial_rate
            } else {
                segment_size
            },
            inst_rate: 0,
            averaged_rtt: 0,
            sqmean_rtt: 0,
            last_sqrt_rtt: 0,
            tld: 0,
            nofeedback_timer_expiry: now + retransmission_timeout,
            retransmission_timeout,
            receive_rate_history: Default::default(),
            last_loss_event_rate: 0.0,
            sent_packet: false,
        }
    }

    /// Create a new sender using the small-packet variant (RFC 4828)
    pub fn new_sp(now: u64, initial_average_packet_size: u32) -> Self {
        let mut sender = Self::new(DEFAULT_MSS, now, 0);
        sender.sp = true;
        sender.average_packet_size = initial_average_packet_size << 4;
        sender
    }

    pub fn set_use_inst_rate(&mut self, use_inst_rate: bool) {
        self.use_inst_rate = use_inst_rate;
    }

    fn segment_size(&self) -> u32 {
        if self.sp {
            self.mss
        } else {
            self.average_packet_size >> 4
        }
    }

    fn min_rate(&self) -> u32 {
        self.segment_size() / T_MBI
    }

    /// Must be called when the first RTT sample is available, before the first [`on_feedback`](Self::on_feedback)
    pub fn on_first_rtt(&mut self, now: u64) {
        self.receive_rate_history[0] = ReceiveRateItem {
            timestamp: now,
            rate: u32::MAX,
        };
    }

    fn max_receive_rate(&self, ignore_max: bool) -> u32 {
        let mut max_rate = 0;

        for item in &self.receive_rate_history {
            if item.rate == u32::MAX {
                return if ignore_max { max_rate } else { u32::MAX };
            }

            max_rate = max_rate.max(item.rate);
        }

        max_rate
    }

    fn add_to_receive_rate_history(&mut self, receive_rate: u32, now: u64) {
        self.receive_rate_history.copy_within(0..RECEIVE_RATE_HISTORY_SIZE - 1, 1);
        self.receive_rate_history[0] = ReceiveRateItem {
            timestamp: now,
            rate: receive_rate,
        };
    }

    fn maximize_receive_rate_history(&mut self, receive_rate: u32, now: u64) -> u32 {
        self.add_to_receive_rate_history(receive_rate, now);

        let max_rate = self.max_receive_rate(true);

        log::trace!("maximize receive rate history recv={receive_rate} max={max_rate}");

        self.receive_rate_history = Default::default();
        self.receive_rate_history[0] = ReceiveRateItem {
            timestamp: now,
            rate: max_rate,
        };

        max_rate
    }

    fn update_receive_rate_history(&mut self, receive_rate: u32, now: u64) {
        self.add_to_receive_rate_history(receive_rate, now);

        let expired = now.saturating_sub(2 * self.averaged_rtt);

        for item in &mut self.receive_rate_history[1..] {
            if item.rate != 0 && item.timestamp < expired {
                item.rate = 0;
            }
        }
    }

    /// RFC 5348 section 4.3 step 4, second part
    fn recompute_sending_rate(&mut self, recv_limit: u32, loss_event_rate: f64, now: u64) {
        if loss_event_rate > 0.0 {
            // congestion avoidance phase
            self.computed_rate = calculate_bitrate(
                f64::from(self.segment_size()),
                self.averaged_rtt as f64,
                loss_event_rate,
            ) as u32;
            self.rate = self.computed_rate.min(recv_limit).max(self.min_rate());

            log::trace!(
                "congestion avoidance rate={} computed={}",
                self.rate,
                self.computed_rate
            );
        } else if now.saturating_sub(self.tld) >= self.averaged_rtt {
            // initial slow start
            self.rate = self
                .rate
                .saturating_mul(2)
                .min(recv_limit)
                .max(compute_initial_rate(self.mss, self.averaged_rtt));
            self.tld = now;

            log::trace!("slow start rate={}", self.rate);
        }
    }

    /// RFC 5348 section 4.5
    fn update_inst_rate(&mut self) {
        if self.last_sqrt_rtt == 0 {
            return;
        }

        if self.sqmean_rtt != 0 {
            self.sqmean_rtt = (0.9 * self.sqmean_rtt as f64) as u64 + self.last_sqrt_rtt / 10;
        } else {
            self.sqmean_rtt = self.last_sqrt_rtt;
        }

        let inst_rate = u64::from(self.rate) * self.sqmean_rtt / self.last_sqrt_rtt;

        self.inst_rate = u32::try_from(inst_rate)
            .unwrap_or(u32::MAX)
            .max(self.min_rate());
    }

    fn timer_interval(&self) -> u64 {
        let transmit_time = SECOND * 2 * u64::from(self.segment_size()) / u64::from(self.rate.max(1));

        (4 * self.averaged_rtt)
            .max(transmit_time)
            .max(MIN_NOFEEDBACK_TIMER)
    }

    /// Process a feedback report (RFC 5348 section 4.3)
    ///
    /// `rtt` must be in `1..=10s`, reports outside this range are ignored.
    pub fn on_feedback(
        &mut self,
        now: u64,
        rtt: u64,
        receive_rate: u32,
        loss_event_rate: f64,
        is_data_limited: bool,
    ) {
        if rtt == 0 || rtt > MAX_RTT {
            log::warn!("ignoring TFRC feedback with out of range rtt={rtt}");
            return;
        }

        // First feedback, set the rate from the MSS and RTT
        if self.tld == 0 {
            self.rate = compute_initial_rate(self.mss, rtt);
            self.tld = now;

            log::trace!("initial rate={}", self.rate);
        }

        // Step 2: update the RTT
        if self.averaged_rtt == 0 {
            self.averaged_rtt = rtt;
        } else {
            self.averaged_rtt = (self.averaged_rtt * 9 + rtt) / 10;
        }

        self.averaged_rtt = self.averaged_rtt.max(1);

        // Step 3: update the timeout interval
        self.retransmission_timeout = self.timer_interval();

        // Step 4: update the allowed sending rate
        let recv_limit = if is_data_limited {
            if loss_event_rate > self.last_loss_event_rate {
                // New loss event or an increase of the loss event rate
                for item in &mut self.receive_rate_history {
                    item.rate /= 2;
                }

                let receive_rate = (f64::from(receive_rate) * 0.85) as u32;

                self.maximize_receive_rate_history(receive_rate, now)
            } else {
                self.maximize_receive_rate_history(receive_rate, now)
                    .saturating_mul(2)
            }
        } else {
            self.update_receive_rate_history(receive_rate, now);

            let max = self.max_receive_rate(false);

            if max < u32::MAX / 2 {
                max * 2
            } else {
                u32::MAX
            }
        };

        log::trace!("feedback data_limited={is_data_limited} recv_limit={recv_limit}");

        self.recompute_sending_rate(recv_limit, loss_event_rate, now);

        // Step 5: update the instantaneous transmit rate
        self.last_sqrt_rtt = (rtt as f64).sqrt() as u64;
        self.update_inst_rate();

        // Step 6: reset the no feedback timer
        self.nofeedback_timer_expiry = now + self.retransmission_timeout;
        self.sent_packet = false;

        self.last_loss_event_rate = loss_event_rate;
    }

    fn update_limits(&mut self, timer_limit: u32, now: u64) {
        let timer_limit = timer_limit.max(self.min_rate());

        self.receive_rate_history = Default::default();
        self.receive_rate_history[0] = ReceiveRateItem {
            timestamp: now,
            rate: timer_limit / 2,
        };

        self.recompute_sending_rate(timer_limit, self.last_loss_event_rate, now);
    }

    /// The no feedback timer expired (RFC 5348 section 4.4)
    pub fn no_feedback_timer_expired(&mut self, now: u64) {
        let receive_rate = self.max_receive_rate(false);
        let recover_rate = compute_initial_rate(self.mss, self.averaged_rtt);

        if self.averaged_rtt == 0 && self.sent_packet {
            // No RTT yet, halve the allowed rate
            self.rate = (self.rate / 2).max(self.min_rate());
            self.update_inst_rate();

            log::trace!("no feedback, no rtt, rate={}", self.rate);
        } else if ((self.last_loss_event_rate > 0.0 && receive_rate < recover_rate)
            || (self.last_loss_event_rate == 0.0 && self.rate < recover_rate.saturating_mul(2)))
            && !self.sent_packet
        {
            // Idle, do not halve the rate
            log::trace!("no feedback, idle recv={receive_rate} recover={recover_rate}");
        } else if self.last_loss_event_rate == 0.0 {
            // No loss yet, halve the allowed rate
            self.rate = (self.rate / 2).max(self.min_rate());
            self.update_inst_rate();

            log::trace!("no feedback, no loss, rate={}", self.rate);
        } else if self.computed_rate / 2 > receive_rate {
            // 2 * X_recv was already limiting the sending rate
            self.update_limits(receive_rate, now);
        } else {
            self.update_limits(self.computed_rate / 2, now);
        }

        debug_assert!(self.rate != 0 || self.min_rate() == 0);

        self.nofeedback_timer_expiry = now + self.timer_interval();
        self.sent_packet = false;
    }

    /// Record a packet of `size` bytes which is being sent
    pub fn sending_packet(&mut self, size: u32) {
        // avg = size + (avg * 15 / 16), the average is scaled by 16
        self.average_packet_size = size.saturating_add((15 * self.average_packet_size) >> 4);
        self.sent_packet = true;
    }

    /// The current allowed sending rate in bytes per second
    pub fn send_rate(&self) -> u32 {
        let rate = if self.use_inst_rate && self.inst_rate != 0 {
            self.inst_rate
        } else {
            self.rate
        };

        if self.sp {
            let avg = u64::from(self.average_packet_size >> 4);
            u32::try_from(u64::from(rate) * avg / (avg + HEADER_SIZE)).unwrap_or(u32::MAX)
        } else {
            rate
        }
    }

    pub fn no_feedback_timer_expiry(&self) -> u64 {
        self.nofeedback_timer_expiry
    }

    pub fn averaged_rtt(&self) -> u64 {
        self.averaged_rtt
    }

    pub fn retransmission_timeout(&self) -> u64 {
        self.retransmission_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTT: u64 = 100_000;

    #[test]
    fn initial_state() {
        let sender = TfrcSender::new(1460, 0, 0);

        assert_eq!(sender.send_rate(), 1460);
        assert_eq!(sender.no_feedback_timer_expiry(), 2 * SECOND);
        assert_eq!(sender.averaged_rtt(), 0);

        let sender = TfrcSender::new(1460, 0, 20_000);
        assert_eq!(sender.send_rate(), 20_000);
    }

    #[test]
    fn first_feedback_sets_initial_rate() {
        let mut sender = TfrcSender::new(1460, 0, 0);
        let now = SECOND;

        sender.on_first_rtt(now);
        sender.on_feedback(now, RTT, 100_000, 0.0, false);

        assert_eq!(sender.send_rate(), compute_initial_rate(1460, RTT));
        assert_eq!(sender.averaged_rtt(), RTT);
        // max(4 * rtt, 2 * 1460 / 43800 s, 20ms)
        assert_eq!(sender.no_feedback_timer_expiry(), now + 4 * RTT);
    }

    #[test]
    fn slow_start_doubles_per_rtt() {
        let mut sender = TfrcSender::new(1460, 0, 0);
        sender.set_use_inst_rate(false);
        let mut now = SECOND;

        sender.on_first_rtt(now);
        sender.on_feedback(now, RTT, 1_000_000, 0.0, false);
        let initial = sender.send_rate();

        now += RTT;
        sender.on_feedback(now, RTT, 1_000_000, 0.0, false);

        assert_eq!(sender.send_rate(), initial * 2);
    }

    #[test]
    fn slow_start_is_limited_by_receive_rate() {
        let mut sender = TfrcSender::new(1460, 0, 0);
        sender.set_use_inst_rate(false);
        let mut now = SECOND;

        sender.on_first_rtt(now);
        sender.on_feedback(now, RTT, 30_000, 0.0, false);

        for _ in 0..10 {
            now += RTT;
            sender.on_feedback(now, RTT, 30_000, 0.0, false);
        }

        // 2 * receive rate, but never below the initial rate
        assert_eq!(sender.send_rate(), 60_000);
    }

    #[test]
    fn loss_enters_congestion_avoidance() {
        let mut sender = TfrcSender::new(1460, 0, 0);
        sender.set_use_inst_rate(false);
        let mut now = SECOND;

        sender.on_first_rtt(now);
        sender.on_feedback(now, RTT, 1_000_000, 0.0, false);

        now += RTT;
        sender.on_feedback(now, RTT, 1_000_000, 0.01, false);

        let expected = calculate_bitrate(1460.0, RTT as f64, 0.01) as u32;
        assert_eq!(sender.send_rate(), expected);
    }

    #[test]
    fn rate_never_drops_below_minimum() {
        let mut sender = TfrcSender::new(1460, 0, 0);
        let mut now = SECOND;

        sender.on_first_rtt(now);
        sender.on_feedback(now, RTT, 100_000, 0.0, false);
        sender.sending_packet(1460);

        for _ in 0..200 {
            now = sender.no_feedback_timer_expiry();
            sender.sending_packet(1460);
            sender.no_feedback_timer_expired(now);

            assert!(sender.send_rate() >= 1460 / 64);
        }

        assert_eq!(sender.send_rate(), 1460 / 64);
    }

    #[test]
    fn idle_sender_keeps_rate_on_timeout() {
        let mut sender = TfrcSender::new(1460, 0, 0);
        let now = SECOND;

        sender.on_first_rtt(now);
        sender.on_feedback(now, RTT, 100_000, 0.0, false);
        let rate = sender.send_rate();

        // No packet was sent since the last feedback and the rate is below 2 * recover rate
        sender.no_feedback_timer_expired(sender.no_feedback_timer_expiry());

        assert_eq!(sender.send_rate(), rate);
    }

    #[test]
    fn no_rtt_halves_rate_if_sending() {
        let mut sender = TfrcSender::new(1460, 0, 10_000);
        sender.sending_packet(1460);
        sender.no_feedback_timer_expired(2 * SECOND);

        assert_eq!(sender.send_rate(), 5_000);
        assert_eq!(sender.no_feedback_timer_expiry(), 2 * SECOND + 2 * SECOND * 1460 / 5_000);
    }

    #[test]
    fn data_limited_with_new_loss_reduces_limit() {
        let mut sender = TfrcSender::new(1460, 0, 0);
        let mut now = SECOND;

        sender.on_first_rtt(now);
        sender.on_feedback(now, RTT, 200_000, 0.0, false);

        now += RTT;
        sender.on_feedback(now, RTT, 200_000, 0.05, true);

        // the receive rate limit is 0.85 * receive rate
        assert!(sender.send_rate() <= 170_000);
        assert!(sender.send_rate() >= 1460 / 64);
    }

    #[test]
    fn out_of_range_rtt_is_ignored() {
        let mut sender = TfrcSender::new(1460, 0, 0);

        sender.on_feedback(SECOND, 0, 100_000, 0.0, false);
        sender.on_feedback(SECOND, 11 * SECOND, 100_000, 0.0, false);

        assert_eq!(sender.averaged_rtt(), 0);
        assert_eq!(sender.send_rate(), 1460);
    }

    #[test]
    fn small_packet_variant_accounts_headers() {
        let mut sender = TfrcSender::new_sp(0, 160);
        sender.set_use_inst_rate(false);

        // rate = 1460 (initial) scaled by 160 / (160 + 40)
        assert_eq!(sender.send_rate(), 1460 * 160 / 200);
    }
}
