/// Detects data-limited intervals on the sender side (RFC 5348 section 8.2.1)
///
/// An interval covered by a feedback report counts as data-limited unless one of the two
/// "not limited" marks falls inside it. With both marks still at their initial value of 0
/// every interval is reported as data-limited.
#[derive(Debug, Default, Clone)]
pub struct IsDataLimited {
    not_limited_1: u64,
    not_limited_2: u64,
    t_new: u64,
    t_next: u64,
}

impl IsDataLimited {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sender is not data limited at this instant
    pub fn not_limited_now(&mut self, now: u64) {
        if self.not_limited_1 <= self.t_new {
            // Goal: not_limited_1 > t_new
            self.not_limited_1 = now;
        } else if self.not_limited_2 <= self.t_next {
            // Goal: not_limited_2 > t_next
            self.not_limited_2 = now;
        }
    }

    /// A feedback report was received, `last_packet_timestamp` is the send timestamp of the
    /// last packet it covers.
    ///
    /// Returns if the interval since the previous report was data limited.
    pub fn received_feedback(&mut self, now: u64, last_packet_timestamp: u64, rtt: u64) -> bool {
        self.t_new = last_packet_timestamp;
        let t_old = self.t_new.saturating_sub(rtt);
        self.t_next = now;

        let inside = |mark: u64| t_old < mark && mark <= self.t_new;

        let data_limited = !(inside(self.not_limited_1) || inside(self.not_limited_2));

        if self.not_limited_1 <= self.t_new && self.not_limited_2 > self.t_new {
            self.not_limited_1 = self.not_limited_2;
        }

        data_limited
    }
}
