use ezk_tfrc::{SECOND, TfrcReceiver, TfrcSender};
use std::collections::VecDeque;

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy)]
struct Packet {
    seqnum: u64,
    timestamp: u64,
    size: u32,
}

/// One way link with a fixed delay, a bottleneck and a drop-tail queue
pub(crate) struct Link {
    delay: u64,
    capacity: u64,
    queue_limit: u64,
    busy_until: u64,
    in_flight: VecDeque<(u64, Packet)>,
    pub(crate) dropped: usize,
}

impl Link {
    pub(crate) fn new(delay: u64, capacity: u64, queue_limit: u64) -> Self {
        Self {
            delay,
            capacity,
            queue_limit,
            busy_until: 0,
            in_flight: VecDeque::new(),
            dropped: 0,
        }
    }

    fn send(&mut self, now: u64, packet: Packet) {
        let queued = self.busy_until.saturating_sub(now) * self.capacity / SECOND;

        if queued > self.queue_limit {
            self.dropped += 1;
            return;
        }

        let start = self.busy_until.max(now);
        self.busy_until = start + u64::from(packet.size) * SECOND / self.capacity;

        self.in_flight.push_back((self.busy_until + self.delay, packet));
    }

    fn receive(&mut self, now: u64) -> Option<Packet> {
        if self.in_flight.front()?.0 <= now {
            self.in_flight.pop_front().map(|(_, packet)| packet)
        } else {
            None
        }
    }
}

struct FeedbackReport {
    arrival: u64,
    loss_event_rate: f64,
    receive_rate: u32,
    last_timestamp: u64,
    hold_time: u64,
}

/// Sender and receiver connected by a [`Link`], feedback travels back without loss
pub(crate) struct Simulation {
    pub(crate) sender: TfrcSender,
    pub(crate) receiver: TfrcReceiver,
    pub(crate) link: Link,
    packet_size: u32,
    next_seqnum: u64,
    last_send: Option<u64>,
    got_first_rtt: bool,
    feedback: VecDeque<FeedbackReport>,
    last_timestamp: u64,
    last_arrival: u64,
    pub(crate) max_loss_event_rate: f64,
}

impl Simulation {
    pub(crate) fn new(link: Link, packet_size: u32) -> Self {
        Self {
            sender: TfrcSender::new(packet_size, 0, 0),
            receiver: TfrcReceiver::new(0),
            link,
            packet_size,
            next_seqnum: 0,
            last_send: None,
            got_first_rtt: false,
            feedback: VecDeque::new(),
            last_timestamp: 0,
            last_arrival: 0,
            max_loss_event_rate: 0.0,
        }
    }

    /// Advance the simulation by one millisecond
    pub(crate) fn step(&mut self, now: u64) {
        let mut want_feedback = false;

        while let Some(packet) = self.link.receive(now) {
            want_feedback |= self.receiver.got_packet(
                packet.timestamp,
                now,
                packet.seqnum,
                self.sender.averaged_rtt(),
                packet.size,
            );

            self.last_timestamp = packet.timestamp;
            self.last_arrival = now;
        }

        let expiry = self.receiver.feedback_timer_expiry();
        if expiry != 0 && now >= expiry {
            want_feedback |= self.receiver.feedback_timer_expired(now);
        }

        if want_feedback {
            if let Some(feedback) = self.receiver.send_feedback(now) {
                self.feedback.push_back(FeedbackReport {
                    arrival: now + self.link.delay,
                    loss_event_rate: feedback.loss_event_rate,
                    receive_rate: feedback.receive_rate,
                    last_timestamp: self.last_timestamp,
                    hold_time: now - self.last_arrival,
                });
            }
        }

        while self.feedback.front().is_some_and(|f| f.arrival <= now) {
            let Some(report) = self.feedback.pop_front() else {
                break;
            };

            if !self.got_first_rtt {
                self.sender.on_first_rtt(now);
                self.got_first_rtt = true;
            }

            self.max_loss_event_rate = self.max_loss_event_rate.max(report.loss_event_rate);

            let rtt = now - report.last_timestamp - report.hold_time;
            self.sender.on_feedback(
                now,
                rtt,
                report.receive_rate,
                report.loss_event_rate,
                false,
            );
        }

        if now >= self.sender.no_feedback_timer_expiry() {
            self.sender.no_feedback_timer_expired(now);
        }

        // Pace with the current rate so rate changes apply to the next packet
        let rate = u64::from(self.sender.send_rate().max(1));
        let interval = SECOND * u64::from(self.packet_size) / rate;

        if self.last_send.is_none_or(|last_send| now >= last_send + interval) {
            let packet = Packet {
                seqnum: self.next_seqnum,
                timestamp: now,
                size: self.packet_size,
            };
            self.next_seqnum += 1;

            self.sender.sending_packet(packet.size);
            self.link.send(now, packet);
            self.last_send = Some(now);
        }
    }
}
