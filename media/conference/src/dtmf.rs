//! # Telephony event queue
//!
//! Start and stop requests are queued and handed to the special sources one at a time. An event is first offered as
//! RFC 4733 RTP event, a source that can't produce it leads to a retry as in-band tone. The sources report back with
//! [`DtmfMessage`]s, only a message matching the oldest queued event completes it.

use crate::special_source::SpecialSourceKind;
use std::collections::VecDeque;

/// How a telephony event is transmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfMethod {
    /// RTP events (RFC 4733) using the `telephone-event` codec
    RtpEvent = 1,
    /// In-band audio tone encoded with the send codec
    Sound = 2,
}

/// A queued start or stop request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtmfEvent {
    pub start: bool,
    /// Event number as registered by IANA, only meaningful for starts
    pub number: u8,
    /// Volume in dBm0 without the sign, only meaningful for starts
    pub volume: u8,
    pub method: DtmfMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfMessageKind {
    Processed,
    Dropped,
}

/// Report of a special source about an event it was handed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtmfMessage {
    pub kind: DtmfMessageKind,
    pub source: SpecialSourceKind,
    pub start: bool,
    pub method: DtmfMethod,
    pub number: u8,
    pub volume: u8,
}

impl DtmfMessage {
    pub fn processed(source: SpecialSourceKind, event: &DtmfEvent) -> Self {
        Self::from_event(DtmfMessageKind::Processed, source, event)
    }

    pub fn dropped(source: SpecialSourceKind, event: &DtmfEvent) -> Self {
        Self::from_event(DtmfMessageKind::Dropped, source, event)
    }

    fn from_event(kind: DtmfMessageKind, source: SpecialSourceKind, event: &DtmfEvent) -> Self {
        Self {
            kind,
            source,
            start: event.start,
            method: event.method,
            number: event.number,
            volume: event.volume,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DtmfNotification {
    Started { method: DtmfMethod, number: u8, volume: u8 },
    Stopped { method: DtmfMethod },
}

#[derive(Debug, Default)]
pub(crate) struct DtmfQueue {
    /// Oldest event at the front
    events: VecDeque<DtmfEvent>,
    /// The front event has been handed to a source and awaits its report
    running: bool,
    /// Source which reported the last processed start
    running_source: Option<SpecialSourceKind>,
    last_accepted_start: bool,
    /// The start of the next stop has been discarded
    skip_stop: bool,
}

impl DtmfQueue {
    pub(crate) fn start(&mut self, number: u8, volume: u8) -> bool {
        if self.last_accepted_start {
            log::warn!("Tried to start a telephony event without stopping the previous one");
            return false;
        }

        log::debug!("Queueing telephony event {number}");

        self.events.push_back(DtmfEvent {
            start: true,
            number,
            volume,
            method: DtmfMethod::RtpEvent,
        });
        self.last_accepted_start = true;

        true
    }

    pub(crate) fn stop(&mut self) -> bool {
        if !self.last_accepted_start {
            log::warn!("Tried to stop a telephony event without starting one first");
            return false;
        }

        self.last_accepted_start = false;

        if self.skip_stop {
            log::debug!("Discarding stop of a telephony event that was never sent");
            self.skip_stop = false;
            return true;
        }

        log::debug!("Queueing telephony event stop");

        self.events.push_back(DtmfEvent {
            start: false,
            number: 0,
            volume: 0,
            method: DtmfMethod::RtpEvent,
        });

        true
    }

    /// Take the next event to hand to the sources, `None` while another one is in flight
    pub(crate) fn next_event(&mut self) -> Option<DtmfEvent> {
        if self.running {
            return None;
        }

        let event = self.events.front()?.clone();
        self.running = true;

        Some(event)
    }

    /// Switch the in-flight start event to in-band tones, `None` if there is nothing left to try
    pub(crate) fn fallback(&mut self) -> Option<DtmfEvent> {
        let event = self.events.front_mut()?;

        if !event.start || event.method != DtmfMethod::RtpEvent {
            return None;
        }

        event.method = DtmfMethod::Sound;

        Some(event.clone())
    }

    /// No source accepted the in-flight event
    pub(crate) fn send_failed(&mut self) {
        self.running = false;

        if let Some(event) = self.events.front() {
            log::warn!(
                "No source could send telephony event {} ({}), discarding it",
                event.number,
                if event.start { "start" } else { "stop" }
            );

            self.discard_front();
        }
    }

    fn discard_front(&mut self) {
        let Some(event) = self.events.pop_front() else {
            return;
        };

        if !event.start {
            return;
        }

        if self.events.front().is_some_and(|next| !next.start) {
            self.events.pop_front();
        } else {
            self.skip_stop = true;
        }
    }

    pub(crate) fn handle_message(&mut self, message: &DtmfMessage) -> Option<DtmfNotification> {
        let Some(event) = self.events.front_mut() else {
            log::debug!("Ignoring telephony event message, nothing is queued");
            return None;
        };

        let matching = (!message.start && !event.start)
            || (message.start == event.start
                && message.method == event.method
                && message.number == event.number);

        match message.kind {
            DtmfMessageKind::Processed => {
                if !matching {
                    log::warn!("Got processed telephony event that doesn't match the running one, ignoring");
                    return None;
                }

                if message.start {
                    if let Some(running_source) = self.running_source {
                        log::warn!(
                            "Got a second start from {}",
                            if running_source == message.source {
                                "the same source"
                            } else {
                                "a different source"
                            }
                        );
                    }

                    self.running_source = Some(message.source);
                } else if let Some(running_source) = self.running_source {
                    if running_source != message.source {
                        log::debug!("Received stop from another source, ignoring");
                        return None;
                    }

                    self.running_source = None;
                }

                self.events.pop_front();
                self.running = false;

                log::debug!(
                    "Got processed telephony event {} for {}",
                    if message.start { "start" } else { "stop" },
                    message.number
                );

                if message.start {
                    Some(DtmfNotification::Started {
                        method: message.method,
                        number: message.number,
                        volume: message.volume,
                    })
                } else {
                    Some(DtmfNotification::Stopped {
                        method: message.method,
                    })
                }
            }
            DtmfMessageKind::Dropped => {
                if !message.start && !event.start {
                    if self.running_source == Some(message.source) {
                        self.running_source = None;
                    }

                    self.events.pop_front();
                    self.running = false;

                    Some(DtmfNotification::Stopped {
                        method: message.method,
                    })
                } else if matching {
                    self.running = false;

                    if event.method == DtmfMethod::RtpEvent {
                        log::debug!("Telephony event {} dropped, retrying as sound", event.number);
                        event.method = DtmfMethod::Sound;
                    } else {
                        log::warn!("Telephony event {} dropped by all sources", event.number);
                        self.discard_front();
                    }

                    None
                } else {
                    log::warn!("Got dropped telephony event that doesn't match the running one");
                    None
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}
