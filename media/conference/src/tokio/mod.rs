use crate::{Conference, ConferenceEvent};
use std::{
    future::poll_fn,
    pin::{Pin, pin},
    task::Poll,
    time::Instant,
};
use tokio::time::{Sleep, sleep_until};

/// Drives the timers of a [`Conference`] on the tokio runtime
///
/// Companion type to be used alongside the conference, which stays usable from any thread while being driven.
#[derive(Default)]
pub struct ConferenceDriver {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ConferenceDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll the conference until an event is available
    ///
    /// This function is cancel safe.
    pub async fn poll_conference(&mut self, conference: &Conference) -> ConferenceEvent {
        let notify = conference.notify();

        loop {
            // Register before checking the queue, events pushed in between must wake this task
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            if let Some(event) = conference.pop_event() {
                return event;
            }

            let now = Instant::now();
            conference.poll(now);

            if let Some(event) = conference.pop_event() {
                return event;
            }

            self.update_sleep(conference, now);

            poll_fn(|cx| {
                if notified.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(());
                }

                match &mut self.sleep {
                    Some(sleep) => sleep.as_mut().poll(cx),
                    None => Poll::Pending,
                }
            })
            .await;
        }
    }

    fn update_sleep(&mut self, conference: &Conference, now: Instant) {
        match conference.timeout(now) {
            Some(duration) => {
                let deadline = tokio::time::Instant::from(now + duration);

                if let Some(sleep) = &mut self.sleep {
                    sleep.as_mut().reset(deadline);
                } else {
                    self.sleep = Some(Box::pin(sleep_until(deadline)));
                }
            }
            None => self.sleep = None,
        }
    }
}
