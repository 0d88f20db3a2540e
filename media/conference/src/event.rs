use crate::{
    Error,
    candidate::{Candidate, Component, ComponentState},
    codec::Codec,
    dtmf::DtmfMethod,
    session::SessionId,
    stream::StreamId,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

/// Events emitted by the conference, its sessions and streams
///
/// Retrieved with [`Conference::pop_event`](crate::Conference::pop_event).
#[derive(Debug)]
pub enum ConferenceEvent {
    /// The transmitter of a stream discovered a local candidate
    NewLocalCandidate {
        session: SessionId,
        stream: StreamId,
        candidate: Candidate,
    },
    /// All local candidates of a stream have been gathered
    LocalCandidatesPrepared { session: SessionId, stream: StreamId },
    NewActiveCandidatePair {
        session: SessionId,
        stream: StreamId,
        local: Candidate,
        remote: Candidate,
    },
    ComponentStateChanged {
        session: SessionId,
        stream: StreamId,
        component: Component,
        state: ComponentState,
    },
    /// The codecs of the session changed, including the configuration discovered for them
    CodecsChanged { session: SessionId },
    /// A new codec is used to send media
    SendCodecChanged {
        session: SessionId,
        codec: Codec,
        /// Codecs used by auxiliary sources and the encoder alongside the main codec
        secondary_codecs: Vec<Codec>,
    },
    /// The codecs currently being decoded for a stream changed
    RecvCodecsChanged {
        session: SessionId,
        stream: StreamId,
        codecs: Vec<Codec>,
    },
    /// The codecs negotiated for a single stream changed
    NegotiatedCodecsChanged { session: SessionId, stream: StreamId },
    TelephonyEventStarted {
        session: SessionId,
        method: DtmfMethod,
        number: u8,
        volume: u8,
    },
    TelephonyEventStopped { session: SessionId, method: DtmfMethod },
    /// An error occurred outside of a synchronous call
    Error { source: ErrorSource, error: Error },
}

/// Object an asynchronous error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Conference,
    Session(SessionId),
    Stream(SessionId, StreamId),
}

/// Event queue shared between the conference and all of its sessions
#[derive(Debug, Default, Clone)]
pub(crate) struct EventQueue {
    events: Arc<Mutex<VecDeque<ConferenceEvent>>>,
    #[cfg(feature = "tokio")]
    notify: Arc<tokio::sync::Notify>,
}

impl EventQueue {
    pub(crate) fn push(&self, event: ConferenceEvent) {
        log::trace!("Queueing event {event:?}");

        self.events.lock().push_back(event);
        self.wake();
    }

    /// Wake the task driving the conference
    pub(crate) fn wake(&self) {
        #[cfg(feature = "tokio")]
        self.notify.notify_one();
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn notify(&self) -> Arc<tokio::sync::Notify> {
        self.notify.clone()
    }

    pub(crate) fn error(&self, source: ErrorSource, error: Error) {
        log::warn!("{source:?} emitted error: {error}");

        self.push(ConferenceEvent::Error { source, error });
    }

    pub(crate) fn pop(&self) -> Option<ConferenceEvent> {
        self.events.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
