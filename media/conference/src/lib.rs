//! # RTP conferencing core
//!
//! Negotiates codecs between local capabilities, application preferences and remote participants, and manages the
//! send and receive state of RTP sessions built from that negotiation. Media processing itself is left to a
//! [`MediaBackend`], which builds encoders, decoders and transmitters on request and reports back through
//! [`RtpPipelineHooks`].
//!
//! [`Conference`] is the top level type and is sans-io. Time based work (SSRC binding without RTCP, TFRC timers)
//! happens in [`Conference::poll`], events are retrieved with [`Conference::pop_event`].
//!
//! Enabling the `tokio` feature flag provides [`ConferenceDriver`](tokio::ConferenceDriver), a companion type which
//! drives the conference's timers and waits for events.

mod conference;
mod error;
mod event;
mod rate_control;
mod rtcp;

pub mod backend;
pub mod candidate;
pub mod caps;
pub mod codec;
pub mod config;
pub mod dtmf;
pub mod hdrext;
pub mod negotiation;
pub mod session;
pub mod special_source;
pub mod srtp;
pub mod stream;
pub mod substream;
#[cfg(feature = "tokio")]
pub mod tokio;

pub use backend::{MediaBackend, StreamTransmitter, TransmitterEvent};
pub use codec::{Codec, CodecBlueprint, CodecPreference, MediaType};
pub use conference::{Conference, Participant, ParticipantId, RtpPipelineHooks};
pub use config::{ConferenceConfig, SessionConfig, TfrcMode};
pub use error::Error;
pub use event::{ConferenceEvent, ErrorSource};
pub use rate_control::OutgoingRtp;
pub use session::{Session, SessionId};
pub use stream::{Direction, Stream, StreamId};

fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
    }
}
