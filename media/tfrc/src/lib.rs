//! # TCP friendly rate control
//!
//! Sans-io implementation of the TFRC sender and receiver state machines described in
//! [RFC 5348](https://www.rfc-editor.org/rfc/rfc5348), including the small-packet variant
//! of [RFC 4828](https://www.rfc-editor.org/rfc/rfc4828).
//!
//! All times are expressed in microseconds relative to an arbitrary epoch chosen by the caller,
//! all rates are in bytes per second. None of the types in this crate read a clock, the caller
//! passes `now` into every operation.
//!
//! - [`TfrcSender`] consumes feedback reports and computes the allowed sending rate
//! - [`TfrcReceiver`] records received packets, computes the loss event rate and decides when feedback is due
//! - [`IsDataLimited`] tracks whether the sender was data limited during a feedback interval

mod data_limited;
mod equation;
mod receiver;
mod sender;

pub use data_limited::IsDataLimited;
pub use equation::{calculate_bitrate, compute_initial_rate};
pub use receiver::{Feedback, TfrcReceiver};
pub use sender::TfrcSender;

/// One second in microseconds
pub const SECOND: u64 = 1_000_000;

/// Default maximum segment size used when no sender state exists yet
pub const DEFAULT_MSS: u32 = 1460;

/// Lower bound of the no feedback timer
pub const MIN_NOFEEDBACK_TIMER: u64 = 20 * 1000;

/// Largest RTT accepted from a feedback report
pub const MAX_RTT: u64 = 10 * SECOND;

/// Rounded `val * num / denom`, computed without intermediate overflow
fn scale_round(val: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return 0;
    }

    let val = u128::from(val) * u128::from(num);
    let denom = u128::from(denom);

    u64::try_from((val + denom / 2) / denom).unwrap_or(u64::MAX)
}
