use crate::SECOND;

/// TCP throughput equation of RFC 5348 section 3.1 with `b = 1` and `t_RTO = 4 * R`
///
/// - `s`: segment size in bytes
/// - `rtt`: round trip time in microseconds
/// - `p`: loss event rate
///
/// Returns the allowed rate in bytes per second.
pub fn calculate_bitrate(s: f64, rtt: f64, p: f64) -> f64 {
    let f = (2.0 * p / 3.0).sqrt() + 12.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p);

    (SECOND as f64 * s) / (rtt * f)
}

/// Initial sending rate of RFC 5348 section 4.2: `min(4 * MSS, max(2 * MSS, 4380)) / RTT`
///
/// Returns 0 if the RTT is unknown.
pub fn compute_initial_rate(mss: u32, rtt: u64) -> u32 {
    if rtt == 0 {
        return 0;
    }

    let mss = u64::from(mss);
    let window = (4 * mss).min((2 * mss).max(4380));

    u32::try_from(SECOND * window / rtt).unwrap_or(u32::MAX)
}

/// Find the loss event rate `p` which would produce `rate` with the given segment size and RTT,
/// returns `1 / p`.
///
/// Used to synthesize the first loss interval (RFC 5348 section 6.3.1).
pub(crate) fn compute_first_loss_interval(s: f64, rtt: f64, rate: f64) -> f64 {
    if rate <= 0.0 || s <= 0.0 || rtt <= 0.0 {
        return 1.0;
    }

    let mut p_min = 0.0f64;
    let mut p_max = 1.0f64;
    let mut p = 0.5;

    // Bisection, 64 steps are more than enough to exhaust f64 precision
    for _ in 0..64 {
        p = (p_min + p_max) / 2.0;
        let computed_rate = calculate_bitrate(s, rtt, p);

        if computed_rate < rate {
            p_max = p;
        } else {
            p_min = p;
        }

        if computed_rate >= 0.95 * rate && computed_rate <= 1.05 * rate {
            break;
        }
    }

    1.0 / p
}
