//! Millisecond clocks derived from Posix `clock_gettime`.
//!
//! All timer arithmetic in the crate uses [`monotonic_ms`]; wall-clock time is
//! only used for log timestamps.

use std::time::Duration;

/// A timeout value that is effectively "never".
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[inline(always)]
fn gettime_ms(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer and the clock ids we pass are
    // always supported on linux.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// Milliseconds since an arbitrary monotonic origin (boot).
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    gettime_ms(libc::CLOCK_MONOTONIC)
}

/// Wall-clock milliseconds since the epoch.
#[inline(always)]
pub fn realtime_ms() -> u64 {
    gettime_ms(libc::CLOCK_REALTIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
