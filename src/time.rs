use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

/// A point on the process-wide monotonic timeline, in nanoseconds.
///
/// Every input event is stamped on this timeline as close to the kernel as
/// possible so that velocity timing and note bookkeeping agree across
/// devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MonotonicNanos(pub u64);

impl MonotonicNanos {
    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Time elapsed since `earlier`, saturating to zero if `earlier` is
    /// ahead.
    #[inline]
    pub fn since(&self, earlier: MonotonicNanos) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// The current time on the shared monotonic timeline.
pub fn now() -> MonotonicNanos {
    MonotonicNanos(epoch().elapsed().as_nanos() as u64)
}

/// Rebases kernel event timestamps (wall clock) onto the monotonic
/// timeline.
///
/// The kernel stamps evdev events with `CLOCK_REALTIME`. A reader captures
/// one (wall, monotonic) anchor pair at startup and shifts every event
/// timestamp by the same offset, so jitter from the userspace read path
/// never reaches the velocity computer.
pub struct WallRebase {
    wall_anchor: SystemTime,
    mono_anchor: MonotonicNanos,
}

impl WallRebase {
    pub fn new() -> Self {
        Self { wall_anchor: SystemTime::now(), mono_anchor: now() }
    }

    pub fn rebase(&self, wall: SystemTime) -> MonotonicNanos {
        match wall.duration_since(self.wall_anchor) {
            Ok(ahead) => MonotonicNanos(self.mono_anchor.0 + ahead.as_nanos() as u64),
            Err(behind) => MonotonicNanos(
                self.mono_anchor.0.saturating_sub(behind.duration().as_nanos() as u64),
            ),
        }
    }
}

impl Default for WallRebase {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRate(pub u32);

impl SampleRate {
    #[inline]
    pub fn as_f64(&self) -> f64 {
        f64::from(self.0)
    }

    #[inline]
    pub fn recip(&self) -> f64 {
        1.0 / self.as_f64()
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate(44_100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn since_saturates_instead_of_underflowing() {
        let early = MonotonicNanos(1_000);
        let late = MonotonicNanos(5_000);
        assert_eq!(late.since(early), Duration::from_nanos(4_000));
        assert_eq!(early.since(late), Duration::ZERO);
    }

    #[test]
    fn rebase_shifts_forward_and_backward() {
        let rb = WallRebase::new();
        let ahead = rb.rebase(SystemTime::now() + Duration::from_millis(10));
        let behind = rb.rebase(SystemTime::now() - Duration::from_secs(1));
        assert!(ahead > behind);
    }

    #[test]
    fn sample_rate_reciprocal_inverts() {
        let sr = SampleRate(48_000);
        assert_eq!(sr.as_f64(), 48_000.0);
        assert!((sr.recip() * 48_000.0 - 1.0).abs() < 1e-12);
    }
}
