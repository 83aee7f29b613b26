//! Time types for the relay.
//!
//! The device has no real-time clock. [`Timestamp`] values read from a
//! [`Clock`](crate::traits::Clock) are monotonic milliseconds since boot;
//! [`ClockOffset`] turns them into network time once peers have told us what
//! time it is.

use core::ops::Add;

/// Point in time in milliseconds.
///
/// Used both for monotonic boot-relative time and for corrected epoch time
/// as carried in packet headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Boot, or the epoch.
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Whole seconds, as printed in stats lines.
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    #[inline]
    pub const fn saturating_sub(self, earlier: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }

    /// True if more than `window` has passed between `self` and `now`.
    ///
    /// Timestamps in the future are never stale.
    #[inline]
    pub const fn is_older_than(self, window: Duration, now: Timestamp) -> bool {
        self.0.saturating_add(window.0) < now.0
    }
}

/// Deadlines: `now + Cfg::SCAN_INTERVAL`. Saturates at the far future.
impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.0))
    }
}

/// Span of time in milliseconds. Config intervals and retention windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn from_mins(mins: u64) -> Self {
        Duration(mins.saturating_mul(60 * 1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

/// Additive correction from monotonic boot time to network time.
///
/// Starts at zero. Every packet timestamp that is ahead of corrected time,
/// or that diverges from it by more than the threshold in either direction,
/// is folded into the offset. Small lags are ignored so a slow peer cannot
/// drag the clock backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockOffset(i64);

impl ClockOffset {
    pub const ZERO: ClockOffset = ClockOffset(0);

    /// The raw offset in milliseconds.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Apply the offset to a monotonic reading.
    pub fn apply(self, monotonic: Timestamp) -> Timestamp {
        let corrected = (monotonic.as_millis() as i64).saturating_add(self.0);
        Timestamp::from_millis(corrected.max(0) as u64)
    }

    /// Fold an observed network timestamp into the offset.
    ///
    /// Returns true if the offset changed.
    pub fn observe(&mut self, observed: Timestamp, monotonic: Timestamp, threshold: Duration) -> bool {
        let now = self.apply(monotonic).as_millis() as i64;
        let diff = (observed.as_millis() as i64).saturating_sub(now);
        if diff > 0 || diff.unsigned_abs() > threshold.as_millis() {
            self.0 = self.0.saturating_add(diff);
            return true;
        }
        false
    }

    /// True once the corrected clock has been pushed at least `floor` ms.
    pub fn reached(self, floor: u64) -> bool {
        self.0 >= 0 && self.0 as u64 >= floor
    }
}
