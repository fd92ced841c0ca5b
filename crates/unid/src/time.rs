use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Default epoch: Monday, January 1, 2024 00:00:00 UTC
pub const DEFAULT_EPOCH: Duration = Duration::from_millis(1_704_067_200_000);

/// Twitter epoch: Thursday, November 4, 2010 1:42:54.657 UTC
pub const TWITTER_EPOCH: Duration = Duration::from_millis(1_288_834_974_657);

/// A source of millisecond timestamps relative to a configurable origin.
///
/// This abstraction lets the generator run against the real wall clock in
/// production and against scripted clocks in tests (e.g. to simulate a clock
/// stepping backwards).
///
/// # Example
///
/// ```
/// use unid::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource {
    /// Returns the current time in milliseconds since the configured epoch.
    fn current_millis(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

/// Wall-clock time source offset from a custom epoch.
///
/// Unlike a monotonic timer this reads `SystemTime` on every call, so NTP
/// corrections or manual clock changes are visible to the generator, and a
/// backward step surfaces as [`ClockRollback`](crate::Error::ClockRollback).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WallClock {
    epoch_millis: u64,
}

impl Default for WallClock {
    /// Constructs a wall clock aligned to [`DEFAULT_EPOCH`].
    fn default() -> Self {
        Self::with_epoch(DEFAULT_EPOCH)
    }
}

impl WallClock {
    /// Constructs a wall clock whose zero point is `epoch`, given as a
    /// [`Duration`] since 1970-01-01 UTC.
    ///
    /// Readings taken before the epoch saturate to zero.
    pub const fn with_epoch(epoch: Duration) -> Self {
        Self {
            epoch_millis: epoch.as_millis() as u64,
        }
    }

    /// The configured epoch in milliseconds since the Unix epoch.
    pub const fn epoch_millis(&self) -> u64 {
        self.epoch_millis
    }
}

impl TimeSource for WallClock {
    fn current_millis(&self) -> u64 {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        unix.saturating_sub(self.epoch_millis)
    }
}
