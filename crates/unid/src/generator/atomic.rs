use core::{cmp, time::Duration};
use std::time::Instant;

use portable_atomic::{AtomicU64, Ordering};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    Error, Layout, Result, SnowflakeId, WorkerIdentity,
    generator::{GeneratorConfig, IdGenStatus},
    time::TimeSource,
};

/// Floor of [`AtomicSnowflakeGenerator::stall_budget`]. A healthy clock
/// leaves the current millisecond well within it, even under scheduler load.
pub const MIN_STALL_BUDGET: Duration = Duration::from_millis(50);

/// A lock-free Snowflake ID generator suitable for multi-threaded
/// environments.
///
/// The generator keeps its `{last timestamp, sequence}` state packed into the
/// last ID it issued, stored in a single [`AtomicU64`]. Every issuance is one
/// compare-and-swap on that word, which is the only point of contention
/// between threads sharing the generator.
///
/// IDs from one generator are strictly increasing as long as the clock does
/// not move backward past the configured rollback tolerance.
///
/// ## Recommended When
/// - Many request handlers share one generator (wrap it in an `Arc`)
/// - Fair access can be sacrificed for throughput
///
/// # Example
/// ```
/// use unid::{AtomicSnowflakeGenerator, Layout, WallClock, WorkerIdentity};
///
/// let identity = WorkerIdentity::new(1, 3, &Layout::TWITTER).unwrap();
/// let generator = AtomicSnowflakeGenerator::new(identity, WallClock::default()).unwrap();
///
/// let a = generator.next_id().unwrap();
/// let b = generator.next_id().unwrap();
/// assert!(a < b);
/// ```
pub struct AtomicSnowflakeGenerator<T>
where
    T: TimeSource,
{
    #[cfg(feature = "cache-padded")]
    state: crossbeam_utils::CachePadded<AtomicU64>,
    #[cfg(not(feature = "cache-padded"))]
    state: AtomicU64,
    time: T,
    identity: WorkerIdentity,
    layout: Layout,
    rollback_tolerance_ms: u64,
}

impl<T> AtomicSnowflakeGenerator<T>
where
    T: TimeSource,
{
    /// Creates a generator with the default [`GeneratorConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `identity` does not fit
    /// [`Layout::TWITTER`], e.g. when it was built for a wider layout.
    pub fn new(identity: WorkerIdentity, time: T) -> Result<Self> {
        Self::with_config(identity, time, GeneratorConfig::default())
    }

    /// Creates a generator with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `identity` does not fit the
    /// configured layout.
    pub fn with_config(identity: WorkerIdentity, time: T, config: GeneratorConfig) -> Result<Self> {
        // Re-validate against the configured layout, it may be narrower than
        // the one the identity was built for.
        WorkerIdentity::new(identity.datacenter_id(), identity.worker_id(), &config.layout)?;
        Ok(Self::from_parts(identity, time, config))
    }

    fn from_parts(identity: WorkerIdentity, time: T, config: GeneratorConfig) -> Self {
        let initial = config.layout.pack(0, identity, 0);
        Self {
            #[cfg(feature = "cache-padded")]
            state: crossbeam_utils::CachePadded::new(AtomicU64::new(initial)),
            #[cfg(not(feature = "cache-padded"))]
            state: AtomicU64::new(initial),
            time,
            identity,
            layout: config.layout,
            rollback_tolerance_ms: config.rollback_tolerance.as_millis() as u64,
        }
    }

    pub const fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Makes one attempt at generating the next ID without blocking.
    ///
    /// # Returns
    /// - `Ok(IdGenStatus::Ready { id })`: a new ID is available
    /// - `Ok(IdGenStatus::Pending { yield_for })`: the sequence is exhausted
    ///   for this millisecond (`1`) or the CAS lost a race (`0`)
    /// - `Ok(IdGenStatus::ClockBehind { drift_ms })`: the clock moved back by
    ///   no more than the rollback tolerance
    ///
    /// # Errors
    /// - [`Error::ClockRollback`] if the clock moved back beyond tolerance
    /// - [`Error::TimestampOverflow`] if the clock is past the layout's range
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn try_poll_id(&self) -> Result<IdGenStatus> {
        let now = self.time.current_millis();
        if now > self.layout.max_timestamp() {
            return Err(Error::TimestampOverflow { timestamp: now });
        }

        let current_raw = self.state.load(Ordering::Relaxed);
        let current_ts = self.layout.timestamp(current_raw);

        let next_raw = match now.cmp(&current_ts) {
            cmp::Ordering::Equal => {
                if self.layout.sequence(current_raw) < self.layout.max_sequence() {
                    // The sequence is the low field, so +1 cannot carry.
                    current_raw + 1
                } else {
                    return Ok(IdGenStatus::Pending { yield_for: 1 });
                }
            }
            cmp::Ordering::Greater => self.layout.pack(now, self.identity, 0),
            cmp::Ordering::Less => return self.cold_clock_behind(now, current_ts),
        };

        if self
            .state
            .compare_exchange(current_raw, next_raw, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            Ok(IdGenStatus::Ready {
                id: SnowflakeId::from_raw(next_raw),
            })
        } else {
            // Another thread won the race; retry immediately.
            Ok(IdGenStatus::Pending { yield_for: 0 })
        }
    }

    #[cold]
    #[inline(never)]
    fn cold_clock_behind(&self, now: u64, current_ts: u64) -> Result<IdGenStatus> {
        let drift_ms = current_ts - now;
        if drift_ms <= self.rollback_tolerance_ms {
            return Ok(IdGenStatus::ClockBehind { drift_ms });
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(
            drift_ms,
            last_timestamp = current_ts,
            now,
            "clock moved backwards beyond tolerance, refusing to issue id"
        );
        Err(Error::ClockRollback { drift_ms })
    }

    /// Generates the next ID, blocking the current thread while the sequence
    /// is exhausted or the clock catches up within tolerance.
    ///
    /// The total time spent waiting on a lagging clock never exceeds the
    /// rollback tolerance. Waiting for the next millisecond after the
    /// sequence ran out is bounded by [`Self::stall_budget`].
    ///
    /// # Errors
    /// - Same as [`Self::try_poll_id`]
    /// - [`Error::ClockStalled`] if the clock did not advance within the
    ///   stall budget
    pub fn next_id(&self) -> Result<SnowflakeId> {
        let mut waited_ms = 0;
        let mut stalled_since = None;
        loop {
            match self.try_poll_id()? {
                IdGenStatus::Ready { id } => return Ok(id),
                IdGenStatus::Pending { yield_for: 0 } => {
                    // Lost a race, so the generator is making progress.
                    stalled_since = None;
                    core::hint::spin_loop();
                }
                IdGenStatus::Pending { .. } => {
                    self.check_stall(*stalled_since.get_or_insert_with(Instant::now))?;
                    std::thread::yield_now();
                }
                IdGenStatus::ClockBehind { drift_ms } => {
                    waited_ms += drift_ms;
                    self.check_wait_budget(waited_ms, drift_ms)?;
                    std::thread::sleep(Duration::from_millis(drift_ms));
                }
            }
        }
    }

    /// Async counterpart of [`Self::next_id`] that yields to the tokio
    /// scheduler instead of blocking the worker thread.
    ///
    /// # Errors
    /// Same as [`Self::next_id`].
    #[cfg(feature = "async-tokio")]
    pub async fn next_id_async(&self) -> Result<SnowflakeId> {
        let mut waited_ms = 0;
        let mut stalled_since = None;
        loop {
            match self.try_poll_id()? {
                IdGenStatus::Ready { id } => return Ok(id),
                IdGenStatus::Pending { yield_for: 0 } => {
                    // Lost a race, so the generator is making progress.
                    stalled_since = None;
                    core::hint::spin_loop();
                }
                IdGenStatus::Pending { .. } => {
                    self.check_stall(*stalled_since.get_or_insert_with(Instant::now))?;
                    tokio::task::yield_now().await;
                }
                IdGenStatus::ClockBehind { drift_ms } => {
                    waited_ms += drift_ms;
                    self.check_wait_budget(waited_ms, drift_ms)?;
                    tokio::time::sleep(Duration::from_millis(drift_ms)).await;
                }
            }
        }
    }

    /// Longest wait for the clock to leave a millisecond whose sequence is
    /// exhausted: the rollback tolerance, but never less than
    /// [`MIN_STALL_BUDGET`].
    pub fn stall_budget(&self) -> Duration {
        Duration::from_millis(self.rollback_tolerance_ms).max(MIN_STALL_BUDGET)
    }

    fn check_stall(&self, since: Instant) -> Result<()> {
        let waited = since.elapsed();
        if waited > self.stall_budget() {
            let waited_ms = waited.as_millis() as u64;
            #[cfg(feature = "tracing")]
            tracing::warn!(waited_ms, "clock stopped advancing with the sequence exhausted");
            return Err(Error::ClockStalled { waited_ms });
        }
        Ok(())
    }

    fn check_wait_budget(&self, waited_ms: u64, drift_ms: u64) -> Result<()> {
        if waited_ms > self.rollback_tolerance_ms {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                drift_ms,
                waited_ms,
                "clock did not catch up within rollback tolerance"
            );
            return Err(Error::ClockRollback { drift_ms });
        }
        Ok(())
    }
}
