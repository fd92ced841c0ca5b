use crate::SnowflakeId;

/// Outcome of a single non-blocking attempt to generate a Snowflake ID.
///
/// Returned by [`AtomicSnowflakeGenerator::try_poll_id`] so callers can plug
/// in their own backoff. [`AtomicSnowflakeGenerator::next_id`] and
/// [`AtomicSnowflakeGenerator::next_id_async`] are ready-made loops over it.
///
/// [`AtomicSnowflakeGenerator::try_poll_id`]: crate::AtomicSnowflakeGenerator::try_poll_id
/// [`AtomicSnowflakeGenerator::next_id`]: crate::AtomicSnowflakeGenerator::next_id
/// [`AtomicSnowflakeGenerator::next_id_async`]: crate::AtomicSnowflakeGenerator::next_id_async
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGenStatus {
    /// A unique ID was generated and is ready to use.
    Ready {
        /// The generated Snowflake ID.
        id: SnowflakeId,
    },
    /// No ID could be generated right now.
    ///
    /// `yield_for` is `1` when the sequence for the current millisecond is
    /// used up and `0` when another thread won the compare-and-swap race, in
    /// which case retrying immediately is fine.
    Pending {
        /// Milliseconds to wait before trying again.
        yield_for: u64,
    },
    /// The clock reads behind the last issued timestamp, but within the
    /// rollback tolerance. Waiting `drift_ms` lets it catch up.
    ClockBehind {
        /// How far behind the clock is, in milliseconds.
        drift_ms: u64,
    },
}
