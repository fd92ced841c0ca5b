/// A result type defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors `unid` can produce.
///
/// Callers of the subsystem receive either a valid ID or one of these kinds,
/// never a zero or partially formed ID.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The clock moved backward by more than the configured tolerance.
    ///
    /// Issuing an ID anyway risks duplicating one issued before the clock
    /// moved, so the call fails instead. It is never retried internally.
    #[error("clock moved backwards by {drift_ms}ms")]
    ClockRollback {
        /// How far behind the last issued timestamp the clock reads.
        drift_ms: u64,
    },

    /// The sequence of the current millisecond ran out and the clock did not
    /// move on within the stall budget. Usually a frozen clock or an epoch
    /// that lies in the future.
    #[error("clock did not advance for {waited_ms}ms with the sequence exhausted")]
    ClockStalled { waited_ms: u64 },

    /// The timestamp no longer fits the layout's timestamp field.
    #[error("timestamp {timestamp} exceeds the layout's timestamp field")]
    TimestampOverflow { timestamp: u64 },

    /// Both segments of a business key were empty at request time and no
    /// refill completed within the wait bound. Transient; retry shortly.
    #[error("segment for `{key}` exhausted")]
    SegmentExhausted { key: String },

    /// The range store could not supply a segment after bounded retries.
    #[error("segment for `{key}` unavailable: {reason}")]
    SegmentUnavailable { key: String, reason: String },

    /// The remote ID service could not be reached.
    #[error("remote ID service unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    /// The business key is empty or too long.
    #[error("invalid business key `{key}`")]
    InvalidKey { key: String },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors a caller may reasonably retry after a short
    /// delay.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SegmentExhausted { .. } | Self::RemoteUnavailable { .. }
        )
    }
}
