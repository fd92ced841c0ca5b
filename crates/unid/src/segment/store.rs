use core::future::Future;
use std::collections::HashMap;

use parking_lot::Mutex;

/// Failure reported by a [`RangeStore`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// The persisted counter behind segment allocation.
///
/// An implementation must advance the named counter atomically (serializable
/// or stronger isolation for that single row), e.g.
/// `UPDATE counter SET max_id = max_id + $step WHERE key = $key RETURNING max_id`.
/// Counters only ever grow, which is what keeps ranges from being issued
/// twice across restarts.
pub trait RangeStore: Send + Sync + 'static {
    /// Advances `key` by `step` and returns the new upper bound. The caller
    /// owns the range `[max - step, max)`.
    ///
    /// Unknown keys are created on first use.
    fn fetch_and_advance(
        &self,
        key: &str,
        step: u64,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// An in-process [`RangeStore`].
///
/// Counters live only as long as the process, so ranges restart from `base`
/// after a restart. Suitable for tests and single-process deployments whose
/// IDs do not outlive the process.
#[derive(Debug, Default)]
pub struct MemoryRangeStore {
    base: u64,
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryRangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown keys start counting at `base` instead of zero.
    pub fn with_base(base: u64) -> Self {
        Self {
            base,
            counters: Mutex::default(),
        }
    }

    /// Current upper bound of `key`, if it has been advanced.
    pub fn current(&self, key: &str) -> Option<u64> {
        self.counters.lock().get(key).copied()
    }
}

impl RangeStore for MemoryRangeStore {
    async fn fetch_and_advance(&self, key: &str, step: u64) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock();
        let max = counters.entry(key.to_owned()).or_insert(self.base);
        *max = max
            .checked_add(step)
            .ok_or_else(|| StoreError::new(format!("counter `{key}` overflowed")))?;
        Ok(*max)
    }
}
