use core::time::Duration;
use unid::{Error, Result, RetryPolicy};
use unid_tonic_core::types::EPOCH;

/// When and how a client that fell back to local generation tries the
/// remote service again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Delay between two probe calls.
    pub probe_interval: Duration,
    /// Consecutive successful probes needed to switch back to remote.
    pub successes_required: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            successes_required: 3,
        }
    }
}

/// Settings for [`IdClient`](crate::IdClient).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// URI of the ID service, e.g. `http://ids.internal:50051`.
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Deadline for a single call, connection setup included.
    pub request_timeout: Duration,
    /// `None` keeps a client that fell back in local mode for good.
    pub recovery: Option<RecoveryPolicy>,
    /// Retries of `clock-rollback` and `segment-exhausted` answers.
    pub retry: RetryPolicy,
    /// Epoch of locally generated IDs. Must match the server's.
    pub epoch: Duration,
    /// Rollback tolerance of the local generator.
    pub rollback_tolerance: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50051".to_owned(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_millis(500),
            recovery: Some(RecoveryPolicy::default()),
            retry: RetryPolicy {
                attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(100),
            },
            epoch: EPOCH,
            rollback_tolerance: Duration::from_millis(5),
        }
    }
}

impl ClientConfig {
    /// Default settings pointed at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidConfig {
                reason: reason.to_owned(),
            })
        };
        if self.endpoint.is_empty() {
            return invalid("endpoint must not be empty");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be positive");
        }
        if self.retry.attempts == 0 {
            return invalid("retry.attempts must be at least 1");
        }
        // A local generator reads a clock stuck at zero until the epoch.
        if self.epoch > std::time::UNIX_EPOCH.elapsed().unwrap_or_default() {
            return invalid("epoch lies in the future");
        }
        if let Some(recovery) = &self.recovery {
            if recovery.probe_interval.is_zero() {
                return invalid("recovery.probe_interval must be positive");
            }
            if recovery.successes_required == 0 {
                return invalid("recovery.successes_required must be at least 1");
            }
        }
        Ok(())
    }
}
