//! Error types for the ID service and their wire representation.
//!
//! [`Error`] converts into a [`tonic::Status`] whose code follows the usual
//! gRPC conventions. Domain failures additionally carry an `unid-error`
//! metadata entry naming the [`ErrorKind`], which is how a client tells an
//! answer from a healthy server apart from a transport failure: a status
//! without that entry is treated as "the service could not be reached".

use tonic::{
    Status,
    metadata::{AsciiMetadataValue, MetadataMap},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Metadata key carrying the [`ErrorKind`] of a failed call.
pub const ERROR_KIND_KEY: &str = "unid-error";

/// Metadata key carrying the observed clock drift of a
/// [`ErrorKind::ClockRollback`] failure, in milliseconds.
pub const DRIFT_MS_KEY: &str = "unid-drift-ms";

/// Unified error type for the ID service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// ID generation or segment allocation failed.
    #[error(transparent)]
    IdGeneration(#[from] unid::Error),

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The caller exceeded its request rate.
    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

/// Machine-readable classification of a domain failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClockRollback,
    ClockStalled,
    TimestampOverflow,
    SegmentExhausted,
    SegmentUnavailable,
    InvalidKey,
    InvalidRequest,
    RateLimited,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClockRollback => "clock-rollback",
            Self::ClockStalled => "clock-stalled",
            Self::TimestampOverflow => "timestamp-overflow",
            Self::SegmentExhausted => "segment-exhausted",
            Self::SegmentUnavailable => "segment-unavailable",
            Self::InvalidKey => "invalid-key",
            Self::InvalidRequest => "invalid-request",
            Self::RateLimited => "rate-limited",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "clock-rollback" => Self::ClockRollback,
            "clock-stalled" => Self::ClockStalled,
            "timestamp-overflow" => Self::TimestampOverflow,
            "segment-exhausted" => Self::SegmentExhausted,
            "segment-unavailable" => Self::SegmentUnavailable,
            "invalid-key" => Self::InvalidKey,
            "invalid-request" => Self::InvalidRequest,
            "rate-limited" => Self::RateLimited,
            "internal" => Self::Internal,
            _ => return None,
        })
    }

    /// Kind carried by `status`, or `None` if the status did not come from
    /// the service's domain logic.
    pub fn from_status(status: &Status) -> Option<Self> {
        status
            .metadata()
            .get(ERROR_KIND_KEY)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Kind reported to clients, `None` for failures that should look like
    /// the service is unreachable.
    pub fn kind(&self) -> Option<ErrorKind> {
        Some(match self {
            Self::IdGeneration(e) => match e {
                unid::Error::ClockRollback { .. } => ErrorKind::ClockRollback,
                unid::Error::ClockStalled { .. } => ErrorKind::ClockStalled,
                unid::Error::TimestampOverflow { .. } => ErrorKind::TimestampOverflow,
                unid::Error::SegmentExhausted { .. } => ErrorKind::SegmentExhausted,
                unid::Error::SegmentUnavailable { .. } => ErrorKind::SegmentUnavailable,
                unid::Error::InvalidKey { .. } => ErrorKind::InvalidKey,
                _ => ErrorKind::Internal,
            },
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ServiceShutdown => return None,
        })
    }
}

/// Observed drift of a clock rollback status, if present.
pub fn drift_ms(status: &Status) -> Option<u64> {
    status
        .metadata()
        .get(DRIFT_MS_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let kind = err.kind();
        let mut metadata = MetadataMap::new();
        if let Some(kind) = kind {
            metadata.insert(ERROR_KIND_KEY, AsciiMetadataValue::from_static(kind.as_str()));
        }

        let message = err.to_string();
        let code = match err {
            Error::IdGeneration(unid::Error::ClockRollback { drift_ms }) => {
                metadata.insert(DRIFT_MS_KEY, AsciiMetadataValue::from(drift_ms));
                tonic::Code::Aborted
            }
            Error::IdGeneration(unid::Error::ClockStalled { .. }) => tonic::Code::Unavailable,
            Error::IdGeneration(unid::Error::TimestampOverflow { .. }) => tonic::Code::OutOfRange,
            Error::IdGeneration(unid::Error::SegmentExhausted { .. }) => {
                tonic::Code::ResourceExhausted
            }
            Error::IdGeneration(unid::Error::SegmentUnavailable { .. }) => {
                tonic::Code::Unavailable
            }
            Error::IdGeneration(unid::Error::InvalidKey { .. }) => tonic::Code::InvalidArgument,
            Error::IdGeneration(_) => tonic::Code::Internal,
            Error::InvalidRequest { .. } => tonic::Code::InvalidArgument,
            Error::RateLimited { .. } => tonic::Code::ResourceExhausted,
            Error::ServiceShutdown => tonic::Code::Unavailable,
        };
        Status::with_metadata(code, message, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(err: unid::Error) -> Status {
        Error::from(err).into()
    }

    #[test]
    fn domain_errors_carry_their_kind() {
        let cases = [
            (
                unid::Error::ClockRollback { drift_ms: 12 },
                tonic::Code::Aborted,
                ErrorKind::ClockRollback,
            ),
            (
                unid::Error::ClockStalled { waited_ms: 60 },
                tonic::Code::Unavailable,
                ErrorKind::ClockStalled,
            ),
            (
                unid::Error::TimestampOverflow { timestamp: 1 },
                tonic::Code::OutOfRange,
                ErrorKind::TimestampOverflow,
            ),
            (
                unid::Error::SegmentExhausted { key: "k".into() },
                tonic::Code::ResourceExhausted,
                ErrorKind::SegmentExhausted,
            ),
            (
                unid::Error::SegmentUnavailable {
                    key: "k".into(),
                    reason: "db down".into(),
                },
                tonic::Code::Unavailable,
                ErrorKind::SegmentUnavailable,
            ),
            (
                unid::Error::InvalidKey { key: String::new() },
                tonic::Code::InvalidArgument,
                ErrorKind::InvalidKey,
            ),
            (
                unid::Error::InvalidConfig {
                    reason: "bad".into(),
                },
                tonic::Code::Internal,
                ErrorKind::Internal,
            ),
        ];
        for (err, code, kind) in cases {
            let status = status(err);
            assert_eq!(status.code(), code);
            assert_eq!(ErrorKind::from_status(&status), Some(kind));
        }
    }

    #[test]
    fn clock_rollback_reports_drift() {
        let status = status(unid::Error::ClockRollback { drift_ms: 42 });
        assert_eq!(drift_ms(&status), Some(42));
        assert!(status.message().contains("42ms"));
    }

    #[test]
    fn rate_limited_is_resource_exhausted() {
        let status: Status = Error::RateLimited { retry_after_ms: 40 }.into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(ErrorKind::from_status(&status), Some(ErrorKind::RateLimited));
        assert!(status.message().contains("40ms"));
    }

    #[test]
    fn shutdown_looks_like_transport_failure() {
        let status: Status = Error::ServiceShutdown.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(ErrorKind::from_status(&status), None);
    }

    #[test]
    fn plain_statuses_have_no_kind() {
        assert_eq!(ErrorKind::from_status(&Status::unavailable("conn refused")), None);
        let mut status = Status::internal("x");
        status
            .metadata_mut()
            .insert(ERROR_KIND_KEY, AsciiMetadataValue::from_static("bogus"));
        assert_eq!(ErrorKind::from_status(&status), None);
    }

    #[test]
    fn kinds_round_trip_through_their_names() {
        for kind in [
            ErrorKind::ClockRollback,
            ErrorKind::SegmentUnavailable,
            ErrorKind::InvalidRequest,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
    }
}
