//! The network side of [`IdClient`](crate::IdClient).
//!
//! [`RemoteIds`] is the seam between the client's state machine and the
//! transport. [`GrpcRemote`] talks to the real service; tests substitute
//! their own implementation.

use crate::ClientConfig;
use core::future::Future;
use tonic::{
    Status,
    transport::{Channel, Endpoint},
};
use unid::{Error, Result};
use unid_tonic_core::{
    error::{ErrorKind, drift_ms},
    proto::{SegmentRequest, SnowflakeRequest, id_generator_client::IdGeneratorClient},
};

/// Outcome of a failed remote call.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum RemoteError {
    /// The service answered and reported a domain failure.
    #[error("{kind}: {message}")]
    Domain {
        kind: ErrorKind,
        message: String,
        drift_ms: Option<u64>,
    },
    /// No answer from the service itself: unreachable, timed out, shutting
    /// down, or a status from some intermediary.
    #[error("transport failure: {reason}")]
    Transport { reason: String },
}

impl From<Status> for RemoteError {
    fn from(status: Status) -> Self {
        match ErrorKind::from_status(&status) {
            Some(kind) => Self::Domain {
                kind,
                drift_ms: drift_ms(&status),
                message: status.message().to_owned(),
            },
            None => Self::Transport {
                reason: format!("{}: {}", status.code(), status.message()),
            },
        }
    }
}

/// Calls of the ID service an [`IdClient`](crate::IdClient) relies on.
pub trait RemoteIds: Send + Sync + 'static {
    fn snowflake(&self) -> impl Future<Output = core::result::Result<u64, RemoteError>> + Send;

    fn segment(
        &self,
        key: &str,
    ) -> impl Future<Output = core::result::Result<u64, RemoteError>> + Send;
}

/// [`RemoteIds`] over a tonic channel.
#[derive(Clone, Debug)]
pub struct GrpcRemote {
    client: IdGeneratorClient<Channel>,
}

impl GrpcRemote {
    /// Prepares a channel to `config.endpoint` without connecting; the
    /// connection is made by the first call. Must be called inside a tokio
    /// runtime.
    pub fn connect_lazy(config: &ClientConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| Error::InvalidConfig {
                reason: format!("invalid endpoint `{}`: {e}", config.endpoint),
            })?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: IdGeneratorClient::new(channel),
        }
    }
}

impl RemoteIds for GrpcRemote {
    async fn snowflake(&self) -> core::result::Result<u64, RemoteError> {
        let mut client = self.client.clone();
        let response = client.snowflake(SnowflakeRequest {}).await?;
        Ok(response.into_inner().id)
    }

    async fn segment(&self, key: &str) -> core::result::Result<u64, RemoteError> {
        let mut client = self.client.clone();
        let request = SegmentRequest {
            key: key.to_owned(),
        };
        let response = client.segment(request).await?;
        Ok(response.into_inner().id)
    }
}
