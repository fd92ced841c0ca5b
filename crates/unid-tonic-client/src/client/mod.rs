use crate::{ClientConfig, GrpcRemote, RecoveryPolicy, RemoteError, RemoteIds};
use core::time::Duration;
use portable_atomic::{AtomicU8, Ordering};
use rand::Rng;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use unid::{Error, GeneratorConfig, Result, WorkerIdentity};
use unid_tonic_core::{
    error::ErrorKind,
    types::{Clock, Generator, LAYOUT},
};


/// Where [`IdClient::next_id`] currently gets its IDs from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// From the ID service.
    Remote = 0,
    /// From the embedded generator, without touching the network.
    Local = 1,
}

impl Mode {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Remote,
            _ => Self::Local,
        }
    }
}

struct Inner<R> {
    remote: R,
    config: ClientConfig,
    mode: AtomicU8,
    local: OnceCell<Generator>,
}

/// Entry point for services that need IDs.
///
/// Snowflake IDs come from the ID service while it is reachable. The first
/// transport failure switches the client to [`Mode::Local`]: that call and
/// every later one is served by an embedded generator whose worker identity
/// is derived from the host name and process id. Such an identity is not
/// coordinated, so a local generator can in rare cases share it with
/// another process; see [`WorkerIdentity::derive_local`].
///
/// Segment IDs have no local equivalent and always go to the service.
///
/// Clones share the mode, the local generator and the connection.
pub struct IdClient<R = GrpcRemote> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for IdClient<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl IdClient {
    /// Creates a client for `config.endpoint`. The connection is
    /// established lazily by the first call. Must be called inside a tokio
    /// runtime.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let remote = GrpcRemote::connect_lazy(&config)?;
        Self::with_remote(remote, config)
    }
}

impl<R: RemoteIds> IdClient<R> {
    pub fn with_remote(remote: R, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                remote,
                config,
                mode: AtomicU8::new(Mode::Remote as u8),
                local: OnceCell::new(),
            }),
        })
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.inner.mode.load(Ordering::Acquire))
    }

    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    /// Returns the next Snowflake ID.
    ///
    /// # Errors
    ///
    /// - [`Error::ClockRollback`] if the service kept reporting a clock
    ///   rollback through all retries
    /// - [`Error::RemoteUnavailable`] for any other failure the service
    ///   reported
    /// - errors of the local generator once in [`Mode::Local`]
    pub async fn next_id(&self) -> Result<u64> {
        if self.mode() == Mode::Local {
            return self.local_id().await;
        }

        let retry = &self.inner.config.retry;
        let mut failures = 0;
        loop {
            match self.inner.remote.snowflake().await {
                Ok(id) => return Ok(id),
                Err(RemoteError::Transport { reason }) => {
                    self.fall_back(&reason);
                    return self.local_id().await;
                }
                Err(RemoteError::Domain {
                    kind: ErrorKind::ClockRollback,
                    drift_ms,
                    ..
                }) => {
                    failures += 1;
                    if failures >= retry.attempts {
                        return Err(Error::ClockRollback {
                            drift_ms: drift_ms.unwrap_or_default(),
                        });
                    }
                    tracing::debug!(drift_ms, failures, "service clock behind, retrying");
                    tokio::time::sleep(jittered(retry.backoff(failures))).await;
                }
                Err(err) => {
                    return Err(Error::RemoteUnavailable {
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Returns the next ID of the counter named `key`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidKey`] if the service rejected `key`
    /// - [`Error::SegmentExhausted`] if the service had no IDs ready through
    ///   all retries
    /// - [`Error::SegmentUnavailable`] if the service could not be reached
    ///   or could not reserve a range
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn next_segment_id(&self, key: &str) -> Result<u64> {
        let retry = &self.inner.config.retry;
        let mut failures = 0;
        loop {
            let err = match self.inner.remote.segment(key).await {
                Ok(id) => return Ok(id),
                Err(err) => err,
            };
            let key = key.to_owned();
            match err {
                RemoteError::Domain {
                    kind: ErrorKind::SegmentExhausted,
                    ..
                } => {
                    failures += 1;
                    if failures >= retry.attempts {
                        return Err(Error::SegmentExhausted { key });
                    }
                    tokio::time::sleep(jittered(retry.backoff(failures))).await;
                }
                RemoteError::Domain {
                    kind: ErrorKind::InvalidKey,
                    ..
                } => return Err(Error::InvalidKey { key }),
                RemoteError::Domain { message, .. } => {
                    return Err(Error::SegmentUnavailable {
                        key,
                        reason: message,
                    });
                }
                RemoteError::Transport { reason } => {
                    return Err(Error::SegmentUnavailable { key, reason });
                }
            }
        }
    }

    async fn local_id(&self) -> Result<u64> {
        let generator = self
            .inner
            .local
            .get_or_try_init(|| async { build_local(&self.inner.config) })
            .await?;
        Ok(generator.next_id_async().await?.to_raw())
    }

    fn fall_back(&self, reason: &str) {
        let switched = self
            .inner
            .mode
            .compare_exchange(
                Mode::Remote as u8,
                Mode::Local as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !switched {
            return;
        }

        tracing::warn!(reason, "ID service unreachable, generating IDs locally");
        if let Some(policy) = self.inner.config.recovery {
            tokio::spawn(probe(Arc::downgrade(&self.inner), policy));
        }
    }
}

fn build_local(config: &ClientConfig) -> Result<Generator> {
    let identity = WorkerIdentity::derive_local(&LAYOUT);
    tracing::info!(
        datacenter_id = identity.datacenter_id(),
        worker_id = identity.worker_id(),
        "starting local ID generator"
    );
    Generator::with_config(
        identity,
        Clock::with_epoch(config.epoch),
        GeneratorConfig {
            layout: LAYOUT,
            rollback_tolerance: config.rollback_tolerance,
        },
    )
}

/// Polls the service until it answers `successes_required` times in a row,
/// then switches the client back to [`Mode::Remote`]. Ends early once every
/// handle to the client is gone.
async fn probe<R: RemoteIds>(client: Weak<Inner<R>>, policy: RecoveryPolicy) {
    let mut successes = 0;
    loop {
        tokio::time::sleep(policy.probe_interval).await;
        let Some(inner) = client.upgrade() else {
            return;
        };

        match inner.remote.snowflake().await {
            Ok(_) => successes += 1,
            Err(err) => {
                tracing::debug!(error = %err, "recovery probe failed");
                successes = 0;
            }
        }

        if successes >= policy.successes_required {
            inner.mode.store(Mode::Remote as u8, Ordering::Release);
            tracing::info!("ID service reachable again, switching back to remote");
            return;
        }
    }
}

/// `backoff` plus up to 25% random jitter.
fn jittered(backoff: Duration) -> Duration {
    let spread = u64::try_from(backoff.as_millis() / 4).unwrap_or(u64::MAX);
    backoff + Duration::from_millis(rand::rng().random_range(0..=spread))
}
