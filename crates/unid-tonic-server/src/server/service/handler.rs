//! gRPC service implementation for Snowflake and segment ID issuance.
//!
//! [`IdService`] is a thin routing layer: `Snowflake` calls go to one
//! process-wide [`AtomicSnowflakeGenerator`], `Segment` calls to the shared
//! [`SegmentAllocator`]. It adds per-client rate limiting of `Snowflake`
//! calls, request accounting for graceful shutdown, metrics, and the mapping
//! of library errors onto gRPC statuses.

use crate::server::{
    config::ServerConfig,
    service::rate_limit::{RateLimitConfig, RateLimiter},
    store::ServerStore,
    telemetry::{
        increment_request_errors, increment_segment_requests, increment_snowflake_requests,
        record_request_duration,
    },
};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::sync::Notify;
use tonic::{Request, Response, Status};
use unid_tonic_core::{
    error::Error,
    proto::{IdResponse, SegmentRequest, SnowflakeRequest, id_generator_server::IdGenerator},
    types::{Clock, Generator},
    unid::{AtomicSnowflakeGenerator, RangeStore, SegmentAllocator, TimeSource},
};

/// Tracks in-flight requests so shutdown can wait for them.
#[derive(Debug, Default)]
struct Lifecycle {
    shutting_down: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
}

impl Lifecycle {
    fn enter(&self) -> Result<RequestGuard<'_>, Error> {
        // Count first, then check, so a concurrent shutdown either sees this
        // request or refuses it.
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let guard = RequestGuard(self);
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }
        Ok(guard)
    }

    async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct RequestGuard<'a>(&'a Lifecycle);

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// The `IdGenerator` gRPC service.
///
/// Cheap to clone; clones share the generator, the allocator and the
/// shutdown state.
pub struct IdService<S = ServerStore, T = Clock>
where
    T: TimeSource,
{
    generator: Arc<AtomicSnowflakeGenerator<T>>,
    allocator: Arc<SegmentAllocator<S>>,
    limiter: Option<Arc<RateLimiter>>,
    lifecycle: Arc<Lifecycle>,
}

impl<S, T: TimeSource> Clone for IdService<S, T> {
    fn clone(&self) -> Self {
        Self {
            generator: Arc::clone(&self.generator),
            allocator: Arc::clone(&self.allocator),
            limiter: self.limiter.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl IdService {
    /// Builds the service described by `config`, opening the range store.
    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let clock = Clock::with_epoch(config.epoch);
        let generator = Generator::with_config(config.identity, clock, config.generator)?;
        let store = ServerStore::open(config).await?;
        let allocator = SegmentAllocator::new(store, config.segment.clone())?;
        let service = Self::new(generator, allocator);
        Ok(match config.rate_limit {
            Some(limit) => service.with_rate_limit(limit),
            None => service,
        })
    }
}

impl<S: RangeStore, T: TimeSource> IdService<S, T> {
    pub fn new(generator: AtomicSnowflakeGenerator<T>, allocator: SegmentAllocator<S>) -> Self {
        Self {
            generator: Arc::new(generator),
            allocator: Arc::new(allocator),
            limiter: None,
            lifecycle: Arc::default(),
        }
    }

    /// Limits `Snowflake` calls per client IP. Calls without a peer address,
    /// such as those over a Unix socket, are not limited.
    #[must_use]
    pub fn with_rate_limit(mut self, limit: RateLimitConfig) -> Self {
        self.limiter = Some(Arc::new(RateLimiter::new(limit)));
        self
    }

    fn admit<M>(&self, req: &Request<M>) -> Result<(), Error> {
        let (Some(limiter), Some(peer)) = (&self.limiter, req.remote_addr()) else {
            return Ok(());
        };
        limiter
            .check(peer.ip())
            .map_err(|retry_after_ms| Error::RateLimited { retry_after_ms })
    }

    /// Refuses new requests, waits up to `timeout` for in-flight ones, then
    /// cancels background segment refills.
    ///
    /// Returns `false` if requests were still running when the timeout hit.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.lifecycle.shutting_down.store(true, Ordering::Release);
        let drained = tokio::time::timeout(timeout, self.lifecycle.drained())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                inflight = self.lifecycle.inflight.load(Ordering::Acquire),
                "in-flight requests did not finish before the shutdown timeout"
            );
        }
        self.allocator.shutdown();
        drained
    }
}

fn respond(
    method: &'static str,
    start: Instant,
    result: Result<u64, Error>,
) -> Result<Response<IdResponse>, Status> {
    record_request_duration(method, start.elapsed().as_secs_f64() * 1_000.0);
    match result {
        Ok(id) => Ok(Response::new(IdResponse { id })),
        Err(e) => {
            let kind = e.kind().map_or("shutdown", |kind| kind.as_str());
            increment_request_errors(kind);
            tracing::warn!(method, kind, error = %e, "request failed");
            Err(e.into())
        }
    }
}

#[tonic::async_trait]
impl<S, T> IdGenerator for IdService<S, T>
where
    S: RangeStore,
    T: TimeSource + Send + Sync + 'static,
{
    #[tracing::instrument(skip_all)]
    async fn snowflake(
        &self,
        req: Request<SnowflakeRequest>,
    ) -> Result<Response<IdResponse>, Status> {
        let start = Instant::now();
        let _guard = match self.lifecycle.enter() {
            Ok(guard) => guard,
            Err(e) => return respond("snowflake", start, Err(e)),
        };
        increment_snowflake_requests();
        if let Err(e) = self.admit(&req) {
            return respond("snowflake", start, Err(e));
        }

        let result = self
            .generator
            .next_id_async()
            .await
            .map(|id| id.to_raw())
            .map_err(Error::from);
        respond("snowflake", start, result)
    }

    #[tracing::instrument(skip_all, fields(key = %req.get_ref().key))]
    async fn segment(&self, req: Request<SegmentRequest>) -> Result<Response<IdResponse>, Status> {
        let start = Instant::now();
        let _guard = match self.lifecycle.enter() {
            Ok(guard) => guard,
            Err(e) => return respond("segment", start, Err(e)),
        };
        increment_segment_requests();

        let key = req.into_inner().key;
        let result = self.allocator.next_segment_id(&key).await.map_err(Error::from);
        respond("segment", start, result)
    }
}
