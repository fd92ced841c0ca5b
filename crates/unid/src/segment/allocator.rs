use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    BufferStats, Error, RangeStore, Result, RetryPolicy, SegmentBuffer, SegmentConfig,
    segment::buffer::Issue,
};

/// Longest accepted business key, in bytes.
pub const MAX_KEY_LEN: usize = 128;

/// Hands out monotonically increasing integers per business key, backed by a
/// [`RangeStore`].
///
/// Each key gets its own [`SegmentBuffer`], created on first use. Requests are
/// served from memory; the store is only consulted to load the first segment
/// of a key and, in background tasks, to prefetch the next one. IDs of one key
/// are strictly increasing within a segment and across segments, but a
/// restart abandons whatever was left of the cached segments, leaving gaps.
///
/// Must be used from within a tokio runtime.
///
/// # Example
///
/// ```
/// use unid::{MemoryRangeStore, SegmentAllocator, SegmentConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> unid::Result<()> {
/// let ids = SegmentAllocator::new(MemoryRangeStore::new(), SegmentConfig::fixed_step(100))?;
///
/// assert_eq!(ids.next_segment_id("orders").await?, 0);
/// assert_eq!(ids.next_segment_id("orders").await?, 1);
/// assert_eq!(ids.next_segment_id("users").await?, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SegmentAllocator<S> {
    store: Arc<S>,
    config: SegmentConfig,
    buffers: RwLock<HashMap<String, Arc<SegmentBuffer>>>,
    shutdown: CancellationToken,
}

impl<S: RangeStore> SegmentAllocator<S> {
    /// Creates an allocator that owns `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(store: S, config: SegmentConfig) -> Result<Self> {
        Self::with_shared_store(Arc::new(store), config)
    }

    /// Creates an allocator over a store that is also used elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn with_shared_store(store: Arc<S>, config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            buffers: RwLock::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Returns the next ID for `key`.
    ///
    /// Only the first call for a key, and calls that find both segments empty,
    /// wait on the store. Everything else is a single atomic increment.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidKey`] if `key` is empty, longer than
    ///   [`MAX_KEY_LEN`] bytes, or contains whitespace or control characters.
    /// - [`Error::SegmentUnavailable`] if the store could not supply a
    ///   segment after the configured retries.
    /// - [`Error::SegmentExhausted`] if both segments were empty and no refill
    ///   landed within [`SegmentConfig::exhausted_wait`].
    pub async fn next_segment_id(&self, key: &str) -> Result<u64> {
        validate_key(key)?;
        let buffer = self.buffer(key);
        buffer
            .loaded
            .get_or_try_init(|| self.load(&buffer))
            .await?;

        let deadline = tokio::time::Instant::now() + self.config.exhausted_wait;
        loop {
            match buffer.try_issue() {
                Issue::Id { id, refill } => {
                    if refill {
                        self.spawn_refill(&buffer);
                    }
                    return Ok(id);
                }
                Issue::Exhausted { refill } => {
                    if refill {
                        self.spawn_refill(&buffer);
                    }
                    if !buffer.wait_for_refill(deadline).await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(key, "segment exhausted while waiting for refill");
                        return Err(Error::SegmentExhausted {
                            key: key.to_owned(),
                        });
                    }
                    if let Some(reason) = buffer.failure() {
                        return Err(Error::SegmentUnavailable {
                            key: key.to_owned(),
                            reason,
                        });
                    }
                }
            }
        }
    }

    /// Keys whose first segment has been loaded, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .buffers
            .read()
            .values()
            .filter(|buffer| buffer.loaded.initialized())
            .map(|buffer| buffer.key().to_owned())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Snapshot of the buffer behind `key`, if it has been loaded.
    pub fn stats(&self, key: &str) -> Option<BufferStats> {
        let buffers = self.buffers.read();
        let buffer = buffers.get(key)?;
        buffer.loaded.initialized().then(|| buffer.stats())
    }

    /// Cancels in-flight and future background refills.
    ///
    /// IDs left in already cached segments are still handed out; once those
    /// run dry, callers get [`Error::SegmentUnavailable`].
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!(keys = self.buffers.read().len(), "segment allocator shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn buffer(&self, key: &str) -> Arc<SegmentBuffer> {
        if let Some(buffer) = self.buffers.read().get(key) {
            return Arc::clone(buffer);
        }
        let mut buffers = self.buffers.write();
        let buffer = buffers.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(SegmentBuffer::new(
                key,
                self.config.default_step,
                self.config.low_water,
            ))
        });
        Arc::clone(buffer)
    }

    async fn load(&self, buffer: &SegmentBuffer) -> Result<()> {
        let step = self.config.default_step;
        let max = fetch_range(
            self.store.as_ref(),
            buffer.key(),
            step,
            &self.config.retry,
            &self.shutdown,
        )
        .await
        .map_err(|reason| Error::SegmentUnavailable {
            key: buffer.key().to_owned(),
            reason,
        })?;
        buffer.install_initial(max, step);
        #[cfg(feature = "tracing")]
        tracing::info!(key = buffer.key(), max, step, "loaded first segment");
        Ok(())
    }

    fn spawn_refill(&self, buffer: &Arc<SegmentBuffer>) {
        let buffer = Arc::clone(buffer);
        let store = Arc::clone(&self.store);
        let retry = self.config.retry;
        let shutdown = self.shutdown.clone();
        let step = buffer.planned_step(&self.config);

        tokio::spawn(async move {
            match fetch_range(store.as_ref(), buffer.key(), step, &retry, &shutdown).await {
                Ok(max) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(key = buffer.key(), max, step, "prefetched segment");
                    buffer.complete_refill(max, step);
                }
                Err(reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(key = buffer.key(), %reason, "segment refill gave up");
                    buffer.fail_refill(reason);
                }
            }
        });
    }
}

/// Checks that `key` can name a segment counter.
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] if `key` is empty, longer than
/// [`MAX_KEY_LEN`] bytes, or contains whitespace or control characters.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.chars().any(|c| c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey {
            key: key.to_owned(),
        })
    }
}

/// Advances `key` by `step`, retrying store failures with backoff. Returns the
/// new upper bound, or the reason the last attempt failed.
async fn fetch_range<S: RangeStore>(
    store: &S,
    key: &str,
    step: u64,
    retry: &RetryPolicy,
    shutdown: &CancellationToken,
) -> core::result::Result<u64, String> {
    let mut failures = 0;
    loop {
        if shutdown.is_cancelled() {
            return Err("allocator shut down".to_owned());
        }
        let reason = match store.fetch_and_advance(key, step).await {
            Ok(max) if max >= step => return Ok(max),
            Ok(max) => format!("store returned bound {max} below step {step}"),
            Err(e) => e.to_string(),
        };
        failures += 1;
        if failures >= retry.attempts {
            return Err(reason);
        }

        let backoff = retry.backoff(failures);
        #[cfg(feature = "tracing")]
        tracing::warn!(key, attempt = failures, ?backoff, %reason, "range store call failed, retrying");
        tokio::select! {
            () = shutdown.cancelled() => return Err("allocator shut down".to_owned()),
            () = tokio::time::sleep(backoff) => {}
        }
    }
}
