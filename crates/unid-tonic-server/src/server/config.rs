use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use std::path::PathBuf;
use crate::server::service::rate_limit::RateLimitConfig;
use unid_tonic_core::{
    types::{EPOCH, LAYOUT},
    unid::{GeneratorConfig, RetryPolicy, SegmentConfig, WorkerIdentity},
};

/// Runtime configuration for the `unid-tonic-server` binary.
///
/// Every value can be given as a CLI flag or an environment variable (a
/// `.env` file in the working directory is honored). The Snowflake identity
/// must be unique across all running servers; everything else only tunes
/// performance.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "unid-tonic-server",
    version,
    about = "A gRPC service issuing Snowflake and segment-allocated unique IDs"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/unid.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Datacenter part of the Snowflake identity.
    ///
    /// Environment variable: `DATACENTER_ID`
    #[arg(long, env = "DATACENTER_ID", default_value_t = 0)]
    pub datacenter_id: u64,

    /// Worker part of the Snowflake identity. Derived from the host name and
    /// process id when absent, which is only safe for single-instance
    /// deployments.
    ///
    /// Environment variable: `WORKER_ID`
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<u64>,

    /// Zero point of embedded timestamps, in Unix milliseconds. Changing it
    /// on a running fleet breaks ordering and can produce duplicates.
    ///
    /// Environment variable: `EPOCH_MS`
    #[arg(long, env = "EPOCH_MS", default_value_t = EPOCH.as_millis() as u64)]
    pub epoch_ms: u64,

    /// Largest backward clock jump, in milliseconds, that is waited out
    /// instead of failing requests.
    ///
    /// Environment variable: `ROLLBACK_TOLERANCE_MS`
    #[arg(long, env = "ROLLBACK_TOLERANCE_MS", default_value_t = 5)]
    pub rollback_tolerance_ms: u64,

    /// Size of the first segment reserved for each business key.
    ///
    /// Environment variable: `SEGMENT_STEP`
    #[arg(long, env = "SEGMENT_STEP", default_value_t = 1_000)]
    pub segment_step: u64,

    /// Smallest step the adaptive sizing may shrink to. Defaults to
    /// `SEGMENT_STEP`.
    ///
    /// Environment variable: `SEGMENT_MIN_STEP`
    #[arg(long, env = "SEGMENT_MIN_STEP")]
    pub segment_min_step: Option<u64>,

    /// Largest step the adaptive sizing may grow to.
    ///
    /// Environment variable: `SEGMENT_MAX_STEP`
    #[arg(long, env = "SEGMENT_MAX_STEP", default_value_t = 1_000_000)]
    pub segment_max_step: u64,

    /// Fraction of a segment consumed before the next one is prefetched.
    ///
    /// Environment variable: `SEGMENT_LOW_WATER`
    #[arg(long, env = "SEGMENT_LOW_WATER", default_value_t = 0.9)]
    pub segment_low_water: f64,

    /// Desired seconds between two refills of the same key.
    ///
    /// Environment variable: `SEGMENT_REFILL_INTERVAL_SECS`
    #[arg(long, env = "SEGMENT_REFILL_INTERVAL_SECS", default_value_t = 900)]
    pub segment_refill_interval_secs: u64,

    /// How long a request waits for an in-flight refill when a key's
    /// segments are both empty.
    ///
    /// Environment variable: `SEGMENT_WAIT_MS`
    #[arg(long, env = "SEGMENT_WAIT_MS", default_value_t = 1_000)]
    pub segment_wait_ms: u64,

    /// Where segment counters are kept.
    ///
    /// Environment variable: `RANGE_STORE`
    #[arg(long, env = "RANGE_STORE", value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    /// Counter file used by `--store file`.
    ///
    /// Environment variable: `RANGE_STORE_PATH`
    #[arg(long, env = "RANGE_STORE_PATH", default_value = "unid-ranges.txt")]
    pub store_path: PathBuf,

    /// Sustained `Snowflake` calls per second allowed from one client IP.
    /// `0` disables the limit. Unix socket peers are never limited.
    ///
    /// Environment variable: `RATE_LIMIT_PER_SEC`
    #[arg(long, env = "RATE_LIMIT_PER_SEC", default_value_t = 1_000.0)]
    pub rate_limit_per_sec: f64,

    /// Calls one client IP may make in a burst before the sustained rate
    /// applies.
    ///
    /// Environment variable: `RATE_LIMIT_BURST`
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 2_000)]
    pub rate_limit_burst: u64,

    /// Seconds to wait for in-flight requests on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

/// Backing storage for segment counters.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Counters live in memory and restart from zero with the process.
    Memory,
    /// Counters are persisted to `--store-path`.
    File,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub identity: WorkerIdentity,
    pub epoch: Duration,
    pub generator: GeneratorConfig,
    pub segment: SegmentConfig,
    pub store: StoreKind,
    pub store_path: PathBuf,
    /// `None` when limiting is disabled.
    pub rate_limit: Option<RateLimitConfig>,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let generator = GeneratorConfig {
            layout: LAYOUT,
            rollback_tolerance: Duration::from_millis(args.rollback_tolerance_ms),
        };

        let worker_id = args
            .worker_id
            .unwrap_or_else(|| WorkerIdentity::derive_local(&generator.layout).worker_id());
        let identity = WorkerIdentity::new(args.datacenter_id, worker_id, &generator.layout)
            .context("invalid Snowflake identity")?;

        if Duration::from_millis(args.epoch_ms) > std::time::UNIX_EPOCH.elapsed()? {
            bail!("EPOCH_MS ({}) lies in the future", args.epoch_ms);
        }

        let segment = SegmentConfig {
            default_step: args.segment_step,
            min_step: args.segment_min_step.unwrap_or(args.segment_step),
            max_step: args.segment_max_step,
            low_water: args.segment_low_water,
            target_refill_interval: Duration::from_secs(args.segment_refill_interval_secs),
            exhausted_wait: Duration::from_millis(args.segment_wait_ms),
            retry: RetryPolicy::default(),
        };
        segment.validate().context("invalid segment settings")?;

        if !args.rate_limit_per_sec.is_finite() || args.rate_limit_per_sec < 0.0 {
            bail!("RATE_LIMIT_PER_SEC must be a non-negative number");
        }
        let rate_limit = if args.rate_limit_per_sec > 0.0 {
            if args.rate_limit_burst == 0 {
                bail!("RATE_LIMIT_BURST must be at least 1");
            }
            Some(RateLimitConfig {
                burst: args.rate_limit_burst,
                per_second: args.rate_limit_per_sec,
            })
        } else {
            None
        };

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            identity,
            epoch: Duration::from_millis(args.epoch_ms),
            generator,
            segment,
            store: args.store,
            store_path: args.store_path,
            rate_limit,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
