//! # Service-wide ID types and constants
//!
//! The server and any client that falls back to local generation must agree
//! on the epoch and bit layout, otherwise locally generated IDs would not
//! sort with (or could collide with) server-issued ones. Both sides use the
//! definitions here.

use unid::{AtomicSnowflakeGenerator, DEFAULT_EPOCH, Layout, WallClock};

/// The clock used by the service's Snowflake generator.
pub type Clock = WallClock;

/// The Snowflake generator shared by all requests of one process.
pub type Generator = AtomicSnowflakeGenerator<Clock>;

/// Zero point of embedded timestamps. Overridable on the server through
/// `--epoch-ms`; clients falling back to local generation must use the same
/// value.
pub const EPOCH: core::time::Duration = DEFAULT_EPOCH;

/// Bit layout of service-issued Snowflake IDs.
pub const LAYOUT: Layout = Layout::TWITTER;
