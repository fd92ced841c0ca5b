//! gRPC service implementation.
//!
//! - [`handler`] - gRPC service entry point (`IdService`).
//! - [`rate_limit`] - per-client limits on the `Snowflake` RPC.

pub mod handler;
pub mod rate_limit;
