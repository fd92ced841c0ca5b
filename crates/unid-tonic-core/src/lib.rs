#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can reach the library through
// `unid_tonic_core::unid`
pub use unid;
