//! Segment ("leaf") allocation: per-key counters served from memory in
//! ranges reserved from a [`RangeStore`].

mod allocator;
mod buffer;
mod config;
mod file_store;
mod store;
#[cfg(test)]
mod tests;

pub use allocator::*;
pub use buffer::{BufferStats, SegmentBuffer};
pub use config::*;
pub use file_store::*;
pub use store::*;
