mod error;
mod generator;
mod id;
mod retry;
#[cfg(feature = "segment")]
mod segment;
mod time;
mod worker;

pub use crate::error::*;
pub use crate::generator::*;
pub use crate::id::*;
pub use crate::retry::*;
#[cfg(feature = "segment")]
pub use crate::segment::*;
pub use crate::time::*;
pub use crate::worker::*;
