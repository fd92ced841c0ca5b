mod atomic;
mod config;
mod status;

pub use atomic::*;
pub use config::*;
pub use status::*;
