#![doc = include_str!("../README.md")]

mod client;
mod config;
mod remote;

pub use client::*;
pub use config::*;
pub use remote::*;
pub use unid;
