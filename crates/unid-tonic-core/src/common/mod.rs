//! Shared protocol bindings, types and error definitions used by both the
//! `unid` gRPC server and client.
//!
//! - [`error`] - service error type and its mapping to and from
//!   [`tonic::Status`].
//! - [`types`] - the clock, generator and epoch the service runs with.
//! - [`proto`] - generated messages, client and server stubs.

pub mod error;
pub mod types;
pub mod proto {
    tonic::include_proto!("unid");
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("unid_descriptor");
}
