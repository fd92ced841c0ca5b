//! Generates the gRPC client and server bindings for `proto/unid.proto`.
//!
//! The file descriptor set is written next to the generated code so the
//! server can expose it through gRPC reflection:
//!
//! ```rust,ignore
//! pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("unid_descriptor");
//! ```
//!
//! # Panics
//!
//! Panics if `OUT_DIR` is unset or code generation fails, which aborts the
//! build with the underlying error.

use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("unid_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    println!("cargo:rerun-if-changed=proto/unid.proto");
    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/unid.proto"], &["proto"])
        .unwrap();
}
