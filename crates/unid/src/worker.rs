use std::hash::{DefaultHasher, Hash, Hasher};

use crate::{Error, Layout, Result};

/// The datacenter and worker pair embedded in every Snowflake ID.
///
/// The combination must be unique among all generators running at the same
/// time; two generators sharing an identity can issue the same ID within the
/// same millisecond. It is assigned once at startup and never changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    datacenter_id: u64,
    worker_id: u64,
}

impl WorkerIdentity {
    /// Creates an identity, checking it fits `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either value exceeds its field.
    pub fn new(datacenter_id: u64, worker_id: u64, layout: &Layout) -> Result<Self> {
        if datacenter_id > layout.max_datacenter_id() {
            return Err(Error::invalid_config(format!(
                "datacenter id {datacenter_id} exceeds maximum {}",
                layout.max_datacenter_id()
            )));
        }
        if worker_id > layout.max_worker_id() {
            return Err(Error::invalid_config(format!(
                "worker id {worker_id} exceeds maximum {}",
                layout.max_worker_id()
            )));
        }
        Ok(Self {
            datacenter_id,
            worker_id,
        })
    }

    pub const fn datacenter_id(&self) -> u64 {
        self.datacenter_id
    }

    pub const fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Derives an identity from the host name and process id.
    ///
    /// Used where no coordinator hands out identities, e.g. by clients that
    /// fell back to local generation. Distinct processes can still hash to
    /// the same identity; with the default layout the odds for any two
    /// processes are 1 in 1024.
    pub fn derive_local(layout: &Layout) -> Self {
        Self::derive_from(&host_name(), std::process::id(), layout)
    }

    /// Deterministic part of [`Self::derive_local`].
    pub fn derive_from(host: &str, pid: u32, layout: &Layout) -> Self {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        pid.hash(&mut hasher);
        let hash = hasher.finish();

        let worker_id = hash & layout.max_worker_id();
        let datacenter_id = (hash >> 32) & layout.max_datacenter_id();
        Self {
            datacenter_id,
            worker_id,
        }
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
        })
        .unwrap_or_default()
}
