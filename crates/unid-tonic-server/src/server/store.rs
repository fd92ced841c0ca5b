//! The range store selected by `--store`.

use crate::server::config::{ServerConfig, StoreKind};
use unid_tonic_core::unid::{FileRangeStore, MemoryRangeStore, RangeStore, StoreError};

#[derive(Debug)]
pub enum ServerStore {
    Memory(MemoryRangeStore),
    File(FileRangeStore),
}

impl ServerStore {
    pub async fn open(config: &ServerConfig) -> Result<Self, StoreError> {
        Ok(match config.store {
            StoreKind::Memory => {
                tracing::warn!("segment counters are kept in memory and reset on restart");
                Self::Memory(MemoryRangeStore::new())
            }
            StoreKind::File => Self::File(FileRangeStore::open(&config.store_path).await?),
        })
    }
}

impl RangeStore for ServerStore {
    async fn fetch_and_advance(&self, key: &str, step: u64) -> Result<u64, StoreError> {
        match self {
            Self::Memory(store) => store.fetch_and_advance(key, step).await,
            Self::File(store) => store.fetch_and_advance(key, step).await,
        }
    }
}
