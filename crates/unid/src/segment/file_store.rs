use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tokio::{fs::File, io::AsyncWriteExt, sync::Mutex};

use crate::segment::{RangeStore, StoreError, validate_key};

/// A [`RangeStore`] that persists counters to a small text file.
///
/// Each line holds `<key> <max>`, so keys must pass [`validate_key`]. Every
/// advance writes a temporary sibling, syncs it to disk, renames it over the
/// store file and syncs the parent directory before the new bound is handed
/// out. Once `fetch_and_advance` returns, the advance survives a process
/// crash or power loss on filesystems that honor `fsync`. This gives the
/// restart guarantee of a database-backed store for single-node deployments;
/// it is not meant to be shared between processes.
#[derive(Debug)]
pub struct FileRangeStore {
    path: PathBuf,
    counters: Mutex<BTreeMap<String, u64>>,
}

impl FileRangeStore {
    /// Opens the store at `path`, creating it lazily on the first advance.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let counters = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        #[cfg(feature = "tracing")]
        tracing::info!(path = %path.display(), keys = counters.len(), "opened range store");
        Ok(Self {
            path,
            counters: Mutex::new(counters),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, counters: &BTreeMap<String, u64>) -> Result<(), StoreError> {
        let mut contents = String::new();
        for (key, max) in counters {
            contents.push_str(key);
            contents.push(' ');
            contents.push_str(&max.to_string());
            contents.push('\n');
        }
        let tmp = self.tmp_path();
        let mut file = File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        self.sync_dir().await
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Makes the rename itself durable.
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(dir).await?.sync_all().await?;
        Ok(())
    }

    // Directories cannot be opened for syncing here; the rename is atomic
    // but its durability is left to the filesystem.
    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn parse(contents: &str) -> Result<BTreeMap<String, u64>, StoreError> {
    let mut counters = BTreeMap::new();
    for (n, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, max) = line
            .rsplit_once(' ')
            .ok_or_else(|| StoreError::new(format!("line {}: expected `<key> <max>`", n + 1)))?;
        let max = max
            .parse::<u64>()
            .map_err(|e| StoreError::new(format!("line {}: {e}", n + 1)))?;
        counters.insert(key.to_owned(), max);
    }
    Ok(counters)
}

impl RangeStore for FileRangeStore {
    async fn fetch_and_advance(&self, key: &str, step: u64) -> Result<u64, StoreError> {
        validate_key(key).map_err(|e| StoreError::new(e.to_string()))?;
        let mut counters = self.counters.lock().await;
        let current = counters.get(key).copied().unwrap_or(0);
        let next = current
            .checked_add(step)
            .ok_or_else(|| StoreError::new(format!("counter `{key}` overflowed")))?;

        // Write first, then commit in memory, so a failed write leaves both
        // views at the old bound.
        let mut updated = counters.clone();
        updated.insert(key.to_owned(), next);
        self.persist(&updated).await?;
        *counters = updated;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn advances_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.txt");

        let store = FileRangeStore::open(&path).await.unwrap();
        assert_eq!(store.fetch_and_advance("orders", 100).await, Ok(100));
        assert_eq!(store.fetch_and_advance("orders", 100).await, Ok(200));
        assert_eq!(store.fetch_and_advance("users", 10).await, Ok(10));
        drop(store);

        let reopened = FileRangeStore::open(&path).await.unwrap();
        assert_eq!(reopened.fetch_and_advance("orders", 50).await, Ok(250));
        assert_eq!(reopened.fetch_and_advance("users", 10).await, Ok(20));
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRangeStore::open(dir.path().join("absent.txt"))
            .await
            .unwrap();
        assert_eq!(store.fetch_and_advance("k", 7).await, Ok(7));
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.txt");
        tokio::fs::write(&path, "orders not-a-number\n").await.unwrap();

        assert!(FileRangeStore::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn advance_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.txt");
        let store = FileRangeStore::open(&path).await.unwrap();

        store.fetch_and_advance("orders", 10).await.unwrap();
        store.fetch_and_advance("orders", 10).await.unwrap();

        assert!(!store.tmp_path().exists());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "orders 20\n");
    }

    #[tokio::test]
    async fn keys_that_would_break_the_file_format_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.txt");
        let store = FileRangeStore::open(&path).await.unwrap();

        for key in ["orders\nusers 999", "two words", "", "tab\tkey"] {
            assert!(store.fetch_and_advance(key, 10).await.is_err(), "{key:?}");
        }
        assert!(!path.exists());

        assert_eq!(store.fetch_and_advance("orders", 10).await, Ok(10));
        let reopened = FileRangeStore::open(&path).await.unwrap();
        assert_eq!(reopened.fetch_and_advance("orders", 1).await, Ok(11));
    }

    #[test]
    fn parse_skips_blank_lines() {
        let parsed = parse("a 1\n\nb 20\n").unwrap();
        assert_eq!(parsed.get("a"), Some(&1));
        assert_eq!(parsed.get("b"), Some(&20));
    }
}
