//! Keyshare persistence
//!
//! Keyshares are stored as base64 engine bytes keyed by the hex public key
//! they belong to.

use crate::mpc::async_trait;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Access to a party's persisted keyshares
#[async_trait]
pub trait KeyshareStore: Send + Sync {
    /// Base64 keyshare for `public_key`
    async fn get_local_state(&self, public_key: &str) -> Result<String>;

    async fn save_local_state(&self, public_key: &str, keyshare: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKeyshare {
    public_key: String,
    keyshare: String,
    updated_at: DateTime<Utc>,
}

/// One JSON file per public key inside a directory
#[derive(Debug, Clone)]
pub struct FileKeyshareStore {
    dir: PathBuf,
}

impl FileKeyshareStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, public_key: &str) -> Result<PathBuf> {
        if public_key.is_empty() || !public_key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!("invalid public key: {:?}", public_key)));
        }
        Ok(self.dir.join(format!("{}.json", public_key)))
    }
}

#[async_trait]
impl KeyshareStore for FileKeyshareStore {
    #[instrument(skip(self))]
    async fn get_local_state(&self, public_key: &str) -> Result<String> {
        let path = self.path_for(public_key)?;
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
        let stored: StoredKeyshare =
            serde_json::from_slice(&raw).map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(stored.keyshare)
    }

    #[instrument(skip(self, keyshare))]
    async fn save_local_state(&self, public_key: &str, keyshare: &str) -> Result<()> {
        let path = self.path_for(public_key)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let stored = StoredKeyshare {
            public_key: public_key.to_string(),
            keyshare: keyshare.to_string(),
            updated_at: Utc::now(),
        };
        // Write then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&stored)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "Keyshare saved");
        Ok(())
    }
}

/// Keyshares held in memory
#[derive(Debug, Default)]
pub struct MemoryKeyshareStore {
    shares: DashMap<String, String>,
}

impl MemoryKeyshareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}

#[async_trait]
impl KeyshareStore for MemoryKeyshareStore {
    async fn get_local_state(&self, public_key: &str) -> Result<String> {
        self.shares
            .get(public_key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Storage(format!("no keyshare for {}", public_key)))
    }

    async fn save_local_state(&self, public_key: &str, keyshare: &str) -> Result<()> {
        self.shares.insert(public_key.to_string(), keyshare.to_string());
        Ok(())
    }
}
