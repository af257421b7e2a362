//! Certificate storage over the shared KV.
//!
//! Implements the Caddy-style storage contract: opaque values with
//! modification metadata, a hierarchical directory index kept in sorted
//! sets (one per parent, trailing `/` marks sub-directories), TTL-bounded
//! distributed locks with background refresh, and a repair walk that
//! reconciles the index with the stored keys.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use stormkit_storage::{Kv, KvError, KvLock};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Prepended to every KV key so the storage can share a database with the
/// rest of the edge.
pub const DEFAULT_KEY_PREFIX: &str = "le_";

const LOCK_TTL: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum StorageError {
    /// The key does not exist. Callers treat this as a recoverable miss.
    #[error("key does not exist")]
    NotExist,

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("storage codec error: {0}")]
    Codec(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageData {
    /// Base64 of the stored bytes.
    value: String,
    /// Unix seconds.
    modified: i64,
    size: i64,
}

/// Metadata for a stored key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyInfo {
    pub key: String,
    pub modified: OffsetDateTime,
    pub size: i64,
    pub is_terminal: bool,
}

pub struct CertStorage {
    key_prefix: String,
    kv: Kv,
    /// name → (lock handle, refresh task). The entry is removed before the
    /// release command is sent so a second caller cannot observe it.
    locks: Mutex<HashMap<String, (KvLock, JoinHandle<()>)>>,
}

impl CertStorage {
    pub fn new(kv: Kv) -> Self {
        Self::with_prefix(kv, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(kv: Kv, key_prefix: &str) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            kv,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        use base64::Engine;

        let modified = OffsetDateTime::now_utc().unix_timestamp();
        let data = StorageData {
            value: base64::engine::general_purpose::STANDARD.encode(value),
            modified,
            size: value.len() as i64,
        };
        let json = serde_json::to_string(&data).map_err(|e| StorageError::Codec(e.to_string()))?;

        let prefixed = self.prefix_key(key);
        self.store_directory_record(&prefixed, modified as f64, false, false)
            .await?;
        self.kv.set(&prefixed, &json, None).await?;
        Ok(())
    }

    pub async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        use base64::Engine;

        let data = self.load_storage_data(key).await?;
        base64::engine::general_purpose::STANDARD
            .decode(data.value)
            .map_err(|e| StorageError::Codec(e.to_string()))
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let prefixed = self.prefix_key(key);
        self.delete_directory_record(&prefixed, false).await?;
        self.kv.del(&prefixed).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.kv
            .exists(&self.prefix_key(key))
            .await
            .unwrap_or(false)
    }

    /// List keys under `dir`. Non-recursive returns immediate entries;
    /// recursive descends into sub-directories, concatenating paths.
    pub fn list<'a>(
        &'a self,
        dir: &'a str,
        recursive: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let members = self.kv.zrange(&self.prefix_key(dir)).await?;

            for member in members {
                let trimmed = member.trim_end_matches('/');
                let full_path = path_join(dir, trimmed);

                if recursive && member != trimmed {
                    keys.extend(self.list(&full_path, recursive).await?);
                } else {
                    keys.push(full_path);
                }
            }

            Ok(keys)
        })
    }

    pub async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        let data = self.load_storage_data(key).await?;

        Ok(KeyInfo {
            key: key.to_string(),
            modified: OffsetDateTime::from_unix_timestamp(data.modified)
                .map_err(|e| StorageError::Codec(e.to_string()))?,
            size: data.size,
            is_terminal: true,
        })
    }

    /// Obtain the named lock, polling every second until it is granted.
    /// While held, a background task refreshes the TTL every three seconds.
    /// Callers bound the wait with their own timeout.
    pub async fn lock(&self, name: &str) -> Result<(), StorageError> {
        let key = self.prefix_lock(name);

        loop {
            match self.kv.obtain_lock(&key, LOCK_TTL).await {
                Ok(lock) => {
                    let refresher = spawn_refresh(lock.clone());
                    self.locks
                        .lock()
                        .insert(key.clone(), (lock, refresher));
                    return Ok(());
                }
                Err(KvError::NotObtained) => {
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release the named lock. Unknown names are tolerated; releasing twice
    /// is a no-op.
    pub async fn unlock(&self, name: &str) -> Result<(), StorageError> {
        let key = self.prefix_lock(name);

        let entry = self.locks.lock().remove(&key);
        if let Some((lock, refresher)) = entry {
            refresher.abort();
            lock.release().await?;
        }
        Ok(())
    }

    /// Reconcile the directory index with the stored keys. At the root, a
    /// full scan re-inserts missing index entries; the walk then removes
    /// members whose target key no longer exists.
    pub fn repair<'a>(
        &'a self,
        dir: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let curr_key = self.prefix_key(dir);

            if dir.is_empty() {
                for key in self.kv.scan_prefix(&self.key_prefix).await? {
                    let trimmed = self.trim_key(&key);
                    let data = match self.load_storage_data(&trimmed).await {
                        Ok(data) => data,
                        Err(_) => {
                            // Sorted sets and malformed values are skipped.
                            continue;
                        }
                    };

                    self.store_directory_record(&key, data.modified as f64, true, false)
                        .await?;
                }
            }

            for member in self.kv.zrange(&curr_key).await? {
                let trimmed = member.trim_end_matches('/');
                let full_path = path_join(dir, trimmed);

                if !self.exists(&full_path).await {
                    self.kv.zrem(&curr_key, &member).await?;
                    tracing::info!(member, dir = curr_key, "removed dangling index record");
                    continue;
                }

                if member != trimmed {
                    self.repair(&full_path).await?;
                }
            }

            Ok(())
        })
    }

    async fn load_storage_data(&self, key: &str) -> Result<StorageData, StorageError> {
        let raw = self
            .kv
            .get(&self.prefix_key(key))
            .await?
            .ok_or(StorageError::NotExist)?;
        serde_json::from_str(&raw).map_err(|e| StorageError::Codec(e.to_string()))
    }

    /// Insert `(base, score)` into the parent's sorted set, recursing
    /// upwards until an ancestor is already indexed or the root is reached.
    fn store_directory_record<'a>(
        &'a self,
        key: &'a str,
        score: f64,
        repair: bool,
        base_is_dir: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let Some((dir, base)) = split_directory_key(key, base_is_dir) else {
                return Ok(());
            };

            let added = self.kv.zadd(&dir, &base, score).await?;

            if added || repair {
                if added && repair {
                    tracing::info!(member = base, dir, "repaired directory index record");
                }
                self.store_directory_record(&dir, score, repair, true)
                    .await?;
            }

            Ok(())
        })
    }

    /// Remove `base` from the parent's set; empty parents are removed from
    /// their own parents recursively.
    fn delete_directory_record<'a>(
        &'a self,
        key: &'a str,
        base_is_dir: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let Some((dir, base)) = split_directory_key(key, base_is_dir) else {
                return Ok(());
            };

            self.kv.zrem(&dir, &base).await?;

            if !self.kv.exists(&dir).await? {
                self.delete_directory_record(&dir, true).await?;
            }

            Ok(())
        })
    }

    fn trim_key(&self, key: &str) -> String {
        key.trim_start_matches(&self.key_prefix)
            .trim_start_matches('/')
            .to_string()
    }

    fn prefix_key(&self, key: &str) -> String {
        path_join(&self.key_prefix, key)
    }

    fn prefix_lock(&self, name: &str) -> String {
        self.prefix_key(&path_join("locks", name))
    }
}

/// Keep a held lock fresh until it is released or lost. Refreshing only
/// extends the TTL while the stored token still matches this holder.
fn spawn_refresh(lock: KvLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LOCK_REFRESH_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if lock.refresh(LOCK_TTL).await.is_err() {
                return;
            }
        }
    })
}

/// Split into `(parent, base)`, `None` at the top level. A trailing `/` on
/// the base marks it as a directory in the parent's index.
fn split_directory_key(key: &str, base_is_dir: bool) -> Option<(String, String)> {
    let (dir, base) = key.rsplit_once('/')?;
    if dir.is_empty() {
        return None;
    }

    let base = if base_is_dir {
        format!("{base}/")
    } else {
        base.to_string()
    };

    Some((dir.to_string(), base))
}

fn path_join(a: &str, b: &str) -> String {
    if a.is_empty() {
        return b.to_string();
    }
    if b.is_empty() {
        return a.to_string();
    }
    format!("{}/{}", a.trim_end_matches('/'), b.trim_start_matches('/'))
}
