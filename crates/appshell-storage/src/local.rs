//! Local disk storage backend

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::backend::{StorageBackend, validate_generation_name};
use crate::entry::{RequestKey, StoredResponse, VaryRule, compute_sha256};
use crate::error::StorageError;

/// Entry metadata as written to disk. The body lives in a blob file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    key: RequestKey,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    #[serde(default)]
    vary: VaryRule,
    stored_at: DateTime<Utc>,
    body_digest: String,
    body_size: u64,
}

/// Local disk storage backend
///
/// Each generation is a directory:
/// `<base_path>/<generation>/entries/<first 2 chars>/<key digest>.json` holds
/// the response metadata and
/// `<base_path>/<generation>/blobs/sha256/<first 2 chars>/<body digest>` the
/// body. Blobs are written before the entry record and every file goes
/// through a temp file and a rename, so readers never see a partial entry.
pub struct LocalStorage {
    base_path: PathBuf,
    temp_counter: AtomicU64,
}

impl LocalStorage {
    /// Create a new local storage backend
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();

        fs::create_dir_all(&base_path).await?;

        info!("Initialized local cache storage at {:?}", base_path);

        Ok(Self {
            base_path,
            temp_counter: AtomicU64::new(0),
        })
    }

    fn generation_path(&self, generation: &str) -> Result<PathBuf, StorageError> {
        validate_generation_name(generation)?;
        Ok(self.base_path.join(generation))
    }

    fn entry_path(&self, generation: &str, key: &RequestKey) -> Result<PathBuf, StorageError> {
        let digest = key.digest();
        Ok(self
            .generation_path(generation)?
            .join("entries")
            .join(&digest[..2])
            .join(format!("{}.json", digest)))
    }

    fn blob_path(&self, generation: &str, digest: &str) -> Result<PathBuf, StorageError> {
        Ok(self
            .generation_path(generation)?
            .join("blobs")
            .join("sha256")
            .join(&digest[..2])
            .join(digest))
    }

    /// Write `data` to `path` through a uniquely named temp file
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = path.with_extension(format!("{}.tmp", seq));
        fs::write(&temp_path, data).await?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }

    /// Read an entry record. A missing file is `None`.
    async fn read_record(&self, path: &Path) -> Result<Option<EntryRecord>, StorageError> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Every readable entry record under `root`
    async fn records(&self, root: &Path) -> Result<Vec<EntryRecord>, StorageError> {
        let mut records = Vec::new();

        for path in list_files(root).await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable entry {:?}: {}", path, e),
            }
        }

        Ok(records)
    }

    /// Remove a blob once no entry of the generation references it
    async fn collect_blob(&self, generation: &str, digest: &str) -> Result<(), StorageError> {
        let entries_root = self.generation_path(generation)?.join("entries");
        let referenced = self
            .records(&entries_root)
            .await?
            .iter()
            .any(|record| record.body_digest == digest);

        if !referenced {
            debug!("Removing unreferenced blob {} from {}", digest, generation);
            match fs::remove_file(self.blob_path(generation, digest)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(())
    }

    async fn require_generation(&self, generation: &str) -> Result<PathBuf, StorageError> {
        let path = self.generation_path(generation)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(generation.to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_generation(&self, generation: &str) -> Result<bool, StorageError> {
        let path = self.generation_path(generation)?;
        if fs::try_exists(&path).await? {
            return Ok(false);
        }

        fs::create_dir_all(path.join("entries")).await?;
        fs::create_dir_all(path.join("blobs").join("sha256")).await?;
        debug!("Created generation directory {:?}", path);
        Ok(true)
    }

    async fn list_generations(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_generation_name(&name).is_ok() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool, StorageError> {
        let path = self.generation_path(generation)?;
        debug!("Deleting generation directory {:?}", path);

        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn get(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StorageError> {
        let path = self.entry_path(generation, key)?;

        let Some(record) = self.read_record(&path).await? else {
            return Ok(None);
        };

        if record.key != *key {
            // Digest collision or a stale file; treat as absent
            warn!("Entry at {:?} belongs to {}, not {}", path, record.key, key);
            return Ok(None);
        }

        let blob_path = self.blob_path(generation, &record.body_digest)?;
        let body = match fs::read(&blob_path).await {
            Ok(body) => Bytes::from(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Entry {} references missing blob {}", key, record.body_digest);
                return Ok(None);
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        if body.len() as u64 != record.body_size {
            return Err(StorageError::Backend(format!(
                "blob {} is {} bytes, entry {} expects {}",
                record.body_digest,
                body.len(),
                key,
                record.body_size
            )));
        }

        Ok(Some(StoredResponse {
            status: record.status,
            status_text: record.status_text,
            headers: record.headers,
            body,
            vary: record.vary,
            stored_at: record.stored_at,
        }))
    }

    async fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), StorageError> {
        self.require_generation(generation).await?;

        let body_digest = compute_sha256(&response.body);
        let blob_path = self.blob_path(generation, &body_digest)?;

        // Blobs are content-addressed, an existing one already holds these bytes
        if !fs::try_exists(&blob_path).await? {
            self.write_atomic(&blob_path, &response.body).await?;
        }

        let record = EntryRecord {
            key: key.clone(),
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            vary: response.vary,
            stored_at: response.stored_at,
            body_size: response.body.len() as u64,
            body_digest,
        };
        let entry_path = self.entry_path(generation, key)?;
        let replaced = self
            .read_record(&entry_path)
            .await
            .ok()
            .flatten()
            .map(|old| old.body_digest)
            .filter(|digest| *digest != record.body_digest);

        debug!("Writing entry {} to {:?}", key, entry_path);
        self.write_atomic(&entry_path, &serde_json::to_vec(&record)?).await?;

        if let Some(digest) = replaced {
            // The entry is already replaced; a leftover blob only costs disk
            if let Err(e) = self.collect_blob(generation, &digest).await {
                warn!("Failed to remove blob {} from {}: {}", digest, generation, e);
            }
        }
        Ok(())
    }

    async fn entry_size(&self, generation: &str, key: &RequestKey) -> Result<Option<u64>, StorageError> {
        let path = self.entry_path(generation, key)?;
        Ok(self
            .read_record(&path)
            .await?
            .filter(|record| record.key == *key)
            .map(|record| record.body_size))
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>, StorageError> {
        let entries_root = self.require_generation(generation).await?.join("entries");

        let mut keys: Vec<RequestKey> = self
            .records(&entries_root)
            .await?
            .into_iter()
            .map(|record| record.key)
            .collect();

        keys.sort();
        Ok(keys)
    }

    async fn usage(&self) -> Result<u64, StorageError> {
        Ok(self
            .records(&self.base_path)
            .await?
            .iter()
            .map(|record| record.body_size)
            .sum())
    }
}

/// Recursively list regular files under `root`
async fn list_files(root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // Directory removed concurrently
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    Ok(files)
}
