//! Cache store manager

use appshell_proxy::Fetcher;
use appshell_storage::{MatchOptions, RequestKey, StorageBackend, StorageError, StoredResponse};
use bytes::Bytes;
use futures::future::try_join_all;
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::response::to_stored;

/// Configuration for the cache manager
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Maximum total size of all generations in bytes. `None` is unlimited.
    pub max_size: Option<u64>,
}

/// Runtime cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub write_count: u64,
    pub write_failures: u64,
}

/// Handle to an opened cache generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    name: String,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Cache manager for the versioned generations of request/response pairs
pub struct CacheManager {
    storage: Arc<dyn StorageBackend>,
    config: CacheConfig,
    stats: RwLock<CacheStats>,
}

impl CacheManager {
    /// Create a new cache manager
    pub fn new(storage: Arc<dyn StorageBackend>, config: CacheConfig) -> Self {
        info!(
            "Initializing cache manager (backend: {}, max_size: {})",
            storage.name(),
            config
                .max_size
                .map(|s| format!("{} bytes", s))
                .unwrap_or_else(|| "unlimited".to_string())
        );

        Self {
            storage,
            config,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Open a generation, creating it if needed
    pub async fn open(&self, generation: &str) -> Result<CacheHandle, CoreError> {
        if self.storage.create_generation(generation).await? {
            info!("Created cache generation {}", generation);
        }
        Ok(CacheHandle {
            name: generation.to_string(),
        })
    }

    /// Handle to a generation without creating it. Lookups against a
    /// generation that does not exist simply miss.
    pub fn handle(&self, generation: &str) -> CacheHandle {
        CacheHandle {
            name: generation.to_string(),
        }
    }

    /// Fetch every path and store the responses.
    ///
    /// All fetches complete before anything is written, so a failure on any
    /// path leaves the generation untouched by this call. Returns the number
    /// of entries written.
    pub async fn populate(
        &self,
        handle: &CacheHandle,
        fetcher: &dyn Fetcher,
        paths: &[String],
    ) -> Result<usize, CoreError> {
        info!("Populating {} with {} resources", handle.name, paths.len());

        let fetches = paths.iter().map(|path| async move {
            let install_failed = |reason: String| CoreError::InstallFailed {
                path: path.clone(),
                reason,
            };

            let request = http::Request::get(path.as_str())
                .body(Bytes::new())
                .map_err(|e| install_failed(e.to_string()))?;

            let response = fetcher
                .fetch(&request)
                .await
                .map_err(|e| install_failed(e.to_string()))?;

            if response.status() != StatusCode::OK {
                return Err(install_failed(format!("status {}", response.status())));
            }

            let (parts, body) = response.into_parts();
            let body = body.collect().await.map_err(|e| install_failed(e.to_string()))?;
            debug!("Fetched {} ({} bytes)", path, body.len());

            // The install request carries no client headers, so shell
            // entries are stored without a vary rule and match any client
            Ok((RequestKey::get(path), to_stored(&parts, body)))
        });

        let entries = try_join_all(fetches).await?;
        let count = entries.len();

        for (key, response) in entries {
            self.write(handle, &key, response).await?;
        }

        info!("Populated {} with {} entries", handle.name, count);
        Ok(count)
    }

    /// Exact-match lookup in one generation
    pub async fn lookup(
        &self,
        handle: &CacheHandle,
        key: &RequestKey,
        request_headers: &HeaderMap,
        options: MatchOptions,
    ) -> Result<Option<StoredResponse>, CoreError> {
        let entry = self
            .storage
            .get(&handle.name, key)
            .await?
            .filter(|entry| entry.matches(request_headers, options));

        let mut stats = self.stats.write().await;
        if entry.is_some() {
            stats.hit_count += 1;
        } else {
            stats.miss_count += 1;
        }

        Ok(entry)
    }

    /// Store a response, replacing any entry for the same key.
    ///
    /// Only status 200 responses are accepted.
    pub async fn write(
        &self,
        handle: &CacheHandle,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), CoreError> {
        let result = self.try_write(handle, key, response).await;

        let mut stats = self.stats.write().await;
        match &result {
            Ok(()) => {
                stats.write_count += 1;
                metrics::counter!("appshell_cache_writes_total", "result" => "ok").increment(1);
            }
            Err(_) => {
                stats.write_failures += 1;
                metrics::counter!("appshell_cache_writes_total", "result" => "error").increment(1);
            }
        }

        result
    }

    async fn try_write(
        &self,
        handle: &CacheHandle,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), CoreError> {
        if response.status != StatusCode::OK.as_u16() {
            return Err(CoreError::NotCacheable(response.status));
        }

        if let Some(max_size) = self.config.max_size {
            // An overwrite frees the bytes of the entry it replaces
            let replaced = self.storage.entry_size(&handle.name, key).await?.unwrap_or(0);
            let used = self.storage.usage().await?.saturating_sub(replaced);
            let required = response.size();
            if used + required > max_size {
                return Err(StorageError::QuotaExceeded {
                    required,
                    available: max_size.saturating_sub(used),
                }
                .into());
            }
        }

        debug!("Caching {} in {} ({} bytes)", key, handle.name, response.size());
        self.storage.put(&handle.name, key, response).await?;
        Ok(())
    }

    /// Keys stored in a generation
    pub async fn keys(&self, handle: &CacheHandle) -> Result<Vec<RequestKey>, CoreError> {
        Ok(self.storage.keys(&handle.name).await?)
    }

    /// List every generation
    pub async fn list_generations(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.storage.list_generations().await?)
    }

    /// Delete a generation
    pub async fn delete(&self, generation: &str) -> Result<bool, CoreError> {
        debug!("Deleting cache generation {}", generation);
        Ok(self.storage.delete_generation(generation).await?)
    }

    /// Delete every generation except `current`. Returns the deleted names.
    pub async fn delete_stale(&self, current: &str) -> Result<Vec<String>, CoreError> {
        let mut deleted = Vec::new();

        for generation in self.list_generations().await? {
            if generation == current {
                continue;
            }
            info!("Deleting stale cache generation {}", generation);
            if self.delete(&generation).await? {
                deleted.push(generation);
            }
        }

        Ok(deleted)
    }

    /// Delete every generation unconditionally. Returns how many were removed.
    pub async fn purge_all(&self) -> Result<usize, CoreError> {
        info!("Purging all cache generations");

        let mut purged = 0;
        for generation in self.list_generations().await? {
            match self.delete(&generation).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to delete generation {}: {}", generation, e),
            }
        }

        info!("Purged {} cache generations", purged);
        Ok(purged)
    }
}
