//! In-memory storage backend

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::backend::{StorageBackend, validate_generation_name};
use crate::entry::{RequestKey, StoredResponse};
use crate::error::StorageError;

type Generation = HashMap<RequestKey, Arc<StoredResponse>>;

/// In-memory storage backend
///
/// Entries are held behind `Arc` and replaced under the write lock, so a
/// reader always clones a complete snapshot.
#[derive(Default)]
pub struct MemoryStorage {
    generations: RwLock<BTreeMap<String, Generation>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_generation(&self, generation: &str) -> Result<bool, StorageError> {
        validate_generation_name(generation)?;

        let mut generations = self.generations.write();
        if generations.contains_key(generation) {
            return Ok(false);
        }
        generations.insert(generation.to_string(), Generation::new());
        debug!("Created in-memory generation {}", generation);
        Ok(true)
    }

    async fn list_generations(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.generations.read().keys().cloned().collect())
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool, StorageError> {
        Ok(self.generations.write().remove(generation).is_some())
    }

    async fn get(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StorageError> {
        let generations = self.generations.read();
        Ok(generations
            .get(generation)
            .and_then(|entries| entries.get(key))
            .map(|entry| entry.as_ref().clone()))
    }

    async fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), StorageError> {
        let mut generations = self.generations.write();
        let entries = generations
            .get_mut(generation)
            .ok_or_else(|| StorageError::NotFound(generation.to_string()))?;
        entries.insert(key.clone(), Arc::new(response));
        Ok(())
    }

    async fn entry_size(&self, generation: &str, key: &RequestKey) -> Result<Option<u64>, StorageError> {
        let generations = self.generations.read();
        Ok(generations
            .get(generation)
            .and_then(|entries| entries.get(key))
            .map(|entry| entry.size()))
    }

    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>, StorageError> {
        let generations = self.generations.read();
        let entries = generations
            .get(generation)
            .ok_or_else(|| StorageError::NotFound(generation.to_string()))?;
        let mut keys: Vec<RequestKey> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn usage(&self) -> Result<u64, StorageError> {
        Ok(self
            .generations
            .read()
            .values()
            .flat_map(|entries| entries.values())
            .map(|entry| entry.size())
            .sum())
    }
}
