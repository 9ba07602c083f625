//! Storage backend trait

use async_trait::async_trait;

use crate::entry::{RequestKey, StoredResponse};
use crate::error::StorageError;

/// Maximum length of a generation name
pub const MAX_GENERATION_NAME_LEN: usize = 128;

/// Storage backend trait
///
/// A backend holds any number of named cache generations, each mapping
/// request keys to immutable response snapshots. Implementations must make
/// `put` atomic with respect to a concurrent `get` of the same key: a reader
/// sees either the previous entry or the new one.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Create a generation if it does not exist. Returns true if it was created.
    async fn create_generation(&self, generation: &str) -> Result<bool, StorageError>;

    /// List all generation names, sorted
    async fn list_generations(&self) -> Result<Vec<String>, StorageError>;

    /// Delete a generation and all its entries. Returns false if it did not exist.
    async fn delete_generation(&self, generation: &str) -> Result<bool, StorageError>;

    /// Read an entry
    async fn get(
        &self,
        generation: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StorageError>;

    /// Insert or replace an entry. The generation must exist.
    async fn put(
        &self,
        generation: &str,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), StorageError>;

    /// Body size of an entry, without reading the body
    async fn entry_size(&self, generation: &str, key: &RequestKey) -> Result<Option<u64>, StorageError>;

    /// List the keys stored in a generation
    async fn keys(&self, generation: &str) -> Result<Vec<RequestKey>, StorageError>;

    /// Total body bytes of every entry across all generations
    async fn usage(&self) -> Result<u64, StorageError>;
}

/// Validate a generation name.
///
/// Names double as directory names for the local backend, so path
/// separators, leading dots and anything outside `[A-Za-z0-9._-]` are rejected.
pub fn validate_generation_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.len() > MAX_GENERATION_NAME_LEN {
        return Err(StorageError::InvalidGeneration(format!(
            "name must be 1-{} characters: {:?}",
            MAX_GENERATION_NAME_LEN, name
        )));
    }

    if name.starts_with('.') {
        return Err(StorageError::InvalidGeneration(format!(
            "name must not start with '.': {}",
            name
        )));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(StorageError::InvalidGeneration(format!(
            "invalid character {:?} in {}",
            c, name
        )));
    }

    Ok(())
}
