//! App Shell Cache Storage Layer
//!
//! This crate provides the storage abstraction for cache generations,
//! with in-memory and local disk backends.

pub mod backend;
pub mod entry;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{StorageBackend, validate_generation_name};
pub use entry::{MatchOptions, RequestKey, StoredResponse, VaryRule};
pub use error::StorageError;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
