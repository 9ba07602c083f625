//! Cache management module

mod manager;

pub use manager::{CacheConfig, CacheHandle, CacheManager, CacheStats};
