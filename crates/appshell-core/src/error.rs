//! Core error types

use thiserror::Error;

use crate::events::EventKind;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] appshell_storage::StorageError),

    #[error("Network error: {0}")]
    Proxy(#[from] appshell_proxy::ProxyError),

    #[error("Install failed fetching {path}: {reason}")]
    InstallFailed { path: String, reason: String },

    #[error("Response with status {0} is not cacheable")]
    NotCacheable(u16),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No handler registered for {0:?} events")]
    NoHandler(EventKind),
}
