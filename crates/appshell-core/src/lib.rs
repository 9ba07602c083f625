//! App Shell Cache Core Logic
//!
//! This crate provides the cache store manager, the request interceptor
//! with its offline fallback policy, and the worker lifecycle (install,
//! activate, control messages) driven through an explicit event table.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod interceptor;
pub mod response;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheConfig, CacheHandle, CacheManager, CacheStats};
pub use config::WorkerConfig;
pub use error::CoreError;
pub use events::{EventKind, EventOutcome, EventTable, WorkerEvent};
pub use host::{HostStatus, WorkerHost, WorkerStatus};
pub use interceptor::{FetchEvent, Outcome, RequestInterceptor};
pub use worker::{ControlMessage, ServiceWorker, WorkerState};
