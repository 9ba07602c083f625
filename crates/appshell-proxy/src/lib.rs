//! App Shell Cache Network Layer
//!
//! This crate provides the fetcher abstraction the interceptor talks to,
//! the single-use response body type, and the HTTP client for the origin
//! server.

pub mod body;
pub mod client;
pub mod error;
pub mod fetcher;
#[cfg(feature = "stub")]
pub mod stub;

pub use body::{Body, ByteStream};
pub use client::{OriginClient, OriginClientConfig};
pub use error::ProxyError;
pub use fetcher::{FetchRequest, FetchResponse, Fetcher};
#[cfg(feature = "stub")]
pub use stub::StubFetcher;
