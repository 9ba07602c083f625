//! Network fetcher abstraction

use async_trait::async_trait;
use bytes::Bytes;

use crate::body::Body;
use crate::error::ProxyError;

/// An outgoing request. The URI is origin-relative (path and query).
pub type FetchRequest = http::Request<Bytes>;

/// A network response with a single-use body
pub type FetchResponse = http::Response<Body>;

/// Something that can perform a request against the live network.
///
/// An `Err` means no response was received at all; any HTTP status,
/// including errors, comes back as `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ProxyError>;
}
