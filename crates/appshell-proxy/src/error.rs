//! Proxy error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Origin unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Response body error: {0}")]
    Body(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProxyError {
    /// Whether the failure came from the transport (connectivity, DNS,
    /// timeout, interrupted body) rather than from a malformed request
    pub fn is_network_failure(&self) -> bool {
        match self {
            ProxyError::Http(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
            }
            ProxyError::Unreachable(_) | ProxyError::Body(_) => true,
            ProxyError::InvalidUrl(_) | ProxyError::InvalidResponse(_) => false,
        }
    }
}
