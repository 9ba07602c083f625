//! Origin server client

use async_trait::async_trait;
use futures::StreamExt;
use http::header::HeaderMap;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::body::Body;
use crate::error::ProxyError;
use crate::fetcher::{FetchRequest, FetchResponse, Fetcher};

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Origin client configuration
#[derive(Clone, Debug)]
pub struct OriginClientConfig {
    /// Base URL of the origin serving the application
    pub url: String,
    /// Per-request timeout. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Skip TLS certificate verification
    pub skip_tls_verify: bool,
}

/// HTTP client for the origin server
pub struct OriginClient {
    config: OriginClientConfig,
    base: Url,
    client: Client,
}

impl OriginClient {
    /// Create a new origin client
    pub fn new(config: OriginClientConfig) -> Result<Self, ProxyError> {
        let base = Url::parse(&config.url)
            .map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", config.url, e)))?;

        if !matches!(base.scheme(), "http" | "https") {
            return Err(ProxyError::InvalidUrl(format!(
                "unsupported scheme in {}",
                config.url
            )));
        }

        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none());

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        if config.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build()?;

        info!("Created origin client for {}", config.url);

        Ok(Self {
            config,
            base,
            client,
        })
    }

    pub fn origin(&self) -> &str {
        &self.config.url
    }

    /// Resolve an origin-relative URI against the base URL, keeping any
    /// path prefix of the base
    fn resolve(&self, uri: &http::Uri) -> Result<Url, ProxyError> {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let base = self.base.as_str().trim_end_matches('/');
        let joined = format!("{}{}", base, path_and_query);

        Url::parse(&joined).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    /// Check if the origin is reachable
    pub async fn ping(&self) -> Result<bool, ProxyError> {
        let response = self.client.head(self.base.clone()).send().await?;
        Ok(!response.status().is_server_error())
    }
}

#[async_trait]
impl Fetcher for OriginClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ProxyError> {
        let url = self.resolve(request.uri())?;
        debug!("Fetching {} {}", request.method(), url);

        let response = self
            .client
            .request(request.method().clone(), url)
            .headers(forwardable(request.headers()))
            .body(request.body().clone())
            .send()
            .await?;

        let status = response.status();
        let headers = forwardable(response.headers());
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProxyError::Body(e.to_string())));

        let mut fetched = http::Response::builder()
            .status(status)
            .body(Body::from_stream(Box::pin(stream)))
            .map_err(|e| ProxyError::InvalidResponse(e.to_string()))?;
        *fetched.headers_mut() = headers;

        Ok(fetched)
    }
}

/// Copy headers, dropping hop-by-hop ones
fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP {
        forwarded.remove(*name);
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;

    fn client(url: &str) -> OriginClient {
        OriginClient::new(OriginClientConfig {
            url: url.to_string(),
            timeout: None,
            skip_tls_verify: false,
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_keeps_base_prefix() {
        let app = client("http://localhost:8080/app/");
        let uri: http::Uri = "/index.html?v=2".parse().unwrap();
        assert_eq!(
            app.resolve(&uri).unwrap().as_str(),
            "http://localhost:8080/app/index.html?v=2"
        );

        let root = client("http://localhost:8080");
        let uri: http::Uri = "/".parse().unwrap();
        assert_eq!(root.resolve(&uri).unwrap().as_str(), "http://localhost:8080/");
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let result = OriginClient::new(OriginClientConfig {
            url: "ftp://example.com".to_string(),
            timeout: None,
            skip_tls_verify: false,
        });
        assert!(matches!(result, Err(ProxyError::InvalidUrl(_))));
    }

    #[test]
    fn test_forwardable_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.local".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::ACCEPT, "text/html".parse().unwrap());

        let forwarded = forwardable(&headers);
        assert!(forwarded.get(header::HOST).is_none());
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert_eq!(forwarded.get(header::ACCEPT).unwrap(), "text/html");
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_network_failure() {
        // Port 9 (discard) on loopback is closed on any sane test host
        let client = client("http://127.0.0.1:9");
        let request = http::Request::builder()
            .uri("/index.html")
            .body(bytes::Bytes::new())
            .unwrap();

        let err = client.fetch(&request).await.unwrap_err();
        assert!(err.is_network_failure());
    }
}
