//! In-process fetcher with canned responses

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::body::Body;
use crate::error::ProxyError;
use crate::fetcher::{FetchRequest, FetchResponse, Fetcher};

#[derive(Clone)]
struct StubRoute {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

/// A [`Fetcher`] that answers from a fixed route table.
///
/// Counts every call, can be switched offline to simulate a dead network,
/// and answers 404 for unknown paths. Bodies are returned as streams so
/// callers exercise the same single-use path as with a real origin.
pub struct StubFetcher {
    routes: RwLock<HashMap<String, StubRoute>>,
    online: AtomicBool,
    calls: AtomicUsize,
    requests: RwLock<Vec<String>>,
}

impl Default for StubFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StubFetcher {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            requests: RwLock::new(Vec::new()),
        }
    }

    /// Add a route (builder style)
    pub fn route(self, path: &str, status: u16, body: &'static str) -> Self {
        self.set_route(path, status, Vec::new(), Bytes::from_static(body.as_bytes()));
        self
    }

    /// Add a route with response headers (builder style)
    pub fn route_with_headers(
        self,
        path: &str,
        status: u16,
        headers: &[(&str, &str)],
        body: &'static str,
    ) -> Self {
        let headers = headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        self.set_route(path, status, headers, Bytes::from_static(body.as_bytes()));
        self
    }

    pub fn set_route(&self, path: &str, status: u16, headers: Vec<(String, String)>, body: Bytes) {
        self.routes.write().insert(
            path.to_string(),
            StubRoute {
                status,
                headers,
                body,
            },
        );
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of fetches attempted, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `"METHOD /path"` for every fetch attempted, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.read().clone()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, ProxyError> {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .write()
            .push(format!("{} {}", request.method(), path));

        if !self.online.load(Ordering::SeqCst) {
            return Err(ProxyError::Unreachable(path));
        }

        let route = self.routes.read().get(&path).cloned();
        let route = route.unwrap_or(StubRoute {
            status: 404,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from_static(b"Not Found"),
        });

        let body = route.body;
        let mut builder = http::Response::builder().status(route.status);
        for (name, value) in &route.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
            .body(Body::from_stream(Box::pin(stream::once(async move { Ok(body) }))))
            .map_err(|e| ProxyError::InvalidResponse(e.to_string()))
    }
}
