//! Shared fixtures for unit tests

use appshell_proxy::StubFetcher;
use appshell_storage::MemoryStorage;
use bytes::Bytes;
use http::Method;
use std::sync::Arc;

use crate::cache::{CacheConfig, CacheManager};
use crate::interceptor::FetchEvent;

pub fn memory_cache() -> Arc<CacheManager> {
    Arc::new(CacheManager::new(
        Arc::new(MemoryStorage::new()),
        CacheConfig::default(),
    ))
}

/// Origin serving the default app shell
pub fn shell_fetcher() -> StubFetcher {
    StubFetcher::new()
        .route("/", 200, "<html>root</html>")
        .route_with_headers("/index.html", 200, &[("content-type", "text/html")], "<html>shell</html>")
        .route("/css/styles.css", 200, "body { margin: 0 }")
        .route("/js/app.js", 200, "console.log('app')")
        .route("/manifest.json", 200, "{\"name\":\"Tasks\"}")
        .route("/icons/icon-192x192.png", 200, "png-192")
        .route("/icons/icon-512x512.png", 200, "png-512")
}

pub fn request(method: Method, path: &str, body: Bytes) -> FetchEvent {
    let request = http::Request::builder()
        .method(method)
        .uri(path)
        .body(body)
        .expect("valid request");
    FetchEvent::new(request)
}

pub fn get(path: &str, accept: Option<&str>) -> FetchEvent {
    let mut builder = http::Request::get(path);
    if let Some(accept) = accept {
        builder = builder.header(http::header::ACCEPT, accept);
    }
    FetchEvent::new(builder.body(Bytes::new()).expect("valid request"))
}
