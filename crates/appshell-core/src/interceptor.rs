//! Request interceptor: cache-first serving with write-through and
//! offline fallback

use appshell_proxy::{FetchRequest, FetchResponse, Fetcher};
use appshell_storage::{MatchOptions, RequestKey, StoredResponse, VaryRule};
use http::{HeaderValue, Method, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::WorkerConfig;
use crate::response::{self, FALLBACK_HEADER};

/// A request arriving from a controlled session
#[derive(Debug)]
pub struct FetchEvent {
    pub request: FetchRequest,
}

impl FetchEvent {
    pub fn new(request: FetchRequest) -> Self {
        Self { request }
    }

    /// Cache key for the request: method plus path and query
    pub fn key(&self) -> RequestKey {
        let url = self
            .request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        RequestKey::new(self.request.method().as_str(), url)
    }
}

/// How a request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served from the current generation, no network access
    CacheHit,
    /// Fetched with status 200 and queued for write-through
    NetworkStored,
    /// Fetched with another status and returned as-is
    NetworkUncached,
    /// Network failed, served the cached shell document
    OfflineShell,
    /// Network failed, synthesized a 503
    Unavailable,
    /// Not a GET; forwarded without touching the cache
    PassThrough,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::CacheHit => "cache_hit",
            Outcome::NetworkStored => "network_stored",
            Outcome::NetworkUncached => "network_uncached",
            Outcome::OfflineShell => "offline_shell",
            Outcome::Unavailable => "unavailable",
            Outcome::PassThrough => "pass_through",
        }
    }
}

/// Per-request decision logic for one worker version
pub struct RequestInterceptor {
    cache: Arc<CacheManager>,
    fetcher: Arc<dyn Fetcher>,
    generation: String,
    shell_document: String,
    writes: TaskTracker,
    /// Cleared once this version's generation may no longer be written
    writable: Arc<AtomicBool>,
}

impl RequestInterceptor {
    pub fn new(cache: Arc<CacheManager>, fetcher: Arc<dyn Fetcher>, config: &WorkerConfig) -> Self {
        Self {
            cache,
            fetcher,
            generation: config.generation_name(),
            shell_document: config.shell_document.clone(),
            writes: TaskTracker::new(),
            writable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Tracker for detached write-through tasks. The response path never
    /// waits on it; hosts use it to drain pending writes at shutdown.
    pub fn pending_writes(&self) -> &TaskTracker {
        &self.writes
    }

    /// Drop write-throughs that have not started yet and refuse new ones
    pub fn disable_writes(&self) {
        self.writable.store(false, Ordering::SeqCst);
    }

    pub fn enable_writes(&self) {
        self.writable.store(true, Ordering::SeqCst);
    }

    /// Wait until every write-through spawned so far has finished
    pub async fn drain_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Answer a request. Always produces a response.
    pub async fn handle(&self, event: FetchEvent) -> FetchResponse {
        self.respond(event).await.0
    }

    /// Answer a request and report how it was answered
    pub async fn respond(&self, event: FetchEvent) -> (FetchResponse, Outcome) {
        let (response, outcome) = if event.request.method() == Method::GET {
            self.cache_first(event).await
        } else {
            (pass_through(self.fetcher.as_ref(), &event.request).await, Outcome::PassThrough)
        };

        metrics::counter!("appshell_requests_total", "outcome" => outcome.as_str()).increment(1);
        (response, outcome)
    }

    async fn cache_first(&self, event: FetchEvent) -> (FetchResponse, Outcome) {
        let key = event.key();
        let request = event.request;
        let handle = self.cache.handle(&self.generation);

        match self
            .cache
            .lookup(&handle, &key, request.headers(), MatchOptions::default())
            .await
        {
            Ok(Some(stored)) => {
                debug!("Serving {} from {}", key, self.generation);
                return (response::from_stored(stored), Outcome::CacheHit);
            }
            Ok(None) => debug!("Cache miss for {}, fetching from network", key),
            Err(e) => warn!("Cache lookup for {} failed, treating as miss: {}", key, e),
        }

        let fetched = match self.fetcher.fetch(&request).await {
            Ok(fetched) => fetched,
            Err(e) => {
                if e.is_network_failure() {
                    info!("Network unavailable for {}: {}", key, e);
                } else {
                    warn!("Fetch for {} failed: {}", key, e);
                }
                return self.fallback(&request).await;
            }
        };

        if fetched.status() != StatusCode::OK {
            debug!("Not caching {} (status {})", key, fetched.status());
            return (fetched, Outcome::NetworkUncached);
        }

        let (parts, body) = fetched.into_parts();
        let (body, snapshot) = match body.duplicate().await {
            Ok(duplicated) => duplicated,
            Err(e) => {
                info!("Response body for {} was interrupted: {}", key, e);
                return self.fallback(&request).await;
            }
        };

        let stored = response::to_stored(&parts, snapshot)
            .with_vary(VaryRule::capture(&parts.headers, request.headers()));
        self.write_through(key, stored);

        (FetchResponse::from_parts(parts, body), Outcome::NetworkStored)
    }

    /// Store a fetched response in the background. Failures are logged and
    /// dropped; the caller already has its response.
    fn write_through(&self, key: RequestKey, stored: StoredResponse) {
        let cache = Arc::clone(&self.cache);
        let generation = self.generation.clone();
        let writable = Arc::clone(&self.writable);

        self.writes.spawn(async move {
            if !writable.load(Ordering::SeqCst) {
                debug!("Dropping write-through of {}, {} is retired", key, generation);
                return;
            }

            let result = async {
                let handle = cache.open(&generation).await?;
                cache.write(&handle, &key, stored).await
            }
            .await;

            if let Err(e) = result {
                warn!("Write-through of {} into {} failed: {}", key, generation, e);
            }
        });
    }

    /// Offline policy: the shell document for HTML navigations, 503 otherwise
    async fn fallback(&self, request: &FetchRequest) -> (FetchResponse, Outcome) {
        if response::accepts_html(request.headers()) {
            let handle = self.cache.handle(&self.generation);
            let key = RequestKey::get(&self.shell_document);
            let options = MatchOptions { ignore_vary: true };

            match self.cache.lookup(&handle, &key, request.headers(), options).await {
                Ok(Some(stored)) => {
                    let mut shell = response::from_stored(stored);
                    shell
                        .headers_mut()
                        .insert(FALLBACK_HEADER, HeaderValue::from_static("shell"));
                    return (shell, Outcome::OfflineShell);
                }
                Ok(None) => warn!(
                    "Shell document {} missing from {}",
                    self.shell_document, self.generation
                ),
                Err(e) => warn!("Shell document lookup failed: {}", e),
            }
        }

        (response::unavailable(), Outcome::Unavailable)
    }
}

/// Forward a request untouched. A transport failure becomes a 502.
pub async fn pass_through(fetcher: &dyn Fetcher, request: &FetchRequest) -> FetchResponse {
    match fetcher.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("{} {} failed: {}", request.method(), request.uri(), e);
            response::bad_gateway()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{get, memory_cache, request, shell_fetcher};
    use crate::cache::CacheConfig;
    use appshell_proxy::StubFetcher;
    use appshell_storage::{MemoryStorage, StorageBackend, StorageError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::HeaderMap;

    /// Backend whose every operation fails
    struct BrokenStorage;

    #[async_trait]
    impl StorageBackend for BrokenStorage {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn create_generation(&self, _generation: &str) -> Result<bool, StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }

        async fn list_generations(&self) -> Result<Vec<String>, StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }

        async fn delete_generation(&self, _generation: &str) -> Result<bool, StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }

        async fn get(
            &self,
            _generation: &str,
            _key: &RequestKey,
        ) -> Result<Option<StoredResponse>, StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }

        async fn put(
            &self,
            _generation: &str,
            _key: &RequestKey,
            _response: StoredResponse,
        ) -> Result<(), StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }

        async fn entry_size(
            &self,
            _generation: &str,
            _key: &RequestKey,
        ) -> Result<Option<u64>, StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }

        async fn keys(&self, _generation: &str) -> Result<Vec<RequestKey>, StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }

        async fn usage(&self) -> Result<u64, StorageError> {
            Err(StorageError::Backend("disk unavailable".to_string()))
        }
    }

    fn interceptor(fetcher: Arc<StubFetcher>) -> (Arc<CacheManager>, RequestInterceptor) {
        let cache = memory_cache();
        let config = WorkerConfig::default();
        let interceptor = RequestInterceptor::new(cache.clone(), fetcher, &config);
        (cache, interceptor)
    }

    async fn settle(interceptor: &RequestInterceptor) {
        interceptor.drain_writes().await;
    }

    async fn lookup(cache: &CacheManager, path: &str) -> Option<StoredResponse> {
        cache
            .lookup(
                &cache.handle("appcache-v1"),
                &RequestKey::get(path),
                &HeaderMap::new(),
                MatchOptions::default(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let fetcher = Arc::new(shell_fetcher());
        let (cache, interceptor) = interceptor(fetcher.clone());
        let handle = cache.open("appcache-v1").await.unwrap();
        cache
            .write(
                &handle,
                &RequestKey::get("/js/app.js"),
                StoredResponse::new(200, "OK", vec![], Bytes::from_static(b"cached")),
            )
            .await
            .unwrap();

        let (response, outcome) = interceptor.respond(get("/js/app.js", None)).await;
        assert_eq!(outcome, Outcome::CacheHit);
        assert_eq!(response.into_body().collect().await.unwrap(), Bytes::from_static(b"cached"));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_writes_through() {
        let fetcher = Arc::new(shell_fetcher());
        let (cache, interceptor) = interceptor(fetcher.clone());

        let (response, outcome) = interceptor.respond(get("/css/styles.css", None)).await;
        assert_eq!(outcome, Outcome::NetworkStored);
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap();

        settle(&interceptor).await;

        let stored = lookup(&cache, "/css/styles.css").await.unwrap();
        assert_eq!(stored.status, 200);
        assert_eq!(stored.body, body);

        // Second request is served from cache
        let (_, outcome) = interceptor.respond(get("/css/styles.css", None)).await;
        assert_eq!(outcome, Outcome::CacheHit);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_200_is_returned_but_not_cached() {
        let fetcher = Arc::new(
            StubFetcher::new()
                .route("/moved", 301, "")
                .route("/error", 500, "boom"),
        );
        let (cache, interceptor) = interceptor(fetcher.clone());

        for path in ["/moved", "/error", "/missing"] {
            let (response, outcome) = interceptor.respond(get(path, None)).await;
            assert_eq!(outcome, Outcome::NetworkUncached);
            assert_ne!(response.status(), StatusCode::OK);
        }
        settle(&interceptor).await;

        assert!(cache.list_generations().await.unwrap().is_empty());
        assert_eq!(cache.stats().await.write_count, 0);
    }

    #[tokio::test]
    async fn test_non_get_bypasses_cache() {
        let fetcher = Arc::new(shell_fetcher().route("/api/tasks", 200, "created"));
        let (cache, interceptor) = interceptor(fetcher.clone());

        let (response, outcome) = interceptor
            .respond(request(Method::POST, "/api/tasks", Bytes::from_static(b"{}")))
            .await;
        assert_eq!(outcome, Outcome::PassThrough);
        assert_eq!(response.status(), StatusCode::OK);
        settle(&interceptor).await;

        let stats = cache.stats().await;
        assert_eq!(stats.hit_count + stats.miss_count + stats.write_count, 0);
        assert!(cache.list_generations().await.unwrap().is_empty());
        assert_eq!(fetcher.requests(), vec!["POST /api/tasks"]);
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_shell() {
        let fetcher = Arc::new(shell_fetcher());
        let (cache, interceptor) = interceptor(fetcher.clone());
        let handle = cache.open("appcache-v1").await.unwrap();
        cache
            .populate(&handle, fetcher.as_ref(), &["/index.html".to_string()])
            .await
            .unwrap();
        fetcher.set_online(false);

        // Any HTML navigation lands on the shell, not only the shell path
        for path in ["/index.html", "/tasks/42"] {
            let (response, outcome) = interceptor.respond(get(path, Some("text/html"))).await;
            if path == "/index.html" {
                // The shell itself is a plain cache hit
                assert_eq!(outcome, Outcome::CacheHit);
            } else {
                assert_eq!(outcome, Outcome::OfflineShell);
                assert_eq!(response.headers()[FALLBACK_HEADER], "shell");
            }
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.into_body().collect().await.unwrap(),
                Bytes::from_static(b"<html>shell</html>")
            );
        }
    }

    #[tokio::test]
    async fn test_offline_shell_for_uncached_document() {
        let fetcher = Arc::new(shell_fetcher());
        let (cache, interceptor) = interceptor(fetcher.clone());
        let handle = cache.open("appcache-v1").await.unwrap();
        cache
            .populate(&handle, fetcher.as_ref(), &["/index.html".to_string()])
            .await
            .unwrap();
        // Request for /index.html with a query has no entry of its own
        fetcher.set_online(false);

        let (response, outcome) = interceptor
            .respond(get("/index.html?utm=home", Some("text/html,*/*;q=0.8")))
            .await;
        assert_eq!(outcome, Outcome::OfflineShell);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_offline_resource_gets_503() {
        let fetcher = Arc::new(shell_fetcher());
        fetcher.set_online(false);
        let (_cache, interceptor) = interceptor(fetcher.clone());

        let (response, outcome) = interceptor
            .respond(get("/data.json", Some("application/json")))
            .await;
        assert_eq!(outcome, Outcome::Unavailable);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.into_body().collect().await.unwrap(),
            Bytes::from_static(response::UNAVAILABLE_BODY.as_bytes())
        );
    }

    #[tokio::test]
    async fn test_offline_html_without_shell_gets_503() {
        let fetcher = Arc::new(shell_fetcher());
        fetcher.set_online(false);
        let (_cache, interceptor) = interceptor(fetcher);

        let (response, outcome) = interceptor.respond(get("/", Some("text/html"))).await;
        assert_eq!(outcome, Outcome::Unavailable);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_vary_mismatch_goes_to_network() {
        let fetcher = Arc::new(StubFetcher::new().route_with_headers(
            "/greeting",
            200,
            &[("vary", "accept-language")],
            "hola",
        ));
        let (_cache, interceptor) = interceptor(fetcher.clone());

        let spanish = || {
            let mut event = get("/greeting", None);
            event
                .request
                .headers_mut()
                .insert(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("es"));
            event
        };

        assert_eq!(interceptor.respond(spanish()).await.1, Outcome::NetworkStored);
        settle(&interceptor).await;
        assert_eq!(interceptor.respond(spanish()).await.1, Outcome::CacheHit);
        assert_eq!(interceptor.respond(get("/greeting", None)).await.1, Outcome::NetworkStored);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_installed_entry_serves_clients_with_any_encoding() {
        let fetcher = Arc::new(StubFetcher::new().route_with_headers(
            "/css/styles.css",
            200,
            &[("vary", "accept-encoding")],
            "body {}",
        ));
        let (cache, interceptor) = interceptor(fetcher.clone());
        let handle = cache.open("appcache-v1").await.unwrap();
        cache
            .populate(&handle, fetcher.as_ref(), &["/css/styles.css".to_string()])
            .await
            .unwrap();
        fetcher.set_online(false);

        let mut event = get("/css/styles.css", None);
        event.request.headers_mut().insert(
            http::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );
        let (response, outcome) = interceptor.respond(event).await;
        assert_eq!(outcome, Outcome::CacheHit);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.into_body().collect().await.unwrap(), Bytes::from_static(b"body {}"));
    }

    #[tokio::test]
    async fn test_failed_write_through_keeps_response() {
        let fetcher = Arc::new(shell_fetcher());
        let cache = Arc::new(CacheManager::new(
            Arc::new(MemoryStorage::new()),
            CacheConfig { max_size: Some(1) },
        ));
        let interceptor = RequestInterceptor::new(cache.clone(), fetcher, &WorkerConfig::default());

        let (response, outcome) = interceptor.respond(get("/js/app.js", None)).await;
        assert_eq!(outcome, Outcome::NetworkStored);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.into_body().collect().await.unwrap(),
            Bytes::from_static(b"console.log('app')")
        );

        settle(&interceptor).await;
        assert_eq!(cache.stats().await.write_failures, 1);
        assert!(lookup(&cache, "/js/app.js").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_lookup_falls_back_to_network() {
        let fetcher = Arc::new(shell_fetcher());
        let cache = Arc::new(CacheManager::new(Arc::new(BrokenStorage), CacheConfig::default()));
        let interceptor =
            RequestInterceptor::new(cache, fetcher.clone(), &WorkerConfig::default());

        let (response, outcome) = interceptor.respond(get("/js/app.js", None)).await;
        assert_eq!(outcome, Outcome::NetworkStored);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fetcher.calls(), 1);
        settle(&interceptor).await;
    }

    #[tokio::test]
    async fn test_disabled_writes_are_dropped() {
        let fetcher = Arc::new(shell_fetcher());
        let (cache, interceptor) = interceptor(fetcher);
        interceptor.disable_writes();

        let (response, _) = interceptor.respond(get("/js/app.js", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        settle(&interceptor).await;
        assert!(cache.list_generations().await.unwrap().is_empty());

        interceptor.enable_writes();
        interceptor.respond(get("/js/app.js", None)).await;
        settle(&interceptor).await;
        assert!(lookup(&cache, "/js/app.js").await.is_some());
    }
}
