//! Worker host: owns the active and waiting workers and routes events

use appshell_proxy::{FetchResponse, Fetcher};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheManager, CacheStats};
use crate::error::CoreError;
use crate::events::{EventOutcome, EventTable, WorkerEvent};
use crate::interceptor::{FetchEvent, pass_through};
use crate::response;
use crate::worker::{ControlMessage, ServiceWorker, WorkerState};

#[derive(Clone)]
struct Registration {
    worker: Arc<ServiceWorker>,
    events: EventTable,
}

/// Snapshot of one worker for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: Uuid,
    pub version: String,
    pub generation: String,
    pub state: WorkerState,
    pub controlling: bool,
}

impl WorkerStatus {
    fn of(worker: &ServiceWorker) -> Self {
        Self {
            id: worker.id(),
            version: worker.version().to_string(),
            generation: worker.generation().to_string(),
            state: worker.state(),
            controlling: worker.is_controlling(),
        }
    }
}

/// Snapshot of the host for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub active: Option<WorkerStatus>,
    pub waiting: Option<WorkerStatus>,
    pub generations: Vec<String>,
    pub stats: CacheStats,
}

/// Hosts workers the way a browser hosts service worker registrations:
/// at most one active worker controls requests, a newer installed worker
/// may wait until it is allowed to take over.
pub struct WorkerHost {
    cache: Arc<CacheManager>,
    fetcher: Arc<dyn Fetcher>,
    active: RwLock<Option<Registration>>,
    waiting: RwLock<Option<Registration>>,
    lifecycle: Mutex<()>,
}

impl WorkerHost {
    pub fn new(cache: Arc<CacheManager>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache,
            fetcher,
            active: RwLock::new(None),
            waiting: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn active(&self) -> Option<Arc<ServiceWorker>> {
        self.active.read().as_ref().map(|r| r.worker.clone())
    }

    pub fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        self.waiting.read().as_ref().map(|r| r.worker.clone())
    }

    /// Install a worker and, if allowed, activate it.
    ///
    /// Returns once install (and activation, when it happens) has fully
    /// completed. If install fails the previously active worker keeps
    /// serving and the error is returned.
    pub async fn register(&self, worker: Arc<ServiceWorker>) -> Result<WorkerState, CoreError> {
        let _guard = self.lifecycle.lock().await;

        let registration = Registration {
            events: worker.event_table(),
            worker: worker.clone(),
        };

        registration.events.dispatch(WorkerEvent::Install).await?;

        if let Some(previous) = self.waiting.write().replace(registration) {
            previous.worker.retire();
        }

        let has_active = self.active.read().is_some();
        if !has_active || worker.wants_takeover() {
            self.promote_waiting().await?;
        } else {
            info!(
                "Worker {} ({}) installed and waiting",
                worker.id(),
                worker.generation()
            );
        }

        Ok(worker.state())
    }

    /// Activate the waiting worker and make it the controller.
    /// Caller must hold the lifecycle lock.
    async fn promote_waiting(&self) -> Result<bool, CoreError> {
        let Some(next) = self.waiting.write().take() else {
            return Ok(false);
        };

        // Outgoing writes must land before activation deletes their generation
        let outgoing = self.active();
        if let Some(outgoing) = &outgoing {
            outgoing.interceptor().disable_writes();
            outgoing.interceptor().drain_writes().await;
        }

        if let Err(e) = next.events.dispatch(WorkerEvent::Activate).await {
            if let Some(outgoing) = &outgoing {
                outgoing.interceptor().enable_writes();
            }
            *self.waiting.write() = Some(next);
            return Err(e);
        }

        let worker = next.worker.clone();
        let previous = self.active.write().replace(next);
        if let Some(previous) = previous {
            previous.worker.retire();
        }

        info!(
            "Worker {} ({}) is now controlling requests",
            worker.id(),
            worker.generation()
        );
        Ok(true)
    }

    /// Natural hand-off: the hosting application reports every session of
    /// the old worker closed. Promotes the waiting worker, if any.
    pub async fn release(&self) -> Result<bool, CoreError> {
        let _guard = self.lifecycle.lock().await;
        self.promote_waiting().await
    }

    /// Deliver a control message. The waiting worker receives it if there
    /// is one, so `skipWaiting` promotes it immediately.
    pub async fn post_message(&self, message: ControlMessage) -> Result<(), CoreError> {
        let _guard = self.lifecycle.lock().await;

        let target = self
            .waiting
            .read()
            .clone()
            .or_else(|| self.active.read().clone())
            .ok_or_else(|| CoreError::InvalidState("no worker registered".to_string()))?;

        target.events.dispatch(WorkerEvent::Message(message)).await?;

        let waiting_wants_takeover = self
            .waiting
            .read()
            .as_ref()
            .is_some_and(|r| r.worker.wants_takeover());
        if waiting_wants_takeover {
            self.promote_waiting().await?;
        }

        Ok(())
    }

    /// Answer a request. Without a controlling worker the request goes
    /// straight to the network.
    pub async fn fetch(&self, event: FetchEvent) -> FetchResponse {
        let active = self.active.read().clone();

        match active {
            Some(registration) if registration.worker.is_controlling() => {
                match registration.events.dispatch(WorkerEvent::Fetch(event)).await {
                    Ok(EventOutcome::Response(response)) => response,
                    Ok(EventOutcome::Done) => {
                        warn!("Fetch handler finished without a response");
                        response::unavailable()
                    }
                    Err(e) => {
                        warn!("Fetch handler failed: {}", e);
                        response::unavailable()
                    }
                }
            }
            _ => pass_through(self.fetcher.as_ref(), &event.request).await,
        }
    }

    pub async fn status(&self) -> Result<HostStatus, CoreError> {
        let active = self.active().map(|w| WorkerStatus::of(&w));
        let waiting = self.waiting().map(|w| WorkerStatus::of(&w));

        Ok(HostStatus {
            active,
            waiting,
            generations: self.cache.list_generations().await?,
            stats: self.cache.stats().await,
        })
    }

    /// Wait for pending write-through tasks of the current workers.
    /// Retired workers were drained when they were replaced.
    pub async fn shutdown(&self) {
        for worker in [self.active(), self.waiting()].into_iter().flatten() {
            let writes = worker.interceptor().pending_writes();
            writes.close();
            writes.wait().await;
        }
        info!("Worker host stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::testing::{get, memory_cache, shell_fetcher};
    use appshell_proxy::StubFetcher;
    use http::StatusCode;

    fn host() -> (Arc<StubFetcher>, WorkerHost) {
        let fetcher = Arc::new(shell_fetcher());
        let host = WorkerHost::new(memory_cache(), fetcher.clone());
        (fetcher, host)
    }

    fn worker(host: &WorkerHost, config: WorkerConfig) -> Arc<ServiceWorker> {
        Arc::new(ServiceWorker::new(config, host.cache().clone(), host.fetcher().clone()).unwrap())
    }

    #[tokio::test]
    async fn test_first_worker_activates() {
        let (_fetcher, host) = host();
        let v1 = worker(&host, WorkerConfig::default());

        assert_eq!(host.register(v1.clone()).await.unwrap(), WorkerState::Activated);
        assert_eq!(host.active().unwrap().id(), v1.id());
        assert!(host.waiting().is_none());
    }

    #[tokio::test]
    async fn test_requests_pass_through_before_activation() {
        let (fetcher, host) = host();

        let response = host.fetch(get("/js/app.js", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fetcher.calls(), 1);
        assert!(host.cache().list_generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_version_takes_over_and_collects_garbage() {
        let (_fetcher, host) = host();
        let v1 = worker(&host, WorkerConfig::default());
        let v2 = worker(&host, WorkerConfig::default().with_version("v2"));

        host.register(v1.clone()).await.unwrap();
        host.register(v2.clone()).await.unwrap();

        assert_eq!(host.active().unwrap().id(), v2.id());
        assert_eq!(v1.state(), WorkerState::Redundant);
        assert!(!v1.is_controlling());
        assert_eq!(
            host.cache().list_generations().await.unwrap(),
            vec!["appcache-v2"]
        );
    }

    #[tokio::test]
    async fn test_pending_write_of_replaced_worker_is_dropped() {
        let (fetcher, host) = host();
        let v1 = worker(&host, WorkerConfig::default());
        host.register(v1.clone()).await.unwrap();

        fetcher.set_route("/data.json", 200, vec![], bytes::Bytes::from_static(b"{}"));
        let response = host.fetch(get("/data.json", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        host.register(worker(&host, WorkerConfig::default().with_version("v2")))
            .await
            .unwrap();
        assert_eq!(host.cache().list_generations().await.unwrap(), vec!["appcache-v2"]);

        // A retired worker still answering a stale client writes nothing
        let (response, _) = v1.interceptor().respond(get("/data.json?late", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        v1.interceptor().drain_writes().await;
        host.shutdown().await;

        assert_eq!(v1.state(), WorkerState::Redundant);
        assert_eq!(host.cache().list_generations().await.unwrap(), vec!["appcache-v2"]);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let (fetcher, host) = host();
        let v1 = worker(&host, WorkerConfig::default());
        host.register(v1.clone()).await.unwrap();

        fetcher.set_route("/manifest.json", 404, vec![], bytes::Bytes::new());
        let v2 = worker(&host, WorkerConfig::default().with_version("v2"));

        assert!(host.register(v2.clone()).await.is_err());
        assert_eq!(v2.state(), WorkerState::Redundant);
        assert_eq!(host.active().unwrap().id(), v1.id());
        assert!(host.waiting().is_none());

        // v1 still serves its shell
        fetcher.set_online(false);
        let response = host.fetch(get("/", Some("text/html"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_waiting_worker_promoted_by_skip_waiting() {
        let (_fetcher, host) = host();
        host.register(worker(&host, WorkerConfig::default())).await.unwrap();

        let patient = WorkerConfig {
            force_takeover: false,
            ..WorkerConfig::default().with_version("v2")
        };
        let v2 = worker(&host, patient);

        assert_eq!(host.register(v2.clone()).await.unwrap(), WorkerState::Installed);
        assert_eq!(host.waiting().unwrap().id(), v2.id());
        // Stale generations survive until v2 activates
        assert_eq!(host.cache().list_generations().await.unwrap().len(), 2);

        host.post_message(ControlMessage::SkipWaiting).await.unwrap();
        assert_eq!(host.active().unwrap().id(), v2.id());
        assert_eq!(v2.state(), WorkerState::Activated);
        assert_eq!(host.cache().list_generations().await.unwrap(), vec!["appcache-v2"]);
    }

    #[tokio::test]
    async fn test_release_promotes_waiting_worker() {
        let (_fetcher, host) = host();
        host.register(worker(&host, WorkerConfig::default())).await.unwrap();

        let v2 = worker(
            &host,
            WorkerConfig {
                force_takeover: false,
                ..WorkerConfig::default().with_version("v2")
            },
        );
        host.register(v2.clone()).await.unwrap();

        assert!(host.release().await.unwrap());
        assert_eq!(host.active().unwrap().id(), v2.id());
        assert!(!host.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_cache_message() {
        let (_fetcher, host) = host();
        assert!(matches!(
            host.post_message(ControlMessage::ClearCache).await,
            Err(CoreError::InvalidState(_))
        ));

        host.register(worker(&host, WorkerConfig::default())).await.unwrap();
        host.cache().open("appcache-v0").await.unwrap();
        assert_eq!(host.cache().list_generations().await.unwrap().len(), 2);

        host.post_message(ControlMessage::ClearCache).await.unwrap();
        assert!(host.cache().list_generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let (fetcher, host) = host();
        host.register(worker(&host, WorkerConfig::default())).await.unwrap();

        // Miss that triggers a background write
        fetcher.set_route("/data.json", 200, vec![], bytes::Bytes::from_static(b"{}"));
        let response = host.fetch(get("/data.json", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        host.shutdown().await;

        let status = host.status().await.unwrap();
        let active = status.active.unwrap();
        assert_eq!(active.generation, "appcache-v1");
        assert_eq!(active.state, WorkerState::Activated);
        assert!(status.waiting.is_none());
        assert_eq!(status.generations, vec!["appcache-v1"]);
        // Seven shell entries plus the write-through
        assert_eq!(status.stats.write_count, 8);
    }
}
