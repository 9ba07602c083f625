//! Worker lifecycle: install, activate, control messages

use appshell_proxy::{FetchResponse, Fetcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::config::WorkerConfig;
use crate::error::CoreError;
use crate::events::{EventKind, EventOutcome, EventTable, WorkerEvent};
use crate::interceptor::{FetchEvent, RequestInterceptor};

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

/// Control signal sent by the hosting application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ControlMessage {
    /// Take over from the active worker without waiting for sessions to end
    #[serde(rename = "skipWaiting")]
    SkipWaiting,
    /// Delete every cache generation
    #[serde(rename = "clearCache")]
    ClearCache,
}

/// One deployed version: its configuration, interceptor and lifecycle state
pub struct ServiceWorker {
    id: Uuid,
    config: WorkerConfig,
    cache: Arc<CacheManager>,
    fetcher: Arc<dyn Fetcher>,
    interceptor: RequestInterceptor,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
    controlling: AtomicBool,
}

impl ServiceWorker {
    pub fn new(
        config: WorkerConfig,
        cache: Arc<CacheManager>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let interceptor = RequestInterceptor::new(cache.clone(), fetcher.clone(), &config);

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            cache,
            fetcher,
            interceptor,
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            controlling: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn generation(&self) -> &str {
        self.interceptor.generation()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn interceptor(&self) -> &RequestInterceptor {
        &self.interceptor
    }

    /// Move from `from` to `to`, failing if the worker is elsewhere
    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), CoreError> {
        let mut state = self.state.write();
        if *state != from {
            return Err(CoreError::InvalidState(format!(
                "worker {} is {:?}, expected {:?}",
                self.id, *state, from
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: WorkerState) {
        *self.state.write() = to;
    }

    /// Populate this version's generation with the app shell.
    ///
    /// On success the worker asks to take over immediately when forced
    /// takeover is configured. On failure it becomes redundant.
    pub async fn install(&self) -> Result<(), CoreError> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)?;
        info!("Installing worker {} ({})", self.id, self.generation());

        let result = async {
            let handle = self.cache.open(self.generation()).await?;
            self.cache
                .populate(&handle, self.fetcher.as_ref(), &self.config.app_shell)
                .await
        }
        .await;

        match result {
            Ok(count) => {
                self.set_state(WorkerState::Installed);
                info!("Worker {} installed, {} shell resources cached", self.id, count);
                if self.config.force_takeover {
                    self.skip_waiting();
                }
                metrics::counter!("appshell_lifecycle_events_total", "event" => "install").increment(1);
                Ok(())
            }
            Err(e) => {
                self.set_state(WorkerState::Redundant);
                error!("Failed to install worker {}: {}", self.id, e);
                Err(e)
            }
        }
    }

    /// Request takeover without waiting for existing sessions to end
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn wants_takeover(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Delete every generation but this version's, then claim all sessions.
    /// Returns the deleted generation names.
    pub async fn activate(&self) -> Result<Vec<String>, CoreError> {
        self.transition(WorkerState::Installed, WorkerState::Activating)?;
        info!("Activating worker {} ({})", self.id, self.generation());

        let deleted = match self.cache.delete_stale(self.generation()).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.set_state(WorkerState::Installed);
                error!("Failed to activate worker {}: {}", self.id, e);
                return Err(e);
            }
        };

        self.claim();
        self.set_state(WorkerState::Activated);
        info!(
            "Worker {} activated, removed {} stale generations",
            self.id,
            deleted.len()
        );
        metrics::counter!("appshell_lifecycle_events_total", "event" => "activate").increment(1);
        Ok(deleted)
    }

    /// Start intercepting every in-scope request, including those of
    /// sessions that began before this worker was activated
    pub fn claim(&self) {
        self.controlling.store(true, Ordering::SeqCst);
    }

    pub fn is_controlling(&self) -> bool {
        self.controlling.load(Ordering::SeqCst)
    }

    /// Replaced by a newer worker
    pub fn retire(&self) {
        self.controlling.store(false, Ordering::SeqCst);
        self.interceptor.disable_writes();
        self.set_state(WorkerState::Redundant);
        info!("Worker {} ({}) is now redundant", self.id, self.generation());
    }

    pub async fn handle_message(&self, message: ControlMessage) -> Result<(), CoreError> {
        info!("Worker {} received {:?}", self.id, message);

        match message {
            ControlMessage::SkipWaiting => self.skip_waiting(),
            ControlMessage::ClearCache => {
                let purged = self.cache.purge_all().await?;
                info!("Cleared {} cache generations", purged);
            }
        }

        Ok(())
    }

    pub async fn fetch(&self, event: FetchEvent) -> FetchResponse {
        self.interceptor.handle(event).await
    }

    /// Build the event table routing lifecycle, fetch and message events
    /// to this worker
    pub fn event_table(self: &Arc<Self>) -> EventTable {
        let mut table = EventTable::new();

        let worker = Arc::clone(self);
        table.on(EventKind::Install, move |_| {
            let worker = worker.clone();
            async move {
                worker.install().await?;
                Ok(EventOutcome::Done)
            }
        });

        let worker = Arc::clone(self);
        table.on(EventKind::Activate, move |_| {
            let worker = worker.clone();
            async move {
                worker.activate().await?;
                Ok(EventOutcome::Done)
            }
        });

        let worker = Arc::clone(self);
        table.on(EventKind::Fetch, move |event| {
            let worker = worker.clone();
            async move {
                match event {
                    WorkerEvent::Fetch(fetch) => Ok(EventOutcome::Response(worker.fetch(fetch).await)),
                    other => Err(CoreError::InvalidState(format!(
                        "fetch handler received {:?}",
                        other.kind()
                    ))),
                }
            }
        });

        let worker = Arc::clone(self);
        table.on(EventKind::Message, move |event| {
            let worker = worker.clone();
            async move {
                match event {
                    WorkerEvent::Message(message) => {
                        worker.handle_message(message).await?;
                        Ok(EventOutcome::Done)
                    }
                    other => Err(CoreError::InvalidState(format!(
                        "message handler received {:?}",
                        other.kind()
                    ))),
                }
            }
        });

        table
    }
}
