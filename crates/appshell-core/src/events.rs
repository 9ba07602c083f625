//! Event handler table
//!
//! Lifecycle and fetch events are dispatched through an explicit table
//! mapping each event kind to a handler. A handler returns a future; the
//! host awaits it before treating the phase as finished.

use appshell_proxy::FetchResponse;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::CoreError;
use crate::interceptor::FetchEvent;
use crate::worker::ControlMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message(ControlMessage),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message(_) => EventKind::Message,
        }
    }
}

/// What a handler produced
#[derive(Debug)]
pub enum EventOutcome {
    /// Lifecycle or message work finished
    Done,
    /// Response for a fetch event
    Response(FetchResponse),
}

pub type EventFuture = BoxFuture<'static, Result<EventOutcome, CoreError>>;

pub type EventHandler = Arc<dyn Fn(WorkerEvent) -> EventFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventTable {
    handlers: HashMap<EventKind, EventHandler>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an event kind, replacing any previous one
    pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(WorkerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<EventOutcome, CoreError>> + Send + 'static,
    {
        self.handlers
            .insert(kind, Arc::new(move |event| handler(event).boxed()));
    }

    /// Run the handler registered for the event's kind to completion
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, CoreError> {
        let kind = event.kind();
        let handler = self
            .handlers
            .get(&kind)
            .cloned()
            .ok_or(CoreError::NoHandler(kind))?;

        handler(event).await
    }
}
