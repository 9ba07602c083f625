//! App shell cache HTTP API
//!
//! This crate provides the Axum router that fronts the worker host. Every
//! request outside the control endpoints becomes a fetch event.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
