//! HTTP front-end for the Warden stream recorder.
//!
//! The engine in `warden-core` is authoritative; this crate only
//! translates between HTTP and the supervisor's API surface.

use std::sync::Arc;

use warden_core::supervisor::Supervisor;

pub mod events;
pub mod handlers;
pub mod routes;

/// Server application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}
