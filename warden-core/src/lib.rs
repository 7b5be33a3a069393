//! # Warden core
//!
//! The real-time event and capture engine behind the Warden stream
//! recorder: a push-notification multiplexer, a subscription-lifecycle
//! reconciler, a recorder pool, a token-refresh coordinator and the
//! supervisor loop that ties them together.
//!
//! ## Architecture
//!
//! - [`upstream`] — rate-limit-aware request layer over the platform's
//!   GQL and Helix APIs, with a two-tier metadata cache.
//! - [`token`] — single-writer owner of the OAuth bundle; proactive
//!   refresh, atomic persistence, refresh event fan-out.
//! - [`push`] — up to three EventSub WebSocket sessions, each carrying a
//!   small batch of per-channel subscriptions; self-healing.
//! - [`recorder`] — one capture worker per live channel, blocking media
//!   I/O on dedicated OS threads, cooldown-guarded restarts.
//! - [`supervisor`] — roster owner, fallback polling and the periodic
//!   self-heal cycle.

/// Error taxonomy shared by all subsystems
pub mod error;

/// Environment-driven configuration
pub mod config;

/// Upstream request layer (GQL metadata + Helix subscription CRUD)
pub mod upstream;

/// OAuth token bundle management
pub mod token;

/// EventSub push subscription manager
pub mod push;

/// Recording pool and capture workers
pub mod recorder;

/// Persistent channel roster
pub mod roster;

/// Top-level control loop
pub mod supervisor;

mod util;

pub use config::Config;
pub use error::{CoreError, Result};
pub use roster::RosterStore;
pub use supervisor::Supervisor;
