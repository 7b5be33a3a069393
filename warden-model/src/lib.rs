//! Shared data models for the Warden stream recorder.
//!
//! Everything the subsystems exchange lives here: the typed channel record
//! keyed by lower-cased name, the push event kinds and their complements,
//! and the status events fanned out to connected UI clients.

pub mod channel;
pub mod events;

pub use channel::{Channel, ChannelName, DownloadStatus, Quality};
pub use events::{EventKind, StatusUpdate, StreamEvent};
