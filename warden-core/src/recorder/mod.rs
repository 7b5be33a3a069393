//! Live media capture.
//!
//! The pool enforces at-most-one worker per channel and the cooldown
//! policy; each worker copies the stream to disk on its own OS thread
//! through the opaque extractor seam.

pub mod extract;
pub mod filename;
pub mod pool;
mod worker;

pub use extract::{CaptureRequest, StreamExtractor, StreamSource, StreamlinkExtractor};
pub use pool::{COOLDOWN, RecorderPool, StopReason};

#[cfg(any(test, feature = "test-support"))]
pub use extract::MockStreamExtractor;
