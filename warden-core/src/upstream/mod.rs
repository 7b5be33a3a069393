//! Request layer over the platform's HTTPS APIs.
//!
//! Channel lookup and metadata go through the public GQL endpoint;
//! subscription CRUD goes through Helix with the operator's bearer token.
//! The client is stateless apart from an in-flight concurrency limiter,
//! a short-lived metadata cache and the shared retry-after deadline.

mod client;
mod types;

pub use client::{RetryAfterGate, UpstreamClient};
pub use types::{ChannelMetadata, SubscriptionRecord};

use async_trait::async_trait;
use warden_model::{ChannelName, EventKind};

use crate::error::Result;

/// The seam between the engine and the platform's APIs.
///
/// Subscription calls take the bearer token explicitly: the token manager
/// is the single owner of credentials and callers fetch a fresh token per
/// operation, exactly like every other consumer.
#[cfg_attr(any(test, feature = "test-support"), mockall::automock)]
#[async_trait]
pub trait ChannelApi: Send + Sync {
    /// Resolve a login to an upstream broadcaster id.
    async fn lookup_id(&self, name: &ChannelName) -> Result<Option<String>>;

    /// Fresh-enough channel metadata (live flag, title, thumbnail, images).
    async fn get_channel(&self, id: &str) -> Result<ChannelMetadata>;

    /// All push subscriptions currently visible to the credential.
    async fn list_subscriptions(&self, token: &str) -> Result<Vec<SubscriptionRecord>>;

    /// Create a subscription on a session; "already exists" is reported as
    /// [`crate::CoreError::SubscriptionConflict`] and callers treat it as
    /// success.
    async fn create_subscription(
        &self,
        token: &str,
        kind: EventKind,
        channel_id: &str,
        session_id: &str,
    ) -> Result<String>;

    /// Delete a subscription; returns false when upstream no longer knows
    /// the id.
    async fn delete_subscription(&self, token: &str, sub_id: &str) -> Result<bool>;
}
