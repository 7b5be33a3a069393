use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use warden_model::{ChannelName, EventKind};

use crate::config::Config;
use crate::error::{CoreError, Result};

use super::types::{GqlResponse, HelixSubscriptions};
use super::{ChannelApi, ChannelMetadata, SubscriptionRecord};

/// Static channel fields (images) are good for a day.
const STATIC_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Live-status fields go stale after a minute.
const STATUS_TTL: Duration = Duration::from_secs(60);
/// Cap on concurrent upstream requests.
const MAX_IN_FLIGHT: usize = 10;
/// 429 backoff parameters when no Retry-After header is present.
const RATE_LIMIT_BASE: Duration = Duration::from_secs(5);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(60);
const RATE_LIMIT_ATTEMPTS: u32 = 3;

const GET_USER_ID_QUERY: &str = r#"
    query GetUserID($login: String!) {
        user(login: $login) {
            id
            login
            displayName
        }
    }
"#;

const GET_CHANNEL_INFO_QUERY: &str = r#"
    query GetChannelInfo($id: ID!) {
        user(id: $id) {
            id
            login
            displayName
            profileImageURL(width: 150)
            offlineImageURL
            stream {
                id
                title
                viewersCount
                previewImageURL(width: 440, height: 248)
                game {
                    name
                }
            }
        }
    }
"#;

const GET_STREAM_STATUS_QUERY: &str = r#"
    query GetStreamStatusOnly($id: ID!) {
        user(id: $id) {
            stream {
                id
                title
                viewersCount
                previewImageURL(width: 440, height: 248)
                game {
                    name
                }
            }
        }
    }
"#;

/// Shared rate-limit deadline. When one caller is told to back off, every
/// other caller can defer voluntarily instead of burning its own request.
#[derive(Debug, Clone, Default)]
pub struct RetryAfterGate {
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl RetryAfterGate {
    pub fn note(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut deadline = self.deadline.lock();
        if deadline.map(|d| d < until).unwrap_or(true) {
            *deadline = Some(until);
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        let deadline = *self.deadline.lock();
        deadline.and_then(|d| d.checked_duration_since(Instant::now()))
    }

    /// Sleep out any published deadline before issuing a request.
    pub async fn wait(&self) {
        if let Some(remaining) = self.remaining() {
            debug!(?remaining, "deferring to shared rate-limit deadline");
            tokio::time::sleep(remaining).await;
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    meta: ChannelMetadata,
    static_at: Instant,
    status_at: Instant,
}

/// Rate-limit-aware request layer over the GQL and Helix APIs.
pub struct UpstreamClient {
    http: reqwest::Client,
    gql_url: String,
    helix_url: String,
    gql_client_id: String,
    helix_client_id: String,
    in_flight: Arc<Semaphore>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    gate: RetryAfterGate,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("gql_url", &self.gql_url)
            .field("helix_url", &self.helix_url)
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            gql_url: config.gql_url.clone(),
            helix_url: config.helix_url.clone(),
            gql_client_id: config.gql_client_id.clone(),
            helix_client_id: config.helix_client_id.clone(),
            in_flight: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            cache: Mutex::new(HashMap::new()),
            gate: RetryAfterGate::default(),
        })
    }

    /// The shared deadline other subsystems consult before issuing calls.
    pub fn retry_after_gate(&self) -> RetryAfterGate {
        self.gate.clone()
    }

    fn subscriptions_url(&self) -> String {
        format!("{}/eventsub/subscriptions", self.helix_url)
    }

    async fn gql_query(
        &self,
        operation: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<GqlResponse> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| CoreError::Internal("request limiter closed".into()))?;

        let response = self
            .http
            .post(&self.gql_url)
            .header("Client-ID", &self.gql_client_id)
            .json(&json!({
                "operationName": operation,
                "query": query,
                "variables": variables,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, format!("GQL {operation}")));
        }
        Ok(response.json::<GqlResponse>().await?)
    }

    async fn fetch_channel_info(&self, id: &str) -> Result<ChannelMetadata> {
        let response = self
            .gql_query("GetChannelInfo", GET_CHANNEL_INFO_QUERY, json!({ "id": id }))
            .await?;
        let user = response
            .data
            .and_then(|d| d.user)
            .ok_or_else(|| CoreError::Permanent {
                status: 404,
                message: format!("no user data for channel id {id}"),
            })?;
        Ok(ChannelMetadata::from(user))
    }

    async fn fetch_stream_status(&self, id: &str) -> Result<ChannelMetadata> {
        let response = self
            .gql_query(
                "GetStreamStatusOnly",
                GET_STREAM_STATUS_QUERY,
                json!({ "id": id }),
            )
            .await?;
        let user = response
            .data
            .and_then(|d| d.user)
            .ok_or_else(|| CoreError::Permanent {
                status: 404,
                message: format!("no user data for channel id {id}"),
            })?;
        Ok(ChannelMetadata::from(user))
    }

    /// Issue a Helix request, honoring the shared deadline and retrying
    /// rate limits with capped exponential backoff and jitter.
    async fn send_helix<F>(&self, token: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            self.gate.wait().await;

            let _permit = self
                .in_flight
                .acquire()
                .await
                .map_err(|_| CoreError::Internal("request limiter closed".into()))?;

            let response = build(&self.http)
                .header("Client-Id", &self.helix_client_id)
                .bearer_auth(token)
                .send()
                .await?;
            drop(_permit);

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            if body.contains("cost") {
                return Err(CoreError::SubscriptionCostExceeded);
            }

            let base = retry_after.unwrap_or_else(|| {
                std::cmp::min(RATE_LIMIT_BASE * 2u32.saturating_pow(attempt), RATE_LIMIT_CAP)
            });
            let wait = jitter(base);
            self.gate.note(wait);

            attempt += 1;
            if attempt >= RATE_LIMIT_ATTEMPTS {
                return Err(CoreError::RateLimited { retry_after: wait });
            }
            warn!(?wait, attempt, "rate limited by upstream, backing off");
            tokio::time::sleep(wait).await;
        }
    }
}

/// ±10% spread so a fleet of callers does not retry in lockstep.
fn jitter(base: Duration) -> Duration {
    let factor = 0.9 + 0.2 * rand::random::<f64>();
    base.mul_f64(factor)
}

fn classify_status(status: StatusCode, context: String) -> CoreError {
    match status {
        StatusCode::UNAUTHORIZED => CoreError::CredentialRejected,
        StatusCode::CONFLICT => CoreError::SubscriptionConflict,
        s if s.is_server_error() => CoreError::Transient(format!("{context}: {s}")),
        s => CoreError::Permanent {
            status: s.as_u16(),
            message: context,
        },
    }
}

#[async_trait]
impl ChannelApi for UpstreamClient {
    async fn lookup_id(&self, name: &ChannelName) -> Result<Option<String>> {
        if name.is_empty() {
            return Ok(None);
        }
        let response = self
            .gql_query(
                "GetUserID",
                GET_USER_ID_QUERY,
                json!({ "login": name.as_str() }),
            )
            .await?;
        Ok(response.data.and_then(|d| d.user).and_then(|u| u.id))
    }

    async fn get_channel(&self, id: &str) -> Result<ChannelMetadata> {
        let now = Instant::now();
        let cached = self.cache.lock().get(id).cloned();

        if let Some(entry) = cached {
            if now.duration_since(entry.static_at) < STATIC_TTL {
                if now.duration_since(entry.status_at) < STATUS_TTL {
                    return Ok(entry.meta);
                }
                // Static half still good; refresh only the live status.
                match self.fetch_stream_status(id).await {
                    Ok(status) => {
                        let mut meta = entry.meta.clone();
                        meta.merge_status(status);
                        self.cache.lock().insert(
                            id.to_string(),
                            CacheEntry {
                                meta: meta.clone(),
                                static_at: entry.static_at,
                                status_at: now,
                            },
                        );
                        return Ok(meta);
                    }
                    Err(err) if err.is_transient() => {
                        warn!(id, %err, "status refresh failed, serving cached metadata");
                        return Ok(entry.meta);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let meta = self.fetch_channel_info(id).await?;
        self.cache.lock().insert(
            id.to_string(),
            CacheEntry {
                meta: meta.clone(),
                static_at: now,
                status_at: now,
            },
        );
        Ok(meta)
    }

    async fn list_subscriptions(&self, token: &str) -> Result<Vec<SubscriptionRecord>> {
        let url = self.subscriptions_url();
        let response = self.send_helix(token, |http| http.get(&url)).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "list subscriptions".into()));
        }
        let body: HelixSubscriptions = response.json().await?;
        Ok(body
            .data
            .into_iter()
            .filter_map(|sub| sub.into_record())
            .collect())
    }

    async fn create_subscription(
        &self,
        token: &str,
        kind: EventKind,
        channel_id: &str,
        session_id: &str,
    ) -> Result<String> {
        let url = self.subscriptions_url();
        let payload = json!({
            "type": kind.as_subscription_type(),
            "version": "1",
            "condition": { "broadcaster_user_id": channel_id },
            "transport": { "method": "websocket", "session_id": session_id },
        });

        let response = self
            .send_helix(token, |http| http.post(&url).json(&payload))
            .await?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            let body: HelixSubscriptions = response.json().await?;
            return body
                .data
                .into_iter()
                .next()
                .map(|sub| sub.id)
                .ok_or_else(|| CoreError::Internal("create returned no subscription".into()));
        }
        Err(classify_status(
            status,
            format!("create {} for {channel_id}", kind.as_subscription_type()),
        ))
    }

    async fn delete_subscription(&self, token: &str, sub_id: &str) -> Result<bool> {
        let url = format!("{}?id={sub_id}", self.subscriptions_url());
        let response = self.send_helix(token, |http| http.delete(&url)).await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(classify_status(status, format!("delete {sub_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_publishes_latest_deadline() {
        let gate = RetryAfterGate::default();
        assert!(gate.remaining().is_none());

        gate.note(Duration::from_secs(30));
        let remaining = gate.remaining().expect("deadline set");
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(25));

        // A shorter deadline must not shrink the published one.
        gate.note(Duration::from_secs(1));
        assert!(gate.remaining().unwrap() > Duration::from_secs(25));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = jitter(base);
            assert!(jittered >= Duration::from_secs(9));
            assert!(jittered <= Duration::from_secs(11));
        }
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            CoreError::CredentialRejected
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, String::new()),
            CoreError::SubscriptionConflict
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            CoreError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, String::new()),
            CoreError::Permanent { status: 400, .. }
        ));
    }
}
