//! Single-writer owner of the OAuth credential bundle.
//!
//! Refreshes proactively before expiry, persists atomically, and fans a
//! refresh event out to subscribers. Refreshing goes through the
//! operator's auxiliary auth service; this process never sees the client
//! secret.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::util::write_atomic;

/// Lead time before expiry at which a refresh is triggered.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(30 * 60);

/// Upper bound on one refresh attempt, lock held included.
const REFRESH_DEADLINE: Duration = Duration::from_secs(30);

/// Re-arm delay after a failed scheduled refresh.
const RETRY_ARM_DELAY: Duration = Duration::from_secs(5 * 60);

/// Lifetime assumed when the refresh response omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 14_400;

/// The persisted access/refresh/expiry triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds of validity reported by the auth service.
    pub expires_in: i64,
    /// Absolute expiry, unix milliseconds.
    pub expires_at: i64,
}

impl TokenBundle {
    /// True when the token expires within `buffer` from now. A token whose
    /// expiry sits exactly on the buffer boundary counts as expiring.
    pub fn expires_within(&self, buffer: Duration) -> bool {
        let threshold = Utc::now().timestamp_millis() + buffer.as_millis() as i64;
        self.expires_at <= threshold
    }

    /// Time until the proactive refresh point, zero if already past it.
    fn until_refresh(&self, buffer: Duration) -> Duration {
        let remaining = self.expires_at
            - Utc::now().timestamp_millis()
            - buffer.as_millis() as i64;
        Duration::from_millis(remaining.max(0) as u64)
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Owner of the credential bundle; see module docs.
pub struct TokenManager {
    path: PathBuf,
    refresh_endpoint: String,
    helix_url: String,
    helix_client_id: String,
    http: reqwest::Client,
    bundle: RwLock<Option<TokenBundle>>,
    refresh_lock: Mutex<()>,
    refresh_tx: broadcast::Sender<String>,
    timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let (refresh_tx, _) = broadcast::channel(8);
        Ok(Self {
            path: config.token_path(),
            refresh_endpoint: config.refresh_endpoint.clone(),
            helix_url: config.helix_url.clone(),
            helix_client_id: config.helix_client_id.clone(),
            http,
            bundle: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_tx,
            timer: parking_lot::Mutex::new(None),
        })
    }

    /// Load the persisted bundle and arm the proactive refresh timer.
    pub async fn start(self: &Arc<Self>) {
        let loaded = self.load_from_disk().await;
        *self.bundle.write().await = loaded;

        if self.bundle.read().await.is_some() {
            self.arm_refresh_timer().await;
            info!("token manager started with persisted bundle");
        } else {
            info!("token manager started without credentials");
        }
    }

    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    /// A token file that exists but cannot be parsed is logged and treated
    /// as absent; the system proceeds unauthenticated.
    async fn load_from_disk(&self) -> Option<TokenBundle> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(_) => return None,
        };
        if content.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<TokenBundle>(&content) {
            Ok(bundle) => Some(bundle),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "token file unparseable, starting unauthenticated");
                None
            }
        }
    }

    /// Register an observer invoked once per refresh with the new token.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.refresh_tx.subscribe()
    }

    /// Current access token without triggering a refresh.
    pub async fn peek(&self) -> Option<String> {
        self.bundle.read().await.as_ref().map(|b| b.access_token.clone())
    }

    /// Current access token, refreshing first when it expires within the
    /// buffer or `force` is set. The bool reports whether this call
    /// changed the token. A failed refresh yields the stale token; only a
    /// rejected refresh token surfaces as an error.
    pub async fn get(self: &Arc<Self>, force: bool) -> Result<(Option<String>, bool)> {
        let needs_refresh = {
            let guard = self.bundle.read().await;
            match guard.as_ref() {
                None => return Ok((None, false)),
                Some(bundle) => force || bundle.expires_within(REFRESH_BUFFER),
            }
        };

        if needs_refresh {
            match self.refresh().await {
                Ok(refreshed) => return Ok((self.peek().await, refreshed)),
                Err(err @ CoreError::CredentialExpired) => return Err(err),
                Err(err) => {
                    warn!(%err, "token refresh failed, serving stale token");
                }
            }
        }
        Ok((self.peek().await, false))
    }

    /// Lightweight identity call to check whether upstream still accepts a
    /// token.
    pub async fn validate(&self, token: &str) -> bool {
        let url = format!("{}/users", self.helix_url);
        match self
            .http
            .get(&url)
            .header("Client-Id", &self.helix_client_id)
            .bearer_auth(token)
            .send()
            .await
        {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    warn!(status = %response.status(), "token validation failed");
                }
                ok
            }
            Err(err) => {
                warn!(%err, "token validation request failed");
                false
            }
        }
    }

    /// Single-flight refresh. Concurrent callers coalesce behind the lock:
    /// whoever arrives second observes the already-rotated token and
    /// returns without another round trip.
    pub async fn refresh(self: &Arc<Self>) -> Result<bool> {
        let before = self.peek().await;
        let _flight = self.refresh_lock.lock().await;

        if self.peek().await != before {
            debug!("refresh coalesced with a concurrent flight");
            return Ok(true);
        }

        let refresh_token = {
            let guard = self.bundle.read().await;
            match guard.as_ref() {
                Some(bundle) if !bundle.refresh_token.is_empty() => bundle.refresh_token.clone(),
                _ => return Err(CoreError::CredentialExpired),
            }
        };

        let bundle = tokio::time::timeout(
            REFRESH_DEADLINE,
            self.exchange_refresh_token(&refresh_token),
        )
        .await
        .map_err(|_| CoreError::Transient("token refresh timed out".into()))??;

        let json = serde_json::to_vec_pretty(&bundle)?;
        write_atomic(&self.path, &json).await?;

        let access_token = bundle.access_token.clone();
        *self.bundle.write().await = Some(bundle);

        self.arm_refresh_timer().await;
        // Nobody listening is fine; the send result is informational only.
        let _ = self.refresh_tx.send(access_token);

        info!("access token refreshed");
        Ok(true)
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenBundle> {
        let url = format!(
            "{}?refresh_token={}",
            self.refresh_endpoint, refresh_token
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(CoreError::CredentialExpired);
        }
        if !status.is_success() {
            if status.is_server_error() {
                return Err(CoreError::Transient(format!("refresh endpoint: {status}")));
            }
            return Err(CoreError::Permanent {
                status: status.as_u16(),
                message: "refresh endpoint rejected the request".into(),
            });
        }

        let body: RefreshResponse = response.json().await?;
        let (access_token, refresh_token) = match (body.access_token, body.refresh_token) {
            (Some(a), Some(r)) if !a.is_empty() && !r.is_empty() => (a, r),
            _ => {
                return Err(CoreError::Permanent {
                    status: status.as_u16(),
                    message: "refresh response missing tokens".into(),
                });
            }
        };
        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        Ok(TokenBundle {
            access_token,
            refresh_token,
            expires_in,
            expires_at: Utc::now().timestamp_millis() + expires_in * 1000,
        })
    }

    /// Re-arm the proactive refresh timer for (expiry − buffer). A failed
    /// scheduled refresh re-arms with a fixed delay instead of looping.
    fn arm_refresh_timer(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let delay = match self.bundle.read().await.as_ref() {
                Some(bundle) => bundle.until_refresh(REFRESH_BUFFER),
                None => return,
            };

            let manager = Arc::clone(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match manager.refresh().await {
                    Ok(_) => {}
                    Err(CoreError::CredentialExpired) => {
                        warn!("refresh token rejected, scheduled refresh disabled");
                    }
                    Err(err) => {
                        warn!(%err, "scheduled token refresh failed, re-arming");
                        let retry = Arc::clone(&manager);
                        let handle = tokio::spawn(async move {
                            tokio::time::sleep(RETRY_ARM_DELAY).await;
                            if let Err(err) = retry.refresh().await {
                                warn!(%err, "token refresh retry failed");
                            }
                        });
                        *manager.timer.lock() = Some(handle);
                    }
                }
            });

            if let Some(previous) = self.timer.lock().replace(task) {
                previous.abort();
            }
        })
    }
}
