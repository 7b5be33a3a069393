//! The top-level control loop.
//!
//! Owns the roster, consumes push notifications, runs the fallback poll
//! and the periodic self-heal cycle, and coordinates the push restart on
//! token rotation. Collaborators are injected at construction; the
//! supervisor is the single decision-maker for "what happens next".

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_model::{Channel, ChannelName, DownloadStatus, EventKind, Quality, StatusUpdate, StreamEvent};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::push::{PushHandle, PushManager, PushStatus};
use crate::recorder::{RecorderPool, StopReason, StreamExtractor};
use crate::roster::RosterStore;
use crate::token::TokenManager;
use crate::upstream::ChannelApi;

/// Fallback polling cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(300);
/// Self-audit cadence.
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(600);
/// A given repair fires at most once per this window.
const REPAIR_INTERVAL: Duration = Duration::from_secs(3600);
/// Backup scheduler cadence (the backup itself is at most daily).
const BACKUP_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
const BACKUP_MIN_AGE: Duration = Duration::from_secs(24 * 3600);
/// How long shutdown waits for capture threads to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Self-heal counters, exposed through the status surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HealthMetrics {
    pub push_restarts: u64,
    pub token_refreshes: u64,
    pub zombie_stops: u64,
    pub recorder_restarts: u64,
}

/// Per-channel view served to the front-end.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: ChannelName,
    pub live: bool,
    pub downloads_enabled: bool,
    pub title: String,
    pub thumbnail: String,
    pub profile_image_url: String,
    pub offline_image_url: String,
    pub storage_path: PathBuf,
    pub quality: Quality,
    pub download_status: DownloadStatus,
    pub recording: bool,
    /// Destination of the in-flight recording, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_path: Option<PathBuf>,
}

/// Partial settings update for one channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelSettings {
    pub downloads_enabled: Option<bool>,
    pub save_directory: Option<PathBuf>,
    pub quality: Option<Quality>,
}

/// Overall service summary.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub watched_channels: usize,
    pub live_channels: Vec<ChannelName>,
    pub recording_channels: Vec<ChannelName>,
    pub metrics: HealthMetrics,
}

pub struct Supervisor {
    roster: Arc<RosterStore>,
    api: Arc<dyn ChannelApi>,
    tokens: Arc<TokenManager>,
    push: PushHandle,
    pool: Arc<RecorderPool>,
    updates: broadcast::Sender<StatusUpdate>,
    events_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    repairs: Mutex<HashMap<&'static str, Instant>>,
    metrics: Mutex<HealthMetrics>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        config: &Config,
        api: Arc<dyn ChannelApi>,
        tokens: Arc<TokenManager>,
        roster: Arc<RosterStore>,
        extractor: Arc<dyn StreamExtractor>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        let (events_tx, events_rx) = mpsc::channel(64);

        let pool = RecorderPool::new(
            extractor,
            api.clone(),
            roster.clone(),
            updates.clone(),
            config.cookie_path(),
        );
        let push = PushManager::spawn(
            api.clone(),
            tokens.clone(),
            roster.clone(),
            config.eventsub_ws_url.clone(),
            events_tx,
        );

        Arc::new(Self {
            roster,
            api,
            tokens,
            push,
            pool,
            updates,
            events_rx: Mutex::new(Some(events_rx)),
            repairs: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HealthMetrics::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to the UI fan-out stream.
    pub fn updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    /// Bring the whole engine up: credentials, push sessions, recorder
    /// reconciliation, then the periodic loops.
    pub async fn start(self: &Arc<Self>) {
        self.tokens.start().await;

        // Notification pump
        if let Some(mut events_rx) = self.events_rx.lock().await.take() {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = supervisor.shutdown.cancelled() => break,
                        event = events_rx.recv() => match event {
                            Some(event) => supervisor.on_notification(event).await,
                            None => break,
                        },
                    }
                }
            });
        }

        // Push restart on token rotation
        {
            let supervisor = Arc::clone(self);
            let mut refreshes = self.tokens.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = supervisor.shutdown.cancelled() => break,
                        refresh = refreshes.recv() => match refresh {
                            Ok(token) => supervisor.on_token_refresh(token).await,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        self.resolve_missing_ids().await;
        self.push.start().await;
        self.pool.reconcile().await;

        self.spawn_loop("poll", POLL_INTERVAL, POLL_INTERVAL, |s| async move {
            s.poll_tick().await;
        });
        self.spawn_loop(
            "supervise",
            POLL_INTERVAL, // settle time before the first audit
            SUPERVISE_INTERVAL,
            |s| async move {
                s.supervise_tick().await;
            },
        );
        self.spawn_loop(
            "backup",
            BACKUP_CHECK_INTERVAL,
            BACKUP_CHECK_INTERVAL,
            |s| async move {
                if let Err(err) = s.roster.backup_if_due(BACKUP_MIN_AGE).await {
                    warn!(%err, "roster backup failed");
                }
            },
        );

        info!("supervisor started");
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        tick: F,
    ) where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + initial_delay,
                period,
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = interval.tick() => tick(Arc::clone(&supervisor)).await,
                }
            }
            debug!(name, "periodic loop stopped");
        });
    }

    /// Graceful shutdown: stop the push subsystem, cancel every worker,
    /// wait out the grace period for their threads.
    pub async fn stop(&self) {
        info!("supervisor stopping");
        self.shutdown.cancel();
        self.push.shutdown().await;
        self.tokens.stop();
        self.pool.shutdown(SHUTDOWN_GRACE).await;
        info!("supervisor stopped");
    }

    // ------------------------------------------------------------------
    // Roster operations
    // ------------------------------------------------------------------

    pub async fn roster_names(&self) -> Vec<ChannelName> {
        self.roster.names().await
    }

    /// Replace the watched set; added and removed names get their
    /// subscriptions and recorders adjusted. Applying the same set twice
    /// is a no-op.
    pub async fn set_roster(&self, names: Vec<String>) -> Result<Vec<ChannelName>> {
        let desired: HashSet<ChannelName> = names
            .into_iter()
            .map(ChannelName::new)
            .filter(|n| !n.is_empty())
            .collect();
        let current: HashSet<ChannelName> = self.roster.names().await.into_iter().collect();

        for name in current.difference(&desired) {
            info!(channel = %name, "channel removed from roster");
            self.pool.stop(name, StopReason::Operator).await;
            if let Some(channel) = self.roster.remove(name).await? {
                self.push
                    .remove_channel(name.clone(), channel.twitch_id)
                    .await;
            }
        }

        for name in desired.difference(&current) {
            info!(channel = %name, "channel added to roster");
            self.roster.insert(Channel::new(name.clone())).await?;
            self.adopt_channel(name).await;
            self.push.add_channel(name.clone()).await;
        }

        let names = self.roster.names().await;
        self.publish(StatusUpdate::RosterChanged {
            channels: names.clone(),
        });
        Ok(names)
    }

    /// Resolve the upstream id for a fresh channel and seed its metadata.
    async fn adopt_channel(&self, name: &ChannelName) {
        let twitch_id = match self.api.lookup_id(name).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!(channel = %name, "no upstream id found");
                return;
            }
            Err(err) => {
                warn!(channel = %name, %err, "id lookup failed");
                return;
            }
        };

        let metadata = self.api.get_channel(&twitch_id).await.ok();
        let _ = self
            .roster
            .update(name, |c| {
                c.twitch_id = twitch_id;
                if let Some(meta) = &metadata {
                    c.is_live = meta.is_live;
                    if let Some(title) = meta.title.clone() {
                        c.title = title;
                    }
                    if let Some(thumbnail) = meta.thumbnail.clone() {
                        c.thumbnail = thumbnail;
                    }
                    if let Some(profile) = meta.profile_image_url.clone() {
                        c.profile_image_url = profile;
                    }
                    if let Some(offline) = meta.offline_image_url.clone() {
                        c.offline_image_url = offline;
                    }
                }
            })
            .await;
    }

    async fn resolve_missing_ids(&self) {
        for channel in self.roster.snapshot().await {
            if channel.twitch_id.is_empty() {
                self.adopt_channel(&channel.name).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Handle one transition event, from push or from the fallback poll.
    /// Idempotent: desired state is derived from the event plus the
    /// current roster, never from a diff.
    pub async fn on_notification(&self, event: StreamEvent) {
        let name = event.channel.clone();
        let Some(channel) = self.roster.get(&name).await else {
            warn!(channel = %name, "notification for channel not in roster dropped");
            return;
        };

        match event.kind {
            EventKind::LiveEnded => {
                info!(channel = %name, "went offline");
                let updated = self
                    .roster
                    .update(&name, |c| {
                        c.is_live = false;
                        if !c.title.is_empty() && c.title != "Offline" {
                            c.last_title = Some(c.title.clone());
                        }
                        c.title = "Offline".to_string();
                    })
                    .await;
                if let Err(err) = updated {
                    warn!(channel = %name, %err, "roster update failed");
                }

                self.publish(StatusUpdate::LiveStatus {
                    channel: name.clone(),
                    is_live: false,
                });
                if let Some(channel) = self.roster.get(&name).await {
                    self.publish(StatusUpdate::ChannelInfo {
                        channel: name.clone(),
                        title: channel.title,
                        thumbnail: channel.thumbnail,
                    });
                }

                self.pool.stop(&name, StopReason::StreamEnded).await;
            }
            EventKind::LiveStarted => {
                info!(channel = %name, "went live");
                let updated = self
                    .roster
                    .update(&name, |c| {
                        c.is_live = true;
                        if let Some(title) = event.title.clone().or_else(|| c.last_title.clone()) {
                            c.title = title;
                        }
                    })
                    .await;
                if let Err(err) = updated {
                    warn!(channel = %name, %err, "roster update failed");
                }

                self.publish(StatusUpdate::LiveStatus {
                    channel: name.clone(),
                    is_live: true,
                });

                if channel.downloads_enabled {
                    self.start_recording_quietly(&name).await;
                }
            }
        }
    }

    /// Start a recording, treating cooldown rejection as the non-error it
    /// is.
    async fn start_recording_quietly(&self, name: &ChannelName) {
        match self.pool.start(name).await {
            Ok(()) => {}
            Err(CoreError::Cooldown(_)) => {
                debug!(channel = %name, "start skipped: cooldown");
            }
            Err(err) => warn!(channel = %name, %err, "recording start failed"),
        }
    }

    // ------------------------------------------------------------------
    // Fallback polling
    // ------------------------------------------------------------------

    /// Belt-and-braces refresh: reconcile live flag, title and images for
    /// every resolved channel, emitting transition events equivalent to
    /// push notifications when the flag moved.
    async fn poll_tick(&self) {
        for channel in self.roster.snapshot().await {
            if channel.twitch_id.is_empty() {
                continue;
            }
            let name = channel.name.clone();
            let meta = match self.api.get_channel(&channel.twitch_id).await {
                Ok(meta) => meta,
                Err(err) => {
                    debug!(channel = %name, %err, "poll fetch failed");
                    continue;
                }
            };

            if meta.is_live != channel.is_live {
                self.on_notification(StreamEvent {
                    channel: name.clone(),
                    kind: if meta.is_live {
                        EventKind::LiveStarted
                    } else {
                        EventKind::LiveEnded
                    },
                    title: meta.title.clone(),
                })
                .await;
            }

            if meta.is_live {
                let title = meta.title.clone();
                let thumbnail = meta.thumbnail.clone();
                let profile = meta.profile_image_url.clone();
                let offline = meta.offline_image_url.clone();
                let _ = self
                    .roster
                    .update(&name, |c| {
                        if let Some(title) = title.clone() {
                            c.title = title;
                        }
                        if let Some(thumbnail) = thumbnail.clone() {
                            c.thumbnail = thumbnail;
                        }
                        if let Some(profile) = profile.clone() {
                            c.profile_image_url = profile;
                        }
                        if let Some(offline) = offline.clone() {
                            c.offline_image_url = offline;
                        }
                    })
                    .await;
                if let Some(updated) = self.roster.get(&name).await {
                    self.publish(StatusUpdate::ChannelInfo {
                        channel: name,
                        title: updated.title,
                        thumbnail: updated.thumbnail,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Self-heal
    // ------------------------------------------------------------------

    async fn supervise_tick(&self) {
        // 1. Push health: channels watched but no session connected.
        let push_status = match self.push.status().await {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(%err, "push status unavailable");
                None
            }
        };
        let watched = self.roster.len().await;
        if let Some(status) = &push_status {
            if watched > 0 && status.connected_sessions() == 0 {
                if self.repair_due("push").await {
                    warn!("no push session connected, restarting push subsystem");
                    self.push.restart().await;
                    self.metrics.lock().await.push_restarts += 1;
                } else {
                    debug!("push repair still on cooldown");
                }
            }
        }

        // 2. Token health.
        match self.tokens.get(false).await {
            Ok((Some(token), _)) => {
                if !self.tokens.validate(&token).await {
                    warn!("token no longer accepted, forcing refresh");
                    if let Err(err) = self.tokens.get(true).await {
                        warn!(%err, "forced refresh failed");
                    }
                    self.metrics.lock().await.token_refreshes += 1;
                }
            }
            Ok((None, _)) => debug!("no token to audit"),
            Err(err) => warn!(%err, "token audit failed"),
        }

        // 3. Roster consistency: far fewer subscriptions than resolved
        // channels means the push subsystem lost track.
        let snapshot = self.roster.snapshot().await;
        let with_ids = snapshot.iter().filter(|c| !c.twitch_id.is_empty()).count();
        if let Some(status) = &push_status {
            if with_ids > status.total_subscriptions + 3 {
                if self.repair_due("push").await {
                    warn!(
                        channels = with_ids,
                        subscriptions = status.total_subscriptions,
                        "subscription shortfall, restarting push subsystem"
                    );
                    self.push.restart().await;
                    self.metrics.lock().await.push_restarts += 1;
                }
            }
        }
        for channel in &snapshot {
            if !channel.is_live && self.pool.is_recording(&channel.name).await {
                warn!(channel = %channel.name, "stopping recorder for offline channel");
                self.pool.stop(&channel.name, StopReason::Operator).await;
                self.metrics.lock().await.zombie_stops += 1;
            }
        }

        // 4. Recorder reconciliation: enabled + live + idle + no cooldown.
        for channel in &snapshot {
            if channel.downloads_enabled
                && channel.is_live
                && !self.pool.is_recording(&channel.name).await
                && !self.pool.in_cooldown(&channel.name).await
            {
                info!(channel = %channel.name, "restarting missing recording");
                self.start_recording_quietly(&channel.name).await;
                self.metrics.lock().await.recorder_restarts += 1;
            }
        }
    }

    /// True when this repair has not fired within the last hour; records
    /// the attempt.
    async fn repair_due(&self, key: &'static str) -> bool {
        let mut repairs = self.repairs.lock().await;
        let now = Instant::now();
        if let Some(last) = repairs.get(key) {
            if now.duration_since(*last) < REPAIR_INTERVAL {
                return false;
            }
        }
        repairs.insert(key, now);
        true
    }

    /// Token rotation: validate, then rebuild the push subsystem with the
    /// new credential. Recorders keep running; they consult auth per
    /// start.
    async fn on_token_refresh(&self, token: String) {
        if !self.tokens.validate(&token).await {
            warn!("refreshed token failed validation, push restart skipped");
            return;
        }
        info!("token rotated, restarting push subsystem");
        self.push.restart().await;
    }

    // ------------------------------------------------------------------
    // Front-end surface
    // ------------------------------------------------------------------

    pub async fn channel_status(&self, name: &ChannelName) -> Option<ChannelStatus> {
        let channel = self.roster.get(name).await?;
        let storage_path = self.roster.storage_path_for(&channel).await;
        Some(ChannelStatus {
            name: channel.name.clone(),
            live: channel.is_live,
            downloads_enabled: channel.downloads_enabled,
            title: channel.title,
            thumbnail: channel.thumbnail,
            profile_image_url: channel.profile_image_url,
            offline_image_url: channel.offline_image_url,
            storage_path,
            quality: channel.quality,
            download_status: channel.download_status,
            recording: self.pool.is_recording(name).await,
            recording_path: self.pool.destination_of(name).await,
        })
    }

    pub async fn all_channel_status(&self) -> Vec<ChannelStatus> {
        let mut out = Vec::new();
        for name in self.roster.names().await {
            if let Some(status) = self.channel_status(&name).await {
                out.push(status);
            }
        }
        out
    }

    pub async fn set_channel_settings(
        &self,
        name: &ChannelName,
        settings: ChannelSettings,
    ) -> Result<ChannelStatus> {
        let updated = self
            .roster
            .update(name, |c| {
                if let Some(enabled) = settings.downloads_enabled {
                    c.downloads_enabled = enabled;
                }
                if let Some(dir) = settings.save_directory.clone() {
                    c.save_directory = Some(dir);
                }
                if let Some(quality) = settings.quality.clone() {
                    c.quality = quality;
                }
            })
            .await?
            .ok_or_else(|| CoreError::UnknownChannel(name.to_string()))?;

        match settings.downloads_enabled {
            Some(false) => {
                // A disabled channel keeps nothing running.
                self.pool.stop(name, StopReason::Operator).await;
            }
            Some(true) if updated.is_live => {
                self.start_recording_quietly(name).await;
            }
            _ => {}
        }

        self.channel_status(name)
            .await
            .ok_or_else(|| CoreError::UnknownChannel(name.to_string()))
    }

    pub async fn set_downloads_enabled(&self, name: &ChannelName, enabled: bool) -> Result<ChannelStatus> {
        self.set_channel_settings(
            name,
            ChannelSettings {
                downloads_enabled: Some(enabled),
                ..ChannelSettings::default()
            },
        )
        .await
    }

    pub async fn start_recording(&self, name: &ChannelName) -> Result<()> {
        self.pool.start(name).await
    }

    pub async fn stop_recording(&self, name: &ChannelName) -> bool {
        self.pool.stop(name, StopReason::Operator).await
    }

    pub async fn push_debug(&self) -> Result<PushStatus> {
        self.push.status().await
    }

    pub async fn push_reconnect(&self) {
        info!("operator requested push restart");
        self.push.restart().await;
    }

    pub async fn storage_root(&self) -> PathBuf {
        self.roster.storage_root().await
    }

    pub async fn set_storage_root(&self, path: PathBuf) -> Result<()> {
        self.roster.set_storage_root(path).await
    }

    pub async fn status_summary(&self) -> StatusSummary {
        let snapshot = self.roster.snapshot().await;
        StatusSummary {
            watched_channels: snapshot.len(),
            live_channels: snapshot
                .iter()
                .filter(|c| c.is_live)
                .map(|c| c.name.clone())
                .collect(),
            recording_channels: self.pool.active_channels().await,
            metrics: *self.metrics.lock().await,
        }
    }

    fn publish(&self, update: StatusUpdate) {
        let _ = self.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::MockStreamExtractor;
    use crate::upstream::{ChannelMetadata, MockChannelApi};

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            config_dir: dir.to_path_buf(),
            default_storage_root: dir.join("streams"),
            server_host: "127.0.0.1".into(),
            server_port: 0,
            gql_url: "http://127.0.0.1:1/gql".into(),
            helix_url: "http://127.0.0.1:1/helix".into(),
            eventsub_ws_url: "ws://127.0.0.1:1/ws".into(),
            refresh_endpoint: "http://127.0.0.1:1/refresh".into(),
            gql_client_id: "gql".into(),
            helix_client_id: "helix".into(),
            streamlink_path: "streamlink".into(),
        }
    }

    async fn supervisor_with(
        api: MockChannelApi,
        dir: &std::path::Path,
    ) -> (Arc<Supervisor>, Arc<RosterStore>) {
        let config = test_config(dir);
        let roster = Arc::new(RosterStore::load(&config).await);
        let tokens = Arc::new(TokenManager::new(&config).unwrap());
        let supervisor = Supervisor::new(
            &config,
            Arc::new(api),
            tokens,
            roster.clone(),
            Arc::new(MockStreamExtractor::new()),
        );
        (supervisor, roster)
    }

    #[tokio::test]
    async fn set_roster_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockChannelApi::new();
        api.expect_lookup_id()
            .returning(|name| Ok(Some(format!("id-{name}"))));
        api.expect_get_channel().returning(|_| {
            Ok(ChannelMetadata {
                is_live: false,
                ..ChannelMetadata::default()
            })
        });

        let (supervisor, roster) = supervisor_with(api, dir.path()).await;

        let first = supervisor
            .set_roster(vec!["Alice".into(), "bob".into()])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(roster.get(&ChannelName::new("alice")).await.unwrap().twitch_id, "id-alice");

        let second = supervisor
            .set_roster(vec!["alice".into(), "BOB".into()])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(roster.len().await, 2);
    }

    #[tokio::test]
    async fn set_roster_removes_dropped_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockChannelApi::new();
        api.expect_lookup_id()
            .returning(|name| Ok(Some(format!("id-{name}"))));
        api.expect_get_channel()
            .returning(|_| Ok(ChannelMetadata::default()));

        let (supervisor, roster) = supervisor_with(api, dir.path()).await;
        supervisor
            .set_roster(vec!["alice".into(), "bob".into()])
            .await
            .unwrap();
        supervisor.set_roster(vec!["alice".into()]).await.unwrap();

        assert_eq!(roster.len().await, 1);
        assert!(roster.get(&ChannelName::new("bob")).await.is_none());
    }

    #[tokio::test]
    async fn offline_notification_preserves_title_and_online_restores_it() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockChannelApi::new();
        let (supervisor, roster) = supervisor_with(api, dir.path()).await;

        let alice = ChannelName::new("alice");
        let mut channel = Channel::new(alice.clone());
        channel.twitch_id = "11111".into();
        channel.is_live = true;
        channel.title = "Speedrun".into();
        roster.insert(channel).await.unwrap();

        supervisor
            .on_notification(StreamEvent {
                channel: alice.clone(),
                kind: EventKind::LiveEnded,
                title: None,
            })
            .await;

        let after = roster.get(&alice).await.unwrap();
        assert!(!after.is_live);
        assert_eq!(after.title, "Offline");
        assert_eq!(after.last_title.as_deref(), Some("Speedrun"));

        supervisor
            .on_notification(StreamEvent {
                channel: alice.clone(),
                kind: EventKind::LiveStarted,
                title: None,
            })
            .await;

        let after = roster.get(&alice).await.unwrap();
        assert!(after.is_live);
        assert_eq!(after.title, "Speedrun");
    }

    #[tokio::test]
    async fn unknown_channel_notification_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockChannelApi::new();
        let (supervisor, roster) = supervisor_with(api, dir.path()).await;

        supervisor
            .on_notification(StreamEvent {
                channel: ChannelName::new("stranger"),
                kind: EventKind::LiveStarted,
                title: None,
            })
            .await;
        assert!(roster.is_empty().await);
    }

    #[tokio::test]
    async fn repair_registry_limits_to_once_per_hour() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockChannelApi::new();
        let (supervisor, _) = supervisor_with(api, dir.path()).await;

        assert!(supervisor.repair_due("push").await);
        assert!(!supervisor.repair_due("push").await);
        // Independent repairs keep their own clocks.
        assert!(supervisor.repair_due("token").await);
    }

    #[tokio::test]
    async fn disabling_downloads_stops_nothing_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockChannelApi::new();
        let (supervisor, roster) = supervisor_with(api, dir.path()).await;

        let alice = ChannelName::new("alice");
        let mut channel = Channel::new(alice.clone());
        channel.twitch_id = "11111".into();
        channel.downloads_enabled = true;
        roster.insert(channel).await.unwrap();

        let status = supervisor
            .set_downloads_enabled(&alice, false)
            .await
            .unwrap();
        assert!(!status.downloads_enabled);
        assert!(!status.recording);
    }
}
