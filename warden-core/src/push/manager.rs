//! The push subscription manager.
//!
//! A single owning task holds the session slots and the subscription
//! table; everything from outside arrives through a bounded command
//! channel, everything from the session runners through an internal event
//! channel. This keeps the state machine observable and lock-free.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_model::{ChannelName, EventKind, StreamEvent};

use crate::error::{CoreError, Result};
use crate::roster::RosterStore;
use crate::token::TokenManager;
use crate::upstream::{ChannelApi, SubscriptionRecord};

use super::session::{SessionEvent, SessionEventKind, SessionRunner, SessionStatus};

/// Parallel push connections.
pub const MAX_CONNECTIONS: usize = 3;
/// Channels assigned per connection at start-up.
pub const BATCH_SIZE: usize = 5;
/// Subscriptions a single session may carry, kept under the upstream
/// per-connection cost ceiling.
pub const SESSION_SUB_CEILING: usize = 8;
/// In-flight subscription creates across all sessions.
const CREATE_CONCURRENCY: usize = 5;
/// Authoritative duplicate-subscription sweep cadence.
const HYGIENE_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// Pause between stopping and restarting the subsystem.
const RESTART_SETTLE: Duration = Duration::from_secs(2);

/// Commands accepted by the manager task.
#[derive(Debug)]
pub enum PushCommand {
    Start,
    /// Stop sessions, best-effort delete everything the credential owns,
    /// settle, start from empty.
    Restart,
    AddChannel(ChannelName),
    RemoveChannel {
        channel: ChannelName,
        twitch_id: String,
    },
    Status(oneshot::Sender<PushStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Snapshot served through the push-debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct PushStatus {
    pub running: bool,
    pub connections: Vec<ConnectionStatus>,
    pub total_subscriptions: usize,
    pub session_subscription_counts: HashMap<String, usize>,
    pub pending_channels: Vec<ChannelName>,
    pub token_error: Option<String>,
}

impl PushStatus {
    pub fn connected_sessions(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.status == SessionStatus::Connected)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub id: usize,
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub assigned_channels: usize,
}

/// Cloneable front door to the manager task.
#[derive(Debug, Clone)]
pub struct PushHandle {
    commands: mpsc::Sender<PushCommand>,
}

impl PushHandle {
    pub async fn start(&self) {
        let _ = self.commands.send(PushCommand::Start).await;
    }

    pub async fn restart(&self) {
        let _ = self.commands.send(PushCommand::Restart).await;
    }

    pub async fn add_channel(&self, channel: ChannelName) {
        let _ = self.commands.send(PushCommand::AddChannel(channel)).await;
    }

    pub async fn remove_channel(&self, channel: ChannelName, twitch_id: String) {
        let _ = self
            .commands
            .send(PushCommand::RemoveChannel { channel, twitch_id })
            .await;
    }

    pub async fn status(&self) -> Result<PushStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(PushCommand::Status(tx))
            .await
            .map_err(|_| CoreError::Internal("push manager gone".into()))?;
        rx.await
            .map_err(|_| CoreError::Internal("push manager gone".into()))
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(PushCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct ConnectionSlot {
    index: usize,
    status: SessionStatus,
    session_id: Option<String>,
    assigned: Vec<ChannelName>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct SubEntry {
    sub_id: Option<String>,
    kind: EventKind,
    session_id: String,
    channel: ChannelName,
}

pub struct PushManager {
    api: Arc<dyn ChannelApi>,
    tokens: Arc<TokenManager>,
    roster: Arc<RosterStore>,
    ws_url: String,
    events_tx: mpsc::Sender<StreamEvent>,
    commands_rx: mpsc::Receiver<PushCommand>,
    session_events_tx: mpsc::Sender<SessionEvent>,
    session_events_rx: mpsc::Receiver<SessionEvent>,
    create_limiter: Arc<Semaphore>,

    running: bool,
    slots: Vec<ConnectionSlot>,
    /// broadcaster-id -> live subscription (at most one per channel; its
    /// kind is always the complement of the channel's last-known-live).
    subs: HashMap<String, SubEntry>,
    /// Channels waiting for session capacity.
    pending: VecDeque<ChannelName>,
    token_error: Option<String>,
}

impl PushManager {
    /// Spawn the owning task and hand back its front door.
    pub fn spawn(
        api: Arc<dyn ChannelApi>,
        tokens: Arc<TokenManager>,
        roster: Arc<RosterStore>,
        ws_url: String,
        events_tx: mpsc::Sender<StreamEvent>,
    ) -> PushHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (session_events_tx, session_events_rx) = mpsc::channel(64);

        let manager = PushManager {
            api,
            tokens,
            roster,
            ws_url,
            events_tx,
            commands_rx,
            session_events_tx,
            session_events_rx,
            create_limiter: Arc::new(Semaphore::new(CREATE_CONCURRENCY)),
            running: false,
            slots: Vec::new(),
            subs: HashMap::new(),
            pending: VecDeque::new(),
            token_error: None,
        };
        tokio::spawn(manager.run());

        PushHandle {
            commands: commands_tx,
        }
    }

    async fn run(mut self) {
        let mut hygiene = tokio::time::interval_at(
            tokio::time::Instant::now() + HYGIENE_INTERVAL,
            HYGIENE_INTERVAL,
        );
        hygiene.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(PushCommand::Start) => self.start_sessions().await,
                    Some(PushCommand::Restart) => self.full_restart().await,
                    Some(PushCommand::AddChannel(channel)) => self.add_channel(channel).await,
                    Some(PushCommand::RemoveChannel { channel, twitch_id }) => {
                        self.remove_channel(&channel, &twitch_id).await;
                    }
                    Some(PushCommand::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(PushCommand::Shutdown(reply)) => {
                        self.stop_sessions();
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.stop_sessions();
                        return;
                    }
                },
                Some(event) = self.session_events_rx.recv() => {
                    self.on_session_event(event).await;
                }
                _ = hygiene.tick() => {
                    if self.running && !self.subs.is_empty() {
                        self.run_hygiene().await;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    async fn start_sessions(&mut self) {
        if self.running {
            debug!("push subsystem already running");
            return;
        }
        match self.fetch_token().await {
            Some(_) => {}
            None => {
                warn!("push subsystem not started: no usable token");
                return;
            }
        }

        let mut channels: Vec<ChannelName> = self
            .roster
            .snapshot()
            .await
            .into_iter()
            .filter(|c| !c.twitch_id.is_empty())
            .map(|c| c.name)
            .collect();
        channels.sort();

        self.subs.clear();
        self.pending.clear();
        self.slots.clear();

        let batches: Vec<Vec<ChannelName>> = channels
            .chunks(BATCH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect();

        for (index, batch) in batches.iter().take(MAX_CONNECTIONS).enumerate() {
            self.spawn_slot(index, batch.clone());
        }
        for overflow in batches.iter().skip(MAX_CONNECTIONS) {
            for channel in overflow {
                warn!(%channel, "no session capacity at start, queued for rebalance");
                self.pending.push_back(channel.clone());
            }
        }

        self.running = true;
        info!(
            sessions = self.slots.len(),
            channels = channels.len(),
            "push subsystem started"
        );
    }

    fn spawn_slot(&mut self, index: usize, assigned: Vec<ChannelName>) {
        let cancel = CancellationToken::new();
        let runner = SessionRunner {
            connection: index,
            ws_url: self.ws_url.clone(),
            events: self.session_events_tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(runner.run());
        self.slots.push(ConnectionSlot {
            index,
            status: SessionStatus::Connecting,
            session_id: None,
            assigned,
            cancel,
        });
    }

    fn stop_sessions(&mut self) {
        for slot in &self.slots {
            slot.cancel.cancel();
        }
        self.slots.clear();
        self.subs.clear();
        self.pending.clear();
        self.running = false;
        info!("push subsystem stopped");
    }

    async fn full_restart(&mut self) {
        info!("full push restart requested");
        self.stop_sessions();
        self.full_cleanup().await;
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start_sessions().await;
    }

    /// Best-effort deletion of every subscription the credential owns.
    /// Individual failures are logged and skipped.
    async fn full_cleanup(&mut self) {
        let Some(token) = self.fetch_token().await else {
            return;
        };
        let records = match self.api.list_subscriptions(&token).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "subscription cleanup: list failed");
                return;
            }
        };
        let mut deleted = 0usize;
        for record in &records {
            match self.api.delete_subscription(&token, &record.id).await {
                Ok(_) => deleted += 1,
                Err(err) => warn!(sub_id = %record.id, %err, "cleanup delete failed"),
            }
        }
        info!(deleted, total = records.len(), "subscription cleanup finished");
    }

    // ------------------------------------------------------------------
    // Session events
    // ------------------------------------------------------------------

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event.kind {
            SessionEventKind::StatusChanged(status) => {
                self.on_status_changed(event.connection, status);
            }
            SessionEventKind::Connected { session_id } => {
                self.on_session_connected(event.connection, session_id).await;
            }
            SessionEventKind::Frame(frame) => match frame {
                super::frames::Frame::Notification(notification) => {
                    self.on_notification(notification).await;
                }
                super::frames::Frame::Revocation {
                    subscription_id,
                    broadcaster_id,
                    ..
                } => {
                    self.on_revocation(subscription_id, broadcaster_id);
                }
                _ => {}
            },
        }
    }

    fn on_status_changed(&mut self, connection: usize, status: SessionStatus) {
        let Some(slot) = self.slots.iter_mut().find(|s| s.index == connection) else {
            return;
        };
        slot.status = status;
        if matches!(
            status,
            SessionStatus::Disconnected | SessionStatus::Reconnecting | SessionStatus::Failed
        ) {
            // A subscription dies with its session (upstream may keep it
            // for a short grace window; hygiene reaps stragglers).
            if let Some(old_session) = slot.session_id.take() {
                self.subs.retain(|_, entry| entry.session_id != old_session);
            }
        }
    }

    async fn on_session_connected(&mut self, connection: usize, session_id: String) {
        {
            let Some(slot) = self.slots.iter_mut().find(|s| s.index == connection) else {
                return;
            };
            slot.status = SessionStatus::Connected;
            slot.session_id = Some(session_id.clone());
        }

        let Some(token) = self.fetch_token().await else {
            return;
        };

        // Reconcile with what upstream actually holds: adopt records that
        // already point at this session, reap garbage from sessions no
        // process of ours knows anymore.
        match self.api.list_subscriptions(&token).await {
            Ok(records) => self.adopt_and_reap(&token, records, &session_id).await,
            Err(err) => warn!(%err, "subscription enumeration failed on connect"),
        }

        let assigned = self
            .slots
            .iter()
            .find(|s| s.index == connection)
            .map(|s| s.assigned.clone())
            .unwrap_or_default();
        for channel in assigned {
            self.ensure_subscription(&token, &channel, &session_id).await;
        }

        self.drain_pending(&token, &session_id).await;
    }

    async fn adopt_and_reap(
        &mut self,
        token: &str,
        records: Vec<SubscriptionRecord>,
        session_id: &str,
    ) {
        let known: HashSet<String> = self
            .slots
            .iter()
            .filter_map(|s| s.session_id.clone())
            .collect();

        for record in records {
            let Some(record_session) = record.session_id.clone() else {
                continue;
            };
            if record_session == session_id {
                let Some(kind) = record.kind else { continue };
                match self.roster.find_by_id(&record.broadcaster_id).await {
                    Some(channel) => {
                        debug!(channel = %channel.name, ?kind, "adopted existing subscription");
                        self.subs.insert(
                            record.broadcaster_id.clone(),
                            SubEntry {
                                sub_id: Some(record.id),
                                kind,
                                session_id: record_session,
                                channel: channel.name,
                            },
                        );
                    }
                    None => {
                        // On our session but for nobody we watch.
                        let _ = self.api.delete_subscription(token, &record.id).await;
                    }
                }
            } else if !known.contains(&record_session) {
                // Garbage from a prior process lifetime.
                debug!(sub_id = %record.id, "deleting subscription from unknown session");
                if let Err(err) = self.api.delete_subscription(token, &record.id).await {
                    warn!(sub_id = %record.id, %err, "stale subscription delete failed");
                }
            }
        }
    }

    /// Create the complement-of-live subscription for a channel unless one
    /// already exists on some session.
    async fn ensure_subscription(&mut self, token: &str, channel: &ChannelName, session_id: &str) {
        let Some(record) = self.roster.get(channel).await else {
            return;
        };
        if record.twitch_id.is_empty() {
            return;
        }
        let desired = EventKind::desired_for(record.is_live);

        if let Some(entry) = self.subs.get(&record.twitch_id) {
            if entry.kind == desired {
                return;
            }
        }
        if self.session_sub_count(session_id) >= SESSION_SUB_CEILING {
            warn!(%channel, "session at subscription ceiling, queued");
            self.pending.push_back(channel.clone());
            return;
        }
        self.create_subscription(token, channel, &record.twitch_id, desired, session_id)
            .await;
    }

    async fn create_subscription(
        &mut self,
        token: &str,
        channel: &ChannelName,
        twitch_id: &str,
        kind: EventKind,
        session_id: &str,
    ) {
        let _permit = self.create_limiter.clone().acquire_owned().await;
        match self
            .api
            .create_subscription(token, kind, twitch_id, session_id)
            .await
        {
            Ok(sub_id) => {
                info!(%channel, kind = kind.as_subscription_type(), "subscribed");
                self.subs.insert(
                    twitch_id.to_string(),
                    SubEntry {
                        sub_id: Some(sub_id),
                        kind,
                        session_id: session_id.to_string(),
                        channel: channel.clone(),
                    },
                );
            }
            Err(CoreError::SubscriptionConflict) => {
                // Upstream already holds it; that is success. Track it
                // without an id, hygiene reconciles the id later.
                debug!(%channel, "subscription already exists upstream");
                self.subs.insert(
                    twitch_id.to_string(),
                    SubEntry {
                        sub_id: None,
                        kind,
                        session_id: session_id.to_string(),
                        channel: channel.clone(),
                    },
                );
            }
            Err(CoreError::CredentialRejected) => {
                warn!(%channel, "subscription create rejected, forcing token refresh");
                self.token_error = Some("credential rejected by upstream".into());
                if let Err(err) = self.tokens.get(true).await {
                    warn!(%err, "forced token refresh failed");
                }
            }
            Err(CoreError::SubscriptionCostExceeded) => {
                warn!(%channel, "subscription cost ceiling exceeded, operator action required");
                self.token_error = Some("subscription cost ceiling exceeded".into());
                self.pending.push_back(channel.clone());
            }
            Err(err) => {
                warn!(%channel, %err, "subscription create failed");
            }
        }
    }

    async fn drain_pending(&mut self, token: &str, session_id: &str) {
        // Bounded by the queue length at entry; a channel that fails its
        // create and is re-queued must not spin this loop.
        for _ in 0..self.pending.len() {
            if self.session_sub_count(session_id) >= SESSION_SUB_CEILING {
                break;
            }
            let Some(channel) = self.pending.pop_front() else {
                break;
            };
            if let Some(slot) = self
                .slots
                .iter_mut()
                .find(|s| s.session_id.as_deref() == Some(session_id))
            {
                if !slot.assigned.contains(&channel) {
                    slot.assigned.push(channel.clone());
                }
            }
            self.ensure_subscription(token, &channel, session_id).await;
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn on_notification(&mut self, notification: super::frames::Notification) {
        let Some(broadcaster_id) = notification.broadcaster_id.clone() else {
            return;
        };
        let Some(kind) = notification.kind else {
            return;
        };

        let Some(channel) = self.roster.find_by_id(&broadcaster_id).await else {
            warn!(%broadcaster_id, "notification for unknown broadcaster dropped");
            return;
        };

        if !notification.is_actionable() {
            debug!(
                channel = %channel.name,
                stream_type = notification.stream_type.as_deref().unwrap_or(""),
                "non-live broadcast start ignored"
            );
            return;
        }

        info!(channel = %channel.name, kind = kind.as_subscription_type(), "push notification");
        let _ = self
            .events_tx
            .send(StreamEvent {
                channel: channel.name.clone(),
                kind,
                title: None,
            })
            .await;

        self.flip_subscription(&channel.name, &broadcaster_id, kind)
            .await;
    }

    /// Replace the just-fired subscription with its complement on the same
    /// session, so the next transition is always covered.
    async fn flip_subscription(
        &mut self,
        channel: &ChannelName,
        broadcaster_id: &str,
        fired: EventKind,
    ) {
        let Some(token) = self.fetch_token().await else {
            return;
        };
        let session_id = match self.subs.get(broadcaster_id) {
            Some(entry) => entry.session_id.clone(),
            None => match self
                .slots
                .iter()
                .find(|s| s.status == SessionStatus::Connected)
                .and_then(|s| s.session_id.clone())
            {
                Some(session_id) => session_id,
                None => return,
            },
        };

        self.delete_for_broadcaster(&token, broadcaster_id).await;
        self.subs.remove(broadcaster_id);
        self.create_subscription(&token, channel, broadcaster_id, fired.complement(), &session_id)
            .await;
    }

    /// Delete every upstream subscription for one broadcaster, whatever
    /// session it lives on.
    async fn delete_for_broadcaster(&mut self, token: &str, broadcaster_id: &str) {
        let records = match self.api.list_subscriptions(token).await {
            Ok(records) => records,
            Err(err) => {
                warn!(broadcaster_id, %err, "list before delete failed");
                return;
            }
        };
        for record in records {
            if record.broadcaster_id != broadcaster_id {
                continue;
            }
            if let Err(err) = self.api.delete_subscription(token, &record.id).await {
                warn!(sub_id = %record.id, %err, "subscription delete failed");
            }
        }
    }

    fn on_revocation(&mut self, subscription_id: Option<String>, broadcaster_id: Option<String>) {
        // Upstream told us it is gone for a reason; forget, never recreate.
        if let Some(broadcaster_id) = broadcaster_id {
            if let Some(entry) = self.subs.remove(&broadcaster_id) {
                warn!(channel = %entry.channel, "subscription revoked by upstream");
            }
        } else if let Some(sub_id) = subscription_id {
            self.subs
                .retain(|_, entry| entry.sub_id.as_deref() != Some(&sub_id));
        }
    }

    // ------------------------------------------------------------------
    // Runtime roster changes
    // ------------------------------------------------------------------

    async fn add_channel(&mut self, channel: ChannelName) {
        if !self.running {
            self.start_sessions().await;
        }
        let Some(token) = self.fetch_token().await else {
            self.pending.push_back(channel);
            return;
        };

        // The connected session with the most headroom wins.
        let candidate = self
            .slots
            .iter()
            .filter(|s| s.status == SessionStatus::Connected)
            .filter_map(|s| s.session_id.clone())
            .map(|sid| (self.session_sub_count(&sid), sid))
            .filter(|(count, _)| *count < SESSION_SUB_CEILING)
            .min_by_key(|(count, _)| *count);

        match candidate {
            Some((_, session_id)) => {
                if let Some(slot) = self
                    .slots
                    .iter_mut()
                    .find(|s| s.session_id.as_deref() == Some(session_id.as_str()))
                {
                    if !slot.assigned.contains(&channel) {
                        slot.assigned.push(channel.clone());
                    }
                }
                self.ensure_subscription(&token, &channel, &session_id).await;
            }
            None => {
                warn!(%channel, "no session capacity, queued for next rebalance");
                self.pending.push_back(channel);
            }
        }
    }

    async fn remove_channel(&mut self, channel: &ChannelName, twitch_id: &str) {
        for slot in &mut self.slots {
            slot.assigned.retain(|c| c != channel);
        }
        self.pending.retain(|c| c != channel);
        self.subs.remove(twitch_id);

        if !twitch_id.is_empty() {
            if let Some(token) = self.fetch_token().await {
                self.delete_for_broadcaster(&token, twitch_id).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Hygiene
    // ------------------------------------------------------------------

    /// The authoritative dedup pass: for every (broadcaster, kind) group
    /// holding more than one subscription, keep the newest.
    async fn run_hygiene(&mut self) {
        let Some(token) = self.fetch_token().await else {
            return;
        };
        let records = match self.api.list_subscriptions(&token).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "hygiene list failed");
                return;
            }
        };

        let mut groups: HashMap<(String, Option<EventKind>), Vec<SubscriptionRecord>> =
            HashMap::new();
        for record in records {
            groups
                .entry((record.broadcaster_id.clone(), record.kind))
                .or_default()
                .push(record);
        }

        let mut removed = 0usize;
        for (_, mut group) in groups {
            if group.len() <= 1 {
                continue;
            }
            group.sort_by_key(|r| r.created_at);
            // Newest survives.
            for stale in group.into_iter().rev().skip(1) {
                match self.api.delete_subscription(&token, &stale.id).await {
                    Ok(_) => removed += 1,
                    Err(err) => warn!(sub_id = %stale.id, %err, "hygiene delete failed"),
                }
            }
        }
        if removed > 0 {
            info!(removed, "duplicate subscriptions cleaned up");
        } else {
            debug!("hygiene pass found no duplicates");
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn fetch_token(&mut self) -> Option<String> {
        match self.tokens.get(false).await {
            Ok((Some(token), _)) => {
                self.token_error = None;
                Some(token)
            }
            Ok((None, _)) => {
                self.token_error = Some("no access token available".into());
                None
            }
            Err(err) => {
                self.token_error = Some(err.to_string());
                None
            }
        }
    }

    fn session_sub_count(&self, session_id: &str) -> usize {
        self.subs
            .values()
            .filter(|entry| entry.session_id == session_id)
            .count()
    }

    fn status(&self) -> PushStatus {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in self.subs.values() {
            *counts.entry(entry.session_id.clone()).or_default() += 1;
        }
        PushStatus {
            running: self.running,
            connections: self
                .slots
                .iter()
                .map(|slot| ConnectionStatus {
                    id: slot.index,
                    status: slot.status,
                    session_id: slot.session_id.clone(),
                    assigned_channels: slot.assigned.len(),
                })
                .collect(),
            total_subscriptions: self.subs.len(),
            session_subscription_counts: counts,
            pending_channels: self.pending.iter().cloned().collect(),
            token_error: self.token_error.clone(),
        }
    }
}
