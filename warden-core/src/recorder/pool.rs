//! The recorder pool.
//!
//! Owns every capture worker and enforces at-most-one per channel. A
//! start request reserves the channel's slot under the pool lock, then
//! runs the fresh-liveness and title preconditions off-lock; the
//! reservation is dropped if they fail. Natural completions install a
//! per-channel cooldown so end-of-stream does not restart the recorder
//! against a stale roster.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_model::{Channel, ChannelName, DownloadStatus, StatusUpdate};

use crate::error::{CoreError, Result};
use crate::roster::RosterStore;
use crate::upstream::ChannelApi;

use super::extract::{CaptureRequest, StreamExtractor};
use super::filename::{sanitize_title, unique_recording_path};
use super::worker::{Completion, spawn_capture};

/// Window after a natural completion during which restarts are refused.
pub const COOLDOWN: Duration = Duration::from_secs(30);

/// Why a recording is being stopped; decides the published terminal
/// status and whether a cooldown is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator asked; no cooldown, they may restart at will.
    Operator,
    /// The broadcast ended; cooldown guards against a restart storm.
    StreamEnded,
}

#[derive(Debug)]
enum JobSlot {
    /// Reserved while the off-lock preconditions run.
    Pending,
    Running(RecordingJob),
}

#[derive(Debug)]
pub struct RecordingJob {
    pub destination: PathBuf,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct PoolState {
    jobs: HashMap<ChannelName, JobSlot>,
    cooldowns: HashMap<ChannelName, Instant>,
}

pub struct RecorderPool {
    state: Mutex<PoolState>,
    extractor: Arc<dyn StreamExtractor>,
    api: Arc<dyn ChannelApi>,
    roster: Arc<RosterStore>,
    updates: broadcast::Sender<StatusUpdate>,
    completions_tx: mpsc::Sender<Completion>,
    active_threads: Arc<AtomicUsize>,
    cookie_path: PathBuf,
}

impl std::fmt::Debug for RecorderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderPool").finish_non_exhaustive()
    }
}

impl RecorderPool {
    pub fn new(
        extractor: Arc<dyn StreamExtractor>,
        api: Arc<dyn ChannelApi>,
        roster: Arc<RosterStore>,
        updates: broadcast::Sender<StatusUpdate>,
        cookie_path: PathBuf,
    ) -> Arc<Self> {
        let (completions_tx, completions_rx) = mpsc::channel(16);
        let pool = Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            extractor,
            api,
            roster,
            updates,
            completions_tx,
            active_threads: Arc::new(AtomicUsize::new(0)),
            cookie_path,
        });
        tokio::spawn(completion_loop(Arc::downgrade(&pool), completions_rx));
        pool
    }

    /// Start recording a channel. Silently succeeds when a job already
    /// exists; refuses with `Cooldown` inside the post-completion window.
    pub async fn start(&self, name: &ChannelName) -> Result<()> {
        let channel = self
            .roster
            .get(name)
            .await
            .ok_or_else(|| CoreError::UnknownChannel(name.to_string()))?;
        if channel.twitch_id.is_empty() {
            return Err(CoreError::UnknownChannel(format!(
                "{name} has no resolved upstream id"
            )));
        }

        {
            let mut state = self.state.lock().await;
            if state.jobs.contains_key(name) {
                debug!(%name, "recording already in progress, skipping");
                return Ok(());
            }
            if let Some(until) = state.cooldowns.get(name) {
                if Instant::now() < *until {
                    return Err(CoreError::Cooldown(name.to_string()));
                }
                state.cooldowns.remove(name);
            }
            state.jobs.insert(name.clone(), JobSlot::Pending);
        }

        match self.prepare_and_launch(&channel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.lock().await.jobs.remove(name);
                Err(err)
            }
        }
    }

    /// The off-lock half of the start contract: verify liveness against a
    /// fresh upstream query, resolve a usable title, pick a destination,
    /// spawn the worker.
    async fn prepare_and_launch(&self, channel: &Channel) -> Result<()> {
        let name = &channel.name;
        let fresh = self.api.get_channel(&channel.twitch_id).await?;

        if !fresh.is_live {
            info!(%name, "not live on fresh check, aborting start");
            self.roster
                .update(name, |c| {
                    c.is_live = false;
                    c.download_status = DownloadStatus::Stopped;
                })
                .await?;
            self.publish(StatusUpdate::LiveStatus {
                channel: name.clone(),
                is_live: false,
            });
            self.publish(StatusUpdate::Download {
                channel: name.clone(),
                status: DownloadStatus::Stopped,
            });
            return Err(CoreError::NotLive(name.to_string()));
        }

        let mut title = channel.title.clone();
        if channel.has_placeholder_title() {
            if let Some(fresh_title) = fresh.title.clone().filter(|t| !t.is_empty()) {
                title = fresh_title.clone();
                self.roster
                    .update(name, |c| c.title = fresh_title)
                    .await?;
            }
        }
        let placeholder = Channel::placeholder_title(name);
        if title.is_empty() || title == "Offline" || title == placeholder {
            warn!(%name, "no usable stream title, aborting start");
            self.roster
                .update(name, |c| c.download_status = DownloadStatus::Error)
                .await?;
            self.publish(StatusUpdate::Download {
                channel: name.clone(),
                status: DownloadStatus::Error,
            });
            return Err(CoreError::TitleUnresolved(name.to_string()));
        }

        let directory = self.roster.storage_path_for(channel).await;
        let date = Local::now().format("%Y-%m-%d").to_string();
        let safe_title = sanitize_title(&title);
        let destination = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            std::fs::create_dir_all(&directory)?;
            Ok(unique_recording_path(&directory, &date, &safe_title))
        })
        .await
        .map_err(|err| CoreError::Internal(format!("path task panicked: {err}")))??;

        let auth_token = match tokio::fs::read_to_string(&self.cookie_path).await {
            Ok(cookie) if !cookie.trim().is_empty() => Some(cookie.trim().to_string()),
            _ => None,
        };

        let cancel = CancellationToken::new();
        spawn_capture(
            self.extractor.clone(),
            CaptureRequest {
                channel: name.clone(),
                quality: channel.quality.clone(),
                auth_token,
            },
            destination.clone(),
            cancel.clone(),
            self.completions_tx.clone(),
            self.active_threads.clone(),
        )?;

        {
            let mut state = self.state.lock().await;
            match state.jobs.get_mut(name) {
                Some(slot) => {
                    *slot = JobSlot::Running(RecordingJob {
                        destination: destination.clone(),
                        started_at: Utc::now(),
                        cancel,
                    });
                }
                None => {
                    // Stopped while the preconditions ran; reel the worker
                    // back in.
                    cancel.cancel();
                    return Ok(());
                }
            }
        }
        info!(%name, path = %destination.display(), "recording started");

        self.roster
            .update(name, |c| c.download_status = DownloadStatus::Downloading)
            .await?;
        self.publish(StatusUpdate::Download {
            channel: name.clone(),
            status: DownloadStatus::Downloading,
        });
        Ok(())
    }

    /// Stop a recording: raise the cancellation signal and forget the job
    /// immediately. The worker runs to its next chunk boundary; the file
    /// stays as-is. Never joins in the caller.
    pub async fn stop(&self, name: &ChannelName, reason: StopReason) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.jobs.remove(name);
            if removed.is_some() && reason == StopReason::StreamEnded {
                state.cooldowns.insert(name.clone(), Instant::now() + COOLDOWN);
            }
            removed
        };
        let Some(slot) = removed else {
            return false;
        };
        if let JobSlot::Running(job) = slot {
            job.cancel.cancel();
        }

        let status = match reason {
            StopReason::Operator => DownloadStatus::Stopped,
            StopReason::StreamEnded => DownloadStatus::Completed,
        };
        info!(%name, %status, "recording stopped");
        if let Err(err) = self
            .roster
            .update(name, |c| c.download_status = status)
            .await
        {
            warn!(%name, %err, "failed to persist stop status");
        }
        self.publish(StatusUpdate::Download {
            channel: name.clone(),
            status,
        });
        true
    }

    /// A worker finished on its own: drop the job, install the cooldown,
    /// publish the terminal status.
    async fn on_completion(&self, completion: Completion) {
        let channel = completion.channel;
        let job = {
            let mut state = self.state.lock().await;
            let Some(slot) = state.jobs.remove(&channel) else {
                // Stopped through the front door in the meantime.
                return;
            };
            state
                .cooldowns
                .insert(channel.clone(), Instant::now() + COOLDOWN);
            slot
        };

        let status = if completion.code == 0 {
            DownloadStatus::Completed
        } else {
            DownloadStatus::Error
        };
        if let JobSlot::Running(job) = job {
            let duration = Utc::now().signed_duration_since(job.started_at);
            info!(%channel, %status, minutes = duration.num_minutes(), "recording finished");
        } else {
            info!(%channel, %status, "recording finished");
        }
        if let Err(err) = self
            .roster
            .update(&channel, |c| c.download_status = status)
            .await
        {
            warn!(%channel, %err, "failed to persist completion status");
        }
        self.publish(StatusUpdate::Download { channel, status });
    }

    /// Start-up reconciliation: fresh upstream live checks for every
    /// downloads-enabled channel, launching workers for the live ones.
    /// Recovers recordings after a restart mid-broadcast.
    pub async fn reconcile(&self) {
        let channels = self.roster.snapshot().await;
        for channel in channels {
            if !channel.downloads_enabled || channel.twitch_id.is_empty() {
                continue;
            }
            let name = channel.name.clone();
            match self.api.get_channel(&channel.twitch_id).await {
                Ok(fresh) => {
                    let is_live = fresh.is_live;
                    let title = fresh.title.clone();
                    let thumbnail = fresh.thumbnail.clone();
                    let _ = self
                        .roster
                        .update(&name, |c| {
                            c.is_live = is_live;
                            if let Some(title) = title.clone() {
                                c.title = title;
                            }
                            if let Some(thumbnail) = thumbnail.clone() {
                                c.thumbnail = thumbnail;
                            }
                        })
                        .await;
                    if is_live {
                        match self.start(&name).await {
                            Ok(()) | Err(CoreError::Cooldown(_)) => {}
                            Err(err) => warn!(%name, %err, "reconciliation start failed"),
                        }
                    }
                }
                Err(err) => warn!(%name, %err, "reconciliation status check failed"),
            }
        }
    }

    pub async fn is_recording(&self, name: &ChannelName) -> bool {
        self.state.lock().await.jobs.contains_key(name)
    }

    pub async fn in_cooldown(&self, name: &ChannelName) -> bool {
        let state = self.state.lock().await;
        state
            .cooldowns
            .get(name)
            .map(|until| Instant::now() < *until)
            .unwrap_or(false)
    }

    pub async fn active_channels(&self) -> Vec<ChannelName> {
        self.state.lock().await.jobs.keys().cloned().collect()
    }

    pub async fn destination_of(&self, name: &ChannelName) -> Option<PathBuf> {
        match self.state.lock().await.jobs.get(name) {
            Some(JobSlot::Running(job)) => Some(job.destination.clone()),
            _ => None,
        }
    }

    /// Cancel every worker and wait out the grace period for their threads
    /// to drain. Files are left in whatever state they reached.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.state.lock().await;
            for (_, slot) in state.jobs.drain() {
                if let JobSlot::Running(job) = slot {
                    job.cancel.cancel();
                }
            }
        }
        let deadline = Instant::now() + grace;
        while self.active_threads.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.active_threads.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!(leftover, "capture threads still draining at shutdown");
        }
    }

    fn publish(&self, update: StatusUpdate) {
        let _ = self.updates.send(update);
    }
}

async fn completion_loop(
    pool: std::sync::Weak<RecorderPool>,
    mut completions: mpsc::Receiver<Completion>,
) {
    while let Some(completion) = completions.recv().await {
        match pool.upgrade() {
            Some(pool) => pool.on_completion(completion).await,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::recorder::extract::{MockStreamExtractor, StreamSource};
    use crate::upstream::{ChannelMetadata, MockChannelApi};

    struct ScriptedSource {
        chunks: Vec<Vec<u8>>,
        delay: Duration,
    }

    impl StreamSource for ScriptedSource {
        fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(self.delay);
            match self.chunks.pop() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            config_dir: dir.to_path_buf(),
            default_storage_root: dir.join("streams"),
            server_host: "127.0.0.1".into(),
            server_port: 0,
            gql_url: String::new(),
            helix_url: String::new(),
            eventsub_ws_url: String::new(),
            refresh_endpoint: String::new(),
            gql_client_id: String::new(),
            helix_client_id: String::new(),
            streamlink_path: String::new(),
        }
    }

    async fn roster_with_alice(config: &Config) -> Arc<RosterStore> {
        let roster = Arc::new(RosterStore::load(config).await);
        let mut channel = Channel::new(ChannelName::new("alice"));
        channel.twitch_id = "11111".into();
        channel.downloads_enabled = true;
        channel.title = "Speedrun".into();
        channel.is_live = true;
        roster.insert(channel).await.unwrap();
        roster
    }

    fn live_metadata(title: &str) -> ChannelMetadata {
        ChannelMetadata {
            is_live: true,
            title: Some(title.to_string()),
            ..ChannelMetadata::default()
        }
    }

    fn pool_with(
        api: MockChannelApi,
        extractor: MockStreamExtractor,
        roster: Arc<RosterStore>,
        dir: &std::path::Path,
    ) -> Arc<RecorderPool> {
        let (updates, _) = broadcast::channel(64);
        RecorderPool::new(
            Arc::new(extractor),
            Arc::new(api),
            roster,
            updates,
            dir.join("push-cookie.txt"),
        )
    }

    async fn wait_for_status(
        roster: &RosterStore,
        name: &ChannelName,
        expected: DownloadStatus,
    ) {
        for _ in 0..100 {
            if roster.get(name).await.map(|c| c.download_status) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("channel never reached {expected:?}");
    }

    #[tokio::test]
    async fn natural_completion_installs_cooldown_and_refuses_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let roster = roster_with_alice(&config).await;
        let alice = ChannelName::new("alice");

        let mut api = MockChannelApi::new();
        api.expect_get_channel()
            .returning(|_| Ok(live_metadata("Speedrun")));
        let mut extractor = MockStreamExtractor::new();
        extractor.expect_open().returning(|_| {
            Ok(Box::new(ScriptedSource {
                chunks: vec![b"data".to_vec()],
                delay: Duration::ZERO,
            }) as Box<dyn StreamSource>)
        });

        let pool = pool_with(api, extractor, roster.clone(), dir.path());
        pool.start(&alice).await.unwrap();
        wait_for_status(&roster, &alice, DownloadStatus::Completed).await;

        assert!(pool.in_cooldown(&alice).await);
        assert!(matches!(
            pool.start(&alice).await,
            Err(CoreError::Cooldown(_))
        ));

        let file = dir
            .path()
            .join("streams")
            .join("alice")
            .read_dir()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let name = file.file_name().into_string().unwrap();
        assert!(name.ends_with("Speedrun.mp4"), "unexpected name {name}");
        assert_eq!(std::fs::read(file.path()).unwrap(), b"data");
    }

    #[tokio::test]
    async fn concurrent_starts_yield_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let roster = roster_with_alice(&config).await;
        let alice = ChannelName::new("alice");

        let mut api = MockChannelApi::new();
        api.expect_get_channel()
            .returning(|_| Ok(live_metadata("Speedrun")));
        let mut extractor = MockStreamExtractor::new();
        // A slow source keeps the first worker running while the second
        // start request races it.
        extractor.expect_open().times(1).returning(|_| {
            Ok(Box::new(ScriptedSource {
                chunks: vec![b"x".to_vec(); 50],
                delay: Duration::from_millis(20),
            }) as Box<dyn StreamSource>)
        });

        let pool = pool_with(api, extractor, roster.clone(), dir.path());
        let (a, b) = tokio::join!(pool.start(&alice), pool.start(&alice));
        a.unwrap();
        b.unwrap();

        assert_eq!(pool.active_channels().await.len(), 1);
        assert!(pool.stop(&alice, StopReason::Operator).await);
        assert!(!pool.is_recording(&alice).await);
        // Operator stop installs no cooldown.
        assert!(!pool.in_cooldown(&alice).await);
        pool.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn stale_live_flag_aborts_start_and_corrects_roster() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let roster = roster_with_alice(&config).await;
        let alice = ChannelName::new("alice");

        let mut api = MockChannelApi::new();
        api.expect_get_channel()
            .returning(|_| Ok(ChannelMetadata::default()));
        let extractor = MockStreamExtractor::new();

        let pool = pool_with(api, extractor, roster.clone(), dir.path());
        assert!(matches!(
            pool.start(&alice).await,
            Err(CoreError::NotLive(_))
        ));
        assert!(!roster.get(&alice).await.unwrap().is_live);
        assert!(!pool.is_recording(&alice).await);
    }

    #[tokio::test]
    async fn placeholder_title_is_resolved_from_fresh_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let roster = Arc::new(RosterStore::load(&config).await);
        let bob = ChannelName::new("bob");
        let mut channel = Channel::new(bob.clone());
        channel.twitch_id = "22222".into();
        channel.downloads_enabled = true;
        channel.is_live = true;
        roster.insert(channel).await.unwrap();

        let mut api = MockChannelApi::new();
        api.expect_get_channel()
            .returning(|_| Ok(live_metadata("Chill stream")));
        let mut extractor = MockStreamExtractor::new();
        extractor.expect_open().returning(|_| {
            Ok(Box::new(ScriptedSource {
                chunks: vec![b"d".to_vec()],
                delay: Duration::ZERO,
            }) as Box<dyn StreamSource>)
        });

        let pool = pool_with(api, extractor, roster.clone(), dir.path());
        pool.start(&bob).await.unwrap();
        wait_for_status(&roster, &bob, DownloadStatus::Completed).await;

        assert_eq!(roster.get(&bob).await.unwrap().title, "Chill stream");
        let file = dir
            .path()
            .join("streams")
            .join("bob")
            .read_dir()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert!(
            file.file_name()
                .into_string()
                .unwrap()
                .ends_with("Chill stream.mp4")
        );
    }

    #[tokio::test]
    async fn unresolvable_title_aborts_with_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let roster = Arc::new(RosterStore::load(&config).await);
        let bob = ChannelName::new("bob");
        let mut channel = Channel::new(bob.clone());
        channel.twitch_id = "22222".into();
        channel.is_live = true;
        roster.insert(channel).await.unwrap();

        let mut api = MockChannelApi::new();
        api.expect_get_channel().returning(|_| {
            Ok(ChannelMetadata {
                is_live: true,
                title: None,
                ..ChannelMetadata::default()
            })
        });
        let extractor = MockStreamExtractor::new();

        let pool = pool_with(api, extractor, roster.clone(), dir.path());
        assert!(matches!(
            pool.start(&bob).await,
            Err(CoreError::TitleUnresolved(_))
        ));
        assert_eq!(
            roster.get(&bob).await.unwrap().download_status,
            DownloadStatus::Error
        );
    }
}
