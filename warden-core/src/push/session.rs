//! One push connection and its state machine.
//!
//! A session runner owns exactly one websocket connection slot. It dials,
//! waits for the welcome frame, then pumps frames to the manager until
//! the connection drops, a reconnect frame arrives, or it is cancelled.
//! Reconnection backs off exponentially; after the retry budget is spent
//! the slot is reported FAILED and left for the supervisor to repair.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frames::{Frame, parse_frame};

/// Retry budget before a slot is declared FAILED.
pub const MAX_RETRIES: u32 = 15;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const RETRY_FACTOR: f64 = 1.5;
const RETRY_CAP: Duration = Duration::from_secs(300);

/// Idle time on the socket before a liveness ping is sent.
const READ_IDLE: Duration = Duration::from_secs(60);
/// How long the pong may take before the connection is declared dead.
const PONG_DEADLINE: Duration = Duration::from_secs(10);
/// The welcome frame must arrive promptly after the dial.
const WELCOME_DEADLINE: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection slot states, mirrored into the push-debug surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

/// What a session runner reports back to the manager.
#[derive(Debug)]
pub enum SessionEventKind {
    StatusChanged(SessionStatus),
    /// Welcome observed; the slot now owns this upstream session id.
    Connected { session_id: String },
    Frame(Frame),
}

#[derive(Debug)]
pub struct SessionEvent {
    pub connection: usize,
    pub kind: SessionEventKind,
}

enum DriveEnd {
    /// Reconnect frame observed; redial with the cached URL.
    Reconnect,
    /// Connection lost for the given reason; back off and redial.
    Closed(String),
    /// Cancelled from outside; stop for good.
    Shutdown,
}

pub struct SessionRunner {
    pub connection: usize,
    pub ws_url: String,
    pub events: mpsc::Sender<SessionEvent>,
    pub cancel: CancellationToken,
}

impl SessionRunner {
    pub async fn run(self) {
        let mut retry_count: u32 = 0;
        let mut retry_delay = INITIAL_RETRY_DELAY;
        let mut reconnect_url: Option<String> = None;

        while retry_count < MAX_RETRIES && !self.cancel.is_cancelled() {
            // Reconnect URLs are one-time use.
            let url = reconnect_url.take().unwrap_or_else(|| self.ws_url.clone());
            self.emit_status(SessionStatus::Connecting).await;

            let reason = match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => match self.await_welcome(&mut ws).await {
                    Ok(session_id) => {
                        info!(connection = self.connection, %session_id, "push session connected");
                        retry_count = 0;
                        retry_delay = INITIAL_RETRY_DELAY;
                        self.emit_status(SessionStatus::Connected).await;
                        self.emit(SessionEventKind::Connected { session_id }).await;

                        match self.read_loop(&mut ws, &mut reconnect_url).await {
                            DriveEnd::Shutdown => {
                                let _ = ws.close(None).await;
                                return;
                            }
                            DriveEnd::Reconnect => {
                                self.emit_status(SessionStatus::Reconnecting).await;
                                let _ = ws.close(None).await;
                                continue;
                            }
                            DriveEnd::Closed(reason) => reason,
                        }
                    }
                    Err(reason) => reason,
                },
                Err(err) => format!("dial failed: {err}"),
            };

            warn!(
                connection = self.connection,
                retry_count, %reason, "push session disconnected"
            );
            self.emit_status(SessionStatus::Disconnected).await;

            retry_count += 1;
            if retry_count >= MAX_RETRIES {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(retry_delay) => {}
            }
            retry_delay = std::cmp::min(retry_delay.mul_f64(RETRY_FACTOR), RETRY_CAP);
        }

        if !self.cancel.is_cancelled() {
            warn!(connection = self.connection, "push session retry budget spent");
            self.emit_status(SessionStatus::Failed).await;
        }
    }

    /// The first frame after a dial must be a welcome carrying our session
    /// id.
    async fn await_welcome(&self, ws: &mut WsStream) -> Result<String, String> {
        let message = tokio::time::timeout(WELCOME_DEADLINE, ws.next())
            .await
            .map_err(|_| "welcome frame timed out".to_string())?
            .ok_or_else(|| "connection ended before welcome".to_string())?
            .map_err(|err| format!("welcome read failed: {err}"))?;

        let text = match message {
            Message::Text(text) => text,
            other => return Err(format!("unexpected welcome frame: {other:?}")),
        };
        match parse_frame(&text) {
            Ok(Frame::Welcome { session_id }) => Ok(session_id),
            Ok(frame) => Err(format!("expected welcome, got {frame:?}")),
            Err(err) => Err(format!("invalid welcome frame: {err}")),
        }
    }

    async fn read_loop(&self, ws: &mut WsStream, reconnect_url: &mut Option<String>) -> DriveEnd {
        let mut deadline = READ_IDLE;
        let mut pinged = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return DriveEnd::Shutdown,
                next = tokio::time::timeout(deadline, ws.next()) => {
                    let message = match next {
                        Err(_) if pinged => {
                            return DriveEnd::Closed("pong deadline elapsed".into());
                        }
                        Err(_) => {
                            // Nothing heard for a while; probe the socket.
                            if ws.send(Message::Ping(Vec::new())).await.is_err() {
                                return DriveEnd::Closed("liveness ping failed".into());
                            }
                            pinged = true;
                            deadline = PONG_DEADLINE;
                            continue;
                        }
                        Ok(None) => return DriveEnd::Closed("connection ended".into()),
                        Ok(Some(Err(err))) => return DriveEnd::Closed(err.to_string()),
                        Ok(Some(Ok(message))) => message,
                    };

                    // Any traffic proves liveness.
                    pinged = false;
                    deadline = READ_IDLE;

                    match message {
                        Message::Text(text) => match parse_frame(&text) {
                            Ok(Frame::Keepalive) => {}
                            Ok(Frame::Reconnect { url }) => {
                                info!(connection = self.connection, "reconnect frame received");
                                *reconnect_url = Some(url);
                                return DriveEnd::Reconnect;
                            }
                            Ok(Frame::Welcome { .. }) => {
                                debug!(connection = self.connection, "duplicate welcome ignored");
                            }
                            Ok(Frame::Unknown { message_type }) => {
                                debug!(connection = self.connection, %message_type, "unknown frame");
                            }
                            Ok(frame) => self.emit(SessionEventKind::Frame(frame)).await,
                            Err(err) => {
                                warn!(connection = self.connection, %err, "undecodable frame dropped");
                            }
                        },
                        Message::Ping(payload) => {
                            if ws.send(Message::Pong(payload)).await.is_err() {
                                return DriveEnd::Closed("pong write failed".into());
                            }
                        }
                        Message::Pong(_) => {}
                        Message::Close(_) => return DriveEnd::Closed("server closed".into()),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn emit(&self, kind: SessionEventKind) {
        let _ = self
            .events
            .send(SessionEvent {
                connection: self.connection,
                kind,
            })
            .await;
    }

    async fn emit_status(&self, status: SessionStatus) {
        self.emit(SessionEventKind::StatusChanged(status)).await;
    }
}
