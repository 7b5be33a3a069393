//! EventSub websocket frame decoding.
//!
//! Every frame is a JSON envelope with a `metadata.message_type`
//! discriminator and a `payload` whose shape depends on the type.

use serde::Deserialize;
use serde_json::Value;

use warden_model::EventKind;

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    message_type: String,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    #[serde(default)]
    session: SessionInfo,
}

#[derive(Debug, Default, Deserialize)]
struct SessionInfo {
    id: Option<String>,
    reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    #[serde(default)]
    subscription: SubscriptionInfo,
    #[serde(default)]
    event: EventInfo,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionInfo {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    condition: ConditionInfo,
}

#[derive(Debug, Default, Deserialize)]
struct ConditionInfo {
    broadcaster_user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventInfo {
    broadcaster_user_id: Option<String>,
    /// For `stream.online`: "live", "rerun", "playlist", ...
    #[serde(rename = "type")]
    stream_type: Option<String>,
}

/// A decoded push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: Option<EventKind>,
    pub broadcaster_id: Option<String>,
    pub stream_type: Option<String>,
}

impl Notification {
    /// `stream.online` fires for reruns and premieres too; only the
    /// `live` subtype marks a real broadcast start.
    pub fn is_actionable(&self) -> bool {
        match self.kind {
            Some(EventKind::LiveStarted) => self.stream_type.as_deref() == Some("live"),
            Some(EventKind::LiveEnded) => true,
            None => false,
        }
    }
}

/// One decoded frame off a push session.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Welcome {
        session_id: String,
    },
    Keepalive,
    Notification(Notification),
    Reconnect {
        url: String,
    },
    Revocation {
        subscription_id: Option<String>,
        broadcaster_id: Option<String>,
        kind: Option<EventKind>,
    },
    Unknown {
        message_type: String,
    },
}

pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let frame = match envelope.metadata.message_type.as_str() {
        "session_welcome" => {
            let payload: SessionPayload = serde_json::from_value(envelope.payload)?;
            match payload.session.id {
                Some(session_id) => Frame::Welcome { session_id },
                None => Frame::Unknown {
                    message_type: "session_welcome (missing id)".into(),
                },
            }
        }
        "session_keepalive" => Frame::Keepalive,
        "notification" => {
            let payload: NotificationPayload = serde_json::from_value(envelope.payload)?;
            Frame::Notification(Notification {
                kind: payload
                    .subscription
                    .kind
                    .as_deref()
                    .and_then(EventKind::from_subscription_type),
                broadcaster_id: payload
                    .event
                    .broadcaster_user_id
                    .or(payload.subscription.condition.broadcaster_user_id),
                stream_type: payload.event.stream_type,
            })
        }
        "session_reconnect" => {
            let payload: SessionPayload = serde_json::from_value(envelope.payload)?;
            match payload.session.reconnect_url {
                Some(url) => Frame::Reconnect { url },
                None => Frame::Unknown {
                    message_type: "session_reconnect (missing url)".into(),
                },
            }
        }
        "revocation" => {
            let payload: NotificationPayload = serde_json::from_value(envelope.payload)?;
            Frame::Revocation {
                subscription_id: payload.subscription.id,
                broadcaster_id: payload.subscription.condition.broadcaster_user_id,
                kind: payload
                    .subscription
                    .kind
                    .as_deref()
                    .and_then(EventKind::from_subscription_type),
            }
        }
        other => Frame::Unknown {
            message_type: other.to_string(),
        },
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_frame_carries_session_id() {
        let text = r#"{
            "metadata": { "message_id": "m1", "message_type": "session_welcome" },
            "payload": { "session": { "id": "sess-abc", "status": "connected" } }
        }"#;
        assert_eq!(
            parse_frame(text).unwrap(),
            Frame::Welcome {
                session_id: "sess-abc".into()
            }
        );
    }

    #[test]
    fn keepalive_frame() {
        let text = r#"{
            "metadata": { "message_type": "session_keepalive" },
            "payload": {}
        }"#;
        assert_eq!(parse_frame(text).unwrap(), Frame::Keepalive);
    }

    #[test]
    fn online_notification_decodes_kind_and_subtype() {
        let text = r#"{
            "metadata": { "message_type": "notification", "subscription_type": "stream.online" },
            "payload": {
                "subscription": {
                    "id": "s1",
                    "type": "stream.online",
                    "condition": { "broadcaster_user_id": "11111" }
                },
                "event": { "broadcaster_user_id": "11111", "type": "live" }
            }
        }"#;
        let Frame::Notification(notification) = parse_frame(text).unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(notification.kind, Some(EventKind::LiveStarted));
        assert_eq!(notification.broadcaster_id.as_deref(), Some("11111"));
        assert!(notification.is_actionable());
    }

    #[test]
    fn rerun_notification_is_not_actionable() {
        let notification = Notification {
            kind: Some(EventKind::LiveStarted),
            broadcaster_id: Some("11111".into()),
            stream_type: Some("rerun".into()),
        };
        assert!(!notification.is_actionable());
    }

    #[test]
    fn offline_notification_is_actionable_without_subtype() {
        let notification = Notification {
            kind: Some(EventKind::LiveEnded),
            broadcaster_id: Some("11111".into()),
            stream_type: None,
        };
        assert!(notification.is_actionable());
    }

    #[test]
    fn reconnect_frame_carries_url() {
        let text = r#"{
            "metadata": { "message_type": "session_reconnect" },
            "payload": { "session": { "id": "sess-abc", "reconnect_url": "wss://example/ws?id=1" } }
        }"#;
        assert_eq!(
            parse_frame(text).unwrap(),
            Frame::Reconnect {
                url: "wss://example/ws?id=1".into()
            }
        );
    }

    #[test]
    fn revocation_frame_decodes() {
        let text = r#"{
            "metadata": { "message_type": "revocation" },
            "payload": {
                "subscription": {
                    "id": "s9",
                    "type": "stream.offline",
                    "status": "authorization_revoked",
                    "condition": { "broadcaster_user_id": "22222" }
                }
            }
        }"#;
        assert_eq!(
            parse_frame(text).unwrap(),
            Frame::Revocation {
                subscription_id: Some("s9".into()),
                broadcaster_id: Some("22222".into()),
                kind: Some(EventKind::LiveEnded),
            }
        );
    }

    #[test]
    fn unknown_message_type_is_preserved() {
        let text = r#"{ "metadata": { "message_type": "session_banana" }, "payload": {} }"#;
        assert_eq!(
            parse_frame(text).unwrap(),
            Frame::Unknown {
                message_type: "session_banana".into()
            }
        );
    }
}
