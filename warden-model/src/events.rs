use serde::{Deserialize, Serialize};

use crate::channel::{ChannelName, DownloadStatus};

/// The two push event kinds the platform delivers for a broadcaster.
///
/// The subscription invariant is phrased in terms of the complement: a
/// channel that is live holds a `LiveEnded` subscription and vice versa,
/// so the next transition is always covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LiveStarted,
    LiveEnded,
}

impl EventKind {
    pub fn complement(self) -> Self {
        match self {
            EventKind::LiveStarted => EventKind::LiveEnded,
            EventKind::LiveEnded => EventKind::LiveStarted,
        }
    }

    /// The kind to subscribe to for a channel with the given live flag.
    pub fn desired_for(is_live: bool) -> Self {
        if is_live {
            EventKind::LiveEnded
        } else {
            EventKind::LiveStarted
        }
    }

    /// Upstream subscription type string.
    pub fn as_subscription_type(self) -> &'static str {
        match self {
            EventKind::LiveStarted => "stream.online",
            EventKind::LiveEnded => "stream.offline",
        }
    }

    pub fn from_subscription_type(kind: &str) -> Option<Self> {
        match kind {
            "stream.online" => Some(EventKind::LiveStarted),
            "stream.offline" => Some(EventKind::LiveEnded),
            _ => None,
        }
    }
}

/// A decoded push notification, routed from the push subsystem to the
/// supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub channel: ChannelName,
    pub kind: EventKind,
    /// Stream title when the notification carried one.
    pub title: Option<String>,
}

/// State changes broadcast to connected UI clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusUpdate {
    LiveStatus {
        channel: ChannelName,
        is_live: bool,
    },
    Download {
        channel: ChannelName,
        status: DownloadStatus,
    },
    ChannelInfo {
        channel: ChannelName,
        title: String,
        thumbnail: String,
    },
    RosterChanged {
        channels: Vec<ChannelName>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complement_is_involutive() {
        for kind in [EventKind::LiveStarted, EventKind::LiveEnded] {
            assert_eq!(kind.complement().complement(), kind);
        }
    }

    #[test]
    fn desired_kind_covers_the_next_transition() {
        assert_eq!(EventKind::desired_for(true), EventKind::LiveEnded);
        assert_eq!(EventKind::desired_for(false), EventKind::LiveStarted);
    }

    #[test]
    fn subscription_type_roundtrip() {
        for kind in [EventKind::LiveStarted, EventKind::LiveEnded] {
            assert_eq!(
                EventKind::from_subscription_type(kind.as_subscription_type()),
                Some(kind)
            );
        }
        assert_eq!(EventKind::from_subscription_type("channel.update"), None);
    }

    #[test]
    fn status_update_serializes_tagged() {
        let update = StatusUpdate::LiveStatus {
            channel: ChannelName::new("alice"),
            is_live: true,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "live_status");
        assert_eq!(json["channel"], "alice");
    }
}
