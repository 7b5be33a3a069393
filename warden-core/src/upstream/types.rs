use chrono::{DateTime, Utc};
use serde::Deserialize;

use warden_model::EventKind;

/// Channel metadata as returned by the upstream lookup.
///
/// Static fields (images) change rarely and are cached for a day; the
/// live-status fields are refreshed on a sixty-second cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelMetadata {
    pub login: Option<String>,
    pub display_name: Option<String>,
    pub is_live: bool,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub profile_image_url: Option<String>,
    pub offline_image_url: Option<String>,
    pub viewer_count: Option<u64>,
    pub game: Option<String>,
}

impl ChannelMetadata {
    /// Overlay a fresh status-only fetch onto cached static fields.
    pub fn merge_status(&mut self, status: ChannelMetadata) {
        self.is_live = status.is_live;
        self.title = status.title;
        self.thumbnail = status.thumbnail;
        self.viewer_count = status.viewer_count;
        self.game = status.game;
    }
}

/// One upstream push subscription, as reported by the list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub id: String,
    /// None for subscription types this engine does not manage.
    pub kind: Option<EventKind>,
    pub broadcaster_id: String,
    /// Session the websocket transport points at, when applicable.
    pub session_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// GQL wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(super) struct GqlResponse {
    pub data: Option<GqlData>,
}

#[derive(Debug, Deserialize)]
pub(super) struct GqlData {
    pub user: Option<GqlUser>,
}

#[derive(Debug, Deserialize)]
pub(super) struct GqlUser {
    pub id: Option<String>,
    pub login: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(rename = "profileImageURL")]
    pub profile_image_url: Option<String>,
    #[serde(rename = "offlineImageURL")]
    pub offline_image_url: Option<String>,
    pub stream: Option<GqlStream>,
}

#[derive(Debug, Deserialize)]
pub(super) struct GqlStream {
    pub title: Option<String>,
    #[serde(rename = "viewersCount")]
    pub viewers_count: Option<u64>,
    #[serde(rename = "previewImageURL")]
    pub preview_image_url: Option<String>,
    pub game: Option<GqlGame>,
}

#[derive(Debug, Deserialize)]
pub(super) struct GqlGame {
    pub name: Option<String>,
}

impl From<GqlUser> for ChannelMetadata {
    fn from(user: GqlUser) -> Self {
        let mut meta = ChannelMetadata {
            login: user.login,
            display_name: user.display_name,
            profile_image_url: user.profile_image_url,
            offline_image_url: user.offline_image_url,
            ..ChannelMetadata::default()
        };
        if let Some(stream) = user.stream {
            meta.is_live = true;
            meta.title = stream.title;
            meta.thumbnail = stream.preview_image_url;
            meta.viewer_count = stream.viewers_count;
            meta.game = stream.game.and_then(|g| g.name);
        }
        meta
    }
}

// ---------------------------------------------------------------------------
// Helix wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(super) struct HelixSubscriptions {
    #[serde(default)]
    pub data: Vec<HelixSubscription>,
}

#[derive(Debug, Deserialize)]
pub(super) struct HelixSubscription {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub condition: HelixCondition,
    #[serde(default)]
    pub transport: HelixTransport,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct HelixCondition {
    pub broadcaster_user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct HelixTransport {
    pub method: Option<String>,
    pub session_id: Option<String>,
}

impl HelixSubscription {
    /// Keep only websocket-transport subscriptions; everything else
    /// belongs to some other consumer of the credential.
    pub fn into_record(self) -> Option<SubscriptionRecord> {
        if self.transport.method.as_deref() != Some("websocket") {
            return None;
        }
        let broadcaster_id = self.condition.broadcaster_user_id?;
        Some(SubscriptionRecord {
            id: self.id,
            kind: EventKind::from_subscription_type(&self.kind),
            broadcaster_id,
            session_id: self.transport.session_id,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gql_user_with_stream_maps_to_live_metadata() {
        let json = serde_json::json!({
            "id": "11111",
            "login": "alice",
            "displayName": "Alice",
            "profileImageURL": "https://cdn/profile.png",
            "offlineImageURL": "https://cdn/offline.png",
            "stream": {
                "title": "Speedrun",
                "viewersCount": 420,
                "previewImageURL": "https://cdn/preview.jpg",
                "game": { "name": "Metroid" }
            }
        });
        let user: GqlUser = serde_json::from_value(json).unwrap();
        let meta = ChannelMetadata::from(user);
        assert!(meta.is_live);
        assert_eq!(meta.title.as_deref(), Some("Speedrun"));
        assert_eq!(meta.game.as_deref(), Some("Metroid"));
        assert_eq!(meta.viewer_count, Some(420));
    }

    #[test]
    fn gql_user_without_stream_is_offline() {
        let json = serde_json::json!({ "login": "bob", "stream": null });
        let user: GqlUser = serde_json::from_value(json).unwrap();
        let meta = ChannelMetadata::from(user);
        assert!(!meta.is_live);
        assert!(meta.title.is_none());
    }

    #[test]
    fn non_websocket_subscriptions_are_dropped() {
        let sub: HelixSubscription = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "type": "stream.online",
            "condition": { "broadcaster_user_id": "11111" },
            "transport": { "method": "webhook" }
        }))
        .unwrap();
        assert!(sub.into_record().is_none());
    }

    #[test]
    fn websocket_subscription_maps_to_record() {
        let sub: HelixSubscription = serde_json::from_value(serde_json::json!({
            "id": "s2",
            "type": "stream.offline",
            "condition": { "broadcaster_user_id": "11111" },
            "transport": { "method": "websocket", "session_id": "sess-a" },
            "created_at": "2024-06-01T12:00:00Z"
        }))
        .unwrap();
        let record = sub.into_record().unwrap();
        assert_eq!(record.kind, Some(EventKind::LiveEnded));
        assert_eq!(record.session_id.as_deref(), Some("sess-a"));
    }

    #[test]
    fn merge_status_keeps_static_fields() {
        let mut meta = ChannelMetadata {
            profile_image_url: Some("p".into()),
            is_live: true,
            title: Some("old".into()),
            ..ChannelMetadata::default()
        };
        meta.merge_status(ChannelMetadata {
            is_live: false,
            ..ChannelMetadata::default()
        });
        assert!(!meta.is_live);
        assert!(meta.title.is_none());
        assert_eq!(meta.profile_image_url.as_deref(), Some("p"));
    }
}
