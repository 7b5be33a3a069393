use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lower-cased channel login, the primary key of the roster.
///
/// Every lookup goes through this type, so a channel can never be tracked
/// twice under different casings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl AsRef<str>) -> Self {
        ChannelName(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for ChannelName {
    fn from(name: String) -> Self {
        ChannelName::new(name)
    }
}

impl From<ChannelName> for String {
    fn from(name: ChannelName) -> Self {
        name.0
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Preferred stream rendition, e.g. `best`, `1080p60`, `720p`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality(String);

impl Quality {
    pub fn new(quality: impl Into<String>) -> Self {
        Quality(quality.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_best(&self) -> bool {
        self.0 == "best"
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality("best".to_string())
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal and in-flight states of a channel's recording, persisted for
/// the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Idle,
    Downloading,
    Completed,
    Stopped,
    Error,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        DownloadStatus::Idle
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Idle => "idle",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Stopped => "stopped",
            DownloadStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One watched broadcaster, as stored in `roster.json`.
///
/// The schema is validated once at roster load; in-memory state is always
/// complete after that pass (see `Channel::normalized`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    /// Lower-cased login, mirrors the roster key.
    pub name: ChannelName,
    /// Upstream broadcaster id; empty until resolved.
    pub twitch_id: String,
    /// Whether live broadcasts of this channel should be captured.
    pub downloads_enabled: bool,
    /// Last known live flag, updated by push events and fallback polling.
    pub is_live: bool,
    /// Current stream title, `"Offline"` while the channel is down.
    pub title: String,
    /// Last non-placeholder title, restored when the channel comes back up.
    pub last_title: Option<String>,
    /// Current stream thumbnail URL, stored raw.
    pub thumbnail: String,
    pub profile_image_url: String,
    pub offline_image_url: String,
    /// Overrides the global storage root when set.
    pub save_directory: Option<PathBuf>,
    pub quality: Quality,
    pub download_status: DownloadStatus,
}

impl Default for Channel {
    fn default() -> Self {
        Channel {
            name: ChannelName::new(""),
            twitch_id: String::new(),
            downloads_enabled: false,
            is_live: false,
            title: String::new(),
            last_title: None,
            thumbnail: String::new(),
            profile_image_url: String::new(),
            offline_image_url: String::new(),
            save_directory: None,
            quality: Quality::default(),
            download_status: DownloadStatus::Idle,
        }
    }
}

impl Channel {
    pub fn new(name: ChannelName) -> Self {
        let title = Channel::placeholder_title(&name);
        Channel {
            name,
            title,
            ..Channel::default()
        }
    }

    /// The synthetic title a channel carries before a real one is known.
    pub fn placeholder_title(name: &ChannelName) -> String {
        format!("{name}'s Stream")
    }

    /// True when `title` cannot be used to name a recording.
    pub fn has_placeholder_title(&self) -> bool {
        self.title.is_empty()
            || self.title == "Offline"
            || self.title == Channel::placeholder_title(&self.name)
    }

    /// Fill defaults for entries loaded from older roster files and force
    /// the name to agree with the roster key.
    pub fn normalized(mut self, key: &ChannelName) -> Self {
        self.name = key.clone();
        if self.title.is_empty() {
            self.title = Channel::placeholder_title(key);
        }
        self
    }
}
