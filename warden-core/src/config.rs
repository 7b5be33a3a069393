use std::env;
use std::path::PathBuf;

/// Runtime configuration, resolved once at start-up from the environment.
///
/// Secret material (the OAuth client secret) lives with the external auth
/// service; this process only ever sees the refresh endpoint URL.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding roster.json, token.json, push-cookie.txt and
    /// backups/.
    pub config_dir: PathBuf,

    /// Fallback root for recordings when a channel has no save directory
    /// of its own.
    pub default_storage_root: PathBuf,

    // HTTP front-end bind address
    pub server_host: String,
    pub server_port: u16,

    // Upstream endpoints
    pub gql_url: String,
    pub helix_url: String,
    pub eventsub_ws_url: String,
    pub refresh_endpoint: String,

    /// Client id presented to the public GQL endpoint.
    pub gql_client_id: String,
    /// OAuth application client id presented to Helix.
    pub helix_client_id: String,

    /// Media extractor binary driven by the capture workers.
    pub streamlink_path: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());

        let config_dir = env::var("WARDEN_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&home).join(".config").join("warden"));

        let default_storage_root = env::var("WARDEN_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&home).join("Downloads").join("Streams"));

        Ok(Self {
            config_dir,
            default_storage_root,

            server_host: env::var("WARDEN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("WARDEN_PORT")
                .unwrap_or_else(|_| "8420".to_string())
                .parse()
                .unwrap_or(8420),

            gql_url: env::var("WARDEN_GQL_URL")
                .unwrap_or_else(|_| "https://gql.twitch.tv/gql".to_string()),
            helix_url: env::var("WARDEN_HELIX_URL")
                .unwrap_or_else(|_| "https://api.twitch.tv/helix".to_string()),
            eventsub_ws_url: env::var("WARDEN_EVENTSUB_WS_URL")
                .unwrap_or_else(|_| "wss://eventsub.wss.twitch.tv/ws".to_string()),
            refresh_endpoint: env::var("WARDEN_REFRESH_ENDPOINT").unwrap_or_else(|_| {
                "https://authentication.acheapdomain.click/auth/refresh".to_string()
            }),

            gql_client_id: env::var("WARDEN_GQL_CLIENT_ID")
                .unwrap_or_else(|_| "kimne78kx3ncx6brgo4mv6wki5h1ko".to_string()),
            helix_client_id: env::var("WARDEN_CLIENT_ID")
                .unwrap_or_else(|_| "d88elif9gig3jo3921wrlusmc5rz21".to_string()),

            streamlink_path: env::var("WARDEN_STREAMLINK_PATH")
                .unwrap_or_else(|_| "streamlink".to_string()),
        })
    }

    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }

    pub fn roster_path(&self) -> PathBuf {
        self.config_dir.join("roster.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.config_dir.join("token.json")
    }

    /// Opaque auth cookie supplied by the operator for ad-free capture.
    pub fn cookie_path(&self) -> PathBuf {
        self.config_dir.join("push-cookie.txt")
    }

    pub fn storage_config_path(&self) -> PathBuf {
        self.config_dir.join("storage.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.config_dir.join("backups")
    }
}
