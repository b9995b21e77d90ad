//! Configuration for the `ticketsync` client.
//!
//! Settings are layered, highest priority first:
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/ticketsync/config.toml`)
//! 4. Compiled defaults
//!
//! A missing default config file is not an error. An explicit `--config`
//! path that doesn't exist is.

use std::path::PathBuf;
use std::time::Duration;

use ticketsync_proto::ids::UserId;
use ticketsync_proto::record::{Role, UnknownRole};

use crate::backend::hub::HubConfig;
use crate::core::{Identity, SyncConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A required setting was given neither on the command line nor in the file.
    #[error("missing setting: {0}")]
    Missing(&'static str),

    /// The hub URL is not a usable WebSocket URL.
    #[error("invalid hub url {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The role is not one the desk knows.
    #[error(transparent)]
    InvalidRole(#[from] UnknownRole),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    hub: HubFileConfig,
    connection: ConnectionFileConfig,
    subscriptions: SubscriptionsFileConfig,
    mutations: MutationsFileConfig,
    presence: PresenceFileConfig,
    typing: TypingFileConfig,
    events: EventsFileConfig,
}

/// `[hub]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HubFileConfig {
    url: Option<String>,
    user_id: Option<String>,
    display_name: Option<String>,
    role: Option<String>,
    token: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    probe_interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    refresh_timeout_secs: Option<u64>,
    retry_delay_secs: Option<u64>,
    degraded_grace_secs: Option<u64>,
}

/// `[subscriptions]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SubscriptionsFileConfig {
    open_timeout_secs: Option<u64>,
    max_open_attempts: Option<u32>,
    cooldown_secs: Option<u64>,
    retry_delay_secs: Option<u64>,
}

/// `[mutations]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MutationsFileConfig {
    write_timeout_secs: Option<u64>,
    safety_timeout_secs: Option<u64>,
    retry_delay_secs: Option<u64>,
    match_window_secs: Option<u64>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    heartbeat_interval_secs: Option<u64>,
    ttl_secs: Option<u64>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    lease_ms: Option<u64>,
    throttle_ms: Option<u64>,
    prune_interval_ms: Option<u64>,
}

/// `[events]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EventsFileConfig {
    buffer: Option<usize>,
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Hub --
    /// WebSocket URL of the hub.
    pub hub_url: Option<String>,
    /// Id of the signed-in user.
    pub user_id: Option<String>,
    /// Name shown to others. Falls back to the user id.
    pub display_name: Option<String>,
    /// Role name (`client`, `agent`, `admin`).
    pub role: String,
    /// Session token.
    pub token: Option<String>,
    /// Timeout for opening the hub socket and authenticating.
    pub connect_timeout: Duration,
    /// Timeout for one hub request.
    pub request_timeout: Duration,

    // -- Core --
    /// Tuning for the synchronization core.
    pub sync: SyncConfig,

    // -- Output --
    /// Timestamp format for printed events (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: None,
            user_id: None,
            display_name: None,
            role: "client".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            sync: SyncConfig::default(),
            timestamp_format: "%H:%M:%S".to_string(),
        }
    }
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_secs)
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the default file exists but is malformed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let d = &defaults.sync;

        let mut sync = SyncConfig {
            match_window: secs_or(file.mutations.match_window_secs, d.match_window),
            heartbeat_interval: secs_or(
                file.presence.heartbeat_interval_secs,
                d.heartbeat_interval,
            ),
            presence_ttl: secs_or(file.presence.ttl_secs, d.presence_ttl),
            typing_lease: millis_or(file.typing.lease_ms, d.typing_lease),
            typing_throttle: millis_or(file.typing.throttle_ms, d.typing_throttle),
            typing_prune_interval: millis_or(
                file.typing.prune_interval_ms,
                d.typing_prune_interval,
            ),
            event_buffer: file.events.buffer.unwrap_or(d.event_buffer),
            ..d.clone()
        };

        let c = &file.connection;
        sync.supervisor.probe_interval =
            secs_or(c.probe_interval_secs, d.supervisor.probe_interval);
        sync.supervisor.probe_timeout = secs_or(c.probe_timeout_secs, d.supervisor.probe_timeout);
        sync.supervisor.refresh_timeout =
            secs_or(c.refresh_timeout_secs, d.supervisor.refresh_timeout);
        sync.supervisor.retry_delay = secs_or(c.retry_delay_secs, d.supervisor.retry_delay);
        sync.supervisor.degraded_grace =
            secs_or(c.degraded_grace_secs, d.supervisor.degraded_grace);

        let s = &file.subscriptions;
        sync.subscriptions.open_timeout =
            secs_or(s.open_timeout_secs, d.subscriptions.open_timeout);
        sync.subscriptions.max_open_attempts = s
            .max_open_attempts
            .unwrap_or(d.subscriptions.max_open_attempts);
        sync.subscriptions.cooldown = secs_or(s.cooldown_secs, d.subscriptions.cooldown);
        sync.subscriptions.retry_delay = secs_or(s.retry_delay_secs, d.subscriptions.retry_delay);

        let m = &file.mutations;
        sync.mutations.write_timeout = secs_or(m.write_timeout_secs, d.mutations.write_timeout);
        sync.mutations.safety_timeout = secs_or(m.safety_timeout_secs, d.mutations.safety_timeout);
        sync.mutations.retry_delay = secs_or(m.retry_delay_secs, d.mutations.retry_delay);

        Self {
            hub_url: cli.hub_url.clone().or_else(|| file.hub.url.clone()),
            user_id: cli.user.clone().or_else(|| file.hub.user_id.clone()),
            display_name: cli.name.clone().or_else(|| file.hub.display_name.clone()),
            role: cli
                .role
                .clone()
                .or_else(|| file.hub.role.clone())
                .unwrap_or(defaults.role),
            token: cli.token.clone().or_else(|| file.hub.token.clone()),
            connect_timeout: secs_or(file.hub.connect_timeout_secs, defaults.connect_timeout),
            request_timeout: secs_or(file.hub.request_timeout_secs, defaults.request_timeout),
            sync,
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.events.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// The identity this client signs in as.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] without a user id, [`ConfigError::InvalidRole`]
    /// for an unknown role.
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        let user_id = self
            .user_id
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing("user id"))?;
        let role: Role = self.role.parse()?;
        Ok(Identity {
            display_name: self.display_name.clone().unwrap_or_else(|| user_id.clone()),
            user_id: UserId::new(user_id),
            role,
        })
    }

    /// Settings for [`crate::backend::hub::HubBackend`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] without a hub URL or user id, and
    /// [`ConfigError::InvalidUrl`] unless the URL is `ws://` or `wss://`.
    pub fn to_hub_config(&self) -> Result<HubConfig, ConfigError> {
        let raw = self.hub_url.clone().ok_or(ConfigError::Missing("hub url"))?;
        let url = url::Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                url: raw,
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        let identity = self.identity()?;
        Ok(HubConfig {
            url: url.to_string(),
            user_id: identity.user_id,
            token: self.token.clone(),
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            ..HubConfig::default()
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless client for the ticket desk sync core")]
pub struct CliArgs {
    /// WebSocket URL of the hub.
    #[arg(long, env = "TICKETSYNC_HUB_URL")]
    pub hub_url: Option<String>,

    /// User id to sign in as.
    #[arg(long, env = "TICKETSYNC_USER")]
    pub user: Option<String>,

    /// Display name shown to other participants.
    #[arg(long)]
    pub name: Option<String>,

    /// Role: client, agent or admin.
    #[arg(long)]
    pub role: Option<String>,

    /// Session token.
    #[arg(long, env = "TICKETSYNC_TOKEN")]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/ticketsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp format for printed events (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TICKETSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/ticketsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// An explicit path must exist. Without one the default path is tried and a
/// missing file yields an empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("ticketsync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
