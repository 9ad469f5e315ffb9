//! Configuration system for the `PairChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/pairchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::net::ChatConfig;
use crate::typing::DEFAULT_QUIET_PERIOD;
use crate::user::LocalUser;

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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    identity: IdentityFileConfig,
    network: NetworkFileConfig,
    chat: ChatFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    user_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    photo_url: Option<String>,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    api_base: Option<String>,
    session_cookie: Option<String>,
    connect_timeout_secs: Option<u64>,
    history_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    target_user_id: Option<String>,
    typing_quiet_ms: Option<u64>,
    timestamp_format: Option<String>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    message_queue_cap: Option<usize>,
    join_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnect policy for the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
    /// Retries after a loss before giving up.
    pub max_attempts: u32,
    /// Messages held while not joined; the oldest is evicted beyond this.
    pub message_queue_cap: usize,
    /// How long to wait for the server's `joined` acknowledgement.
    pub join_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            message_queue_cap: 100,
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Identity --
    /// Local user id.
    pub user_id: Option<String>,
    /// Local first name, sent with every join and message.
    pub first_name: Option<String>,
    /// Local last name.
    pub last_name: String,
    /// Local avatar URL.
    pub photo_url: Option<String>,

    // -- Network --
    /// Realtime WebSocket URL.
    pub server_url: Option<String>,
    /// Base URL of the history service.
    pub api_base: Option<String>,
    /// Session cookie forwarded to the history service.
    pub session_cookie: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the history request.
    pub history_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,

    // -- Chat --
    /// User to chat with.
    pub target_user_id: Option<String>,
    /// Quiet period after the last keystroke before "stopped typing".
    pub typing_quiet_period: Duration,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,

    // -- Reconnect --
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            first_name: None,
            last_name: String::new(),
            photo_url: None,
            server_url: None,
            api_base: None,
            session_cookie: None,
            connect_timeout: Duration::from_secs(10),
            history_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            target_user_id: None,
            typing_quiet_period: DEFAULT_QUIET_PERIOD,
            timestamp_format: "%H:%M".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/pairchat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect = &file.reconnect;

        Self {
            user_id: cli.user_id.clone().or_else(|| file.identity.user_id.clone()),
            first_name: cli
                .first_name
                .clone()
                .or_else(|| file.identity.first_name.clone()),
            last_name: file
                .identity
                .last_name
                .clone()
                .unwrap_or(defaults.last_name),
            photo_url: file.identity.photo_url.clone(),
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.network.server_url.clone()),
            api_base: cli.api_base.clone().or_else(|| file.network.api_base.clone()),
            session_cookie: cli
                .session_cookie
                .clone()
                .or_else(|| file.network.session_cookie.clone()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            history_timeout: file
                .network
                .history_timeout_secs
                .map_or(defaults.history_timeout, Duration::from_secs),
            // Tokio channels need room for at least one item.
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity)
                .max(1),
            target_user_id: cli
                .target
                .clone()
                .or_else(|| file.chat.target_user_id.clone()),
            typing_quiet_period: file
                .chat
                .typing_quiet_ms
                .map_or(defaults.typing_quiet_period, Duration::from_millis),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.chat.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
            reconnect: ReconnectConfig {
                initial_delay: reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                message_queue_cap: reconnect
                    .message_queue_cap
                    .unwrap_or(defaults.reconnect.message_queue_cap)
                    .max(1),
                join_timeout: reconnect
                    .join_timeout_secs
                    .map_or(defaults.reconnect.join_timeout, Duration::from_secs),
            },
        }
    }

    /// Build a [`ChatConfig`] from this configuration, if all required
    /// identity and networking fields are present.
    ///
    /// Returns `None` if the server URL, API base, user id, first name, or
    /// target is missing or empty.
    #[must_use]
    pub fn to_chat_config(&self) -> Option<ChatConfig> {
        let non_empty = |s: &Option<String>| s.clone().filter(|v| !v.is_empty());
        let server_url = non_empty(&self.server_url)?;
        let api_base = non_empty(&self.api_base)?;
        let user_id = non_empty(&self.user_id)?;
        let first_name = non_empty(&self.first_name)?;
        let target = non_empty(&self.target_user_id)?;

        let mut local = LocalUser::new(user_id, first_name).with_last_name(self.last_name.clone());
        if let Some(photo) = &self.photo_url {
            local = local.with_photo_url(photo.clone());
        }

        Some(ChatConfig {
            server_url,
            api_base,
            session_cookie: self.session_cookie.clone(),
            local,
            target: target.into(),
            connect_timeout: self.connect_timeout,
            history_timeout: self.history_timeout,
            typing_quiet_period: self.typing_quiet_period,
            reconnect: self.reconnect.clone(),
            channel_capacity: self.channel_capacity,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Per-pair realtime chat in the terminal")]
pub struct CliArgs {
    /// WebSocket URL of the realtime server.
    #[arg(long, env = "PAIRCHAT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Base URL of the history service.
    #[arg(long, env = "PAIRCHAT_API_BASE")]
    pub api_base: Option<String>,

    /// Session cookie forwarded to the history service.
    #[arg(long, env = "PAIRCHAT_SESSION_COOKIE", hide_env_values = true)]
    pub session_cookie: Option<String>,

    /// Your user id.
    #[arg(long, env = "PAIRCHAT_USER_ID")]
    pub user_id: Option<String>,

    /// Your first name.
    #[arg(long, env = "PAIRCHAT_FIRST_NAME")]
    pub first_name: Option<String>,

    /// User to chat with.
    #[arg(long, env = "PAIRCHAT_TARGET")]
    pub target: Option<String>,

    /// Path to config file (default: `~/.config/pairchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PAIRCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/pairchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
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
    let path = config_dir.join("pairchat").join("config.toml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
