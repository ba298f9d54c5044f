//! Configuration for the `TutorChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/tutorchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use tutorchat_proto::ids::UserId;

use crate::connection::{ConnectOptions, DEFAULT_ACK_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};

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

    /// A required setting was not supplied anywhere.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    gateway: GatewayFileConfig,
    chat: ChatFileConfig,
}

/// `[gateway]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GatewayFileConfig {
    url: Option<String>,
    token: Option<String>,
    connect_timeout_secs: Option<u64>,
    ack_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    user_id: Option<String>,
    display_name: Option<String>,
    peer_id: Option<String>,
    timestamp_format: Option<String>,
    log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Auth token for the handshake.
    pub token: Option<String>,
    /// Local identity.
    pub user_id: Option<String>,
    /// Name shown to the other participant.
    pub display_name: Option<String>,
    /// The participant to chat with.
    pub peer_id: Option<String>,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Timeout for acknowledged requests.
    pub ack_timeout: Duration,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
    /// Log file path (default: `$TMPDIR/tutorchat.log`).
    pub log_file: Option<PathBuf>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9100/ws".to_string(),
            token: None,
            user_id: None,
            display_name: None,
            peer_id: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            timestamp_format: "%H:%M".to_string(),
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            url: cli
                .url
                .clone()
                .or_else(|| file.gateway.url.clone())
                .unwrap_or(defaults.url),
            token: cli.token.clone().or_else(|| file.gateway.token.clone()),
            user_id: cli.user_id.clone().or_else(|| file.chat.user_id.clone()),
            display_name: cli
                .display_name
                .clone()
                .or_else(|| file.chat.display_name.clone()),
            peer_id: cli.peer_id.clone().or_else(|| file.chat.peer_id.clone()),
            connect_timeout: cli
                .connect_timeout_secs
                .or(file.gateway.connect_timeout_secs)
                .map_or(defaults.connect_timeout, Duration::from_secs),
            ack_timeout: cli
                .ack_timeout_secs
                .or(file.gateway.ack_timeout_secs)
                .map_or(defaults.ack_timeout, Duration::from_secs),
            timestamp_format: file
                .chat
                .timestamp_format
                .clone()
                .unwrap_or(defaults.timestamp_format),
            log_file: cli.log_file.clone().or_else(|| file.chat.log_file.clone()),
            log_level: cli.log_level.clone(),
        }
    }

    /// The local identity, required to connect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if no non-blank user id was given.
    pub fn local_user(&self) -> Result<UserId, ConfigError> {
        required(self.user_id.as_deref(), "user_id").map(UserId::new)
    }

    /// The participant to chat with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if no non-blank peer id was given.
    pub fn peer(&self) -> Result<UserId, ConfigError> {
        required(self.peer_id.as_deref(), "peer_id").map(UserId::new)
    }

    /// Display name, falling back to the user id.
    pub fn display_name_or(&self, user: &UserId) -> String {
        self.display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| user.as_str().to_string())
    }

    /// Builds the connection options for `user`.
    #[must_use]
    pub fn connect_options(&self, user: UserId) -> ConnectOptions {
        ConnectOptions {
            url: self.url.clone(),
            token: self.token.clone().unwrap_or_default(),
            user_id: user,
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
        }
    }
}

fn required<'a>(value: Option<&'a str>, key: &'static str) -> Result<&'a str, ConfigError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Chat with a tutor or student over the TutorChat gateway")]
pub struct CliArgs {
    /// WebSocket URL of the gateway.
    #[arg(long, env = "TUTORCHAT_URL")]
    pub url: Option<String>,

    /// Auth token sent with the handshake.
    #[arg(long, env = "TUTORCHAT_TOKEN")]
    pub token: Option<String>,

    /// Your user id.
    #[arg(short, long, env = "TUTORCHAT_USER")]
    pub user_id: Option<String>,

    /// Name shown to the other participant.
    #[arg(short = 'n', long)]
    pub display_name: Option<String>,

    /// User id of the person to chat with.
    #[arg(short, long)]
    pub peer_id: Option<String>,

    /// Path to config file (default: `~/.config/tutorchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds to wait for the gateway handshake.
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Seconds to wait for a request acknowledgement.
    #[arg(long)]
    pub ack_timeout_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TUTORCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/tutorchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("tutorchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
