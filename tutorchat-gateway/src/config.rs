//! Configuration for the `TutorChat` gateway.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/tutorchat-gateway/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

use crate::access::RoomAccess;
use crate::gateway::{DEFAULT_MAX_FRAME_SIZE, GatewaySettings};
use crate::store::StoreSpec;
use tutorchat_proto::message::MAX_CONTENT_CHARS;

/// Errors that can occur when loading gateway configuration.
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

    /// A value was present but not acceptable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Setting name.
        key: &'static str,
        /// Why it was refused.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GatewayConfigFile {
    server: ServerFileConfig,
    chat: ChatFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    store: Option<String>,
    max_frame_size: Option<usize>,
    require_token: Option<bool>,
}

/// `[chat]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    max_content_chars: Option<usize>,
    room_access: Option<RoomAccess>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the gateway.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "TutorChat real-time chat gateway")]
pub struct GatewayCliArgs {
    /// Address to bind to.
    #[arg(short, long, env = "TUTORCHAT_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/tutorchat-gateway/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Message store: `memory` or a `sqlite:` URL.
    #[arg(long, env = "TUTORCHAT_STORE")]
    pub store: Option<String>,

    /// Maximum inbound frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Maximum message length in characters.
    #[arg(long)]
    pub max_content_chars: Option<usize>,

    /// Accept handshakes that carry no auth token.
    #[arg(long)]
    pub allow_anonymous: bool,

    /// Room join policy: `open` or `participants`.
    #[arg(long)]
    pub room_access: Option<RoomAccess>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TUTORCHAT_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9100`).
    pub bind_addr: String,
    /// Which message store to open.
    pub store: StoreSpec,
    /// Per-connection tunables.
    pub settings: GatewaySettings,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".to_string(),
            store: StoreSpec::Memory,
            settings: GatewaySettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed, or a value is out of range.
    pub fn load(cli: &GatewayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &GatewayCliArgs, file: &GatewayConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let store = match cli.store.as_ref().or(file.server.store.as_ref()) {
            Some(raw) => raw
                .parse::<StoreSpec>()
                .map_err(|reason| ConfigError::InvalidValue { key: "store", reason })?,
            None => defaults.store,
        };

        let max_frame_size = cli
            .max_frame_size
            .or(file.server.max_frame_size)
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);
        let max_content_chars = cli
            .max_content_chars
            .or(file.chat.max_content_chars)
            .unwrap_or(MAX_CONTENT_CHARS);
        if max_content_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_content_chars",
                reason: "must be at least 1".to_string(),
            });
        }

        let require_token = if cli.allow_anonymous {
            false
        } else {
            file.server
                .require_token
                .unwrap_or(defaults.settings.require_token)
        };

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            store,
            settings: GatewaySettings {
                max_frame_size,
                max_content_chars,
                require_token,
                room_access: cli
                    .room_access
                    .or(file.chat.room_access)
                    .unwrap_or(defaults.settings.room_access),
            },
            log_level: cli.log_level.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<GatewayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(GatewayConfigFile::default());
        };
        config_dir.join("tutorchat-gateway").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GatewayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
