use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::control::ControlConfig;
use crate::flow::{FlowProfile, FlowThresholds};
use crate::protocol;
use crate::session::{SessionConfig, SessionSettings, EARLY_BUFFER_MAX_BYTES};

/// Server used when neither the config file nor the command line names one.
pub const DEFAULT_SERVER: &str = "127.0.0.1:8000";

/// Client config, loaded from TOML. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address: `host:port`, `http(s)://...` or `ws(s)://...`.
    pub server: Option<String>,
    /// Password sent when the server asks for authentication.
    pub password: Option<String>,
    /// Shell id requested for new tabs.
    pub shell: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    pub heartbeat_secs: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub frame_interval_ms: Option<u64>,
    pub early_buffer_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub base_delay_ms: Option<u64>,
    pub backoff_cap: Option<u32>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub profile: FlowProfile,
    pub high_watermark: Option<usize>,
    pub low_watermark: Option<usize>,
    pub hard_cap: Option<usize>,
    pub pause_retry_ms: Option<u64>,
    pub emergency_ms: Option<u64>,
}

impl ClientConfig {
    /// `$XDG_CONFIG_HOME/porterm/config.toml`, or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("porterm").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let flow = self.flow_thresholds();
        if flow.low >= flow.high {
            return Err(ConfigError::Invalid(format!(
                "flow.low_watermark ({}) must be below flow.high_watermark ({})",
                flow.low, flow.high
            )));
        }
        if flow.high > flow.hard_cap {
            return Err(ConfigError::Invalid(format!(
                "flow.high_watermark ({}) must not exceed flow.hard_cap ({})",
                flow.high, flow.hard_cap
            )));
        }
        if self.frame_interval_ms == Some(0) {
            return Err(ConfigError::Invalid("frame_interval_ms must be positive".into()));
        }
        if self.heartbeat_secs == Some(0) {
            return Err(ConfigError::Invalid("heartbeat_secs must be positive".into()));
        }
        Ok(())
    }

    /// Websocket base URL, preferring `override_server` over the file.
    pub fn base_url(&self, override_server: Option<&str>) -> String {
        let server = override_server
            .or(self.server.as_deref())
            .unwrap_or(DEFAULT_SERVER);
        protocol::websocket_base(server)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        let r = &self.reconnect;
        BackoffPolicy::new(
            r.base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(BackoffPolicy::DEFAULT_BASE),
            r.backoff_cap.unwrap_or(BackoffPolicy::DEFAULT_CAP),
            r.max_attempts.unwrap_or(BackoffPolicy::DEFAULT_MAX_ATTEMPTS),
        )
    }

    /// Profile thresholds with any explicit overrides applied.
    pub fn flow_thresholds(&self) -> FlowThresholds {
        let f = &self.flow;
        let mut t = FlowThresholds::for_profile(f.profile);
        if let Some(v) = f.high_watermark {
            t.high = v;
        }
        if let Some(v) = f.low_watermark {
            t.low = v;
        }
        if let Some(v) = f.hard_cap {
            t.hard_cap = v;
        }
        if let Some(ms) = f.pause_retry_ms {
            t.pause_retry = Duration::from_millis(ms);
        }
        if let Some(ms) = f.emergency_ms {
            t.emergency = Duration::from_millis(ms);
        }
        t
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.unwrap_or(30))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(10_000))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.unwrap_or(16))
    }

    pub fn session_config(&self, base_url: &str, password: Option<&str>) -> SessionConfig {
        SessionConfig {
            base_url: base_url.to_string(),
            settings: SessionSettings {
                backoff: self.backoff(),
                flow: self.flow_thresholds(),
                heartbeat_interval: self.heartbeat_interval(),
                frame_interval: self.frame_interval(),
                early_buffer_bytes: self.early_buffer_bytes.unwrap_or(EARLY_BUFFER_MAX_BYTES),
                auth_token: password.map(str::to_string),
            },
        }
    }

    pub fn control_config(&self, base_url: &str, password: Option<&str>) -> ControlConfig {
        ControlConfig {
            base_url: base_url.to_string(),
            password: password.map(str::to_string),
            request_timeout: self.request_timeout(),
            heartbeat_interval: self.heartbeat_interval(),
        }
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if a config file is world-readable. It may hold a password.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain a password -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
