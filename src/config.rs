use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelOptions;

/// Environment variable that overrides the workspace root for every server.
pub const WORKSPACE_ENV: &str = "DEVSYNC_WORKSPACE";

/// Oldest server version accepted, as the dot-less number (`18.09` -> 1809).
pub const DEFAULT_MIN_VERSION: u32 = 1809;

/// Top-level config, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum server version. `"latest"` servers are always accepted.
    pub min_version: u32,
    /// Local workspace root used instead of the server-reported one.
    pub workspace_override: Option<PathBuf>,
    /// Where the list of connected servers is kept.
    pub state_file: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_version: DEFAULT_MIN_VERSION,
            workspace_override: None,
            state_file: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Waits in milliseconds, plus the reconnection cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a new session waits for its event channel.
    pub first_connect_ms: u64,
    /// Per-request timeout for the control API.
    pub request_ms: u64,
    /// Pause between reconnection attempts for a broken session.
    pub reconnect_delay_ms: u64,
    /// Reconnection attempts before giving up on a server that stays
    /// unreachable.
    pub reconnect_max_attempts: u32,
    /// Cap on the event channel's exponential backoff.
    pub channel_backoff_max_ms: u64,
    pub debug_start_timeout_ms: u64,
    pub debug_poll_ms: u64,
    pub attach_retry_ms: u64,
    pub attach_attempt_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_connect_ms: 2_500,
            request_ms: 5_000,
            reconnect_delay_ms: 5_000,
            reconnect_max_attempts: 60,
            channel_backoff_max_ms: 10_000,
            debug_start_timeout_ms: 90_000,
            debug_poll_ms: 2_500,
            attach_retry_ms: 250,
            attach_attempt_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn first_connect(&self) -> Duration {
        Duration::from_millis(self.first_connect_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn debug_start_timeout(&self) -> Duration {
        Duration::from_millis(self.debug_start_timeout_ms)
    }

    pub fn debug_poll(&self) -> Duration {
        Duration::from_millis(self.debug_poll_ms)
    }

    pub fn attach_retry(&self) -> Duration {
        Duration::from_millis(self.attach_retry_ms)
    }

    pub fn attach_attempt(&self) -> Duration {
        Duration::from_millis(self.attach_attempt_ms)
    }

    /// Event channel backoff: one second up to the configured cap.
    pub fn channel_options(&self) -> ChannelOptions {
        let max = Duration::from_millis(self.channel_backoff_max_ms);
        ChannelOptions {
            backoff_min: Duration::from_secs(1).min(max),
            backoff_max: max,
            ..ChannelOptions::default()
        }
    }
}

impl SyncConfig {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Server URIs may carry credentials.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Load from `path`, or the default location when `None`. A missing
    /// file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    /// Save config to a TOML file path, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        restrict_permissions(path)
    }

    /// Session list location: the configured `state_file`, else the default.
    pub fn state_path(&self) -> Option<PathBuf> {
        self.state_file.clone().or_else(default_state_path)
    }

    /// The local workspace override, reading [`WORKSPACE_ENV`] first.
    pub fn workspace_override(&self) -> Option<PathBuf> {
        resolve_override(
            std::env::var_os(WORKSPACE_ENV).map(PathBuf::from),
            self.workspace_override.as_deref(),
        )
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

/// `~/.config/devsync/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("devsync").join("config.toml"))
}

/// `~/.local/share/devsync/sessions`
pub fn default_state_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("devsync").join("sessions"))
}

fn resolve_override(env: Option<PathBuf>, configured: Option<&Path>) -> Option<PathBuf> {
    env.filter(|p| !p.as_os_str().is_empty())
        .or_else(|| configured.map(Path::to_path_buf))
}

/// Errors that can occur when loading or saving config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("Failed to write config {}: {}", .0.display(), .1)]
    WriteFailed(PathBuf, #[source] std::io::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[source] toml::ser::Error),
}

/// Check file permissions on a config file and warn if world-readable.
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
             Server URIs may embed credentials -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
