//! Configuration loading.
//!
//! Reads `~/.config/tailtray/config.toml` (or `$TAILTRAY_CONFIG`). A missing
//! file means defaults; a malformed one is an error so typos are not silently
//! ignored. A few environment variables override the file for ad-hoc runs.

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::{Result, TrayError};
use crate::types::ExitFlagMapping;

const CONFIG_ENV: &str = "TAILTRAY_CONFIG";
const SOCKET_ENV: &str = "TAILTRAY_SOCKET";
const TRANSPORT_ENV: &str = "TAILTRAY_TRANSPORT";
const CONFIG_DIR_NAME: &str = "tailtray";
const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// How the daemon is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Spawn the daemon's CLI for every query.
    #[default]
    Cli,
    /// Speak HTTP to the LocalAPI UNIX socket directly.
    Socket,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cli" => Ok(TransportKind::Cli),
            "socket" => Ok(TransportKind::Socket),
            other => Err(format!("Unknown transport: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrayConfig {
    pub transport: TransportKind,
    pub cli_binary: String,
    pub socket_path: PathBuf,
    pub refresh_interval_secs: u64,
    pub command_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub log_level: String,
    pub operator: Option<String>,
    pub login_server: Option<String>,
    pub accept_routes_on_up: bool,
    /// Prefix for retrying commands the daemon refused; empty disables retries.
    pub privilege_helper: String,
    pub health_ignore: Vec<String>,
    pub exit_flags: ExitFlagMapping,
}

impl Default for TrayConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            cli_binary: "tailscale".to_string(),
            socket_path: PathBuf::from(tailtray_localapi::DEFAULT_SOCKET_PATH),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            log_level: "info".to_string(),
            operator: None,
            login_server: None,
            accept_routes_on_up: false,
            privilege_helper: "pkexec".to_string(),
            health_ignore: Vec::new(),
            exit_flags: ExitFlagMapping::default(),
        }
    }
}

impl TrayConfig {
    /// Returns the config file location, honoring `$TAILTRAY_CONFIG`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads the default config file and applies environment overrides.
    pub fn load() -> Result<Self> {
        let config = match Self::default_path() {
            Some(path) => Self::load_from(&path)?,
            None => {
                tracing::warn!("Could not resolve config directory; using defaults");
                Self::default()
            }
        };
        Ok(config.with_env_overrides())
    }

    /// Loads a specific file. Missing files yield defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file not found; using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(TrayError::Io {
                    context: format!("reading {}", path.display()),
                    source: err,
                })
            }
        };

        toml::from_str(&content).map_err(|err| TrayError::ConfigMalformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = env::var(SOCKET_ENV) {
            self.socket_path = PathBuf::from(path);
        }
        if let Ok(value) = env::var(TRANSPORT_ENV) {
            match value.parse() {
                Ok(kind) => self.transport = kind,
                Err(err) => tracing::warn!(error = %err, "Ignoring {}", TRANSPORT_ENV),
            }
        }
        self
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn privilege_helper(&self) -> Option<&str> {
        Some(self.privilege_helper.trim()).filter(|helper| !helper.is_empty())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            refresh_interval: self.refresh_interval(),
            poll_timeout: self.command_timeout(),
            exit_flags: self.exit_flags.clone(),
            health_ignore: self.health_ignore.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = TrayConfig::load_from(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, TrayConfig::default());
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
transport = "socket"
refresh_interval_secs = 30
health_ignore = ["not in map poll"]

[exit_flags]
active_from_selection = true
"#,
        )
        .expect("write");

        let config = TrayConfig::load_from(&path).expect("load");
        assert_eq!(config.transport, TransportKind::Socket);
        assert_eq!(config.refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.health_ignore, vec!["not in map poll".to_string()]);
        assert!(config.exit_flags.active_from_selection);
        assert_eq!(config.exit_flags.support_field, "ExitNodeOption");
        assert_eq!(config.cli_binary, "tailscale");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "refresh_interval_secs = \"often\"").expect("write");

        assert!(matches!(
            TrayConfig::load_from(&path),
            Err(TrayError::ConfigMalformed { .. })
        ));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config = TrayConfig {
            refresh_interval_secs: 0,
            ..TrayConfig::default()
        };
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
    }

    #[test]
    fn empty_privilege_helper_disables_retry() {
        let config = TrayConfig {
            privilege_helper: "  ".to_string(),
            ..TrayConfig::default()
        };
        assert_eq!(config.privilege_helper(), None);
        assert_eq!(TrayConfig::default().privilege_helper(), Some("pkexec"));
    }

    #[test]
    fn transport_parses_case_insensitively() {
        assert_eq!("Socket".parse::<TransportKind>(), Ok(TransportKind::Socket));
        assert!("pipe".parse::<TransportKind>().is_err());
    }
}
