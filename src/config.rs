//! Configuration loading and validation
//!
//! Read once at startup from a TOML file. Every field has a default, so a
//! missing default config file is fine; anything invalid is fatal.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::hotkey::{KeyCode, KeyCombo};
use crate::session::SessionConfig;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "KEYLOCK_CONFIG";

const APP_DIR: &str = "keylock";
const CONFIG_FILE: &str = "config.toml";
const SOCKET_FILE: &str = "keylock.sock";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How long keys stay unlocked without activity
    pub timeout: Duration,

    /// Keys that must be held together to unlock
    pub combo: KeyCombo,

    /// Matches `xinput list` lines of security keys; group 1 is the id
    pub device_pattern: Regex,

    pub poll_interval: Duration,
    pub tick_interval: Duration,
    pub debounce: Duration,

    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,
    pub ipc_enabled: bool,

    /// Send a desktop notification when a key is plugged in
    pub desktop_notifications: bool,
}

/// Errors that make the configuration unusable
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("keys.combo must list at least one key code")]
    EmptyCombo,

    #[error("general.timeout_secs must be a positive, representable number of seconds")]
    InvalidTimeout,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("devices.pattern is not a valid regex: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("devices.pattern needs a capture group for the device id")]
    PatternWithoutId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    general: GeneralSection,
    keys: KeysSection,
    devices: DevicesSection,
    watcher: WatcherSection,
    controller: ControllerSection,
    session: SessionSection,
    ipc: IpcSection,
    notify: NotifySection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GeneralSection {
    timeout_secs: f64,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self { timeout_secs: 10.0 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KeysSection {
    combo: Vec<KeyCode>,
}

impl Default for KeysSection {
    fn default() -> Self {
        // Control_L + Shift_L
        Self { combo: vec![37, 50] }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DevicesSection {
    pattern: String,
}

impl Default for DevicesSection {
    fn default() -> Self {
        Self {
            pattern: r"yubikey.*?id=(\d+)".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WatcherSection {
    poll_interval_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ControllerSection {
    tick_interval_ms: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SessionSection {
    debounce_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self { debounce_ms: 10 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct IpcSection {
    enabled: bool,
    socket_path: Option<PathBuf>,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct NotifySection {
    enabled: bool,
}

impl Config {
    /// Load configuration from `$KEYLOCK_CONFIG` or the user config dir
    ///
    /// An explicitly named file must exist; the default location may be
    /// absent, in which case defaults apply.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(Path::new(&path)),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_path(&path),
                _ => Self::from_toml(""),
            },
        }
    }

    /// Read and validate a config file
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        Self::from_raw(raw)
    }

    /// Parse and validate TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.keys.combo.is_empty() {
            return Err(ConfigError::EmptyCombo);
        }
        let timeout = Duration::try_from_secs_f64(raw.general.timeout_secs)
            .ok()
            .filter(|t| !t.is_zero())
            .filter(|t| Instant::now().checked_add(*t).is_some())
            .ok_or(ConfigError::InvalidTimeout)?;
        if raw.watcher.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("watcher.poll_interval_ms"));
        }
        if raw.controller.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("controller.tick_interval_ms"));
        }
        if raw.session.debounce_ms == 0 {
            return Err(ConfigError::ZeroInterval("session.debounce_ms"));
        }

        let device_pattern = RegexBuilder::new(&raw.devices.pattern)
            .case_insensitive(true)
            .build()?;
        if device_pattern.captures_len() < 2 {
            return Err(ConfigError::PatternWithoutId);
        }

        let socket_path = raw.ipc.socket_path.unwrap_or_else(default_socket_path);

        Ok(Self {
            timeout,
            combo: KeyCombo::new(raw.keys.combo),
            device_pattern,
            poll_interval: Duration::from_millis(raw.watcher.poll_interval_ms),
            tick_interval: Duration::from_millis(raw.controller.tick_interval_ms),
            debounce: Duration::from_millis(raw.session.debounce_ms),
            socket_path,
            ipc_enabled: raw.ipc.enabled,
            desktop_notifications: raw.notify.enabled,
        })
    }

    /// Timing for each unlock session
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout,
            debounce: self.debounce,
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

fn default_socket_path() -> PathBuf {
    if let Some(runtime) = dirs::runtime_dir() {
        return runtime.join(SOCKET_FILE);
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join(SOCKET_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.combo, KeyCombo::new([37, 50]));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.tick_interval, Duration::from_millis(1));
        assert!(config.ipc_enabled);
        assert!(!config.desktop_notifications);
        assert!(config.socket_path.ends_with(SOCKET_FILE));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_toml(
            r#"
            [general]
            timeout_secs = 2

            [keys]
            combo = [64, 37, 50]

            [devices]
            pattern = 'Nitrokey.*?id=(\d+)'

            [ipc]
            socket_path = "/tmp/keylock-test.sock"
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.combo, KeyCombo::new([37, 50, 64]));
        assert!(config.device_pattern.is_match("↳ NITROKEY 3  id=21"));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/keylock-test.sock"));
    }

    #[test]
    fn test_pattern_is_case_insensitive() {
        let config = Config::from_toml("").unwrap();
        assert!(config.device_pattern.is_match("Yubico YubiKey OTP id=16"));
        assert!(config.device_pattern.is_match("Yubico Yubikey NEO id=17"));
    }

    #[test]
    fn test_empty_combo_is_rejected() {
        let err = Config::from_toml("[keys]\ncombo = []").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCombo));
    }

    #[test]
    fn test_invalid_timeout_is_rejected() {
        for value in ["0", "-1.5", "nan", "inf", "1e19"] {
            let err = Config::from_toml(&format!("[general]\ntimeout_secs = {value}")).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidTimeout), "{value}");
        }
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for (section, key) in [
            ("watcher", "poll_interval_ms"),
            ("controller", "tick_interval_ms"),
            ("session", "debounce_ms"),
        ] {
            let err = Config::from_toml(&format!("[{section}]\n{key} = 0")).unwrap_err();
            match err {
                ConfigError::ZeroInterval(name) => assert_eq!(name, format!("{section}.{key}")),
                other => panic!("{section}.{key}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_pattern_without_group_is_rejected() {
        let err = Config::from_toml("[devices]\npattern = 'yubikey'").unwrap_err();
        assert!(matches!(err, ConfigError::PatternWithoutId));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = Config::from_toml("[devices]\npattern = '(unclosed'").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern(_)));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = Config::from_toml("[general]\ntimeout = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_path_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[general]\ntimeout_secs = 3\n[keys]\ncombo = [37, 50]").unwrap();

        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::from_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
