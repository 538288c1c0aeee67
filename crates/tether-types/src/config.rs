//! Configuration types for engine sessions.
//!
//! [`TetherConfig`] is the top-level configuration loaded from `tether.toml`.
//! It names one or more engine launch profiles, decides whether callers may
//! override them (`lock_down`), and carries the timing constants used by
//! the completion detector and the attention handler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::TetherError;

/// Default configuration file name.
pub const CONFIG_FILENAME: &str = "tether.toml";

/// Engine executable used when a profile does not name one.
pub const DEFAULT_ENGINE_PATH: &str = "/opt/sasinside/SASHome/SASFoundation/9.4/bin/sas_u8";

/// How to launch one engine process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Path of the engine executable (on the remote host when `remote_shell` is set).
    #[serde(default = "default_engine_path")]
    pub engine_path: PathBuf,
    /// Extra launch option tokens, placed before the fixed flags.
    #[serde(default)]
    pub options: Vec<String>,
    /// Remote shell program (e.g. `/usr/bin/ssh`); `None` launches locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_shell: Option<PathBuf>,
    /// Host passed to the remote shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_path: default_engine_path(),
            options: Vec::new(),
            remote_shell: None,
            remote_host: None,
        }
    }
}

impl EngineConfig {
    /// Whether the engine runs behind a remote shell.
    pub fn is_remote(&self) -> bool {
        self.remote_shell.is_some()
    }
}

/// Caller-supplied values that replace profile values when lock-down is off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOverrides {
    pub engine_path: Option<PathBuf>,
    pub options: Option<Vec<String>>,
    pub remote_shell: Option<PathBuf>,
    pub remote_host: Option<String>,
}

impl EngineOverrides {
    pub fn is_empty(&self) -> bool {
        self.engine_path.is_none()
            && self.options.is_none()
            && self.remote_shell.is_none()
            && self.remote_host.is_none()
    }
}

/// Poll-loop constants.
///
/// Kept explicit so that tests can run the detector with zero delays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    /// Sleep between poll cycles in which neither stream produced bytes.
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
    /// Empty poll cycles allowed after the beacon is seen, for in-flight results.
    #[serde(default = "default_bail_countdown")]
    pub bail_countdown: u32,
    /// Maximum bytes taken from a stream per read.
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Retry interval of the log-only and listing drains.
    #[serde(default = "default_log_poll_ms")]
    pub log_poll_ms: u64,
    /// Pause after delivering the interrupt signal.
    #[serde(default = "default_attention_pause_ms")]
    pub attention_pause_ms: u64,
    /// Poll interval inside an attention episode.
    #[serde(default = "default_attention_poll_ms")]
    pub attention_poll_ms: u64,
    /// Grace period between the shutdown unit and SIGKILL.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Liveness poll interval while waiting out the grace period.
    #[serde(default = "default_kill_poll_ms")]
    pub kill_poll_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_delay_ms: default_idle_delay_ms(),
            bail_countdown: default_bail_countdown(),
            read_chunk: default_read_chunk(),
            log_poll_ms: default_log_poll_ms(),
            attention_pause_ms: default_attention_pause_ms(),
            attention_poll_ms: default_attention_poll_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            kill_poll_ms: default_kill_poll_ms(),
        }
    }
}

impl TimingConfig {
    /// Timing with every delay set to zero, for scripted streams.
    pub fn immediate() -> Self {
        Self {
            idle_delay_ms: 0,
            log_poll_ms: 0,
            attention_pause_ms: 0,
            attention_poll_ms: 0,
            shutdown_grace_ms: 0,
            kill_poll_ms: 0,
            ..Self::default()
        }
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn log_poll(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms)
    }

    pub fn attention_pause(&self) -> Duration {
        Duration::from_millis(self.attention_pause_ms)
    }

    pub fn attention_poll(&self) -> Duration {
        Duration::from_millis(self.attention_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn kill_poll(&self) -> Duration {
        Duration::from_millis(self.kill_poll_ms)
    }

    /// Number of log-poll retries that fit in `wait`, at least one.
    pub fn retries_within(&self, wait: Duration) -> u32 {
        if self.log_poll_ms == 0 {
            return u32::try_from(wait.as_millis()).unwrap_or(u32::MAX).max(1);
        }
        let retries = wait.as_millis() / u128::from(self.log_poll_ms);
        u32::try_from(retries).unwrap_or(u32::MAX).max(1)
    }
}

/// Everything a session needs to launch and drive one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    pub timing: TimingConfig,
}

/// Top-level configuration loaded from `tether.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TetherConfig {
    /// Ignore caller overrides and always launch the profile as written.
    #[serde(default = "default_true")]
    pub lock_down: bool,
    /// Profile used when the caller does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
    /// Named engine launch profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, EngineConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            lock_down: true,
            default_profile: None,
            profiles: BTreeMap::new(),
            timing: TimingConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, TetherError> {
        toml::from_str(content).map_err(|e| TetherError::ConfigError(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, TetherError> {
        toml::to_string_pretty(self).map_err(|e| TetherError::ConfigError(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, TetherError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TetherError::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Look up a profile by name, falling back to `default_profile` and then
    /// to the only profile present.
    pub fn profile(&self, name: Option<&str>) -> Result<&EngineConfig, TetherError> {
        let wanted = name.or(self.default_profile.as_deref());
        match wanted {
            Some(n) => self
                .profiles
                .get(n)
                .ok_or_else(|| TetherError::ConfigError(format!("unknown profile: {n:?}"))),
            None if self.profiles.len() == 1 => Ok(self
                .profiles
                .values()
                .next()
                .ok_or_else(|| TetherError::ConfigError("no profiles configured".into()))?),
            None if self.profiles.is_empty() => {
                Err(TetherError::ConfigError("no profiles configured".into()))
            }
            None => Err(TetherError::ConfigError(
                "several profiles configured and no default_profile set".into(),
            )),
        }
    }

    /// Resolve the engine launch settings for a session.
    ///
    /// With `lock_down` set, overrides are dropped (and reported); otherwise
    /// each supplied override replaces the profile value.
    pub fn session_config(
        &self,
        profile: Option<&str>,
        overrides: &EngineOverrides,
    ) -> Result<SessionConfig, TetherError> {
        let mut engine = self.profile(profile)?.clone();

        if self.lock_down {
            if !overrides.is_empty() {
                warn!("engine overrides ignored: configuration is locked down");
            }
        } else {
            if let Some(path) = &overrides.engine_path {
                engine.engine_path = path.clone();
            }
            if let Some(options) = &overrides.options {
                engine.options = options.clone();
            }
            if let Some(shell) = &overrides.remote_shell {
                engine.remote_shell = Some(shell.clone());
            }
            if let Some(host) = &overrides.remote_host {
                engine.remote_host = Some(host.clone());
            }
        }

        if engine.remote_shell.is_some() && engine.remote_host.is_none() {
            return Err(TetherError::ConfigError(
                "remote_shell is set but remote_host is missing".into(),
            ));
        }

        Ok(SessionConfig {
            engine,
            timing: self.timing.clone(),
        })
    }
}

fn default_engine_path() -> PathBuf {
    PathBuf::from(DEFAULT_ENGINE_PATH)
}

fn default_true() -> bool {
    true
}

fn default_idle_delay_ms() -> u64 {
    20
}

fn default_bail_countdown() -> u32 {
    5
}

fn default_read_chunk() -> usize {
    4096
}

fn default_log_poll_ms() -> u64 {
    500
}

fn default_attention_pause_ms() -> u64 {
    250
}

fn default_attention_poll_ms() -> u64 {
    250
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

fn default_kill_poll_ms() -> u64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
lock_down = false
default_profile = "local"

[profiles.local]
engine_path = "/usr/local/sas/sas_u8"
options = ["-fullstimer"]

[profiles.remote]
engine_path = "/opt/sas/sas_u8"
remote_shell = "/usr/bin/ssh"
remote_host = "grid01"

[timing]
idle_delay_ms = 5
"#;

    #[test]
    fn parses_profiles_and_timing() {
        let config = TetherConfig::from_toml(SAMPLE).unwrap();
        assert!(!config.lock_down);
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.timing.idle_delay_ms, 5);
        // unspecified timing keys keep their defaults
        assert_eq!(config.timing.bail_countdown, 5);
        assert!(config.profiles["remote"].is_remote());
    }

    #[test]
    fn lock_down_defaults_on() {
        let config = TetherConfig::from_toml("[profiles.a]\n").unwrap();
        assert!(config.lock_down);
        assert_eq!(
            config.profiles["a"].engine_path,
            PathBuf::from(DEFAULT_ENGINE_PATH)
        );
    }

    #[test]
    fn overrides_apply_when_unlocked() {
        let config = TetherConfig::from_toml(SAMPLE).unwrap();
        let overrides = EngineOverrides {
            engine_path: Some(PathBuf::from("/tmp/engine")),
            options: Some(vec!["-memsize".into(), "2G".into()]),
            ..EngineOverrides::default()
        };
        let resolved = config.session_config(None, &overrides).unwrap();
        assert_eq!(resolved.engine.engine_path, PathBuf::from("/tmp/engine"));
        assert_eq!(resolved.engine.options, vec!["-memsize", "2G"]);
    }

    #[test]
    fn overrides_ignored_when_locked() {
        let mut config = TetherConfig::from_toml(SAMPLE).unwrap();
        config.lock_down = true;
        let overrides = EngineOverrides {
            engine_path: Some(PathBuf::from("/tmp/engine")),
            ..EngineOverrides::default()
        };
        let resolved = config.session_config(Some("local"), &overrides).unwrap();
        assert_eq!(
            resolved.engine.engine_path,
            PathBuf::from("/usr/local/sas/sas_u8")
        );
    }

    #[test]
    fn unknown_profile_is_config_error() {
        let config = TetherConfig::from_toml(SAMPLE).unwrap();
        let err = config
            .session_config(Some("missing"), &EngineOverrides::default())
            .unwrap_err();
        assert!(matches!(err, TetherError::ConfigError(_)));
    }

    #[test]
    fn ambiguous_profile_without_default() {
        let mut config = TetherConfig::from_toml(SAMPLE).unwrap();
        config.default_profile = None;
        assert!(config.profile(None).is_err());
        config.profiles.remove("remote");
        assert!(config.profile(None).is_ok());
    }

    #[test]
    fn remote_shell_requires_host() {
        let config = TetherConfig::from_toml(
            "lock_down = false\n[profiles.r]\nremote_shell = \"/usr/bin/ssh\"\n",
        )
        .unwrap();
        assert!(config
            .session_config(None, &EngineOverrides::default())
            .is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = TetherConfig::from_toml(SAMPLE).unwrap();
        let text = config.to_toml().unwrap();
        assert_eq!(TetherConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, SAMPLE).unwrap();
        let config = TetherConfig::load(&path).unwrap();
        assert_eq!(config.default_profile.as_deref(), Some("local"));
        assert!(TetherConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn retries_within_wait() {
        let timing = TimingConfig::default();
        assert_eq!(timing.retries_within(Duration::from_secs(5)), 10);
        assert_eq!(timing.retries_within(Duration::ZERO), 1);
    }

    #[test]
    fn timing_json_roundtrip() {
        let timing = TimingConfig::immediate();
        let json = serde_json::to_string(&timing).unwrap();
        let back: TimingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, timing);
    }
}
