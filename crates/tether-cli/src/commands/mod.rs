pub mod export;
pub mod import;
pub mod submit;

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use tether_session::{PromptResponder, ResponseStrategy, Session};
use tether_types::{EngineConfig, EngineOverrides, TetherConfig, CONFIG_FILENAME};

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Global {
    pub config: Option<PathBuf>,
    pub profile: Option<String>,
}

/// Resolve the user's home directory from the environment.
pub fn dirs_from_env() -> anyhow::Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable is not set")?;
    Ok(PathBuf::from(home))
}

/// Default configuration path: `~/.tether/tether.toml`.
pub fn default_config_path(home: &Path) -> PathBuf {
    home.join(".tether").join(CONFIG_FILENAME)
}

/// Load the configuration named on the command line, or the default file.
///
/// A missing default file yields a single unlocked profile with the stock
/// engine path, so `--engine` alone is enough to get going.
pub fn load_config(explicit: Option<&Path>, home: Option<&Path>) -> anyhow::Result<TetherConfig> {
    if let Some(path) = explicit {
        return TetherConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    if let Some(path) = home.map(default_config_path).filter(|p| p.exists()) {
        return TetherConfig::load(&path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    debug!("no configuration file, using built-in profile");
    let mut config = TetherConfig {
        lock_down: false,
        ..TetherConfig::default()
    };
    config
        .profiles
        .insert("default".into(), EngineConfig::default());
    Ok(config)
}

/// Load configuration and launch a session with the given overrides.
pub fn open_session(
    global: &Global,
    overrides: &EngineOverrides,
    strategy: ResponseStrategy,
) -> anyhow::Result<Session> {
    let home = dirs_from_env().ok();
    let config = load_config(global.config.as_deref(), home.as_deref())?;
    let session_config = config.session_config(global.profile.as_deref(), overrides)?;
    let path = session_config.engine.engine_path.clone();
    Session::start(session_config, strategy)
        .with_context(|| format!("failed to start engine {}", path.display()))
}

/// Asks the person at the terminal to answer engine prompts.
pub struct TerminalResponder;

impl PromptResponder for TerminalResponder {
    fn respond(&mut self, question: &str) -> Option<String> {
        eprintln!("{question}");
        dialoguer::Input::<String>::new()
            .with_prompt("Response")
            .allow_empty(true)
            .interact_text()
            .ok()
    }
}
