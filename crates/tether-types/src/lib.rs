//! Core types shared across the tether crates.
//!
//! Defines the error taxonomy for engine sessions and the serde
//! configuration loaded from `tether.toml`: engine launch profiles, the
//! lock-down policy for caller overrides, and the poll-loop timing knobs.

pub mod config;
pub mod error;

pub use config::{
    EngineConfig, EngineOverrides, SessionConfig, TetherConfig, TimingConfig, CONFIG_FILENAME,
    DEFAULT_ENGINE_PATH,
};
pub use error::TetherError;
