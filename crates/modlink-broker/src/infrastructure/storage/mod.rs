//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the broker's TOML file from an explicit
//! path, the `MODLINK_CONFIG` variable, or the platform config directory,
//! and falls back to defaults when no file exists yet.

pub mod config;
