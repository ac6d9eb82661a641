//! TOML-based configuration for the broker.
//!
//! The file is looked up in this order:
//!
//! 1. the path given with `--config`,
//! 2. the `MODLINK_CONFIG` environment variable,
//! 3. the platform config directory:
//!    - Linux:   `~/.config/modlink/broker.toml`
//!    - macOS:   `~/Library/Application Support/modlink/broker.toml`
//!    - Windows: `%APPDATA%\modlink\broker.toml`
//!
//! A missing file is not an error: the broker runs on defaults.
//!
//! # Example
//!
//! ```toml
//! [broker]
//! log_level = "debug"
//!
//! [rendezvous]
//! kind = "datagram"
//! host = "127.0.0.1"
//! port = 49900
//! module_port = 50000
//!
//! [pairing]
//! default_kind = "native_channel"
//! station = "cell-3"
//!
//! [[pairing.overrides]]
//! interface = 100
//! kind = "stream"
//!
//! [timeouts]
//! reply = 5000
//! ```
//!
//! Every field has a `#[serde(default = ...)]`, so a file only needs the
//! values it changes.

use std::path::{Path, PathBuf};

use modlink_core::{InterfaceId, ProtocolDescriptor, ProtocolKind};
use modlink_runtime::TransportTimeouts;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::pairing::PairingPlan;
use crate::infrastructure::rendezvous::RendezvousSettings;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "MODLINK_CONFIG";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub broker: GeneralConfig,
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub timeouts: TransportTimeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralConfig {
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// The receptor address and the family module endpoints come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RendezvousConfig {
    #[serde(default = "default_rendezvous_kind")]
    pub kind: ProtocolKind,
    #[serde(default = "default_host")]
    pub host: String,
    /// Receptor port (channel number for native and null kinds).
    #[serde(default = "default_rendezvous_port")]
    pub port: u16,
    /// First port of the control/registrar family.
    #[serde(default = "default_module_port")]
    pub module_port: u16,
    #[serde(default = "default_station")]
    pub station: String,
}

/// Transport choice and channel families for pairings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingConfig {
    #[serde(default = "default_pairing_kind")]
    pub default_kind: ProtocolKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_datagram_port")]
    pub datagram_port: u16,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// Host-local namespace of native channels; also names shared regions.
    #[serde(default = "default_station")]
    pub station: String,
    #[serde(default = "default_native_channel")]
    pub native_channel: u32,
    #[serde(default = "default_null_channel")]
    pub null_channel: u32,
    #[serde(default)]
    pub overrides: Vec<KindOverride>,
}

/// Pins the protocol kind of one interface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindOverride {
    pub interface: u16,
    pub kind: ProtocolKind,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_rendezvous_kind() -> ProtocolKind {
    ProtocolKind::Datagram
}
fn default_pairing_kind() -> ProtocolKind {
    ProtocolKind::Datagram
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_rendezvous_port() -> u16 {
    modlink_runtime::application::connector::DEFAULT_BROKER_PORT
}
fn default_module_port() -> u16 {
    50000
}
fn default_station() -> String {
    "modlink".to_string()
}
fn default_datagram_port() -> u16 {
    51000
}
fn default_stream_port() -> u16 {
    52000
}
fn default_native_channel() -> u32 {
    1000
}
fn default_null_channel() -> u32 {
    60000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            kind: default_rendezvous_kind(),
            host: default_host(),
            port: default_rendezvous_port(),
            module_port: default_module_port(),
            station: default_station(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            default_kind: default_pairing_kind(),
            host: default_host(),
            datagram_port: default_datagram_port(),
            stream_port: default_stream_port(),
            station: default_station(),
            native_channel: default_native_channel(),
            null_channel: default_null_channel(),
            overrides: Vec::new(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

/// A descriptor of `kind` for `port`; native and null kinds use the port as
/// channel number.
fn endpoint(kind: ProtocolKind, host: &str, station: &str, port: u16) -> ProtocolDescriptor {
    match kind {
        ProtocolKind::Datagram => ProtocolDescriptor::datagram(host, port),
        ProtocolKind::Stream => ProtocolDescriptor::stream(host, port),
        ProtocolKind::NativeChannel => ProtocolDescriptor::native(station, u32::from(port)),
        ProtocolKind::Null => ProtocolDescriptor::null(u32::from(port)),
    }
}

impl BrokerConfig {
    pub fn pairing_plan(&self) -> PairingPlan {
        let p = &self.pairing;
        let plan = PairingPlan::new(
            p.default_kind,
            [
                ProtocolDescriptor::datagram(p.host.as_str(), p.datagram_port),
                ProtocolDescriptor::stream(p.host.as_str(), p.stream_port),
                ProtocolDescriptor::native(p.station.as_str(), p.native_channel),
                ProtocolDescriptor::null(p.null_channel),
            ],
        );
        p.overrides.iter().fold(plan, |plan, o| {
            plan.with_override(InterfaceId(o.interface), o.kind)
        })
    }

    pub fn rendezvous_settings(&self) -> RendezvousSettings {
        let r = &self.rendezvous;
        RendezvousSettings {
            receptor: endpoint(r.kind, &r.host, &r.station, r.port),
            module_base: endpoint(r.kind, &r.host, &r.station, r.module_port),
            timeouts: self.timeouts,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the config file: `explicit`, then `MODLINK_CONFIG`, then the
/// platform directory.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if neither a path nor the
/// variable is given and the base directory cannot be determined.
pub fn config_file_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("broker.toml"))
}

/// Loads the config at `path`, returning `BrokerConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &BrokerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// The platform config base directory joined with `modlink`.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("modlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("modlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("modlink"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
