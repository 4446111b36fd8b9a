//! Configuration for the `midea` binary.
//!
//! Settings are read from a YAML file and then overridden from the
//! environment. A missing file yields the defaults. Loading happens before
//! logging is set up, so what it has to report is kept as [`ConfigNotice`]s
//! and logged later by [`MideaConfig::log_notices`].

use anyhow::{Context, Result};
use midea_session::{Credentials, DeviceInfo, SessionConfig};
use midea_wire::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MideaConfig {
    /// Log level directive for the midea crates
    pub log_level: String,
    /// Status refresh period (seconds, 0 disables)
    pub refresh_interval: u64,
    /// Heartbeat period (seconds)
    pub heartbeat_interval: u64,
    /// Discovery idle timeout (seconds)
    pub discovery_timeout: u64,
    /// Appliances to run sessions for
    pub devices: Vec<DeviceConfig>,
    /// Messages from loading, not part of the file
    #[serde(skip)]
    pub notices: Vec<ConfigNotice>,
}

/// Something worth logging that happened while loading the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNotice {
    /// No file at the given path, defaults used
    FileNotFound(PathBuf),
    /// Environment variable replaced a setting
    Override {
        /// Variable name
        variable: &'static str,
        /// Value taken
        value: String,
    },
    /// Environment variable held an unparsable duration and was ignored
    InvalidDuration {
        /// Variable name
        variable: &'static str,
        /// Rejected value
        value: String,
    },
}

/// One configured appliance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Appliance id
    pub device_id: u64,
    /// Family code
    pub device_type: u8,
    /// LAN address
    pub ip: Ipv4Addr,
    /// LAN port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Protocol generation (1, 2 or 3)
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolVersion,
    /// Hex token for V3 devices
    #[serde(default)]
    pub token: Option<String>,
    /// Hex key for V3 devices
    #[serde(default)]
    pub key: Option<String>,
    /// Codec customisation JSON
    #[serde(default)]
    pub customize: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: String,
}

fn default_port() -> u16 {
    6444
}

fn default_protocol() -> ProtocolVersion {
    ProtocolVersion::V3
}

impl Default for MideaConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            refresh_interval: 30,
            heartbeat_interval: 10,
            discovery_timeout: 5,
            devices: Vec::new(),
            notices: Vec::new(),
        }
    }
}

impl MideaConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => serde_yaml::from_str::<Self>(&content)
                .with_context(|| format!("invalid config file {:?}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self {
                notices: vec![ConfigNotice::FileNotFound(path.to_path_buf())],
                ..Self::default()
            },
            Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `MIDEA_*` environment variables
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("MIDEA_LOG_LEVEL") {
            self.notices.push(ConfigNotice::Override {
                variable: "MIDEA_LOG_LEVEL",
                value: level.clone(),
            });
            self.log_level = level;
        }

        let durations: [(&'static str, &mut u64); 3] = [
            ("MIDEA_REFRESH_INTERVAL", &mut self.refresh_interval),
            ("MIDEA_HEARTBEAT_INTERVAL", &mut self.heartbeat_interval),
            ("MIDEA_DISCOVERY_TIMEOUT", &mut self.discovery_timeout),
        ];
        for (variable, setting) in durations {
            let Some(value) = lookup(variable) else {
                continue;
            };
            match parse_seconds(&value) {
                Some(secs) => {
                    *setting = secs;
                    self.notices.push(ConfigNotice::Override {
                        variable,
                        value: format!("{}s", secs),
                    });
                }
                None => self.notices.push(ConfigNotice::InvalidDuration { variable, value }),
            }
        }
    }

    /// Log what happened while loading; call once the subscriber is installed
    pub fn log_notices(&self) {
        for notice in &self.notices {
            match notice {
                ConfigNotice::FileNotFound(path) => {
                    debug!("Config file {:?} not found, using defaults", path)
                }
                ConfigNotice::Override { variable, value } => {
                    info!("{} overrides the config file: {}", variable, value)
                }
                ConfigNotice::InvalidDuration { variable, value } => {
                    warn!("Ignoring {}: invalid duration {:?}", variable, value)
                }
            }
        }
    }

    /// Session settings derived from the intervals
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            ..SessionConfig::default()
        }
    }

    /// Discovery idle timeout
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout)
    }
}

impl DeviceConfig {
    /// Identity and address for the session
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id,
            device_type: self.device_type,
            ip: self.ip,
            port: self.port,
            protocol: self.protocol,
            model: String::new(),
            subtype: 0,
            name: self.name.clone(),
        }
    }

    /// Handshake credentials, if both token and key are set
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.token, &self.key) {
            (Some(token), Some(key)) => Credentials::from_hex(token, key)
                .map(Some)
                .with_context(|| format!("credentials of device {}", self.device_id)),
            (None, None) => Ok(None),
            _ => {
                warn!("Device {} has only one of token and key, ignoring both", self.device_id);
                Ok(None)
            }
        }
    }
}

/// Seconds from either a bare integer or a humantime string ("30s", "1m")
fn parse_seconds(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.parse::<u64>() {
        Ok(secs) => Some(secs),
        Err(_) => humantime::parse_duration(value)
            .ok()
            .map(|duration| duration.as_secs()),
    }
}
