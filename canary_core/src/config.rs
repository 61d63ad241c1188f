use crate::payload::{self, PayloadError};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid endpoint {0:?}: expected HOST:PORT")]
    InvalidEndpoint(String),

    #[error("Invalid serial device {0:?}: expected DEVICE[:BAUD]")]
    InvalidSerial(String),

    #[error("Invalid padding byte: {0}")]
    InvalidPad(PayloadError),

    #[error("Invalid prefix: {0}")]
    InvalidPrefix(PayloadError),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("No transport configured")]
    MissingTransport,

    #[error("Either an explicit offset or automatic offset discovery is required")]
    MissingOffset,
}

/// A `host:port` pair. IPv6 literals are written as `[addr]:port`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

pub const DEFAULT_BAUD: u32 = 115_200;

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

/// `device[:baud]` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSpec {
    pub device: String,
    pub baud: u32,
}

impl FromStr for SerialSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSerial(s.to_string());
        // Device paths may themselves contain colons (/dev/serial/by-path/...), so
        // only a numeric suffix is taken as the baud rate.
        let (device, baud) = match s.rsplit_once(':') {
            Some((device, baud)) => match baud.parse::<u32>() {
                Ok(baud) => (device, baud),
                Err(_) => (s, DEFAULT_BAUD),
            },
            None => (s, DEFAULT_BAUD),
        };
        if device.is_empty() || baud == 0 {
            return Err(invalid());
        }
        Ok(Self {
            device: device.to_string(),
            baud,
        })
    }
}

/// Which channel reaches the target. Exactly one is chosen per run.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    Exec {
        argv: Vec<String>,
    },
    Unix {
        path: PathBuf,
    },
    Tcp {
        addr: Endpoint,
    },
    Udp {
        addr: Endpoint,
    },
    Tls {
        addr: Endpoint,
        #[serde(default)]
        insecure: bool,
    },
    #[serde(rename_all = "kebab-case")]
    Serial {
        device: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default)]
        require_echo: bool,
    },
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Exec { argv } => write!(f, "exec {}", argv.join(" ")),
            TransportConfig::Unix { path } => write!(f, "unix {}", path.display()),
            TransportConfig::Tcp { addr } => write!(f, "tcp {addr}"),
            TransportConfig::Udp { addr } => write!(f, "udp {addr}"),
            TransportConfig::Tls { addr, insecure } => {
                write!(f, "tls {addr}")?;
                if *insecure {
                    write!(f, " (certificate checks disabled)")?;
                }
                Ok(())
            }
            TransportConfig::Serial { device, baud, .. } => write!(f, "serial {device}@{baud}"),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    /// Probe for the offset instead of trusting `offset`.
    #[serde(default)]
    pub auto_offset: bool,
    /// Probe every length in order instead of exponential + binary search.
    #[serde(default)]
    pub linear: bool,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default = "default_max_probe")]
    pub max_probe: usize,
    #[serde(default = "default_canary_len")]
    pub canary_len: usize,
    #[serde(default = "default_confirm")]
    pub confirm: usize,
    /// Single padding byte; `\xHH` escapes allowed.
    #[serde(default = "default_pad")]
    pub pad: String,
    /// Static bytes sent before the padding; `\xHH` escapes allowed.
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

pub fn default_max_probe() -> usize {
    4096
}
pub fn default_canary_len() -> usize {
    8
}
pub fn default_confirm() -> usize {
    3
}
fn default_pad() -> String {
    "A".to_string()
}
pub fn default_timeout_ms() -> u64 {
    200
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            auto_offset: false,
            linear: false,
            offset: None,
            max_probe: default_max_probe(),
            canary_len: default_canary_len(),
            confirm: default_confirm(),
            pad: default_pad(),
            prefix: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl SearchSettings {
    pub fn pad_byte(&self) -> Result<u8, ConfigError> {
        payload::parse_pad(&self.pad).map_err(ConfigError::InvalidPad)
    }

    pub fn prefix_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        payload::parse_escaped(&self.prefix).map_err(ConfigError::InvalidPrefix)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks everything the search algorithms rely on before a transport is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero("timeout"));
        }
        if self.canary_len == 0 {
            return Err(ConfigError::Zero("canary length"));
        }
        if self.auto_offset && self.max_probe == 0 {
            return Err(ConfigError::Zero("max probe"));
        }
        if !self.auto_offset && self.offset.is_none() {
            return Err(ConfigError::MissingOffset);
        }
        self.pad_byte()?;
        self.prefix_bytes()?;
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CanaryConfig {
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    #[serde(default)]
    pub search: SearchSettings,
}

impl CanaryConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CanaryConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.is_none() {
            return Err(ConfigError::MissingTransport);
        }
        self.search.validate()
    }
}
