use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Malformed or missing static configuration. Fatal: retrying cannot fix it.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A failed transaction on the peripheral bus to the Ethernet controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("SPI transfer failed: {0}")]
    Transfer(String),

    #[error("Failed to open {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("Controller did not complete '{0}' in time")]
    Stalled(&'static str),

    #[error("Unexpected controller version 0x{found:02x} (expected 0x{expected:02x})")]
    UnexpectedChip { found: u8, expected: u8 },
}

/// Failure reported by a wireless radio backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Failed to execute nmcli: {0}")]
    NmcliExecution(String),

    #[error("Association rejected: {0}")]
    Rejected(String),
}

/// Failure to bring an interface up.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Association or carrier came up short: no carrier on the wire, or
    /// associated but never addressed.
    #[error("Link acquisition failed: {0}")]
    LinkAcquisition(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("DHCP failed: {0}")]
    Dhcp(#[from] DhcpError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::Configuration(_))
    }
}

/// Malformed or unexpected DHCP traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DhcpError {
    #[error("Malformed DHCP message: {0}")]
    Malformed(&'static str),

    #[error("Server declined the request (NAK)")]
    Declined,

    #[error("No {0} received from a DHCP server")]
    NoResponse(&'static str),
}

/// The downstream endpoint did not answer the liveness probe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Downstream probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Downstream unreachable: {0}")]
    Unreachable(String),

    #[error("No usable uplink for the downstream probe")]
    NoUplink,
}

/// Status page rendering fault.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that stop the supervisor. Everything recoverable is absorbed into
/// state transitions instead.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
}
