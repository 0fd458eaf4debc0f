use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bus::BusDescriptor;
use crate::error::ConfigError;
use crate::interface::WiredSettings;
use crate::retry::RetryPolicy;
use crate::supervisor::SupervisorSettings;
use crate::w5500::NetworkSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AdapterConfig {
    #[serde(default)]
    pub wireless: WirelessConfig,
    #[serde(default)]
    pub wired: WiredConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RadioBackendKind {
    #[default]
    Nmcli,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WirelessConfig {
    pub ssid: String,
    pub password: String,
    /// nmcli device; the first WiFi device when unset.
    pub interface: Option<String>,
    pub backend: RadioBackendKind,
    pub connect_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Upper bound on a single status poll or disconnect.
    pub command_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            interface: None,
            backend: RadioBackendKind::Nmcli,
            connect_timeout_secs: 10,
            poll_interval_ms: 1_000,
            command_timeout_ms: 3_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl WirelessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WiredBackendKind {
    /// W5500 on a Linux spidev device.
    #[default]
    Spidev,
    /// In-process register-level W5500 model.
    Emulated,
    /// No controller attached; every transfer fails.
    Unattached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WiredConfig {
    pub mac: String,
    pub hostname: Option<String>,
    pub backend: WiredBackendKind,
    pub connect_timeout_secs: u64,
    pub reply_timeout_ms: u64,
    pub carrier_poll_ms: u64,
    pub retry: RetryPolicy,
    pub bus: BusConfig,
}

impl Default for WiredConfig {
    fn default() -> Self {
        Self {
            mac: "DE:AD:BE:EF:FE:ED".to_string(),
            hostname: Some("hue-adapter".to_string()),
            backend: WiredBackendKind::Spidev,
            connect_timeout_secs: 10,
            reply_timeout_ms: 2_000,
            carrier_poll_ms: 100,
            retry: RetryPolicy::default(),
            bus: BusConfig::default(),
        }
    }
}

impl WiredConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Wiring of the Ethernet controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// spidev node for the `spidev` backend.
    pub device: PathBuf,
    /// GPIO character device holding the reset line.
    pub gpio_chip: PathBuf,
    /// SPI controller number, shown in diagnostics.
    pub id: u8,
    /// Clock rate in Hz.
    pub baudrate: u32,
    pub sck: u8,
    pub mosi: u8,
    pub miso: u8,
    pub cs: u8,
    /// Reset pin; also the line offset on `gpio_chip`.
    pub rst: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/spidev0.0"),
            gpio_chip: PathBuf::from("/dev/gpiochip0"),
            id: 0,
            baudrate: 2_000_000,
            sck: 2,
            mosi: 3,
            miso: 4,
            cs: 5,
            rst: 6,
        }
    }
}

impl From<&BusConfig> for BusDescriptor {
    fn from(bus: &BusConfig) -> Self {
        BusDescriptor {
            id: bus.id,
            baudrate: bus.baudrate,
            sck: bus.sck,
            mosi: bus.mosi,
            miso: bus.miso,
            cs: bus.cs,
            rst: bus.rst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Tcp,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// The Hue bridge.
    pub address: Ipv4Addr,
    pub method: ProbeMethod,
    pub port: u16,
    /// Request path for HTTP probes.
    pub path: String,
    pub timeout_ms: u64,
    pub interval_secs: u64,
    /// Bind probes to the active uplink's address.
    pub bind_to_uplink: bool,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(192, 168, 1, 61),
            method: ProbeMethod::Tcp,
            port: 80,
            path: "/api/config".to_string(),
            timeout_ms: 2_000,
            interval_secs: 5,
            bind_to_uplink: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub wifi_pin: u8,
    pub ethernet_pin: u8,
    pub data_pin: u8,
    pub heartbeat_pin: u8,
    pub pulse_ms: u64,
    pub flash_ms: u64,
    pub boot_rounds: u32,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            wifi_pin: 28,
            ethernet_pin: 27,
            data_pin: 26,
            heartbeat_pin: 25,
            pulse_ms: 50,
            flash_ms: 33,
            boot_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub bringup_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            bringup_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: Ipv4Addr,
    pub port: u16,
    /// Requests served at once.
    pub max_concurrent: usize,
    pub log_capacity: usize,
    /// Searched before the standard template locations.
    pub template_path: Option<PathBuf>,
    pub bind_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Ipv4Addr::UNSPECIFIED,
            port: 80,
            max_concurrent: 1,
            log_capacity: 50,
            template_path: None,
            bind_attempts: 3,
        }
    }
}

/// Bench network used by `--simulate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub wireless_address: Ipv4Addr,
    pub wired_address: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub lease_secs: u32,
    pub downstream_reachable: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            wireless_address: Ipv4Addr::new(192, 168, 1, 50),
            wired_address: Ipv4Addr::new(192, 168, 1, 60),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            lease_secs: 3_600,
            downstream_reachable: true,
        }
    }
}

impl SimulationConfig {
    pub fn wired_offer(&self) -> NetworkSettings {
        NetworkSettings {
            address: self.wired_address,
            subnet: self.subnet,
            gateway: self.gateway,
        }
    }
}

impl AdapterConfig {
    /// Reads `path`, or returns the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(AdapterConfig::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content).with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Rejects values the adapter cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wireless.backend == RadioBackendKind::Nmcli && self.wireless.ssid.trim().is_empty() {
            return Err(ConfigError::invalid("wireless.ssid", "must not be empty"));
        }
        if self.wireless.ssid.len() > 32 {
            return Err(ConfigError::invalid("wireless.ssid", "longer than 32 bytes"));
        }
        if self.wireless.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("wireless.poll_interval_ms", "must be positive"));
        }
        if self.wireless.command_timeout_ms == 0 {
            return Err(ConfigError::invalid("wireless.command_timeout_ms", "must be positive"));
        }
        parse_mac(&self.wired.mac)?;
        if self.wired.reply_timeout_ms == 0 {
            return Err(ConfigError::invalid("wired.reply_timeout_ms", "must be positive"));
        }
        if self.wired.carrier_poll_ms == 0 {
            return Err(ConfigError::invalid("wired.carrier_poll_ms", "must be positive"));
        }
        validate_retry("wireless.retry", &self.wireless.retry)?;
        validate_retry("wired.retry", &self.wired.retry)?;

        if self.downstream.address.is_unspecified() || self.downstream.address.is_broadcast() {
            return Err(ConfigError::invalid("downstream.address", "must be a unicast address"));
        }
        if self.downstream.timeout_ms == 0 {
            return Err(ConfigError::invalid("downstream.timeout_ms", "must be positive"));
        }
        if self.downstream.interval_secs == 0 {
            return Err(ConfigError::invalid("downstream.interval_secs", "must be positive"));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("supervisor.poll_interval_ms", "must be positive"));
        }
        if self.supervisor.bringup_attempts == 0 {
            return Err(ConfigError::invalid("supervisor.bringup_attempts", "must be at least 1"));
        }
        if self.server.max_concurrent == 0 {
            return Err(ConfigError::invalid("server.max_concurrent", "must be at least 1"));
        }
        if self.server.log_capacity == 0 {
            return Err(ConfigError::invalid("server.log_capacity", "must be at least 1"));
        }
        if self.server.bind_attempts == 0 {
            return Err(ConfigError::invalid("server.bind_attempts", "must be at least 1"));
        }
        Ok(())
    }

    pub fn wired_settings(&self) -> Result<WiredSettings, ConfigError> {
        Ok(WiredSettings {
            mac: parse_mac(&self.wired.mac)?,
            hostname: self.wired.hostname.clone(),
            reply_timeout: Duration::from_millis(self.wired.reply_timeout_ms),
            carrier_poll: Duration::from_millis(self.wired.carrier_poll_ms),
        })
    }

    pub fn supervisor_settings(&self) -> Result<SupervisorSettings, ConfigError> {
        let mac = parse_mac(&self.wired.mac)?;
        let mut seed = [0u8; 8];
        seed[2..].copy_from_slice(&mac);

        Ok(SupervisorSettings {
            poll_interval: Duration::from_millis(self.supervisor.poll_interval_ms),
            bringup_attempts: self.supervisor.bringup_attempts,
            wireless_timeout: self.wireless.connect_timeout(),
            wired_timeout: self.wired.connect_timeout(),
            wireless_retry: self.wireless.retry.clone(),
            wired_retry: self.wired.retry.clone(),
            probe_timeout: Duration::from_millis(self.downstream.timeout_ms),
            probe_interval: Duration::from_secs(self.downstream.interval_secs),
            jitter_seed: u64::from_be_bytes(seed),
        })
    }
}

fn validate_retry(field: &'static str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.base_delay_ms == 0 {
        return Err(ConfigError::invalid(field, "base_delay_ms must be positive"));
    }
    if policy.cap_delay_ms < policy.base_delay_ms {
        return Err(ConfigError::invalid(field, "cap_delay_ms is below base_delay_ms"));
    }
    if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
        return Err(ConfigError::invalid(field, "backoff_multiplier must be at least 1"));
    }
    if !(0.0..1.0).contains(&policy.jitter) {
        return Err(ConfigError::invalid(field, "jitter must be in [0, 1)"));
    }
    if policy.max_attempts == Some(0) {
        return Err(ConfigError::invalid(field, "max_attempts must be at least 1"));
    }
    Ok(())
}

/// Parses `AA:BB:CC:DD:EE:FF` (or `-` separated).
pub fn parse_mac(text: &str) -> Result<[u8; 6], ConfigError> {
    let invalid = || ConfigError::invalid("wired.mac", format!("'{text}' is not a MAC address"));
    let mut mac = [0u8; 6];
    let mut parts = text.split([':', '-']);
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    if mac[0] & 0x01 != 0 {
        return Err(ConfigError::invalid("wired.mac", "multicast addresses cannot be assigned"));
    }
    Ok(mac)
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join("hue-adapter").join("config.toml"))
}
