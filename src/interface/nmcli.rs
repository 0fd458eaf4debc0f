//! Wireless radio backed by NetworkManager.
//!
//! Drives the host's WiFi device through the `nmcli` command-line tool.
//!
//! # Requirements
//!
//! - NetworkManager must be installed and running
//! - The `nmcli` command must be available in PATH
//! - The user must be allowed to manage network connections

use std::net::Ipv4Addr;

use tokio::process::Command;

use crate::error::RadioError;

use super::{Radio, RadioStatus};

/// A WiFi device as listed by `nmcli -t -f DEVICE,TYPE,STATE device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiDevice {
    pub name: String,
    pub state: String,
}

/// Parsed `nmcli -t device show <iface>` output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// Raw state string, e.g. "100 (connected)".
    pub state: String,
    /// Active connection profile name.
    pub connection: Option<String>,
    /// First IPv4 address, without the prefix length.
    pub address: Option<Ipv4Addr>,
    /// Default IPv4 gateway.
    pub gateway: Option<Ipv4Addr>,
}

impl DeviceStatus {
    /// NetworkManager reports 100 for a fully activated device.
    pub fn is_connected(&self) -> bool {
        self.state.split_whitespace().next() == Some("100")
    }
}

/// A WiFi device managed through NetworkManager.
#[derive(Debug)]
pub struct NmcliRadio {
    interface: String,
}

impl NmcliRadio {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

/// Runs `nmcli` with `args` and returns stdout. The child is killed if the
/// caller stops waiting for it.
async fn run(args: &[&str]) -> Result<String, RadioError> {
    let output = Command::new("nmcli")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RadioError::NmcliExecution(e.to_string()))?;

    if !output.status.success() {
        // Prefer stderr, nmcli sometimes reports on stdout.
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(RadioError::NmcliExecution(message));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl Radio for NmcliRadio {
    /// `nmcli device wifi connect <ssid> password <password> ifname <interface>`
    async fn join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        let mut args = vec!["device", "wifi", "connect", ssid];
        if !password.is_empty() {
            args.extend(["password", password]);
        }
        args.extend(["ifname", self.interface.as_str()]);

        run(&args).await.map(|_| ()).map_err(|e| match e {
            RadioError::NmcliExecution(message) => RadioError::Rejected(message),
            other => other,
        })
    }

    async fn poll(&mut self) -> Result<RadioStatus, RadioError> {
        let status = device_status(&self.interface).await?;
        Ok(RadioStatus {
            associated: status.is_connected(),
            address: status.address,
        })
    }

    async fn leave(&mut self) -> Result<(), RadioError> {
        run(&["device", "disconnect", self.interface.as_str()])
            .await
            .map(|_| ())
    }
}

/// List all WiFi devices known to NetworkManager.
pub async fn list_wifi_devices() -> Result<Vec<WifiDevice>, RadioError> {
    let stdout = run(&["-t", "-f", "DEVICE,TYPE,STATE", "device"]).await?;
    Ok(parse_device_list(&stdout))
}

/// `nmcli -t device show <interface>`
pub async fn device_status(interface: &str) -> Result<DeviceStatus, RadioError> {
    let stdout = run(&["-t", "device", "show", interface]).await?;
    Ok(parse_device_show(&stdout))
}

pub fn parse_device_list(stdout: &str) -> Vec<WifiDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(':').collect();
            (parts.len() >= 3 && parts[1] == "wifi").then(|| WifiDevice {
                name: parts[0].to_string(),
                state: parts[2].to_string(),
            })
        })
        .collect()
}

/// Parses terse `KEY:VALUE` lines. Values may themselves contain colons.
pub fn parse_device_show(stdout: &str) -> DeviceStatus {
    let mut status = DeviceStatus {
        state: "unknown".to_string(),
        ..DeviceStatus::default()
    };

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let present = !value.is_empty() && value != "--";

        match key {
            "GENERAL.STATE" => status.state = value.to_string(),
            "GENERAL.CONNECTION" if present => status.connection = Some(value.to_string()),
            // "192.168.4.2/24"
            "IP4.ADDRESS[1]" if present => {
                let address = value.split('/').next().unwrap_or(value);
                status.address = address.parse().ok();
            }
            "IP4.GATEWAY" if present => status.gateway = value.parse().ok(),
            _ => {}
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTED: &str = "\
GENERAL.DEVICE:wlan0
GENERAL.TYPE:wifi
GENERAL.STATE:100 (connected)
GENERAL.CONNECTION:home
IP4.ADDRESS[1]:192.168.1.50/24
IP4.GATEWAY:192.168.1.1
IP6.ADDRESS[1]:fe80::1/64
";

    #[test]
    fn parses_connected_device() {
        let status = parse_device_show(CONNECTED);
        assert!(status.is_connected());
        assert_eq!(status.connection.as_deref(), Some("home"));
        assert_eq!(status.address, Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(status.gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn parses_disconnected_device() {
        let status = parse_device_show(
            "GENERAL.STATE:30 (disconnected)\nGENERAL.CONNECTION:--\nIP4.GATEWAY:--\n",
        );
        assert!(!status.is_connected());
        assert_eq!(status.connection, None);
        assert_eq!(status.address, None);
        assert_eq!(status.gateway, None);
    }

    #[test]
    fn missing_state_is_unknown() {
        let status = parse_device_show("garbage\n");
        assert_eq!(status.state, "unknown");
        assert!(!status.is_connected());
    }

    #[test]
    fn lists_only_wifi_devices() {
        let devices = parse_device_list("wlan0:wifi:connected\neth0:ethernet:connected\nlo:loopback:unmanaged\np2p-dev-wlan0:wifi-p2p:disconnected\n");
        assert_eq!(
            devices,
            vec![WifiDevice {
                name: "wlan0".into(),
                state: "connected".into(),
            }]
        );
    }
}
