use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::WirelessConfig;
use crate::error::{ConfigError, ConnectError, RadioError};
use crate::sim::SimRadio;

use super::nmcli::NmcliRadio;
use super::{InterfaceKind, LinkEvent, LinkNotifier, NetworkInterface};

/// What the radio reports when polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RadioStatus {
    /// Associated with the access point.
    pub associated: bool,
    /// Address handed out by the access point's DHCP server, if any yet.
    pub address: Option<Ipv4Addr>,
}

/// Backend that performs the actual association.
pub trait Radio: Send {
    fn join(&mut self, ssid: &str, password: &str) -> impl Future<Output = Result<(), RadioError>> + Send;

    fn poll(&mut self) -> impl Future<Output = Result<RadioStatus, RadioError>> + Send;

    fn leave(&mut self) -> impl Future<Output = Result<(), RadioError>> + Send;
}

/// Radio selected from configuration.
#[derive(Debug)]
pub enum RadioBackend {
    Nmcli(NmcliRadio),
    Simulated(SimRadio),
}

impl Radio for RadioBackend {
    async fn join(&mut self, ssid: &str, password: &str) -> Result<(), RadioError> {
        match self {
            RadioBackend::Nmcli(radio) => radio.join(ssid, password).await,
            RadioBackend::Simulated(radio) => radio.join(ssid, password).await,
        }
    }

    async fn poll(&mut self) -> Result<RadioStatus, RadioError> {
        match self {
            RadioBackend::Nmcli(radio) => radio.poll().await,
            RadioBackend::Simulated(radio) => radio.poll().await,
        }
    }

    async fn leave(&mut self) -> Result<(), RadioError> {
        match self {
            RadioBackend::Nmcli(radio) => radio.leave().await,
            RadioBackend::Simulated(radio) => radio.leave().await,
        }
    }
}

/// Wireless uplink driver. Every radio call is bounded: joins by the connect
/// timeout, polls and disconnects by the command timeout.
pub struct WirelessInterface<R> {
    radio: R,
    ssid: String,
    password: String,
    poll_interval: Duration,
    command_timeout: Duration,
    notifier: LinkNotifier,
    linked: bool,
    address: Option<Ipv4Addr>,
}

impl<R: Radio> WirelessInterface<R> {
    pub fn new(radio: R, config: &WirelessConfig, notifier: LinkNotifier) -> Self {
        Self {
            radio,
            ssid: config.ssid.clone(),
            password: config.password.clone(),
            poll_interval: config.poll_interval(),
            command_timeout: config.command_timeout(),
            notifier,
            linked: false,
            address: None,
        }
    }

    async fn associate(&mut self) -> Result<Ipv4Addr, ConnectError> {
        self.radio.join(&self.ssid, &self.password).await?;
        loop {
            let status = self.radio.poll().await?;
            if status.associated && !self.linked {
                self.linked = true;
                self.notifier.notify(LinkEvent::LinkUp(InterfaceKind::Wireless));
            }
            if let (true, Some(address)) = (status.associated, status.address) {
                return Ok(address);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn drop_link(&mut self) {
        let had_link = std::mem::replace(&mut self.linked, false);
        self.address = None;
        if had_link {
            self.notifier.notify(LinkEvent::LinkLost(InterfaceKind::Wireless));
        }
    }
}

impl<R: Radio> NetworkInterface for WirelessInterface<R> {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Wireless
    }

    async fn connect(&mut self, timeout: Duration) -> Result<Ipv4Addr, ConnectError> {
        if let Some(address) = self.address {
            return Ok(address);
        }
        if self.ssid.is_empty() {
            return Err(ConfigError::invalid("wireless.ssid", "must not be empty").into());
        }

        tracing::info!(ssid = %self.ssid, "Joining wireless network");
        match tokio::time::timeout(timeout, self.associate()).await {
            Ok(Ok(address)) => {
                self.address = Some(address);
                self.notifier
                    .notify(LinkEvent::AddressAcquired(InterfaceKind::Wireless, address));
                Ok(address)
            }
            Ok(Err(e)) => Err(e),
            Err(_) if self.linked => Err(ConnectError::LinkAcquisition(format!(
                "associated with {} but no address within {timeout:?}",
                self.ssid
            ))),
            Err(_) => Err(ConnectError::Timeout(timeout)),
        }
    }

    /// A poll that errors or outlives the command timeout counts as no
    /// association.
    async fn is_linked(&mut self) -> bool {
        let status = match tokio::time::timeout(self.command_timeout, self.radio.poll()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Wireless poll failed");
                RadioStatus::default()
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.command_timeout, "Wireless poll timed out");
                RadioStatus::default()
            }
        };

        if !status.associated {
            self.drop_link();
            return false;
        }
        if !self.linked {
            self.linked = true;
            self.notifier.notify(LinkEvent::LinkUp(InterfaceKind::Wireless));
        }
        if self.address.is_some() && status.address.is_none() {
            self.address = None;
            self.notifier
                .notify(LinkEvent::AddressReleased(InterfaceKind::Wireless));
        }
        true
    }

    fn current_address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    async fn teardown(&mut self) {
        match tokio::time::timeout(self.command_timeout, self.radio.leave()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Wireless disconnect failed"),
            Err(_) => tracing::warn!(timeout = ?self.command_timeout, "Wireless disconnect timed out"),
        }
        let had_address = self.address.take().is_some();
        self.linked = false;
        if had_address {
            self.notifier
                .notify(LinkEvent::AddressReleased(InterfaceKind::Wireless));
        }
    }
}
