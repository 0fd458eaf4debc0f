//! Wired uplink: W5500 over the peripheral bus, addressed by DHCP.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::bus::{PeripheralBus, SpiTransport};
use crate::dhcp::{self, DhcpMessage, Lease, MessageType};
use crate::error::{BusError, ConnectError, DhcpError};
use crate::w5500::{NetworkSettings, PhyStatus, W5500};

use super::{InterfaceKind, LinkEvent, LinkNotifier, NetworkInterface};

const DHCP_SOCKET: u8 = 0;
const REPLY_POLL: Duration = Duration::from_millis(50);
const MIN_RENEW_RETRY: Duration = Duration::from_secs(10);
// Large enough for any reply our server options produce.
const DHCP_BUFFER: usize = 576;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiredSettings {
    /// Hardware address programmed into the controller.
    pub mac: [u8; 6],
    /// Sent as DHCP option 12.
    pub hostname: Option<String>,
    /// How long to wait for each DHCP reply.
    pub reply_timeout: Duration,
    /// PHY polling interval while waiting for carrier.
    pub carrier_poll: Duration,
}

/// Controller state shown on the status page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerDiagnostics {
    /// Reset, verified and configured since the last bus fault.
    pub initialized: bool,
    /// PHY status from the last poll.
    pub phy: PhyStatus,
    /// Bus wiring, e.g. "SPI0 @ 2000000 Hz (SCK=2, ...)".
    pub bus: String,
    /// Most recent connect, renewal or bus failure.
    pub last_error: Option<String>,
    /// Transfers issued since startup.
    pub transactions: u64,
    /// Transfers that failed.
    pub faults: u64,
}

/// Wired uplink driver: owns the W5500 (and with it the bus) and runs its
/// own DHCP client on socket 0.
///
/// After any bus fault the controller is treated as unknown: the next
/// connect starts with a hard reset, and a held link is reported lost.
pub struct WiredInterface<T> {
    chip: W5500<T>,
    settings: WiredSettings,
    notifier: LinkNotifier,
    initialized: bool,
    needs_reset: bool,
    linked: bool,
    phy: PhyStatus,
    lease: Option<Lease>,
    lease_started: Instant,
    renew_at: Instant,
    xid: u32,
    last_error: Option<String>,
}

impl<T: SpiTransport> WiredInterface<T> {
    pub fn new(bus: PeripheralBus<T>, settings: WiredSettings, notifier: LinkNotifier) -> Self {
        let mac = settings.mac;
        let now = Instant::now();
        Self {
            chip: W5500::new(bus),
            settings,
            notifier,
            initialized: false,
            needs_reset: true,
            linked: false,
            phy: PhyStatus::default(),
            lease: None,
            lease_started: now,
            renew_at: now,
            xid: u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]),
            last_error: None,
        }
    }

    /// Transfers issued on the bus since startup.
    pub fn bus_transactions(&self) -> u64 {
        self.chip.bus().transactions()
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    fn next_xid(&mut self) -> u32 {
        self.xid = self.xid.wrapping_add(1);
        self.xid
    }

    /// Any bus fault leaves the controller in an unknown state.
    fn record_fault(&mut self, error: &ConnectError) {
        if matches!(error, ConnectError::Bus(_)) {
            self.needs_reset = true;
            self.initialized = false;
        }
        self.last_error = Some(error.to_string());
    }

    async fn initialize(&mut self) -> Result<(), BusError> {
        tracing::debug!(bus = %self.chip.bus().descriptor(), "Resetting Ethernet controller");
        self.chip.hard_reset().await?;
        self.chip.soft_reset()?;
        self.chip.verify_chip()?;
        self.chip.init_buffers()?;
        self.chip.set_mac(&self.settings.mac)?;
        self.needs_reset = false;
        self.initialized = true;
        Ok(())
    }

    async fn wait_for_carrier(&mut self) -> Result<(), BusError> {
        loop {
            self.phy = self.chip.phy()?;
            if self.phy.link {
                if !self.linked {
                    self.linked = true;
                    self.notifier.notify(LinkEvent::LinkUp(InterfaceKind::Wired));
                }
                return Ok(());
            }
            tokio::time::sleep(self.settings.carrier_poll).await;
        }
    }

    async fn bring_up(&mut self) -> Result<Lease, ConnectError> {
        if self.needs_reset || !self.initialized {
            self.initialize().await?;
        }
        self.wait_for_carrier().await?;

        self.chip.udp_open(DHCP_SOCKET, dhcp::CLIENT_PORT)?;
        let outcome = self.acquire().await;
        let closed = self.chip.close(DHCP_SOCKET);
        let lease = outcome?;
        closed?;

        self.chip.set_network(&lease.settings)?;
        Ok(lease)
    }

    async fn acquire(&mut self) -> Result<Lease, ConnectError> {
        let xid = self.next_xid();
        let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, dhcp::SERVER_PORT);
        let hostname = self.settings.hostname.clone();

        let discover = DhcpMessage::discover(xid, self.settings.mac, hostname.as_deref());
        self.chip.udp_send(DHCP_SOCKET, broadcast, &discover.encode())?;
        let offer = self.await_reply(xid, "DHCPOFFER").await?;
        if offer.message_type != MessageType::Offer {
            return Err(DhcpError::Malformed("expected OFFER").into());
        }
        tracing::debug!(offered = %offer.yiaddr, "DHCP offer received");

        let request = DhcpMessage::request(xid, self.settings.mac, &offer, hostname.as_deref());
        self.chip.udp_send(DHCP_SOCKET, broadcast, &request.encode())?;
        let ack = self.await_reply(xid, "DHCPACK").await?;
        Ok(Lease::from_ack(&ack)?)
    }

    async fn renew(&mut self, lease: &Lease) -> Result<Lease, ConnectError> {
        let xid = self.next_xid();
        let server = SocketAddrV4::new(lease.server, dhcp::SERVER_PORT);

        self.chip.udp_open(DHCP_SOCKET, dhcp::CLIENT_PORT)?;
        let outcome = async {
            let renew = DhcpMessage::renew(xid, self.settings.mac, lease.address());
            self.chip.udp_send(DHCP_SOCKET, server, &renew.encode())?;
            let ack = self.await_reply(xid, "DHCPACK").await?;
            Ok::<_, ConnectError>(Lease::from_ack(&ack)?)
        }
        .await;
        let closed = self.chip.close(DHCP_SOCKET);
        let renewed = outcome?;
        closed?;
        Ok(renewed)
    }

    /// Waits up to the reply timeout for a reply to `xid`, skipping
    /// unrelated traffic.
    async fn await_reply(&mut self, xid: u32, phase: &'static str) -> Result<DhcpMessage, ConnectError> {
        let deadline = Instant::now() + self.settings.reply_timeout;
        let mut buf = [0u8; DHCP_BUFFER];
        loop {
            while let Some((source, len)) = self.chip.udp_recv(DHCP_SOCKET, &mut buf)? {
                match DhcpMessage::decode(&buf[..len]) {
                    Ok(message) if message.is_reply_to(xid, &self.settings.mac) => return Ok(message),
                    Ok(_) => {}
                    Err(e) => tracing::debug!(%source, error = %e, "Ignoring malformed DHCP datagram"),
                }
            }
            if Instant::now() >= deadline {
                return Err(DhcpError::NoResponse(phase).into());
            }
            tokio::time::sleep(REPLY_POLL).await;
        }
    }

    fn clear_network(&mut self) {
        if let Err(e) = self.chip.set_network(&NetworkSettings::UNSET) {
            self.record_fault(&e.into());
        }
    }

    fn release_lease(&mut self) {
        if self.lease.take().is_some() {
            self.clear_network();
            self.notifier
                .notify(LinkEvent::AddressReleased(InterfaceKind::Wired));
        }
    }

    fn lose_link(&mut self) {
        self.linked = false;
        if self.lease.take().is_some() {
            self.clear_network();
        }
        self.notifier.notify(LinkEvent::LinkLost(InterfaceKind::Wired));
    }
}

impl<T: SpiTransport> NetworkInterface for WiredInterface<T> {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Wired
    }

    async fn connect(&mut self, timeout: Duration) -> Result<Ipv4Addr, ConnectError> {
        if let Some(lease) = &self.lease {
            return Ok(lease.address());
        }

        let outcome = tokio::time::timeout(timeout, self.bring_up()).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) if self.initialized && !self.phy.link => Err(ConnectError::LinkAcquisition(format!(
                "no Ethernet carrier within {timeout:?}"
            ))),
            Err(_) => Err(ConnectError::Timeout(timeout)),
        };

        match result {
            Ok(lease) => {
                let address = lease.address();
                let now = Instant::now();
                self.lease_started = now;
                self.renew_at = now + lease.renew_after();
                self.lease = Some(lease);
                self.last_error = None;
                self.notifier
                    .notify(LinkEvent::AddressAcquired(InterfaceKind::Wired, address));
                Ok(address)
            }
            Err(e) => {
                self.record_fault(&e);
                Err(e)
            }
        }
    }

    /// A controller that faulted since the last poll is in an unknown state,
    /// so any link it had is reported lost.
    async fn is_linked(&mut self) -> bool {
        if !self.initialized {
            if self.linked {
                tracing::debug!("Ethernet controller faulted");
                self.lose_link();
            }
            return false;
        }
        match self.chip.phy() {
            Ok(phy) => {
                self.phy = phy;
                if phy.link && !self.linked {
                    self.linked = true;
                    self.notifier.notify(LinkEvent::LinkUp(InterfaceKind::Wired));
                } else if !phy.link && self.linked {
                    tracing::debug!("Ethernet carrier lost");
                    self.lose_link();
                }
                phy.link
            }
            Err(e) => {
                self.record_fault(&e.into());
                if self.linked {
                    self.lose_link();
                }
                false
            }
        }
    }

    fn current_address(&self) -> Option<Ipv4Addr> {
        self.lease.as_ref().map(Lease::address)
    }

    async fn teardown(&mut self) {
        self.release_lease();
        if self.initialized {
            if let Err(e) = self.chip.close(DHCP_SOCKET) {
                self.record_fault(&e.into());
            }
        }
    }

    /// Renews the lease from T1 on; releases it once it has run out.
    async fn maintain(&mut self) {
        let Some(lease) = self.lease else {
            return;
        };
        let now = Instant::now();
        if now < self.renew_at {
            return;
        }

        match self.renew(&lease).await {
            Ok(renewed) => {
                tracing::info!(address = %renewed.address(), lease = ?renewed.duration, "DHCP lease renewed");
                let now = Instant::now();
                self.lease_started = now;
                self.renew_at = now + renewed.renew_after();
                if renewed.settings != lease.settings {
                    if let Err(e) = self.chip.set_network(&renewed.settings) {
                        self.record_fault(&e.into());
                    }
                }
                let address = renewed.address();
                self.lease = Some(renewed);
                if address != lease.address() {
                    self.notifier
                        .notify(LinkEvent::AddressAcquired(InterfaceKind::Wired, address));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "DHCP lease renewal failed");
                self.record_fault(&e);
                let expiry = self.lease_started + lease.duration;
                let now = Instant::now();
                if now >= expiry || matches!(e, ConnectError::Dhcp(DhcpError::Declined)) {
                    self.release_lease();
                } else {
                    self.renew_at = now + ((expiry - now) / 2).max(MIN_RENEW_RETRY);
                }
            }
        }
    }

    fn diagnostics(&self) -> Option<ControllerDiagnostics> {
        let bus = self.chip.bus();
        Some(ControllerDiagnostics {
            initialized: self.initialized,
            phy: self.phy,
            bus: bus.descriptor().to_string(),
            last_error: self.last_error.clone(),
            transactions: bus.transactions(),
            faults: bus.faults(),
        })
    }
}
