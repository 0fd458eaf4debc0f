//! Network interface drivers.
//!
//! Both uplinks implement [`NetworkInterface`]. The supervisor owns one of
//! each and is generic over them; drivers report every observable change
//! (carrier, address) on a [`LinkNotifier`] channel that the supervisor
//! drains after each call.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ConnectError;

pub mod nmcli;
pub mod wired;
pub mod wireless;

pub use wired::{ControllerDiagnostics, WiredInterface, WiredSettings};
pub use wireless::{Radio, RadioBackend, RadioStatus, WirelessInterface};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Wireless,
    Wired,
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceKind::Wireless => write!(f, "wireless"),
            InterfaceKind::Wired => write!(f, "wired"),
        }
    }
}

/// Lifecycle of one interface. An address exists only while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "address", rename_all = "lowercase")]
pub enum InterfaceState {
    Down,
    Connecting,
    Connected(Ipv4Addr),
    Failed,
}

impl InterfaceState {
    pub fn address(&self) -> Option<Ipv4Addr> {
        match self {
            InterfaceState::Connected(address) => Some(*address),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, InterfaceState::Connected(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            InterfaceState::Down => "down",
            InterfaceState::Connecting => "connecting",
            InterfaceState::Connected(_) => "connected",
            InterfaceState::Failed => "failed",
        }
    }
}

/// Supervisor-side bookkeeping for one interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceStatus {
    pub kind: InterfaceKind,
    pub state: InterfaceState,
    pub since: DateTime<Local>,
    pub consecutive_failures: u32,
    /// Reconnect attempts made since the interface was last connected.
    pub attempt: u32,
    /// Retry budget used up; left alone until its link comes back.
    pub parked: bool,
}

impl InterfaceStatus {
    pub fn new(kind: InterfaceKind) -> Self {
        Self {
            kind,
            state: InterfaceState::Down,
            since: Local::now(),
            consecutive_failures: 0,
            attempt: 0,
            parked: false,
        }
    }

    /// Moves to `state`, stamping the transition time. Returns whether the
    /// state actually changed.
    pub fn transition(&mut self, state: InterfaceState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.since = Local::now();
        true
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.state.address()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    LinkUp(InterfaceKind),
    AddressAcquired(InterfaceKind, Ipv4Addr),
    LinkLost(InterfaceKind),
    AddressReleased(InterfaceKind),
}

impl LinkEvent {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            LinkEvent::LinkUp(kind)
            | LinkEvent::AddressAcquired(kind, _)
            | LinkEvent::LinkLost(kind)
            | LinkEvent::AddressReleased(kind) => *kind,
        }
    }
}

/// Sending half handed to each driver.
#[derive(Debug, Clone)]
pub struct LinkNotifier {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkNotifier {
    /// Queues `event`. Never blocks; events are dropped once the supervisor
    /// is gone.
    pub fn notify(&self, event: LinkEvent) {
        tracing::debug!(?event, "link event");
        let _ = self.tx.send(event);
    }
}

pub fn event_channel() -> (LinkNotifier, mpsc::UnboundedReceiver<LinkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LinkNotifier { tx }, rx)
}

/// Capability surface shared by the wireless and wired uplinks.
pub trait NetworkInterface: Send {
    fn kind(&self) -> InterfaceKind;

    /// Brings the interface up within `timeout`. Calling this while already
    /// connected returns the current address without touching the hardware.
    fn connect(&mut self, timeout: Duration) -> impl Future<Output = Result<Ipv4Addr, ConnectError>> + Send;

    /// Samples carrier. A drop releases the address and emits
    /// [`LinkEvent::LinkLost`].
    fn is_linked(&mut self) -> impl Future<Output = bool> + Send;

    fn current_address(&self) -> Option<Ipv4Addr>;

    fn teardown(&mut self) -> impl Future<Output = ()> + Send;

    /// Periodic upkeep (lease renewal). Called on every supervisor tick.
    fn maintain(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Controller-level diagnostics for the status page, if the interface
    /// has any.
    fn diagnostics(&self) -> Option<ControllerDiagnostics> {
        None
    }
}
