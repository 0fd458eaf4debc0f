//! Published connectivity status.
//!
//! The supervisor builds a complete [`LinkSnapshot`] and swaps it in with a
//! single pointer store. Readers get an `Arc` to whichever snapshot was
//! current and never wait on the supervisor.

use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::indicator::IndicatorLevels;
use crate::interface::{ControllerDiagnostics, InterfaceKind, InterfaceStatus};
use crate::log_ring::LogRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Initializing,
    BringingUpWireless,
    BringingUpWired,
    Nominal,
    Degraded,
    Recovering,
}

impl SupervisorState {
    pub const ALL: [SupervisorState; 6] = [
        SupervisorState::Initializing,
        SupervisorState::BringingUpWireless,
        SupervisorState::BringingUpWired,
        SupervisorState::Nominal,
        SupervisorState::Degraded,
        SupervisorState::Recovering,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SupervisorState::Initializing => "initializing",
            SupervisorState::BringingUpWireless => "bringing_up_wireless",
            SupervisorState::BringingUpWired => "bringing_up_wired",
            SupervisorState::Nominal => "nominal",
            SupervisorState::Degraded => "degraded",
            SupervisorState::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownstreamStatus {
    pub address: Ipv4Addr,
    pub reachable: bool,
    pub consecutive_failures: u32,
    pub last_round_trip_ms: Option<u64>,
    pub last_checked: Option<DateTime<Local>>,
}

impl DownstreamStatus {
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            reachable: false,
            consecutive_failures: 0,
            last_round_trip_ms: None,
            last_checked: None,
        }
    }
}

/// Next reconnect the supervisor has scheduled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledRetry {
    pub target: RetryTarget,
    pub attempt: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryTarget {
    Wired,
    Wireless,
    Downstream,
}

impl From<InterfaceKind> for RetryTarget {
    fn from(kind: InterfaceKind) -> Self {
        match kind {
            InterfaceKind::Wired => RetryTarget::Wired,
            InterfaceKind::Wireless => RetryTarget::Wireless,
        }
    }
}

/// One coherent instant of connectivity status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkSnapshot {
    pub supervisor: SupervisorState,
    pub wireless: InterfaceStatus,
    pub wired: InterfaceStatus,
    pub active_uplink: Option<InterfaceKind>,
    pub downstream: DownstreamStatus,
    pub indicators: IndicatorLevels,
    pub controller: Option<ControllerDiagnostics>,
    pub retry: Option<ScheduledRetry>,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Local>,
}

impl LinkSnapshot {
    /// Startup snapshot: both interfaces down, nothing probed yet.
    pub fn initial(downstream: Ipv4Addr) -> Self {
        Self {
            supervisor: SupervisorState::Initializing,
            wireless: InterfaceStatus::new(InterfaceKind::Wireless),
            wired: InterfaceStatus::new(InterfaceKind::Wired),
            active_uplink: None,
            downstream: DownstreamStatus::new(downstream),
            indicators: IndicatorLevels::default(),
            controller: None,
            retry: None,
            last_error: None,
            timestamp: Local::now(),
        }
    }

    pub fn wireless_address(&self) -> Option<Ipv4Addr> {
        self.wireless.address()
    }

    pub fn wired_address(&self) -> Option<Ipv4Addr> {
        self.wired.address()
    }

    pub fn downstream_reachable(&self) -> bool {
        self.downstream.reachable
    }
}

/// Single-writer, many-reader register for the current snapshot.
pub struct SnapshotStore {
    current: ArcSwap<LinkSnapshot>,
}

impl SnapshotStore {
    pub fn new(initial: LinkSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn publish(&self, snapshot: LinkSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn read(&self) -> Arc<LinkSnapshot> {
        self.current.load_full()
    }
}

/// Everything the supervisor and the status server share.
pub struct SharedStatus {
    pub snapshot: SnapshotStore,
    pub log: LogRing,
}

impl SharedStatus {
    pub fn new(initial: LinkSnapshot, log_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            snapshot: SnapshotStore::new(initial),
            log: LogRing::new(log_capacity),
        })
    }
}
