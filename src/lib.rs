//! Hue bridge network adapter.
//!
//! Keeps a fixed downstream device (a Philips Hue bridge) reachable over two
//! uplinks, a wireless radio and a WIZnet W5500 Ethernet controller on a
//! serial peripheral bus, and serves a small status page.
//!
//! # Modules
//!
//! - [`supervisor`] - Connectivity state machine: bring-up, failover, recovery
//! - [`interface`] - The two uplink drivers behind [`interface::NetworkInterface`]
//! - [`w5500`] / [`bus`] / [`dhcp`] - Wired controller driver, bus binding, DHCP codec
//! - `linux_spi` - spidev transport for the controller (Linux only)
//! - [`probe`] - Downstream liveness checks
//! - [`indicator`] - Status LEDs
//! - [`snapshot`] / [`log_ring`] - State shared with the status server
//! - [`server`] / [`template`] - Status page and JSON API
//! - [`config`] - TOML configuration
//! - [`sim`] - Emulated controller, simulated radio and bridge
//!
//! # Example Usage
//!
//! ```no_run
//! use hue_adapter::config::AdapterConfig;
//!
//! let cfg = AdapterConfig::load(std::path::Path::new("config.toml")).expect("unreadable config");
//! cfg.validate().expect("invalid config");
//! println!("Hue bridge: {}", cfg.downstream.address);
//! ```

/// Peripheral bus binding to the Ethernet controller.
pub mod bus;

/// Configuration file handling and validation.
pub mod config;

/// DHCP message codec and lease bookkeeping.
pub mod dhcp;

/// Error types for the library, built with `thiserror`.
pub mod error;

/// Status LED bank.
pub mod indicator;

/// Wireless and wired uplink drivers.
pub mod interface;

/// Linux spidev transport for a real controller.
#[cfg(target_os = "linux")]
pub mod linux_spi;

/// Bounded event log shown on the status page.
pub mod log_ring;

/// Downstream liveness probes.
pub mod probe;

/// Reconnect backoff schedule.
pub mod retry;

/// Axum status server.
pub mod server;

/// Simulated hardware for bench runs and tests.
pub mod sim;

/// Published connectivity snapshot.
pub mod snapshot;

/// Connectivity supervisor state machine.
pub mod supervisor;

/// Status page template loading and rendering.
pub mod template;

/// W5500 register-level driver.
pub mod w5500;

pub use config::AdapterConfig;
pub use error::{AdapterError, ConfigError, ConnectError};
pub use interface::{InterfaceKind, InterfaceState, NetworkInterface};
pub use snapshot::{LinkSnapshot, SharedStatus, SupervisorState};
pub use supervisor::{Supervisor, SupervisorSettings};
