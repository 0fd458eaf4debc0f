//! Simulated hardware for bench runs and tests.
//!
//! Nothing here touches the host network: the W5500 is emulated at register
//! level, the radio and the downstream endpoint are scripted through their
//! handles.

pub mod probe;
pub mod radio;
pub mod w5500;

pub use probe::{SimProbe, SimProbeHandle};
pub use radio::{SimRadio, SimRadioHandle};
pub use w5500::{Datagram, ModelHandle, SimDhcpServer, W5500Model};
