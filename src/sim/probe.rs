use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::ProbeError;
use crate::interface::InterfaceKind;
use crate::probe::{DownstreamProbe, Uplink};

#[derive(Debug)]
struct Control {
    reachable: bool,
    latency: Duration,
    probes: Vec<InterfaceKind>,
}

/// Downstream endpoint whose reachability is set by the caller.
#[derive(Debug)]
pub struct SimProbe {
    target: Ipv4Addr,
    control: Arc<Mutex<Control>>,
}

#[derive(Debug, Clone)]
pub struct SimProbeHandle {
    control: Arc<Mutex<Control>>,
}

fn lock(control: &Mutex<Control>) -> MutexGuard<'_, Control> {
    control.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimProbe {
    pub fn new(target: Ipv4Addr) -> Self {
        Self {
            target,
            control: Arc::new(Mutex::new(Control {
                reachable: true,
                latency: Duration::from_millis(5),
                probes: Vec::new(),
            })),
        }
    }

    pub fn handle(&self) -> SimProbeHandle {
        SimProbeHandle {
            control: Arc::clone(&self.control),
        }
    }
}

impl SimProbeHandle {
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.control).reachable = reachable;
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.control).latency = latency;
    }

    /// Uplink used by each probe so far.
    pub fn probes(&self) -> Vec<InterfaceKind> {
        lock(&self.control).probes.clone()
    }
}

impl DownstreamProbe for SimProbe {
    fn target(&self) -> Ipv4Addr {
        self.target
    }

    /// An unreachable endpoint behaves like a silent one: the probe runs
    /// into its timeout.
    async fn probe(&mut self, uplink: Uplink, timeout: Duration) -> Result<Duration, ProbeError> {
        let (reachable, latency) = {
            let mut control = lock(&self.control);
            control.probes.push(uplink.kind);
            (control.reachable, control.latency)
        };
        if !reachable || latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ProbeError::Timeout(timeout));
        }
        tokio::time::sleep(latency).await;
        Ok(latency)
    }
}
