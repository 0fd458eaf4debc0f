use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::RadioError;
use crate::interface::{Radio, RadioStatus};

#[derive(Debug)]
struct Control {
    address: Ipv4Addr,
    address_delay: Duration,
    in_range: bool,
    fail_joins: u32,
    joins: u32,
    associated_at: Option<Instant>,
    stalled: bool,
}

/// Scripted wireless radio for bench runs and tests.
#[derive(Debug)]
pub struct SimRadio {
    control: Arc<Mutex<Control>>,
}

#[derive(Debug, Clone)]
pub struct SimRadioHandle {
    control: Arc<Mutex<Control>>,
}

fn lock(control: &Mutex<Control>) -> MutexGuard<'_, Control> {
    control.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimRadio {
    /// A radio in range of an access point that leases `address` one second
    /// after association.
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            control: Arc::new(Mutex::new(Control {
                address,
                address_delay: Duration::from_secs(1),
                in_range: true,
                fail_joins: 0,
                joins: 0,
                associated_at: None,
                stalled: false,
            })),
        }
    }

    pub fn handle(&self) -> SimRadioHandle {
        SimRadioHandle {
            control: Arc::clone(&self.control),
        }
    }

    async fn hang_if_stalled(&self) {
        let stalled = lock(&self.control).stalled;
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

impl SimRadioHandle {
    pub fn fail_next_joins(&self, count: u32) {
        lock(&self.control).fail_joins = count;
    }

    pub fn set_address_delay(&self, delay: Duration) {
        lock(&self.control).address_delay = delay;
    }

    pub fn set_address(&self, address: Ipv4Addr) {
        lock(&self.control).address = address;
    }

    /// Drops the current association. The access point stays in range.
    pub fn drop_link(&self) {
        lock(&self.control).associated_at = None;
    }

    /// Moves the access point out of (or back into) range.
    pub fn set_in_range(&self, in_range: bool) {
        let mut control = lock(&self.control);
        control.in_range = in_range;
        if !in_range {
            control.associated_at = None;
        }
    }

    /// Makes every radio call hang until cleared, like a wedged
    /// NetworkManager.
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.control).stalled = stalled;
    }

    /// Successful joins so far.
    pub fn joins(&self) -> u32 {
        lock(&self.control).joins
    }
}

impl Radio for SimRadio {
    async fn join(&mut self, ssid: &str, _password: &str) -> Result<(), RadioError> {
        self.hang_if_stalled().await;
        let mut control = lock(&self.control);
        if control.fail_joins > 0 {
            control.fail_joins -= 1;
            return Err(RadioError::Rejected(format!("{ssid}: authentication timed out")));
        }
        if !control.in_range {
            return Err(RadioError::Rejected(format!("{ssid}: network not found")));
        }
        control.joins += 1;
        control.associated_at = Some(Instant::now());
        Ok(())
    }

    async fn poll(&mut self) -> Result<RadioStatus, RadioError> {
        self.hang_if_stalled().await;
        let control = lock(&self.control);
        Ok(match control.associated_at {
            Some(at) => RadioStatus {
                associated: true,
                address: (at.elapsed() >= control.address_delay).then_some(control.address),
            },
            None => RadioStatus::default(),
        })
    }

    async fn leave(&mut self) -> Result<(), RadioError> {
        self.hang_if_stalled().await;
        lock(&self.control).associated_at = None;
        Ok(())
    }
}
