//! Status LEDs.
//!
//! Only the supervisor holds the [`IndicatorBank`]. The link LEDs are set by
//! [`IndicatorBank::mirror`] from interface state and nothing else, so they
//! can never disagree with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

/// A single digital output.
pub trait OutputPin: Send {
    fn set(&mut self, high: bool);
}

/// Host stand-in for a GPIO: logs level changes.
#[derive(Debug)]
pub struct TracePin {
    label: &'static str,
    gpio: u8,
    level: bool,
}

impl TracePin {
    pub fn new(label: &'static str, gpio: u8) -> Self {
        Self {
            label,
            gpio,
            level: false,
        }
    }
}

impl OutputPin for TracePin {
    fn set(&mut self, high: bool) {
        if self.level != high {
            self.level = high;
            tracing::trace!(led = self.label, gpio = self.gpio, on = high, "indicator");
        }
    }
}

/// A pin whose level can be observed from elsewhere.
#[derive(Debug, Clone, Default)]
pub struct SharedPin {
    level: Arc<AtomicBool>,
}

impl SharedPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

impl OutputPin for SharedPin {
    fn set(&mut self, high: bool) {
        self.level.store(high, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    WirelessLink,
    WiredLink,
    Activity,
    Heartbeat,
}

/// Order of the boot flash sweep.
const SWEEP: [Indicator; 4] = [
    Indicator::WirelessLink,
    Indicator::Activity,
    Indicator::WiredLink,
    Indicator::Heartbeat,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IndicatorLevels {
    pub wireless: bool,
    pub wired: bool,
    pub activity: bool,
    pub heartbeat: bool,
}

pub struct IndicatorPins {
    pub wireless: Box<dyn OutputPin>,
    pub wired: Box<dyn OutputPin>,
    pub activity: Box<dyn OutputPin>,
    pub heartbeat: Box<dyn OutputPin>,
}

pub struct IndicatorBank {
    pins: IndicatorPins,
    levels: IndicatorLevels,
    pulse: Duration,
    flash: Duration,
    boot_rounds: u32,
}

impl IndicatorBank {
    pub fn new(pins: IndicatorPins, pulse: Duration, flash: Duration, boot_rounds: u32) -> Self {
        let mut bank = Self {
            pins,
            levels: IndicatorLevels::default(),
            pulse,
            flash,
            boot_rounds,
        };
        for indicator in SWEEP {
            bank.set(indicator, false);
        }
        bank
    }

    pub fn levels(&self) -> IndicatorLevels {
        self.levels
    }

    fn set(&mut self, indicator: Indicator, high: bool) {
        let (pin, level) = match indicator {
            Indicator::WirelessLink => (&mut self.pins.wireless, &mut self.levels.wireless),
            Indicator::WiredLink => (&mut self.pins.wired, &mut self.levels.wired),
            Indicator::Activity => (&mut self.pins.activity, &mut self.levels.activity),
            Indicator::Heartbeat => (&mut self.pins.heartbeat, &mut self.levels.heartbeat),
        };
        pin.set(high);
        *level = high;
    }

    /// Link LEDs follow interface state exactly.
    pub fn mirror(&mut self, wireless_connected: bool, wired_connected: bool) {
        self.set(Indicator::WirelessLink, wireless_connected);
        self.set(Indicator::WiredLink, wired_connected);
    }

    /// Blinks the activity LED once for a traffic event.
    pub async fn pulse_activity(&mut self) {
        self.set(Indicator::Activity, true);
        tokio::time::sleep(self.pulse).await;
        self.set(Indicator::Activity, false);
    }

    pub fn toggle_heartbeat(&mut self) {
        let next = !self.levels.heartbeat;
        self.set(Indicator::Heartbeat, next);
    }

    /// Sweeps every LED forward then back, `boot_rounds` times. All LEDs
    /// are off afterwards.
    pub async fn boot_sequence(&mut self) {
        for _ in 0..self.boot_rounds {
            for indicator in SWEEP.iter().chain(SWEEP.iter().rev()) {
                self.set(*indicator, true);
                tokio::time::sleep(self.flash).await;
                self.set(*indicator, false);
            }
        }
    }
}
