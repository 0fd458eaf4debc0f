//! Connectivity supervisor.
//!
//! Owns both interface drivers, the downstream probe and the indicator bank.
//! [`Supervisor::step`] advances the state machine by one unit of work; every
//! step ends with a freshly published snapshot, and every await inside it is
//! a point where the status server gets to run.
//!
//! Priority is fixed: the wired uplink carries downstream traffic whenever it
//! has an address, wireless is the fallback. Recovery works through wired,
//! then wireless, then the downstream endpoint.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::error::{AdapterError, ConnectError};
use crate::indicator::{IndicatorBank, IndicatorLevels};
use crate::interface::{InterfaceKind, InterfaceState, InterfaceStatus, LinkEvent, NetworkInterface};
use crate::log_ring::LogLevel;
use crate::probe::{DownstreamProbe, Uplink};
use crate::retry::RetryPolicy;
use crate::snapshot::{DownstreamStatus, LinkSnapshot, RetryTarget, ScheduledRetry, SharedStatus, SupervisorState};

/// Timing and retry knobs, derived from [`crate::config::AdapterConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Tick length while nominal or waiting for a retry.
    pub poll_interval: Duration,
    /// Connect attempts per interface during initial bring-up.
    pub bringup_attempts: u32,
    /// Bound on one wireless connect.
    pub wireless_timeout: Duration,
    /// Bound on one wired connect, reset and DHCP included.
    pub wired_timeout: Duration,
    pub wireless_retry: RetryPolicy,
    pub wired_retry: RetryPolicy,
    /// Bound on one downstream probe.
    pub probe_timeout: Duration,
    /// Time between downstream probes, and between downstream retries.
    pub probe_interval: Duration,
    /// Seeds retry jitter; derived from the MAC address.
    pub jitter_seed: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            bringup_attempts: 3,
            wireless_timeout: Duration::from_secs(10),
            wired_timeout: Duration::from_secs(10),
            wireless_retry: RetryPolicy::default(),
            wired_retry: RetryPolicy::default(),
            probe_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_secs(5),
            jitter_seed: 0,
        }
    }
}

/// The one reconnect the supervisor is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRetry {
    pub target: RetryTarget,
    /// Zero-based; indexes the backoff schedule.
    pub attempt: u32,
    /// Backoff chosen for this attempt.
    pub delay: Duration,
    /// When the attempt runs.
    pub due: Instant,
}

fn label(kind: InterfaceKind) -> &'static str {
    match kind {
        InterfaceKind::Wireless => "WiFi",
        InterfaceKind::Wired => "Ethernet",
    }
}

/// Connectivity state machine over a wireless interface `W`, a wired
/// interface `E` and a downstream probe `P`.
///
/// The supervisor is the only writer of interface state, the indicators and
/// the published snapshot. Drive it with [`Supervisor::run`], or step it by
/// hand in tests.
pub struct Supervisor<W, E, P> {
    wireless: W,
    wired: E,
    probe: P,
    events: UnboundedReceiver<LinkEvent>,
    indicators: IndicatorBank,
    shared: Arc<SharedStatus>,
    settings: SupervisorSettings,
    downstream_retry: RetryPolicy,

    state: SupervisorState,
    wireless_status: InterfaceStatus,
    wired_status: InterfaceStatus,
    downstream: DownstreamStatus,
    pending: Option<PendingRetry>,
    last_target: Option<RetryTarget>,
    next_probe: Instant,
    last_error: Option<String>,
}

impl<W, E, P> Supervisor<W, E, P>
where
    W: NetworkInterface,
    E: NetworkInterface,
    P: DownstreamProbe,
{
    pub fn new(
        wireless: W,
        wired: E,
        probe: P,
        events: UnboundedReceiver<LinkEvent>,
        indicators: IndicatorBank,
        shared: Arc<SharedStatus>,
        settings: SupervisorSettings,
    ) -> Self {
        let downstream = DownstreamStatus::new(probe.target());
        Self {
            wireless,
            wired,
            probe,
            events,
            indicators,
            shared,
            downstream_retry: RetryPolicy::fixed(settings.probe_interval),
            settings,
            state: SupervisorState::Initializing,
            wireless_status: InterfaceStatus::new(InterfaceKind::Wireless),
            wired_status: InterfaceStatus::new(InterfaceKind::Wired),
            downstream,
            pending: None,
            last_target: None,
            next_probe: Instant::now(),
            last_error: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn status(&self, kind: InterfaceKind) -> &InterfaceStatus {
        match kind {
            InterfaceKind::Wireless => &self.wireless_status,
            InterfaceKind::Wired => &self.wired_status,
        }
    }

    pub fn downstream(&self) -> &DownstreamStatus {
        &self.downstream
    }

    pub fn pending_retry(&self) -> Option<&PendingRetry> {
        self.pending.as_ref()
    }

    pub fn indicators(&self) -> IndicatorLevels {
        self.indicators.levels()
    }

    pub fn wireless(&self) -> &W {
        &self.wireless
    }

    pub fn wired(&self) -> &E {
        &self.wired
    }

    /// Runs until a configuration error makes further progress pointless.
    pub async fn run(mut self) -> Result<(), AdapterError> {
        loop {
            self.step().await?;
        }
    }

    /// Advances the state machine by one unit of work.
    pub async fn step(&mut self) -> Result<(), AdapterError> {
        match self.state {
            SupervisorState::Initializing => {
                self.log(LogLevel::Info, "Adapter starting");
                self.indicators.boot_sequence().await;
                self.enter(SupervisorState::BringingUpWireless);
            }
            SupervisorState::BringingUpWireless => {
                self.bring_up(InterfaceKind::Wireless).await?;
                self.enter(SupervisorState::BringingUpWired);
            }
            SupervisorState::BringingUpWired => {
                self.bring_up(InterfaceKind::Wired).await?;
                if self.active_uplink().is_some() && self.check_downstream().await {
                    self.log(LogLevel::Info, "Adapter ready");
                    self.enter(SupervisorState::Nominal);
                } else {
                    self.enter(SupervisorState::Degraded);
                }
            }
            SupervisorState::Nominal => {
                if self.healthy() {
                    tokio::time::sleep(self.settings.poll_interval).await;
                    self.housekeeping().await;
                    self.probe_if_due().await;
                }
                if !self.healthy() {
                    self.enter(SupervisorState::Degraded);
                }
            }
            SupervisorState::Degraded => {
                self.unpark_if_isolated();
                match self.next_target() {
                    Some(target) => {
                        self.schedule(target);
                        self.enter(SupervisorState::Recovering);
                    }
                    None => self.enter(SupervisorState::Nominal),
                }
            }
            SupervisorState::Recovering => self.recover().await?,
        }
        self.publish();
        Ok(())
    }

    fn enter(&mut self, state: SupervisorState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "supervisor transition");
            self.state = state;
        }
    }

    /// Appends to the log ring and mirrors the entry into tracing.
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        self.shared.log.append(level, message);
    }

    fn status_mut(&mut self, kind: InterfaceKind) -> &mut InterfaceStatus {
        match kind {
            InterfaceKind::Wireless => &mut self.wireless_status,
            InterfaceKind::Wired => &mut self.wired_status,
        }
    }

    fn retry_policy(&self, kind: InterfaceKind) -> &RetryPolicy {
        match kind {
            InterfaceKind::Wireless => &self.settings.wireless_retry,
            InterfaceKind::Wired => &self.settings.wired_retry,
        }
    }

    /// Updates one interface's state and drives its LED in the same breath.
    fn set_state(&mut self, kind: InterfaceKind, state: InterfaceState) {
        self.status_mut(kind).transition(state);
        self.indicators.mirror(
            self.wireless_status.is_connected(),
            self.wired_status.is_connected(),
        );
    }

    /// Wired wins whenever it has an address.
    fn active_uplink(&self) -> Option<Uplink> {
        [&self.wired_status, &self.wireless_status]
            .into_iter()
            .find_map(|status| {
                status.address().map(|local| Uplink {
                    kind: status.kind,
                    local,
                })
            })
    }

    fn healthy(&self) -> bool {
        let statuses = [&self.wireless_status, &self.wired_status];
        statuses.iter().all(|s| s.is_connected() || s.parked)
            && statuses.iter().any(|s| s.is_connected())
            && self.downstream.reachable
    }

    /// Wired first, then wireless, then the downstream endpoint. When both
    /// interfaces are down they take turns, so a dead wired controller
    /// cannot starve the wireless uplink.
    fn next_target(&self) -> Option<RetryTarget> {
        let mut down = [&self.wired_status, &self.wireless_status]
            .into_iter()
            .filter(|status| !status.is_connected() && !status.parked)
            .map(|status| RetryTarget::from(status.kind));
        let first = down.next();
        let second = down.next();
        match (first, second) {
            (Some(RetryTarget::Wired), Some(other)) if self.last_target == Some(RetryTarget::Wired) => Some(other),
            (Some(target), _) => Some(target),
            (None, _) => (!self.downstream.reachable && self.active_uplink().is_some())
                .then_some(RetryTarget::Downstream),
        }
    }

    /// A parked interface is the only way out once nothing is connected.
    fn unpark_if_isolated(&mut self) {
        if self.wireless_status.is_connected() || self.wired_status.is_connected() {
            return;
        }
        for kind in [InterfaceKind::Wired, InterfaceKind::Wireless] {
            if self.status(kind).parked {
                self.unpark(kind, "no uplink left");
            }
        }
    }

    fn unpark(&mut self, kind: InterfaceKind, reason: &str) {
        let status = self.status_mut(kind);
        status.parked = false;
        status.attempt = 0;
        self.log(
            LogLevel::Info,
            format!("{} retries resumed: {reason}", label(kind)),
        );
    }

    async fn connect(&mut self, kind: InterfaceKind) -> Result<Ipv4Addr, ConnectError> {
        match kind {
            InterfaceKind::Wireless => self.wireless.connect(self.settings.wireless_timeout).await,
            InterfaceKind::Wired => self.wired.connect(self.settings.wired_timeout).await,
        }
    }

    /// One connect attempt with all bookkeeping. Only configuration errors
    /// escape.
    async fn attempt(&mut self, kind: InterfaceKind) -> Result<bool, AdapterError> {
        self.set_state(kind, InterfaceState::Connecting);
        self.publish();

        let result = self.connect(kind).await;
        self.drain_events();
        match result {
            Ok(address) => {
                self.set_state(kind, InterfaceState::Connected(address));
                let status = self.status_mut(kind);
                status.consecutive_failures = 0;
                status.attempt = 0;
                status.parked = false;
                self.log(LogLevel::Info, format!("{} connected: {address}", label(kind)));
                self.indicators.pulse_activity().await;
                Ok(true)
            }
            Err(e) if e.is_fatal() => {
                self.set_state(kind, InterfaceState::Failed);
                self.log(LogLevel::Error, format!("{} configuration error: {e}", label(kind)));
                self.publish();
                Err(e.into())
            }
            Err(e) => {
                self.set_state(kind, InterfaceState::Failed);
                let status = self.status_mut(kind);
                status.consecutive_failures += 1;
                let failures = status.consecutive_failures;
                self.last_error = Some(format!("{}: {e}", label(kind)));
                self.log(
                    LogLevel::Warn,
                    format!("{} connection failed (attempt {failures}): {e}", label(kind)),
                );
                Ok(false)
            }
        }
    }

    async fn bring_up(&mut self, kind: InterfaceKind) -> Result<(), AdapterError> {
        let attempts = self.settings.bringup_attempts.max(1);
        for n in 0..attempts {
            if self.attempt(kind).await? {
                return Ok(());
            }
            if n + 1 < attempts {
                let delay = self
                    .retry_policy(kind)
                    .jittered_delay(n, self.settings.jitter_seed);
                tokio::time::sleep(delay).await;
            }
        }
        self.log(
            LogLevel::Warn,
            format!("{} unavailable after {attempts} attempts", label(kind)),
        );
        Ok(())
    }

    fn schedule(&mut self, target: RetryTarget) {
        let (attempt, delay) = match target {
            RetryTarget::Wired | RetryTarget::Wireless => {
                let kind = match target {
                    RetryTarget::Wired => InterfaceKind::Wired,
                    _ => InterfaceKind::Wireless,
                };
                let attempt = self.status(kind).attempt;
                let seed = self.settings.jitter_seed ^ (kind as u64);
                (attempt, self.retry_policy(kind).jittered_delay(attempt, seed))
            }
            RetryTarget::Downstream => {
                let attempt = self.downstream.consecutive_failures.saturating_sub(1);
                (attempt, self.downstream_retry.delay(attempt))
            }
        };
        self.last_target = Some(target);
        self.pending = Some(PendingRetry {
            target,
            attempt,
            delay,
            due: Instant::now() + delay,
        });
        tracing::info!(?target, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    async fn recover(&mut self) -> Result<(), AdapterError> {
        let Some(retry) = self.pending else {
            self.enter(SupervisorState::Degraded);
            return Ok(());
        };

        let now = Instant::now();
        if now < retry.due {
            tokio::time::sleep((retry.due - now).min(self.settings.poll_interval)).await;
            self.housekeeping().await;
            if retry.target != RetryTarget::Downstream {
                self.probe_if_due().await;
            }
            return Ok(());
        }
        self.pending = None;

        let recovered = match retry.target {
            RetryTarget::Wired => self.reconnect(InterfaceKind::Wired).await?,
            RetryTarget::Wireless => self.reconnect(InterfaceKind::Wireless).await?,
            RetryTarget::Downstream => self.check_downstream().await,
        };

        if recovered && self.healthy() {
            self.log(LogLevel::Info, "Connectivity restored");
            self.enter(SupervisorState::Nominal);
        } else {
            self.enter(SupervisorState::Degraded);
        }
        Ok(())
    }

    async fn reconnect(&mut self, kind: InterfaceKind) -> Result<bool, AdapterError> {
        if self.attempt(kind).await? {
            return Ok(self.check_downstream().await);
        }

        let exhausted = {
            let policy = self.retry_policy(kind).clone();
            let status = self.status_mut(kind);
            status.attempt = status.attempt.saturating_add(1);
            let exhausted = policy.exhausted(status.attempt);
            if exhausted {
                status.parked = true;
            }
            exhausted
        };
        if exhausted {
            self.log(
                LogLevel::Warn,
                format!("{} retries exhausted; waiting for its link to return", label(kind)),
            );
        }
        Ok(false)
    }

    /// Periodic probe over whichever uplink is active.
    async fn probe_if_due(&mut self) {
        if Instant::now() >= self.next_probe && self.active_uplink().is_some() {
            self.check_downstream().await;
        }
    }

    /// Probes the downstream endpoint over the active uplink.
    async fn check_downstream(&mut self) -> bool {
        let uplink = self.active_uplink();
        let result = match uplink {
            Some(uplink) => self.probe.probe(uplink, self.settings.probe_timeout).await,
            None => Err(crate::error::ProbeError::NoUplink),
        };
        self.downstream.last_checked = Some(Local::now());
        self.next_probe = Instant::now() + self.settings.probe_interval;

        let via = uplink.map_or("no uplink", |u| label(u.kind));
        match result {
            Ok(round_trip) => {
                let was_reachable = self.downstream.reachable;
                self.downstream.reachable = true;
                self.downstream.consecutive_failures = 0;
                self.downstream.last_round_trip_ms = Some(round_trip.as_millis() as u64);
                if !was_reachable {
                    self.log(
                        LogLevel::Info,
                        format!(
                            "Hue bridge {} reachable via {via} ({} ms)",
                            self.downstream.address,
                            round_trip.as_millis()
                        ),
                    );
                }
                self.indicators.pulse_activity().await;
                true
            }
            Err(e) => {
                self.downstream.reachable = false;
                self.downstream.consecutive_failures += 1;
                self.last_error = Some(format!("Hue bridge: {e}"));
                self.log(
                    LogLevel::Warn,
                    format!(
                        "Hue bridge {} unreachable via {via} (failure {}): {e}",
                        self.downstream.address, self.downstream.consecutive_failures
                    ),
                );
                false
            }
        }
    }

    /// Per-tick upkeep: heartbeat, carrier polls, lease upkeep, events.
    async fn housekeeping(&mut self) {
        self.indicators.toggle_heartbeat();
        self.wired.is_linked().await;
        self.wireless.is_linked().await;
        self.wired.maintain().await;
        self.wireless.maintain().await;
        self.drain_events();
        self.publish();
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            let kind = event.kind();
            match event {
                LinkEvent::LinkUp(_) => {
                    if self.status(kind).parked {
                        self.unpark(kind, "link is back");
                    }
                }
                LinkEvent::AddressAcquired(_, address) => {
                    self.set_state(kind, InterfaceState::Connected(address));
                }
                LinkEvent::LinkLost(_) | LinkEvent::AddressReleased(_) => {
                    if self.status(kind).is_connected() {
                        self.set_state(kind, InterfaceState::Down);
                        let message = match event {
                            LinkEvent::LinkLost(_) => format!("{} link lost", label(kind)),
                            _ => format!("{} address released", label(kind)),
                        };
                        self.last_error = Some(message.clone());
                        self.log(LogLevel::Warn, message);
                    }
                }
            }
        }
    }

    fn publish(&self) {
        self.shared.snapshot.publish(LinkSnapshot {
            supervisor: self.state,
            wireless: self.wireless_status.clone(),
            wired: self.wired_status.clone(),
            active_uplink: self.active_uplink().map(|u| u.kind),
            downstream: self.downstream.clone(),
            indicators: self.indicators.levels(),
            controller: self.wired.diagnostics(),
            retry: self.pending.map(|retry| ScheduledRetry {
                target: retry.target,
                attempt: retry.attempt,
                delay_ms: retry.delay.as_millis() as u64,
            }),
            last_error: self.last_error.clone(),
            timestamp: Local::now(),
        });
    }
}
