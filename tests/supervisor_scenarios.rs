use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hue_adapter::bus::PeripheralBus;
use hue_adapter::error::{AdapterError, ConnectError};
use hue_adapter::config::WirelessConfig;
use hue_adapter::indicator::{IndicatorBank, IndicatorPins, SharedPin};
use hue_adapter::interface::{
    InterfaceKind, InterfaceState, WiredInterface, WiredSettings, WirelessInterface, event_channel,
};
use hue_adapter::retry::RetryPolicy;
use hue_adapter::sim::w5500::test_descriptor;
use hue_adapter::sim::{ModelHandle, SimProbe, SimProbeHandle, SimRadio, SimRadioHandle, W5500Model};
use hue_adapter::snapshot::{LinkSnapshot, RetryTarget, SharedStatus, SupervisorState};
use hue_adapter::supervisor::{Supervisor, SupervisorSettings};
use hue_adapter::w5500::NetworkSettings;

const WIFI_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
const WIRED_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 60);
const BRIDGE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 61);

type SimSupervisor = Supervisor<WirelessInterface<SimRadio>, WiredInterface<W5500Model>, SimProbe>;

struct Rig {
    supervisor: SimSupervisor,
    radio: SimRadioHandle,
    wired: ModelHandle,
    probe: SimProbeHandle,
    shared: Arc<SharedStatus>,
    wifi_led: SharedPin,
    ethernet_led: SharedPin,
}

impl Rig {
    fn new() -> Self {
        Self::with_ssid("HomeNet")
    }

    fn with_ssid(ssid: &str) -> Self {
        let (notifier, events) = event_channel();

        let radio = SimRadio::new(WIFI_ADDRESS);
        let radio_handle = radio.handle();
        let wifi_config = WirelessConfig {
            ssid: ssid.to_string(),
            password: "correct horse".to_string(),
            ..WirelessConfig::default()
        };
        let wireless = WirelessInterface::new(radio, &wifi_config, notifier.clone());

        let model = W5500Model::with_dhcp(NetworkSettings {
            address: WIRED_ADDRESS,
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        });
        let wired_handle = model.handle();
        let wired = WiredInterface::new(
            PeripheralBus::new(model, test_descriptor()),
            WiredSettings {
                mac: [0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED],
                hostname: None,
                reply_timeout: Duration::from_secs(2),
                carrier_poll: Duration::from_millis(100),
            },
            notifier,
        );

        let probe = SimProbe::new(BRIDGE);
        let probe_handle = probe.handle();

        let wifi_led = SharedPin::new();
        let ethernet_led = SharedPin::new();
        let indicators = IndicatorBank::new(
            IndicatorPins {
                wireless: Box::new(wifi_led.clone()),
                wired: Box::new(ethernet_led.clone()),
                activity: Box::new(SharedPin::new()),
                heartbeat: Box::new(SharedPin::new()),
            },
            Duration::from_millis(50),
            Duration::from_millis(33),
            3,
        );

        let shared = SharedStatus::new(LinkSnapshot::initial(BRIDGE), 50);
        let settings = SupervisorSettings {
            jitter_seed: 0xDEAD_BEEF_FEED,
            ..SupervisorSettings::default()
        };

        let supervisor = Supervisor::new(
            wireless,
            wired,
            probe,
            events,
            indicators,
            Arc::clone(&shared),
            settings,
        );

        Rig {
            supervisor,
            radio: radio_handle,
            wired: wired_handle,
            probe: probe_handle,
            shared,
            wifi_led,
            ethernet_led,
        }
    }

    async fn step(&mut self) {
        self.supervisor.step().await.expect("no configuration errors");
        self.assert_leds_match();
    }

    /// Steps until `done` holds, failing after `limit` steps.
    async fn step_until(&mut self, limit: usize, done: impl Fn(&SimSupervisor) -> bool) {
        for _ in 0..limit {
            if done(&self.supervisor) {
                return;
            }
            self.step().await;
        }
        assert!(done(&self.supervisor), "condition not reached, state {:?}", self.supervisor.state());
    }

    async fn reach_nominal_with_both_links(&mut self) {
        self.step_until(50, |s| {
            s.state() == SupervisorState::Nominal
                && s.status(InterfaceKind::Wired).is_connected()
                && s.status(InterfaceKind::Wireless).is_connected()
        })
        .await;
    }

    fn assert_leds_match(&self) {
        let wifi = self.supervisor.status(InterfaceKind::Wireless).is_connected();
        let wired = self.supervisor.status(InterfaceKind::Wired).is_connected();
        assert_eq!(self.wifi_led.is_high(), wifi, "WiFi LED disagrees with state");
        assert_eq!(self.ethernet_led.is_high(), wired, "Ethernet LED disagrees with state");

        let snapshot = self.shared.snapshot.read();
        assert_eq!(snapshot.indicators.wireless, snapshot.wireless.is_connected());
        assert_eq!(snapshot.indicators.wired, snapshot.wired.is_connected());
        assert!(SupervisorState::ALL.contains(&snapshot.supervisor));
    }

    fn messages(&self) -> Vec<String> {
        self.shared
            .log
            .snapshot()
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }
}

#[tokio::test(start_paused = true)]
async fn wired_recovers_after_three_failed_attempts() {
    let mut rig = Rig::new();
    rig.wired.ignore_discovers(3);

    rig.reach_nominal_with_both_links().await;

    assert!(rig.wifi_led.is_high());
    assert!(rig.ethernet_led.is_high());

    let snapshot = rig.shared.snapshot.read();
    assert_eq!(snapshot.supervisor, SupervisorState::Nominal);
    assert_eq!(snapshot.wireless_address(), Some(WIFI_ADDRESS));
    assert_eq!(snapshot.wired_address(), Some(WIRED_ADDRESS));
    assert!(snapshot.downstream_reachable());
    assert_eq!(snapshot.active_uplink, Some(InterfaceKind::Wired));

    let messages = rig.messages();
    let wired: Vec<&String> = messages
        .iter()
        .filter(|m| m.starts_with("Ethernet connect"))
        .collect();
    assert_eq!(wired.len(), 4, "{messages:#?}");
    assert!(wired[..3].iter().all(|m| m.starts_with("Ethernet connection failed")));
    assert_eq!(wired[3], &format!("Ethernet connected: {WIRED_ADDRESS}"));
}

#[tokio::test(start_paused = true)]
async fn wired_link_loss_degrades_within_one_poll() {
    let mut rig = Rig::new();
    rig.reach_nominal_with_both_links().await;
    assert!(rig.ethernet_led.is_high());

    rig.wired.set_link(false);
    rig.step().await;

    assert_eq!(rig.supervisor.state(), SupervisorState::Degraded);
    assert!(!rig.ethernet_led.is_high());
    assert!(rig.wifi_led.is_high());
    let snapshot = rig.shared.snapshot.read();
    assert_eq!(snapshot.wired_address(), None);
    assert_eq!(snapshot.active_uplink, Some(InterfaceKind::Wireless));
    assert!(rig.messages().iter().any(|m| m == "Ethernet link lost"));

    rig.step().await;
    assert_eq!(rig.supervisor.state(), SupervisorState::Recovering);
    let retry = rig.supervisor.pending_retry().copied().unwrap();
    assert_eq!(retry.target, RetryTarget::Wired);
    assert_eq!(retry.attempt, 0);
    assert_eq!(retry.delay, RetryPolicy::default().base_delay());
    let scheduled = rig.shared.snapshot.read().retry.clone().unwrap();
    assert_eq!(scheduled.delay_ms, 1_000);
}

#[tokio::test(start_paused = true)]
async fn scheduled_wired_delays_never_shrink() {
    let mut rig = Rig::new();
    rig.reach_nominal_with_both_links().await;
    rig.wired.set_link(false);

    let policy = RetryPolicy::default();
    let mut delays: Vec<(u32, Duration)> = Vec::new();
    for _ in 0..600 {
        rig.step().await;
        if let Some(retry) = rig.supervisor.pending_retry() {
            if retry.target == RetryTarget::Wired && delays.last().map(|d| d.0) != Some(retry.attempt) {
                delays.push((retry.attempt, retry.delay));
            }
        }
        if delays.len() >= 9 {
            break;
        }
    }

    assert!(delays.len() >= 9, "{delays:?}");
    assert_eq!(delays[0], (0, policy.base_delay()));
    for pair in delays.windows(2) {
        assert!(pair[1].1 >= pair[0].1, "{delays:?}");
    }
    assert!(delays.iter().all(|(_, delay)| *delay <= policy.cap_delay()));
    assert_eq!(delays.last().map(|d| d.1), Some(policy.cap_delay()));
}

#[tokio::test(start_paused = true)]
async fn unreachable_bridge_degrades_with_links_up() {
    let mut rig = Rig::new();
    rig.reach_nominal_with_both_links().await;

    rig.probe.set_reachable(false);
    rig.step_until(20, |s| s.state() != SupervisorState::Nominal).await;

    assert_eq!(rig.supervisor.state(), SupervisorState::Degraded);
    assert!(rig.wifi_led.is_high());
    assert!(rig.ethernet_led.is_high());

    let snapshot = rig.shared.snapshot.read();
    assert!(!snapshot.downstream_reachable());
    assert_eq!(snapshot.downstream.consecutive_failures, 1);
    assert!(snapshot.wireless.is_connected());
    assert!(snapshot.wired.is_connected());

    assert_eq!(rig.probe.probes().last(), Some(&InterfaceKind::Wired));
    let expected = format!("Hue bridge {BRIDGE} unreachable via Ethernet (failure 1)");
    assert!(rig.messages().iter().any(|m| m.starts_with(&expected)));
    assert!(!rig.messages().iter().any(|m| m.contains("link lost")));
}

#[tokio::test(start_paused = true)]
async fn bridge_comes_back_after_downstream_retry() {
    let mut rig = Rig::new();
    rig.reach_nominal_with_both_links().await;

    rig.probe.set_reachable(false);
    rig.step_until(20, |s| s.state() == SupervisorState::Degraded).await;
    rig.probe.set_reachable(true);

    rig.step_until(20, |s| s.state() == SupervisorState::Nominal).await;
    assert!(rig.shared.snapshot.read().downstream_reachable());
    assert!(rig.messages().iter().any(|m| m == "Connectivity restored"));
}

#[tokio::test(start_paused = true)]
async fn wireless_takes_over_while_wired_is_down() {
    let mut rig = Rig::new();
    rig.reach_nominal_with_both_links().await;

    rig.wired.set_link(false);
    rig.step_until(5, |s| s.state() == SupervisorState::Degraded).await;
    rig.step_until(40, |s| s.state() == SupervisorState::Recovering).await;

    for _ in 0..10 {
        rig.step().await;
    }
    assert!(rig.probe.probes().contains(&InterfaceKind::Wireless));

    rig.wired.set_link(true);
    rig.step_until(200, |s| {
        s.state() == SupervisorState::Nominal && s.status(InterfaceKind::Wired).is_connected()
    })
    .await;
    assert_eq!(rig.shared.snapshot.read().active_uplink, Some(InterfaceKind::Wired));
}

/// xorshift; fixed seed so failures reproduce.
struct Sequence(u64);

impl Sequence {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[tokio::test(start_paused = true)]
async fn indicators_track_state_under_random_link_events() {
    let mut rig = Rig::new();
    let mut sequence = Sequence(0x5EED_1234_ABCD_0042);
    let mut wired_link = true;
    let mut in_range = true;

    for _ in 0..150 {
        match sequence.next() % 8 {
            0 => {
                wired_link = !wired_link;
                rig.wired.set_link(wired_link);
            }
            1 => {
                in_range = !in_range;
                rig.radio.set_in_range(in_range);
            }
            2 => rig.radio.drop_link(),
            3 => rig.probe.set_reachable(sequence.next() % 2 == 0),
            _ => {}
        }
        // step() checks LEDs against interface state after every step.
        rig.step().await;
    }

    rig.wired.set_link(true);
    rig.radio.set_in_range(true);
    rig.probe.set_reachable(true);
    rig.reach_nominal_with_both_links_eventually().await;
}

impl Rig {
    async fn reach_nominal_with_both_links_eventually(&mut self) {
        self.step_until(500, |s| {
            s.state() == SupervisorState::Nominal
                && s.status(InterfaceKind::Wired).is_connected()
                && s.status(InterfaceKind::Wireless).is_connected()
        })
        .await;
    }
}

#[tokio::test(start_paused = true)]
async fn both_uplinks_down_take_turns_at_recovery() {
    let mut rig = Rig::new();
    rig.reach_nominal_with_both_links().await;

    rig.wired.set_link(false);
    rig.radio.set_in_range(false);

    let mut targets = Vec::new();
    for _ in 0..60 {
        rig.step().await;
        if let Some(retry) = rig.supervisor.pending_retry() {
            if targets.last() != Some(&retry.target) {
                targets.push(retry.target);
            }
        }
    }

    assert_eq!(targets.first(), Some(&RetryTarget::Wired));
    assert!(targets.contains(&RetryTarget::Wireless), "{targets:?}");
    assert_eq!(rig.shared.snapshot.read().active_uplink, None);

    rig.radio.set_in_range(true);
    rig.step_until(100, |s| s.status(InterfaceKind::Wireless).is_connected()).await;
    assert!(rig.wifi_led.is_high());
    assert!(!rig.ethernet_led.is_high());
}

#[tokio::test(start_paused = true)]
async fn wedged_radio_cannot_stall_the_supervisor() {
    let mut rig = Rig::new();
    rig.reach_nominal_with_both_links().await;

    rig.radio.set_stalled(true);
    for _ in 0..20 {
        tokio::time::timeout(Duration::from_secs(60), rig.step())
            .await
            .expect("step finished despite a hung radio");
    }

    assert!(!rig.supervisor.status(InterfaceKind::Wireless).is_connected());
    assert!(!rig.wifi_led.is_high());
    assert!(rig.ethernet_led.is_high());
    let snapshot = rig.shared.snapshot.read();
    assert_eq!(snapshot.active_uplink, Some(InterfaceKind::Wired));
    assert!(snapshot.downstream_reachable());
    assert!(rig.messages().iter().any(|m| m == "WiFi link lost"));
}

#[tokio::test(start_paused = true)]
async fn missing_ssid_stops_the_supervisor() {
    let Rig {
        supervisor,
        shared,
        wifi_led,
        ..
    } = Rig::with_ssid("");

    let err = supervisor.run().await.unwrap_err();
    assert!(
        matches!(err, AdapterError::Connect(ConnectError::Configuration(_))),
        "{err:?}"
    );

    let snapshot = shared.snapshot.read();
    assert_eq!(snapshot.wireless.state, InterfaceState::Failed);
    assert_eq!(snapshot.supervisor, SupervisorState::BringingUpWireless);
    assert!(!wifi_led.is_high());
    assert!(
        shared
            .log
            .snapshot()
            .iter()
            .any(|entry| entry.message.starts_with("WiFi configuration error"))
    );
}
