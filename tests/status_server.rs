use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use hue_adapter::bus::PeripheralBus;
use hue_adapter::config::{ServerConfig, WirelessConfig};
use hue_adapter::indicator::{IndicatorBank, IndicatorPins, SharedPin};
use hue_adapter::interface::{WiredInterface, WiredSettings, WirelessInterface, event_channel};
use hue_adapter::server::{self, AppState};
use hue_adapter::sim::w5500::test_descriptor;
use hue_adapter::sim::{SimProbe, SimRadio, W5500Model};
use hue_adapter::snapshot::{LinkSnapshot, SharedStatus, SupervisorState};
use hue_adapter::supervisor::{Supervisor, SupervisorSettings};
use hue_adapter::template::TemplateStore;
use hue_adapter::w5500::NetworkSettings;

const BRIDGE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 61);

fn supervisor(
    shared: Arc<SharedStatus>,
) -> Supervisor<WirelessInterface<SimRadio>, WiredInterface<W5500Model>, SimProbe> {
    let (notifier, events) = event_channel();
    let wifi_config = WirelessConfig {
        ssid: "HomeNet".to_string(),
        ..WirelessConfig::default()
    };
    let wireless = WirelessInterface::new(
        SimRadio::new(Ipv4Addr::new(192, 168, 1, 50)),
        &wifi_config,
        notifier.clone(),
    );
    let model = W5500Model::with_dhcp(NetworkSettings {
        address: Ipv4Addr::new(192, 168, 1, 60),
        subnet: Ipv4Addr::new(255, 255, 255, 0),
        gateway: Ipv4Addr::new(192, 168, 1, 1),
    });
    let wired = WiredInterface::new(
        PeripheralBus::new(model, test_descriptor()),
        WiredSettings {
            mac: [0xDE, 0xAD, 0xBE, 0xEF, 0xFE, 0xED],
            hostname: Some("hue-adapter".to_string()),
            reply_timeout: Duration::from_secs(2),
            carrier_poll: Duration::from_millis(100),
        },
        notifier,
    );
    let indicators = IndicatorBank::new(
        IndicatorPins {
            wireless: Box::new(SharedPin::new()),
            wired: Box::new(SharedPin::new()),
            activity: Box::new(SharedPin::new()),
            heartbeat: Box::new(SharedPin::new()),
        },
        Duration::from_millis(50),
        Duration::from_millis(33),
        3,
    );
    Supervisor::new(
        wireless,
        wired,
        SimProbe::new(BRIDGE),
        events,
        indicators,
        shared,
        SupervisorSettings::default(),
    )
}

fn app_state(shared: Arc<SharedStatus>) -> AppState {
    AppState {
        shared,
        templates: Arc::new(TemplateStore::builtin().unwrap()),
        port: 80,
    }
}

async fn get_text(app: axum::Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .uri(uri)
        .header(header::HOST, "192.168.1.50")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test(start_paused = true)]
async fn page_follows_the_supervisor() {
    let shared = SharedStatus::new(LinkSnapshot::initial(BRIDGE), 50);
    let mut supervisor = supervisor(Arc::clone(&shared));
    let app = server::router(app_state(Arc::clone(&shared)), 1);

    let (status, html) = get_text(app.clone(), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("initializing"));
    assert!(html.contains("Not connected"));

    for _ in 0..10 {
        if supervisor.state() == SupervisorState::Nominal {
            break;
        }
        supervisor.step().await.unwrap();
    }
    assert_eq!(supervisor.state(), SupervisorState::Nominal);

    let (_, html) = get_text(app.clone(), "/").await;
    assert!(html.contains("192.168.1.50"));
    assert!(html.contains("192.168.1.60"));
    assert!(html.contains("Initialized"));
    assert!(html.contains("Adapter ready"));
    assert!(html.contains("nominal"));

    let (_, json) = get_text(app, "/api/status").await;
    let json: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(json["supervisor"], "nominal");
    assert_eq!(json["active_uplink"], "wired");
    assert_eq!(json["downstream"]["reachable"], true);
    assert_eq!(json["controller"]["initialized"], true);
    assert_eq!(json["indicators"]["wired"], true);
}

#[tokio::test(start_paused = true)]
async fn log_api_is_bounded_by_ring_capacity() {
    let shared = SharedStatus::new(LinkSnapshot::initial(BRIDGE), 4);
    let mut supervisor = supervisor(Arc::clone(&shared));
    for _ in 0..10 {
        supervisor.step().await.unwrap();
    }

    let app = server::router(app_state(shared), 1);
    let (_, json) = get_text(app, "/api/logs").await;
    let json: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(json.as_array().unwrap().len() <= 4);
}

#[tokio::test]
async fn server_stops_on_cancel() {
    let shared = SharedStatus::new(LinkSnapshot::initial(BRIDGE), 50);
    let config = ServerConfig {
        bind: Ipv4Addr::LOCALHOST,
        port: 0,
        ..ServerConfig::default()
    };
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        let state = app_state(shared);
        tokio::spawn(async move { server::run_server(&config, state, shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn bind_gives_up_after_configured_attempts() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let shared = SharedStatus::new(LinkSnapshot::initial(BRIDGE), 50);
    let config = ServerConfig {
        bind: Ipv4Addr::LOCALHOST,
        port,
        bind_attempts: 2,
        ..ServerConfig::default()
    };

    let err = server::run_server(&config, app_state(shared), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("after 2 attempts"));
}
