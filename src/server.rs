//! Status web server.
//!
//! Read-only view of the supervisor: every request renders from the latest
//! published snapshot and the log ring. Nothing here can reach the drivers.

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use anyhow::Context as _;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tera::Context;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::interface::InterfaceKind;
use crate::log_ring::LogEntry;
use crate::snapshot::{LinkSnapshot, SharedStatus};
use crate::template::TemplateStore;

#[derive(Clone)]
pub struct AppState {
    pub shared: Arc<SharedStatus>,
    pub templates: Arc<TemplateStore>,
    /// Port the server listens on, used for host correction.
    pub port: u16,
}

pub fn router(state: AppState, max_concurrent: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let layers = ServiceBuilder::new()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
        .layer(ConcurrencyLimitLayer::new(max_concurrent.max(1)));

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/reload-template", get(reload_handler))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), host_redirect))
        .layer(middleware::map_response(no_cache_headers))
        .layer(layers)
        .with_state(state)
}

/// Binds (with retries) and serves until `shutdown` is cancelled.
pub async fn run_server(config: &ServerConfig, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = router(state, config.max_concurrent);
    let addr = SocketAddr::from((config.bind, config.port));

    let mut attempt = 1;
    let listener = loop {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => break listener,
            Err(e) if attempt < config.bind_attempts => {
                let wait = Duration::from_secs(2 * u64::from(attempt));
                tracing::warn!(%addr, attempt, error = %e, "Bind failed, retrying in {}s", wait.as_secs());
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to bind {addr} after {attempt} attempts"));
            }
        }
    };

    tracing::info!("Status server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Status server stopped");
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.shared.snapshot.read();
    let entries = state.shared.log.recent(state.shared.log.capacity());
    let context = page_context(&snapshot, &entries);
    Html(state.templates.render_or_fallback(&context))
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.shared.snapshot.read();
    Json(&*snapshot).into_response()
}

async fn logs_handler(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.shared.log.snapshot())
}

#[derive(Serialize)]
struct ReloadResponse {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn reload_handler(State(state): State<AppState>) -> Response {
    match state.templates.reload() {
        Ok(source) => Json(ReloadResponse {
            status: "success",
            message: "Template reloaded".to_string(),
            path: Some(source.label()),
            error: None,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Template reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ReloadResponse {
                    status: "error",
                    message: "Template reload failed".to_string(),
                    path: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

async fn host_redirect(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let location = canonical_location(host, request.uri().path(), state.port);
    match location {
        Some(location) => redirect(&location),
        None => next.run(request).await,
    }
}

fn redirect(location: &str) -> Response {
    let Ok(value) = HeaderValue::from_str(location) else {
        return (StatusCode::BAD_REQUEST, "Invalid host").into_response();
    };
    (
        StatusCode::FOUND,
        [(header::LOCATION, value)],
        format!("Redirecting to {location}"),
    )
        .into_response()
}

/// Where a request should have gone, if its Host header is one browsers
/// commonly mangle: `www.` glued onto an IP, or a stale `:8080`.
pub fn canonical_location(host: &str, path: &str, port: u16) -> Option<String> {
    let clean = match host.strip_prefix("www.") {
        Some(rest) if rest.chars().any(|c| c.is_ascii_digit()) => rest.split(':').next().unwrap_or(rest),
        _ if port == 80 && host.ends_with(":8080") => host.trim_end_matches(":8080"),
        _ => return None,
    };

    if path == "/" || path.is_empty() {
        Some(format!("http://{clean}"))
    } else {
        Some(format!("http://{clean}{path}"))
    }
}

async fn no_cache_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

#[derive(Serialize)]
struct PageLogEntry<'a> {
    time: String,
    message: &'a str,
}

fn on_off(level: bool) -> &'static str {
    if level { "on" } else { "off" }
}

fn uplink_label(kind: Option<InterfaceKind>) -> &'static str {
    match kind {
        Some(InterfaceKind::Wired) => "Ethernet",
        Some(InterfaceKind::Wireless) => "WiFi",
        None => "None",
    }
}

/// Template variables for the status page.
pub fn page_context(snapshot: &LinkSnapshot, entries: &[LogEntry]) -> Context {
    let mut context = Context::new();

    context.insert("wifi_class", on_off(snapshot.indicators.wireless));
    context.insert("ethernet_class", on_off(snapshot.indicators.wired));
    context.insert("data_class", on_off(snapshot.indicators.activity));
    context.insert("builtin_class", on_off(snapshot.indicators.heartbeat));

    let address = |addr: Option<std::net::Ipv4Addr>| addr.map_or_else(|| "Not connected".to_string(), |a| a.to_string());
    context.insert("wifi_ip", &address(snapshot.wireless_address()));
    context.insert("ethernet_ip", &address(snapshot.wired_address()));

    let bridge = snapshot.downstream.address;
    let bridge = if bridge.is_unspecified() {
        "Unknown".to_string()
    } else {
        bridge.to_string()
    };
    context.insert("hue_bridge_ip", &bridge);

    let downstream_status = match (snapshot.downstream.last_checked, snapshot.downstream.reachable) {
        (None, _) => "not checked".to_string(),
        (Some(_), true) => match snapshot.downstream.last_round_trip_ms {
            Some(ms) => format!("reachable, {ms} ms"),
            None => "reachable".to_string(),
        },
        (Some(_), false) => format!(
            "unreachable, {} failed checks",
            snapshot.downstream.consecutive_failures
        ),
    };
    context.insert("downstream_status", &downstream_status);
    context.insert("active_uplink", uplink_label(snapshot.active_uplink));
    context.insert("supervisor_state", snapshot.supervisor.label());
    context.insert("last_error", snapshot.last_error.as_deref().unwrap_or("None"));

    let controller = snapshot.controller.as_ref();
    let initialized = controller.is_some_and(|c| c.initialized);
    let linked = controller.is_some_and(|c| c.phy.link);
    context.insert("eth_init_status", if initialized { "Initialized" } else { "Not Initialized" });
    context.insert("eth_init_class", if initialized { "status-success" } else { "status-error" });
    context.insert("eth_link_status", if linked { "Connected" } else { "Disconnected" });
    context.insert("eth_link_class", if linked { "status-success" } else { "status-warning" });
    context.insert(
        "eth_spi_config",
        controller.map_or("Unknown", |c| c.bus.as_str()),
    );
    let error = controller
        .and_then(|c| c.last_error.as_deref())
        .unwrap_or("None");
    context.insert("eth_error_message", error);
    context.insert("eth_error_class", if error == "None" { "status-success" } else { "status-error" });

    let log_entries: Vec<PageLogEntry<'_>> = entries
        .iter()
        .map(|entry| PageLogEntry {
            time: entry.time_label(),
            message: &entry.message,
        })
        .collect();
    context.insert("log_entries", &log_entries);
    context.insert("render_error", &Option::<String>::None);

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    use crate::interface::{ControllerDiagnostics, InterfaceState};
    use crate::log_ring::LogLevel;
    use crate::snapshot::SupervisorState;
    use crate::w5500::PhyStatus;

    fn state() -> AppState {
        let mut snapshot = LinkSnapshot::initial(Ipv4Addr::new(192, 168, 1, 61));
        snapshot.supervisor = SupervisorState::Nominal;
        snapshot
            .wireless
            .transition(InterfaceState::Connected(Ipv4Addr::new(192, 168, 1, 50)));
        snapshot.indicators.wireless = true;
        snapshot.active_uplink = Some(InterfaceKind::Wireless);

        let shared = SharedStatus::new(snapshot, 50);
        shared.log.append(LogLevel::Info, "Adapter starting");
        shared.log.append(LogLevel::Info, "WiFi connected: 192.168.1.50");

        AppState {
            shared,
            templates: Arc::new(TemplateStore::builtin().unwrap()),
            port: 80,
        }
    }

    fn get(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn index_renders_snapshot_and_newest_log_first() {
        let app = router(state(), 1);
        let response = app.oneshot(get("/", "192.168.1.50")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(response.headers().get(header::PRAGMA).unwrap(), "no-cache");

        let html = body_text(response).await;
        assert!(html.contains("192.168.1.50"));
        assert!(html.contains("192.168.1.61"));
        assert!(html.contains("Not Initialized"));
        assert!(html.contains("nominal"));
        let newest = html.find("WiFi connected").unwrap();
        let oldest = html.find("Adapter starting").unwrap();
        assert!(newest < oldest);
    }

    #[tokio::test]
    async fn status_api_returns_snapshot_json() {
        let app = router(state(), 1);
        let response = app.oneshot(get("/api/status", "192.168.1.50")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["supervisor"], "nominal");
        assert_eq!(json["wireless"]["state"]["address"], "192.168.1.50");
        assert_eq!(json["active_uplink"], "wireless");
    }

    #[tokio::test]
    async fn logs_api_is_oldest_first() {
        let app = router(state(), 1);
        let response = app.oneshot(get("/api/logs", "192.168.1.50")).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json[0]["message"], "Adapter starting");
        assert_eq!(json[1]["level"], "info");
    }

    #[tokio::test]
    async fn reload_reports_source() {
        let app = router(state(), 1);
        let response = app
            .oneshot(get("/api/reload-template", "192.168.1.50"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["path"], "builtin");
    }

    #[tokio::test]
    async fn reload_failure_is_500_and_page_keeps_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.html");
        std::fs::write(&path, "<p>{{ wifi_ip }}</p>").unwrap();

        let mut state = state();
        state.templates = Arc::new(TemplateStore::load(vec![path.clone()]).unwrap());
        std::fs::write(&path, "{% for %}").unwrap();

        let app = router(state, 1);
        let response = app
            .clone()
            .oneshot(get("/api/reload-template", "192.168.1.50"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(json["error"].is_string());

        let response = app.oneshot(get("/", "192.168.1.50")).await.unwrap();
        assert_eq!(body_text(response).await, "<p>192.168.1.50</p>");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let app = router(state(), 1);
        let response = app.oneshot(get("/favicon.ico", "192.168.1.50")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "404 Not Found");
    }

    #[tokio::test]
    async fn www_ip_host_is_redirected() {
        let app = router(state(), 1);
        let response = app
            .oneshot(get("/api/status", "www.192.168.1.50:80"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "http://192.168.1.50/api/status"
        );
        assert_eq!(body_text(response).await, "Redirecting to http://192.168.1.50/api/status");
    }

    #[tokio::test]
    async fn cors_header_present() {
        let app = router(state(), 1);
        let request = Request::builder()
            .uri("/api/status")
            .header(header::HOST, "192.168.1.50")
            .header(header::ORIGIN, "http://example.test")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[test]
    fn canonical_locations() {
        assert_eq!(
            canonical_location("www.192.168.1.50", "/", 80).as_deref(),
            Some("http://192.168.1.50")
        );
        assert_eq!(
            canonical_location("192.168.1.50:8080", "/api/logs", 80).as_deref(),
            Some("http://192.168.1.50/api/logs")
        );
        assert_eq!(canonical_location("192.168.1.50:8080", "/", 8080), None);
        assert_eq!(canonical_location("www.example.com", "/", 80), None);
        assert_eq!(canonical_location("192.168.1.50", "/", 80), None);
    }

    #[tokio::test]
    async fn page_shows_last_error() {
        let app_state = state();
        let mut snapshot = (*app_state.shared.snapshot.read()).clone();
        snapshot.last_error = Some("Hue bridge: Downstream probe timed out after 2s".to_string());
        app_state.shared.snapshot.publish(snapshot);

        let response = router(app_state, 1).oneshot(get("/", "192.168.1.50")).await.unwrap();
        let html = body_text(response).await;
        assert!(html.contains("Hue bridge: Downstream probe timed out after 2s"));
    }

    #[test]
    fn controller_diagnostics_in_context() {
        let mut snapshot = LinkSnapshot::initial(Ipv4Addr::new(192, 168, 1, 61));
        snapshot.controller = Some(ControllerDiagnostics {
            initialized: true,
            phy: PhyStatus {
                link: true,
                speed_100: true,
                full_duplex: true,
            },
            bus: "SPI0 @ 2000000 Hz".to_string(),
            last_error: Some("DHCP: no DHCPOFFER received".to_string()),
            transactions: 10,
            faults: 0,
        });

        let context = page_context(&snapshot, &[]).into_json();
        assert_eq!(context["eth_init_status"], "Initialized");
        assert_eq!(context["eth_link_class"], "status-success");
        assert_eq!(context["eth_spi_config"], "SPI0 @ 2000000 Hz");
        assert_eq!(context["eth_error_class"], "status-error");
        assert_eq!(context["wifi_ip"], "Not connected");
        assert_eq!(context["downstream_status"], "not checked");
        assert_eq!(context["last_error"], "None");
    }
}
