//! Downstream liveness checks.

use std::future::Future;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio::time::Instant;

use crate::error::ProbeError;
use crate::interface::InterfaceKind;
use crate::sim::probe::SimProbe;

/// The uplink a probe is sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uplink {
    pub kind: InterfaceKind,
    pub local: Ipv4Addr,
}

pub trait DownstreamProbe: Send {
    fn target(&self) -> Ipv4Addr;

    /// Checks the downstream endpoint once. Returns the round-trip time.
    fn probe(&mut self, uplink: Uplink, timeout: Duration) -> impl Future<Output = Result<Duration, ProbeError>> + Send;
}

/// TCP handshake against one port of the endpoint. A refused connection
/// still proves the host is up.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: SocketAddrV4,
    bind_uplink: bool,
}

impl TcpProbe {
    pub fn new(target: SocketAddrV4, bind_uplink: bool) -> Self {
        Self { target, bind_uplink }
    }
}

impl DownstreamProbe for TcpProbe {
    fn target(&self) -> Ipv4Addr {
        *self.target.ip()
    }

    async fn probe(&mut self, uplink: Uplink, timeout: Duration) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let socket = TcpSocket::new_v4().map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        if self.bind_uplink {
            socket
                .bind(SocketAddr::new(IpAddr::V4(uplink.local), 0))
                .map_err(|e| ProbeError::Unreachable(format!("bind {}: {e}", uplink.local)))?;
        }

        match tokio::time::timeout(timeout, socket.connect(SocketAddr::V4(self.target))).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => Ok(started.elapsed()),
            Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
            Err(_) => Err(ProbeError::Timeout(timeout)),
        }
    }
}

/// HTTP GET against the endpoint. Any response status counts as alive.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    target: Ipv4Addr,
    url: String,
    bind_uplink: bool,
}

impl HttpProbe {
    pub fn new(target: Ipv4Addr, port: u16, path: &str, bind_uplink: bool) -> Self {
        let path = path.trim_start_matches('/');
        Self {
            target,
            url: format!("http://{target}:{port}/{path}"),
            bind_uplink,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DownstreamProbe for HttpProbe {
    fn target(&self) -> Ipv4Addr {
        self.target
    }

    async fn probe(&mut self, uplink: Uplink, timeout: Duration) -> Result<Duration, ProbeError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if self.bind_uplink {
            builder = builder.local_address(IpAddr::V4(uplink.local));
        }
        let client = builder
            .build()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        let started = Instant::now();
        match client.get(&self.url).send().await {
            Ok(response) => {
                tracing::trace!(status = %response.status(), url = %self.url, "probe response");
                Ok(started.elapsed())
            }
            Err(e) if e.is_timeout() => Err(ProbeError::Timeout(timeout)),
            Err(e) => Err(ProbeError::Unreachable(e.to_string())),
        }
    }
}

/// Probe selected from configuration.
#[derive(Debug)]
pub enum Probe {
    Tcp(TcpProbe),
    Http(HttpProbe),
    Simulated(SimProbe),
}

impl DownstreamProbe for Probe {
    fn target(&self) -> Ipv4Addr {
        match self {
            Probe::Tcp(probe) => probe.target(),
            Probe::Http(probe) => probe.target(),
            Probe::Simulated(probe) => probe.target(),
        }
    }

    async fn probe(&mut self, uplink: Uplink, timeout: Duration) -> Result<Duration, ProbeError> {
        match self {
            Probe::Tcp(probe) => probe.probe(uplink, timeout).await,
            Probe::Http(probe) => probe.probe(uplink, timeout).await,
            Probe::Simulated(probe) => probe.probe(uplink, timeout).await,
        }
    }
}
