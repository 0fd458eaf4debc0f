use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hue_adapter::{
    bus::{BusDescriptor, PeripheralBus, Transport},
    config::{self, AdapterConfig, BusConfig, ProbeMethod, RadioBackendKind, WiredBackendKind},
    indicator::{IndicatorBank, IndicatorPins, TracePin},
    interface::{RadioBackend, WiredInterface, WirelessInterface, event_channel, nmcli},
    probe::{HttpProbe, Probe, TcpProbe},
    server::{self, AppState},
    sim::{SimDhcpServer, SimProbe, SimRadio, W5500Model},
    snapshot::{LinkSnapshot, SharedStatus},
    supervisor::Supervisor,
    template::{self, TemplateStore},
};

#[cfg(target_os = "linux")]
use hue_adapter::linux_spi::LinuxSpi;

#[derive(Parser)]
#[command(name = "hue-adapter")]
#[command(about = "Keep a Hue bridge reachable over WiFi and W5500 Ethernet, with a status page")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connectivity supervisor and the status server
    Run {
        /// Use the emulated controller, simulated radio and simulated bridge
        #[arg(long)]
        simulate: bool,

        /// Override the status server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the configuration file
    CheckConfig,

    /// Show the effective configuration
    ShowConfig,

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// List WiFi devices known to NetworkManager
    Interfaces,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };

    match cli.command {
        Commands::Run { simulate, port } => cmd_run(&path, simulate, port).await,
        Commands::CheckConfig => cmd_check_config(&path),
        Commands::ShowConfig => cmd_show_config(&path),
        Commands::InitConfig { force } => cmd_init_config(&path, force),
        Commands::Interfaces => cmd_interfaces().await,
    }
}

async fn cmd_run(path: &Path, simulate: bool, port: Option<u16>) -> Result<()> {
    let mut cfg = AdapterConfig::load(path)?;
    if simulate {
        cfg.wireless.backend = RadioBackendKind::Simulated;
        cfg.wired.backend = WiredBackendKind::Emulated;
    }
    if let Some(port) = port {
        cfg.server.port = port;
    }
    cfg.validate()?;

    let (notifier, events) = event_channel();

    let radio = match cfg.wireless.backend {
        RadioBackendKind::Nmcli => RadioBackend::Nmcli(nmcli::NmcliRadio::new(wifi_device(&cfg).await?)),
        RadioBackendKind::Simulated => RadioBackend::Simulated(SimRadio::new(cfg.simulation.wireless_address)),
    };
    let wireless = WirelessInterface::new(radio, &cfg.wireless, notifier.clone());

    let bus = PeripheralBus::new(wired_transport(&cfg), BusDescriptor::from(&cfg.wired.bus));
    let wired = WiredInterface::new(bus, cfg.wired_settings()?, notifier);

    let downstream = &cfg.downstream;
    let probe = if simulate {
        let probe = SimProbe::new(downstream.address);
        probe.handle().set_reachable(cfg.simulation.downstream_reachable);
        Probe::Simulated(probe)
    } else {
        match downstream.method {
            ProbeMethod::Tcp => Probe::Tcp(TcpProbe::new(
                std::net::SocketAddrV4::new(downstream.address, downstream.port),
                downstream.bind_to_uplink,
            )),
            ProbeMethod::Http => Probe::Http(HttpProbe::new(
                downstream.address,
                downstream.port,
                &downstream.path,
                downstream.bind_to_uplink,
            )),
        }
    };

    let leds = &cfg.indicators;
    let indicators = IndicatorBank::new(
        IndicatorPins {
            wireless: Box::new(TracePin::new("wifi", leds.wifi_pin)),
            wired: Box::new(TracePin::new("ethernet", leds.ethernet_pin)),
            activity: Box::new(TracePin::new("data", leds.data_pin)),
            heartbeat: Box::new(TracePin::new("heartbeat", leds.heartbeat_pin)),
        },
        Duration::from_millis(leds.pulse_ms),
        Duration::from_millis(leds.flash_ms),
        leds.boot_rounds,
    );

    let shared = SharedStatus::new(LinkSnapshot::initial(downstream.address), cfg.server.log_capacity);
    let templates = TemplateStore::load(template::candidates_with(cfg.server.template_path.as_deref()))
        .context("Failed to load status page template")?;

    let supervisor = Supervisor::new(
        wireless,
        wired,
        probe,
        events,
        indicators,
        Arc::clone(&shared),
        cfg.supervisor_settings()?,
    );

    let state = AppState {
        shared,
        templates: Arc::new(templates),
        port: cfg.server.port,
    };

    let shutdown = CancellationToken::new();
    let server_config = cfg.server.clone();
    let server_shutdown = shutdown.clone();
    let mut server_task =
        tokio::spawn(async move { server::run_server(&server_config, state, server_shutdown).await });
    let mut supervisor_task = tokio::spawn(supervisor.run());

    tracing::info!(
        downstream = %downstream.address,
        simulate,
        "Adapter running, press Ctrl-C to stop"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down");
            shutdown.cancel();
            supervisor_task.abort();
            server_task.await.context("Status server task panicked")??;
        }
        outcome = &mut supervisor_task => {
            shutdown.cancel();
            server_task.await.context("Status server task panicked")??;
            match outcome.context("Supervisor task panicked")? {
                Ok(()) => {}
                Err(e) => bail!("Supervisor stopped: {e}"),
            }
        }
        outcome = &mut server_task => {
            supervisor_task.abort();
            outcome.context("Status server task panicked")??;
            bail!("Status server stopped unexpectedly");
        }
    }

    Ok(())
}

/// A controller that cannot be opened leaves the wired uplink down; the
/// adapter still runs on wireless.
fn wired_transport(cfg: &AdapterConfig) -> Transport {
    match cfg.wired.backend {
        WiredBackendKind::Spidev => open_spidev(&cfg.wired.bus),
        WiredBackendKind::Emulated => {
            let model = W5500Model::new();
            let mut dhcp = SimDhcpServer::new(cfg.simulation.wired_offer());
            dhcp.lease_secs = cfg.simulation.lease_secs;
            model.handle().set_dhcp_server(dhcp);
            Transport::Emulated(model)
        }
        WiredBackendKind::Unattached => {
            tracing::warn!("No Ethernet controller attached; the wired uplink will stay down");
            Transport::Unattached
        }
    }
}

#[cfg(target_os = "linux")]
fn open_spidev(bus: &BusConfig) -> Transport {
    match LinuxSpi::open(&bus.device, bus.baudrate, &bus.gpio_chip, u32::from(bus.rst)) {
        Ok(spi) => {
            tracing::info!(device = %bus.device.display(), "Ethernet controller bus opened");
            Transport::Spidev(spi)
        }
        Err(e) => {
            tracing::error!(error = %e, "Ethernet controller unavailable; the wired uplink will stay down");
            Transport::Unattached
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_spidev(_bus: &BusConfig) -> Transport {
    tracing::warn!("spidev needs Linux; the wired uplink will stay down");
    Transport::Unattached
}

/// The configured WiFi device, or the first one NetworkManager knows.
async fn wifi_device(cfg: &AdapterConfig) -> Result<String> {
    if let Some(name) = &cfg.wireless.interface {
        return Ok(name.clone());
    }
    let devices = nmcli::list_wifi_devices().await?;
    match devices.into_iter().next() {
        Some(device) => Ok(device.name),
        None => bail!("No WiFi devices found; set wireless.interface or use --simulate"),
    }
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let cfg = AdapterConfig::load(path)?;
    cfg.validate()?;
    println!("Configuration OK: {}", path.display());
    Ok(())
}

fn cmd_show_config(path: &Path) -> Result<()> {
    println!("Config file: {}", path.display());
    if !path.exists() {
        println!("(not found, showing defaults)");
    }
    println!();

    let mut cfg = AdapterConfig::load(path)?;
    cfg.wireless.password = "*".repeat(cfg.wireless.password.len().min(12));

    let content = toml::to_string_pretty(&cfg).context("Failed to serialize config")?;
    println!("{content}");
    Ok(())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AdapterConfig::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn cmd_interfaces() -> Result<()> {
    let devices = nmcli::list_wifi_devices().await?;

    if devices.is_empty() {
        println!("No WiFi interfaces found.");
        return Ok(());
    }

    println!(
        "{:<16} {:<14} {:<20} {:<16} {}",
        "INTERFACE", "STATE", "CONNECTION", "ADDRESS", "GATEWAY"
    );
    println!("{}", "-".repeat(84));

    for device in devices {
        let status = nmcli::device_status(&device.name).await.unwrap_or_default();
        let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<14} {:<20} {:<16} {}",
            device.name,
            device.state,
            or_dash(status.connection),
            or_dash(status.address.map(|a| a.to_string())),
            or_dash(status.gateway.map(|g| g.to_string())),
        );
    }

    Ok(())
}
