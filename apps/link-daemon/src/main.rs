mod config;
mod host;

use anyhow::{Context, Result};
use can_transport::{CanBus, MockBus, SlcanBitrate, SlcanBus};
use clap::Parser;
use config::{CanBackend, DaemonConfig, HostTransport};
use frame_protocol::{commands, Link, Router};
use motor_registry::{
    CanDriver, CanHandle, ConfirmPolicy, Confirmer, DriverOptions, LivenessMonitor, LivenessPolicy,
    MetricsHub, MotorController, MotorRegistry, ServoSim,
};
use motor_service::{spawn_liveness, MotorService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "link-daemon", version, about = "Host link and CAN servo controller")]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the mock CAN bus with a simulated servo per configured motor
    #[arg(long)]
    mock: bool,

    /// Listen for the host on this TCP address instead of the configured transport
    #[arg(long)]
    tcp: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => config::load(path)?,
        None => DaemonConfig::default(),
    };
    if args.mock {
        cfg.can.backend = CanBackend::Mock;
    }
    if let Some(addr) = args.tcp {
        cfg.link.transport = HostTransport::Tcp;
        cfg.link.tcp_listen = addr;
    }
    info!(
        transport = ?cfg.link.transport,
        backend = ?cfg.can.backend,
        motors = cfg.motors.devices.len(),
        "link-daemon starting"
    );

    let hub = MetricsHub::new().context("creating metrics registry")?;
    let registry = Arc::new(
        MotorRegistry::from_configs(&cfg.motors.devices).context("registering motors")?,
    );
    hub.motors.motors_registered.set(registry.len() as i64);

    let (_driver, can) = start_can(&cfg, Arc::clone(&registry), &hub)?;
    let confirm = Confirmer::new(
        Arc::clone(&registry),
        can.clone(),
        ConfirmPolicy::from(&cfg.motors),
    )
    .with_metrics(hub.motors.clone());
    let controller = MotorController::new(Arc::clone(&registry), confirm);
    controller.probe_all(Duration::from_millis(5)).await;

    let mut router = Router::new();
    MotorService::new(controller)
        .with_metrics(hub.clone())
        .install(&mut router)
        .context("installing motor commands")?;
    anyhow::ensure!(
        router.handles(commands::MOTOR_STOP),
        "motor commands are not routed"
    );
    info!(metrics = router.handles(commands::DEBUG_METRICS), "router ready");
    let link = Link::new(router, cfg.link.queue_depth).with_max_payload(cfg.link.max_payload);

    let monitor = LivenessMonitor::new(Arc::clone(&registry), LivenessPolicy::from(&cfg.motors))
        .with_metrics(hub.motors.clone());
    let sweep = spawn_liveness(
        monitor,
        can,
        link.replies(),
        Duration::from_millis(cfg.motors.sweep_interval_ms),
    );

    tokio::select! {
        result = host::serve(link, &cfg.link) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    sweep.abort();
    info!("link-daemon shutting down");
    Ok(())
}

fn start_can(
    cfg: &DaemonConfig,
    registry: Arc<MotorRegistry>,
    hub: &MetricsHub,
) -> Result<(CanDriver, CanHandle)> {
    let options = DriverOptions {
        recv_poll: Duration::from_millis(cfg.can.recv_poll_ms),
    };
    let metrics = Some(hub.motors.clone());
    let started = match cfg.can.backend {
        CanBackend::Mock => {
            let sim = ServoSim::new(&cfg.motors.devices);
            let bus = MockBus::with_responder("mock0", sim.responder());
            info!(servos = cfg.motors.devices.len(), "mock CAN bus with simulated servos");
            CanDriver::spawn(bus, registry, metrics, options)
        }
        CanBackend::Slcan => {
            let path = cfg
                .can
                .interface
                .as_deref()
                .context("can.interface is not set")?;
            let bitrate: SlcanBitrate = cfg
                .can
                .bitrate
                .parse()
                .with_context(|| format!("can.bitrate {:?}", cfg.can.bitrate))?;
            let bus = SlcanBus::open_with(path, bitrate)
                .with_context(|| format!("opening SLCAN adapter {path}"))?;
            if let Ok(ports) = SlcanBus::list() {
                if !ports.iter().any(|p| p.name == path) {
                    warn!(path, "adapter not among enumerated serial ports");
                }
            }
            CanDriver::spawn(bus, registry, metrics, options)
        }
    };
    started.context("starting can-io thread")
}

fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
