//! ims-bridge: In-device IMS packet bridge
//!
//! This is the main entry point for the bridge daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./ims-bridge
//!
//! # Run with custom configuration
//! ./ims-bridge -c /path/to/config.json
//!
//! # Run with environment overrides
//! IMS_BRIDGE_LOG_LEVEL=debug ./ims-bridge
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, Level};
use tracing_subscriber::EnvFilter;

use ims_bridge::channel::UnixBlockChannel;
use ims_bridge::config::{load_config_with_env, ChannelConfig, Config};
use ims_bridge::ipc::IpcServer;
use ims_bridge::router::{ChannelHostStack, HostDelivery};
use ims_bridge::stats::Counter;
use ims_bridge::ImsBridge;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/ims-bridge/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("ims-bridge v{}", ims_bridge::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"ims-bridge v{}

In-device IMS packet bridge between the application processor and the modem.

USAGE:
    ims-bridge [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/ims-bridge/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    IMS_BRIDGE_LOG_LEVEL   Override log level (trace, debug, info, warn, error)
    IMS_BRIDGE_FRAG_SIZE   Override data fragment size (0 = block capacity)
    IMS_BRIDGE_IPC_SOCKET  Override IPC socket path
"#,
        ims_bridge::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    match (config.log.format == "json", config.log.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.json().without_time().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }
}

/// Bind one block channel from its configuration
fn bind_channel(name: &str, channel: &ChannelConfig, config: &Config) -> Result<UnixBlockChannel> {
    UnixBlockChannel::bind(
        name,
        &channel.socket_path,
        &channel.peer_path,
        channel.block_size,
        channel.block_count,
        config.transport.peer_poll(),
    )
    .map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind {} channel at {:?}: {}",
            name,
            channel.socket_path,
            e
        )
    })
}

/// Consume packets the bridge hands back to the host
///
/// Without a kernel hook the daemon can only account for them.
async fn drain_host(mut rx: mpsc::UnboundedReceiver<HostDelivery>) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            HostDelivery::Input { packet, mark } => {
                debug!(len = packet.len(), mark, "Packet from CP for local input");
            }
            HostDelivery::Output { packet } => {
                debug!(len = packet.len(), "Packet from CP for output");
            }
        }
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        ims_bridge::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config);

    info!("ims-bridge v{}", ims_bridge::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let control = bind_channel("control", &config.transport.control, &config)?;
    let data = bind_channel("data", &config.transport.data, &config)?;

    let (host, deliveries) = ChannelHostStack::new();
    let host_handle = tokio::spawn(drain_host(deliveries));

    let bridge = Arc::new(ImsBridge::new(
        &config,
        Arc::new(control),
        Arc::new(data),
        Arc::new(host),
    ));
    bridge.start();

    // The IPC server stops together with the bridge
    let ipc_server = IpcServer::new(config.ipc.clone(), Arc::clone(&bridge));
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!("IPC server error: {}", e);
        }
    });

    info!(
        sim_count = config.bridge.sim_count,
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Graceful shutdown
    info!("Shutting down...");

    bridge.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), ipc_handle).await;
    host_handle.abort();

    let stats = bridge.stats();
    info!(
        "Final stats: {} packets to CP, {} packets from CP, {} relay failures",
        stats.get(Counter::PktsToCp),
        stats.get(Counter::PktsFromCp),
        stats.get(Counter::RelayFail)
    );

    info!("Shutdown complete");

    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
