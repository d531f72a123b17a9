//! tun2socks: relay TUN traffic through a SOCKS5 proxy
//!
//! # Usage
//!
//! ```bash
//! # The TUN interface is created and configured beforehand; its descriptor
//! # is inherited by the process
//! tun2socks -c /etc/tun2socks/config.json --fd 3
//!
//! # Environment overrides
//! TUN2SOCKS_PROXY_URL=socks5://127.0.0.1:9050 tun2socks --fd 3
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use tun2socks::config::{load_config_with_env, EngineConfig};
use tun2socks::engine::Engine;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Inherited TUN file descriptor
    tun_fd: Option<i32>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun2socks/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut tun_fd = None;

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
                "--fd" => match args.next().map(|fd| fd.parse::<i32>()) {
                    Some(Ok(fd)) => tun_fd = Some(fd),
                    _ => {
                        eprintln!("--fd requires a numeric file descriptor");
                        std::process::exit(1);
                    }
                },
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun2socks v{}", tun2socks::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            tun_fd,
        }
    }
}

fn print_help() {
    println!(
        r"tun2socks v{}

Relays TCP traffic from a TUN device through a SOCKS5 proxy and DNS queries
to a local resolver.

USAGE:
    tun2socks [OPTIONS] --fd <N>

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun2socks/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    --fd <N>                File descriptor of an open TUN device (IFF_TUN | IFF_NO_PI)
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TUN2SOCKS_PROXY_URL           Override proxy URL
    TUN2SOCKS_MTU                 Override device MTU
    TUN2SOCKS_LOG_LEVEL           Override log level (trace, debug, info, warn, error)
    TUN2SOCKS_DNS_RESOLVER        Override DNS resolver address
    TUN2SOCKS_PAIR_TIMEOUT_SECS   Override forwarding pair timeout
    RUST_LOG                      Additional tracing filter directives
",
        tun2socks::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &EngineConfig) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[cfg(unix)]
fn open_device(fd: i32) -> Result<tun2socks::device::TunDevice> {
    tun2socks::device::open_tun_fd(fd).with_context(|| format!("Failed to open TUN fd {fd}"))
}

#[cfg(not(unix))]
fn open_device(_fd: i32) -> Result<tun2socks::device::ChannelDevice> {
    bail!("TUN file descriptors are only supported on unix")
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();

    if args.generate_config {
        tun2socks::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!("Failed to load configuration from {:?}", args.config_path)
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tun2socks v{}", tun2socks::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let Some(fd) = args.tun_fd else {
        bail!("No TUN device given; pass --fd <N>");
    };
    let device = open_device(fd)?;

    let mut engine = Engine::new(config);
    engine.start(device).context("Failed to start engine")?;

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let run_result = tokio::select! {
        result = engine.wait() => {
            if let Err(e) = &result {
                error!("Packet pump failed: {}", e);
            } else {
                info!("TUN device closed");
            }
            result
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            Ok(())
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            Ok(())
        }
    };

    engine.stop().await;

    let stats = engine.stats();
    info!(
        "Final TCP stats: {} total, {} failed, {} timed out, {} rejected by stack",
        stats.forward.tcp_total,
        stats.forward.tcp_failed,
        stats.forward.tcp_timeouts,
        stats.stack.tcp_rejected
    );
    info!(
        "Transferred: {} bytes up, {} bytes down; {} DNS queries ({} failed)",
        stats.forward.bytes_up,
        stats.forward.bytes_down,
        stats.forward.dns_queries,
        stats.forward.dns_failures
    );
    if let Ok(json) = serde_json::to_string(&stats) {
        info!(stats = %json, "Shutdown complete");
    }

    run_result.context("Engine terminated with an error")
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
    std::future::pending::<()>().await;
}
