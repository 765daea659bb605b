use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, ValueEnum};
use glam::Vec3;
use octree_stream::{MemoryOctree, PolicyKind, ServerCoordinator, StreamConfig, StreamError, UdpTransport};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{debug, info, warn};

mod demo;
mod telemetry;

use demo::DemoScene;
use telemetry::{LogConfig, LogLevel};

/// Largest datagram we accept from a viewer.
const RECV_BUFFER: usize = 64 * 1024;

#[derive(Debug, Parser)]
#[command(
    name = "octree-server",
    author,
    version,
    about = "Streams a shared octree to viewers over UDP"
)]
struct Cli {
    /// Address to bind the UDP socket to.
    #[arg(long, env = "OCTREE_LISTEN_ADDR", default_value = "0.0.0.0:40106")]
    listen_addr: String,

    /// TOML file with a `[stream]` table of streaming tunables.
    #[arg(long = "config", env = "OCTREE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Traversal policy for new viewers.
    #[arg(long, value_enum, env = "OCTREE_POLICY")]
    policy: Option<PolicyArg>,

    /// Per-viewer packet rate cap.
    #[arg(long, env = "OCTREE_PACKETS_PER_SECOND_PER_VIEWER")]
    packets_per_second_per_viewer: Option<u32>,

    /// Packet rate cap across all viewers.
    #[arg(long, env = "OCTREE_PACKETS_PER_SECOND_TOTAL")]
    packets_per_second_total: Option<u32>,

    #[arg(long, env = "OCTREE_INTERVALS_PER_SECOND")]
    intervals_per_second: Option<u32>,

    #[arg(long, env = "OCTREE_MAX_PACKET_SIZE")]
    max_packet_size: Option<usize>,

    /// Seconds between stats log lines; 0 disables them.
    #[arg(long, env = "OCTREE_STATS_INTERVAL_SECS", default_value_t = 10)]
    stats_interval_secs: u64,

    /// How often idle viewers and finished workers are reaped.
    #[arg(long, env = "OCTREE_REAP_INTERVAL_MS", default_value_t = 1_000)]
    reap_interval_ms: u64,

    #[command(flatten)]
    demo: DemoArgs,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct DemoArgs {
    /// Populate the tree with this many random elements.
    #[arg(long = "demo-elements", env = "OCTREE_DEMO_ELEMENTS", default_value_t = 0)]
    elements: u64,

    #[arg(long = "demo-extent", env = "OCTREE_DEMO_EXTENT", default_value_t = 256.0)]
    half_extent: f32,

    /// Elements rewritten every demo tick.
    #[arg(long = "demo-mutations", env = "OCTREE_DEMO_MUTATIONS", default_value_t = 8)]
    mutations_per_tick: u32,

    #[arg(long = "demo-tick-ms", env = "OCTREE_DEMO_TICK_MS", default_value_t = 500)]
    tick_ms: u64,

    #[arg(long = "demo-seed", env = "OCTREE_DEMO_SEED")]
    seed: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "OCTREE_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "OCTREE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Prioritized,
    Sweep,
}

impl From<PolicyArg> for PolicyKind {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Prioritized => PolicyKind::Prioritized,
            PolicyArg::Sweep => PolicyKind::Sweep,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    stream: StreamConfig,
}

impl ConfigFile {
    fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid server config")
    }
}

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    stream: StreamConfig,
    stats_interval: Option<Duration>,
    reap_interval: Duration,
    demo: DemoScene,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let file = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                ConfigFile::parse(&raw).with_context(|| format!("in {}", path.display()))?
            }
            None => ConfigFile::default(),
        };

        let mut stream = file.stream;
        if let Some(policy) = cli.policy {
            stream.policy = policy.into();
        }
        if let Some(rate) = cli.packets_per_second_per_viewer {
            stream.packets_per_second_per_viewer = rate;
        }
        if let Some(rate) = cli.packets_per_second_total {
            stream.packets_per_second_total = rate;
        }
        if let Some(intervals) = cli.intervals_per_second {
            stream.intervals_per_second = intervals;
        }
        if let Some(size) = cli.max_packet_size {
            stream.max_packet_size = size;
        }
        stream.validate()?;

        Ok(ServerConfig {
            listen_addr,
            stream,
            stats_interval: (cli.stats_interval_secs > 0)
                .then(|| Duration::from_secs(cli.stats_interval_secs)),
            reap_interval: Duration::from_millis(cli.reap_interval_ms.max(1)),
            demo: DemoScene {
                elements: cli.demo.elements,
                half_extent: cli.demo.half_extent.max(1.0),
                mutations_per_tick: cli.demo.mutations_per_tick,
                tick: Duration::from_millis(cli.demo.tick_ms.max(1)),
                seed: cli.demo.seed,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        policy = ?config.stream.policy,
        packets_per_second_per_viewer = config.stream.packets_per_second_per_viewer,
        packets_per_second_total = config.stream.packets_per_second_total,
        demo_elements = config.demo.elements,
        "starting octree-server"
    );

    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    let mut tree = MemoryOctree::new(Vec3::ZERO, config.demo.half_extent);
    config.demo.populate(&mut tree);
    let tree = tree.shared();

    let socket = Arc::new(
        UdpSocket::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?,
    );
    let transport = Arc::new(UdpTransport::new(Arc::clone(&socket)));
    let coordinator = ServerCoordinator::new(Arc::clone(&tree), transport, config.stream.clone())
        .context("failed to start coordinator")?;

    let reaper = coordinator.spawn_reaper(config.reap_interval);
    let mutator = config.demo.spawn_mutator(Arc::clone(&tree));
    let stats = config
        .stats_interval
        .map(|every| spawn_stats_logger(coordinator.clone(), every));

    info!("octree-server listening on {}", socket.local_addr().unwrap_or(config.listen_addr));

    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "udp receive failed");
                        continue;
                    }
                };
                match coordinator.handle_datagram(from, &buf[..len]) {
                    Ok(()) => {}
                    Err(StreamError::ShuttingDown) => break,
                    Err(err) => debug!(%from, len, error = %err, "dropping inbound datagram"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    if let Some(mutator) = mutator {
        mutator.abort();
    }
    if let Some(stats) = stats {
        stats.abort();
    }
    coordinator.shutdown().await;
    if let Err(err) = reaper.await {
        warn!(error = %err, "reaper ended abnormally");
    }
    info!("octree-server stopped");
    Ok(())
}

fn spawn_stats_logger(
    coordinator: ServerCoordinator<MemoryOctree>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match serde_json::to_string(&coordinator.stats()) {
                Ok(json) => info!(target = "octree_server::stats", stats = %json, "stream stats"),
                Err(err) => warn!(error = %err, "failed to serialise stats"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["octree-server"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("cli parses")
    }

    #[test]
    fn cli_overrides_apply_on_top_of_defaults() {
        let config = ServerConfig::try_from(cli(&[
            "--listen-addr",
            "127.0.0.1:5000",
            "--policy",
            "sweep",
            "--packets-per-second-per-viewer",
            "240",
            "--stats-interval-secs",
            "0",
        ]))
        .expect("config");
        assert_eq!(config.listen_addr, "127.0.0.1:5000".parse::<SocketAddr>().expect("addr"));
        assert_eq!(config.stream.policy, PolicyKind::Sweep);
        assert_eq!(config.stream.packets_per_second_per_viewer, 240);
        assert_eq!(
            config.stream.packets_per_second_total,
            StreamConfig::default().packets_per_second_total
        );
        assert!(config.stats_interval.is_none());
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        assert!(ServerConfig::try_from(cli(&["--intervals-per-second", "0"])).is_err());
        assert!(ServerConfig::try_from(cli(&["--listen-addr", "nowhere"])).is_err());
    }

    #[test]
    fn config_file_fills_unset_fields_with_defaults() {
        let file = ConfigFile::parse(
            r#"
            [stream]
            history_capacity = 64
            policy = "sweep"
            "#,
        )
        .expect("parse");
        assert_eq!(file.stream.history_capacity, 64);
        assert_eq!(file.stream.policy, PolicyKind::Sweep);
        assert_eq!(file.stream.max_packet_size, StreamConfig::default().max_packet_size);
        assert!(ConfigFile::parse("[stream]\nhistory_capacity = \"lots\"").is_err());
    }
}
