use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use callboard_core::CALLS_GROUP;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    broadcast::{DEFAULT_CHANNEL_PREFIX, DEFAULT_GROUP_CAPACITY},
    store::DEFAULT_KEY_PREFIX,
};

#[derive(Debug, Parser)]
#[command(
    name = "callboard-server",
    author,
    version,
    about = "Live call-center state broadcast server"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to a running server and print every frame it sends.
    Watch {
        /// WebSocket endpoint to watch.
        #[arg(long, default_value = "ws://127.0.0.1:8090/ws/calls")]
        url: String,

        /// Token appended as `?token=` when the server requires one.
        #[arg(long, env = "CALLBOARD_WS_TOKEN")]
        token: Option<String>,

        /// Send a `ping` frame on this interval, in seconds.
        #[arg(long)]
        ping_secs: Option<u64>,

        /// Exit after this many frames.
        #[arg(long)]
        count: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FanoutBackend {
    Redis,
    Local,
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP and WebSocket listener to.
    #[arg(long, env = "CALLBOARD_LISTEN_ADDR", default_value = "127.0.0.1:8090")]
    pub listen_addr: String,

    /// Redis connection URI for fingerprints and cross-process fan-out.
    #[arg(long, env = "CALLBOARD_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Where last-published fingerprints are kept.
    #[arg(long, env = "CALLBOARD_STORE", value_enum, default_value_t = StoreBackend::Redis)]
    pub store: StoreBackend,

    /// How data updates reach sessions.
    #[arg(long, env = "CALLBOARD_FANOUT", value_enum, default_value_t = FanoutBackend::Redis)]
    pub fanout: FanoutBackend,

    #[arg(long, env = "CALLBOARD_FINGERPRINT_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub fingerprint_prefix: String,

    #[arg(long, env = "CALLBOARD_CHANNEL_PREFIX", default_value = DEFAULT_CHANNEL_PREFIX)]
    pub channel_prefix: String,

    /// Dashboard proxy endpoint that forwards vendor API calls.
    #[arg(
        long,
        env = "CALLBOARD_UPSTREAM_URL",
        default_value = "http://127.0.0.1:8000/api/dashboards/proxy/generic/"
    )]
    pub upstream_url: String,

    /// Serve datasets from a local JSON file instead of the proxy.
    #[arg(long, env = "CALLBOARD_UPSTREAM_FILE")]
    pub upstream_file: Option<PathBuf>,

    #[arg(long, env = "CALLBOARD_CALLS_TIMEOUT_SECS", default_value_t = 15)]
    pub calls_timeout_secs: u64,

    #[arg(long, env = "CALLBOARD_QUEUES_TIMEOUT_SECS", default_value_t = 30)]
    pub queues_timeout_secs: u64,

    #[arg(long, env = "CALLBOARD_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    #[arg(long, env = "CALLBOARD_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    #[arg(long, env = "CALLBOARD_HEARTBEAT_SECS", default_value_t = 20)]
    pub heartbeat_secs: u64,

    /// Buffered updates per group before slow sessions start skipping.
    #[arg(long, env = "CALLBOARD_GROUP_CAPACITY", default_value_t = DEFAULT_GROUP_CAPACITY)]
    pub group_capacity: usize,

    /// Require `?token=<value>` on WebSocket upgrades.
    #[arg(long, env = "CALLBOARD_WS_TOKEN")]
    pub ws_token: Option<String>,

    /// Serve sessions only; another process runs the poller.
    #[arg(long, env = "CALLBOARD_NO_POLLER", default_value_t = false)]
    pub no_poller: bool,

    #[arg(long, env = "CALLBOARD_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub enum UpstreamConfig {
    Proxy { url: String },
    File { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub store: StoreBackend,
    pub fanout: FanoutBackend,
    pub fingerprint_prefix: String,
    pub channel_prefix: String,
    pub group: String,
    pub upstream: UpstreamConfig,
    pub calls_timeout: Duration,
    pub queues_timeout: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub group_capacity: usize,
    pub ws_token: Option<String>,
    pub run_poller: bool,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn needs_redis(&self) -> bool {
        self.store == StoreBackend::Redis || self.fanout == FanoutBackend::Redis
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        for (name, value) in [
            ("calls timeout", args.calls_timeout_secs),
            ("queues timeout", args.queues_timeout_secs),
            ("connect timeout", args.connect_timeout_secs),
            ("poll interval", args.poll_interval_secs),
            ("heartbeat interval", args.heartbeat_secs),
        ] {
            if value == 0 {
                bail!("{name} must be at least one second");
            }
        }
        if args.group_capacity == 0 {
            bail!("group capacity must be at least 1");
        }

        let upstream = match args.upstream_file {
            Some(path) => UpstreamConfig::File { path },
            None => {
                reqwest::Url::parse(&args.upstream_url)
                    .with_context(|| format!("invalid upstream url: {}", args.upstream_url))?;
                UpstreamConfig::Proxy {
                    url: args.upstream_url,
                }
            }
        };

        Ok(ServerConfig {
            listen_addr,
            redis_url: args.redis_url,
            store: args.store,
            fanout: args.fanout,
            fingerprint_prefix: args.fingerprint_prefix,
            channel_prefix: args.channel_prefix,
            group: CALLS_GROUP.to_string(),
            upstream,
            calls_timeout: Duration::from_secs(args.calls_timeout_secs),
            queues_timeout: Duration::from_secs(args.queues_timeout_secs),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
            group_capacity: args.group_capacity,
            ws_token: args.ws_token.filter(|token| !token.is_empty()),
            run_poller: !args.no_poller,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
