use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portero::config::Config;
use portero::proxy::dispatcher::Dispatcher;
use portero::proxy::pool::BackendPool;
use portero::proxy::ProxyContext;
use portero::ProxyServer;

#[derive(Parser)]
#[command(name = "portero")]
#[command(about = "A protocol-aware proxy that presents a Redis/Valkey Cluster as a single logical server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to a TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy serving address
    #[arg(long)]
    addr: Option<String>,

    /// Password required from clients and sent to backends
    #[arg(long)]
    password: Option<String>,

    /// Comma-separated host:port list used to query the cluster topology
    #[arg(long)]
    startup_nodes: Option<String>,

    /// Backend dial timeout in seconds
    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    /// Minimum gap between topology reloads in seconds
    #[arg(long)]
    slots_reload_interval_secs: Option<u64>,

    /// Connections dialed eagerly per backend
    #[arg(long)]
    backend_init_connections: Option<usize>,

    /// Max idle connections kept per backend
    #[arg(long)]
    backend_idle_connections: Option<usize>,

    /// Where read commands go: 0 = master, 1 = slave, 2 = slave-idc
    #[arg(long)]
    read_prefer: Option<u8>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)
                .with_context(|| format!("failed to load config from {:?}", path))?,
            None => Config::default(),
        };
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(password) = self.password {
            config.password = if password.is_empty() {
                None
            } else {
                Some(password)
            };
        }
        if let Some(nodes) = self.startup_nodes {
            config.startup_nodes = nodes.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout_secs = secs;
        }
        if let Some(secs) = self.slots_reload_interval_secs {
            config.slots_reload_interval_secs = secs;
        }
        if let Some(n) = self.backend_init_connections {
            config.backend_init_connections = n;
        }
        if let Some(n) = self.backend_idle_connections {
            config.backend_idle_connections = n;
        }
        if let Some(prefer) = self.read_prefer {
            config.read_prefer = prefer;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;
    init_logging(&config);

    info!(
        "starting portero v{} on {} (startup nodes: {:?})",
        env!("CARGO_PKG_VERSION"),
        config.addr,
        config.startup_nodes
    );

    let pool = Arc::new(BackendPool::new(config.pool_config()?)?);
    let (dispatcher, handle) = Dispatcher::new(config.dispatcher_config()?, Arc::clone(&pool));

    dispatcher
        .init_slot_table()
        .await
        .context("initial cluster topology load failed")?;
    tokio::spawn(dispatcher.run());

    let ctx = Arc::new(ProxyContext {
        dispatcher: handle,
        pool,
        password: config.password.clone(),
    });
    let server = ProxyServer::new(config.addr.clone(), ctx);

    tokio::select! {
        result = server.run() => {
            result.context("proxy front-end failed")?;
        }
        _ = shutdown_signal() => {
            info!("terminated by signal");
        }
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
