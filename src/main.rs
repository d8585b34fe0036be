use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use socks5lb::config::{self, Config};
use socks5lb::lb::{Backend, Pool};
use socks5lb::{Server, APP_NAME};

#[derive(Parser)]
#[command(name = "socks5lb")]
#[command(version, about = "SOCKS5-aware TCP load balancer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short = 'c', long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load balancer
    Serve,

    /// Probe all configured backends once and report their health
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    info!("{} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = config::load_from_yaml(&cli.config)?;
    let pool = build_pool(&config);

    match cli.command {
        Commands::Serve => serve(pool, config).await,
        Commands::Check => check(pool).await,
    }
}

/// One canonical pool, populated from configuration and handed to every
/// component that needs it
fn build_pool(config: &Config) -> Arc<Pool> {
    let pool = Arc::new(Pool::new());

    for backend_config in &config.backends {
        let addr = backend_config.addr.clone();
        if let Err(e) = pool.add(Backend::from_config(backend_config.clone())) {
            error!("skipping backend {}: {}", addr, e);
        }
    }

    pool
}

async fn serve(pool: Arc<Pool>, config: Config) -> Result<()> {
    let server = Server::new(pool, config.server);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            server.stop();
            Ok(())
        }
    }
}

async fn check(pool: Arc<Pool>) -> Result<()> {
    if pool.is_empty() {
        anyhow::bail!("no backends configured");
    }

    pool.check_all().await;

    let mut healthy = 0usize;
    for backend in pool.all() {
        let status = if backend.alive() {
            healthy += 1;
            "alive"
        } else {
            "dead"
        };
        println!("{}\t{}", backend.addr, status);
    }

    if healthy == 0 {
        anyhow::bail!("no healthy backends");
    }

    Ok(())
}
