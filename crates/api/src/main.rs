//! Homecare memory API server binary.
//!
//! Usage:
//!   homecare-api --config config.toml
//!   homecare-api --port 8080 --bind 0.0.0.0
//!
//! # Environment Variables
//!
//! - `HOMECARE_CONFIG` - Path to the TOML config file
//! - `HOMECARE_BIND_ADDR` - Server bind address (default: 127.0.0.1)
//! - `OPENAI_API_KEY` - Key for the extraction model and embeddings
//! - `DATABASE_URL` - PostgreSQL connection string for the postgres backend
//! - `LOG_FORMAT=json` - Structured JSON logs
//! - `RUST_LOG` - Log filter

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use homecare_api::{build_coordinator, serve, AppState, ServiceConfig};
use homecare_memory::Reconciler;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,homecare_api=debug,homecare_memory=debug,tower_http=debug";

#[derive(Debug, Parser)]
#[command(name = "homecare-api", version, about = "Homecare patient memory service")]
struct Args {
    /// Path to config.toml
    #[arg(short, long, env = "HOMECARE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(short, long, env = "HOMECARE_BIND_ADDR")]
    bind: Option<String>,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn spawn_reconciler(reconciler: Reconciler, interval: Duration, pending_grace: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match reconciler.run_once(pending_grace).await {
                Ok(reports) => {
                    let repaired = reports.iter().filter(|r| !r.is_clean()).count();
                    tracing::debug!(patients = reports.len(), repaired, "Reconciliation pass done");
                }
                Err(e) => tracing::warn!(error = %e, "Reconciliation pass failed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            ServiceConfig::from_file(path)?
        }
        None => {
            tracing::info!("Using default configuration");
            ServiceConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    if config.server.bind_addr == "0.0.0.0" {
        tracing::warn!(
            "Server binding to 0.0.0.0 exposes patient data on all network interfaces. \
             Put the service behind an authenticating proxy and a firewall."
        );
    }

    let coordinator = Arc::new(build_coordinator(&config).await?);

    if config.server.reconcile_interval_secs > 0 {
        spawn_reconciler(
            coordinator.reconciler(),
            Duration::from_secs(config.server.reconcile_interval_secs),
            Duration::from_secs(config.server.pending_grace_secs),
        );
    }

    let addr: SocketAddr =
        format!("{}:{}", config.server.bind_addr, config.server.port).parse()?;
    serve(
        Arc::new(AppState::new(coordinator)),
        addr,
        &config.server.cors_origins,
    )
    .await
}
