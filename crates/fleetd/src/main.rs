//! fleetd: the fleetgrid manager daemon.
//!
//! Reaches the coordination store, registers this manager, and serves the
//! RPC surface until Ctrl-C. A manager without `coord_url` owns the store
//! file and serves `/coord/*` next to `/rpc/*`; the others point
//! `coord_url` at it. `fleetd coord` runs the store service alone.
//!
//! # Usage
//!
//! ```text
//! fleetd serve --config /etc/fleetgrid/fleetd.toml
//! fleetd coord --config /etc/fleetgrid/fleetd.toml
//! fleetd check-config --config /etc/fleetgrid/fleetd.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use fleetgrid_coord::{CoordService, CoordStore, LocalStore, run_reaper, server};
use fleetgrid_model::{Cipher, Layout, Registry};
use fleetgrid_rpc::{HttpSupervisor, ManagerContext, build_router};
use fleetgrid_tasks::{MaintenanceGate, TaskRunner, TaskTracker, run_eviction, watch_maintenance_file};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{FleetdConfig, LogFormat};

/// How often expired task results are evicted.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid manager daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the manager.
    Serve {
        /// Path to fleetd.toml.
        #[arg(long, default_value = "/etc/fleetgrid/fleetd.toml")]
        config: PathBuf,

        /// Override the listen address.
        #[arg(long)]
        listen: Option<String>,

        /// Override the data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Serve only the coordination store, without a manager.
    Coord {
        #[arg(long, default_value = "/etc/fleetgrid/fleetd.toml")]
        config: PathBuf,

        #[arg(long)]
        listen: Option<String>,

        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Validate a config file and print the effective configuration.
    CheckConfig {
        #[arg(long, default_value = "/etc/fleetgrid/fleetd.toml")]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
        } => {
            let mut config = FleetdConfig::load(&config)?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            init_tracing(config.log_format);
            serve(config).await
        }
        Command::Coord {
            config,
            listen,
            data_dir,
        } => {
            let mut config = FleetdConfig::load(&config)?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            init_tracing(config.log_format);
            coord(config).await
        }
        Command::CheckConfig { config } => {
            let config = FleetdConfig::load(&config)?;
            print!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

/// Open the store file under the data dir and wrap it in the service.
fn host_store(config: &FleetdConfig) -> anyhow::Result<(LocalStore, Arc<CoordService>)> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let db_path = config.data_dir.join("fleetgrid.redb");
    let store = LocalStore::open(&db_path)?;
    info!(path = ?db_path, "coordination store opened");
    let service = Arc::new(
        CoordService::new(store.clone()).with_session_timeout(config.session_timeout()?),
    );
    Ok((store, service))
}

fn reap_interval(config: &FleetdConfig) -> anyhow::Result<Duration> {
    Ok((config.session_timeout()? / 4).max(MIN_REAP_INTERVAL))
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C; shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

async fn coord(config: FleetdConfig) -> anyhow::Result<()> {
    if !config.owns_store() {
        bail!("fleetd coord serves the local store; unset coord_url");
    }
    let (_store, service) = host_store(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper_handle = tokio::spawn(run_reaper(
        service.clone(),
        reap_interval(&config)?,
        shutdown_rx,
    ));

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    info!(addr = %config.listen, "coordination service starting");
    axum::serve(listener, server::routes(service))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    let _ = reaper_handle.await;
    info!("coordination service stopped");
    Ok(())
}

async fn serve(config: FleetdConfig) -> anyhow::Result<()> {
    info!(region = %config.region, host = %config.host, "fleetd starting");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Store and registry ─────────────────────────────────────

    let mut coord_routes = None;
    let mut reaper_handle = None;
    let store = if config.owns_store() {
        let (local, service) = host_store(&config)?;
        reaper_handle = Some(tokio::spawn(run_reaper(
            service.clone(),
            reap_interval(&config)?,
            shutdown_rx.clone(),
        )));
        coord_routes = Some(server::routes(service));
        CoordStore::from(local)
    } else {
        CoordStore::connect(&config.coord_url, config.coord_request_timeout()?)
            .await
            .with_context(|| format!("reach coordination service {}", config.coord_url))?
    };

    let session = Arc::new(store.session().await?);
    if config.encryption_secret.is_empty() {
        warn!("encryption_secret is empty; depender data is sealed with a blank key");
    }
    let registry = Registry::new(
        store,
        session.clone(),
        Layout::new(config.store_root.clone())?,
        config.port_range()?,
        Cipher::from_secret(&config.encryption_secret),
    );
    registry.bootstrap().await?;

    // ── Self-registration ──────────────────────────────────────

    registry
        .register_manager(&config.region, &config.host, config.cname())
        .await?;
    for grant in &config.roles {
        registry
            .set_manager_role(&config.region, &config.host, &grant.role, &grant.rtype, true)
            .await?;
    }
    info!(roles = config.roles.len(), "manager registered");

    // ── Context ────────────────────────────────────────────────

    let tracker = TaskTracker::new(config.result_duration()?);
    let gate = MaintenanceGate::new();
    let runner = TaskRunner::new(tracker.clone(), gate.clone());
    let supervisor =
        HttpSupervisor::new(config.supervisor_port).with_timeout(config.supervisor_timeout()?);
    let ctx = Arc::new(
        ManagerContext::new(
            config.region.clone(),
            config.host.clone(),
            registry,
            runner,
            Arc::new(config.directory()),
            Arc::new(supervisor),
        )
        .with_auth(config.auth_settings())
        .with_supervisor_hosts(config.supervisors.clone())
        .with_result_wait(config.result_wait()?),
    );
    if ctx.auth.skip_authorization {
        warn!("authorization checks are disabled");
    }

    // ── Background loops ───────────────────────────────────────

    let maintenance_handle = tokio::spawn(watch_maintenance_file(
        gate,
        config.maintenance_file.clone(),
        config.maintenance_check_interval()?,
        shutdown_rx.clone(),
    ));
    let eviction_handle = tokio::spawn(run_eviction(tracker, EVICTION_INTERVAL, shutdown_rx));

    // ── RPC server ─────────────────────────────────────────────

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    info!(addr = %config.listen, "RPC server starting");

    let mut router = build_router(ctx);
    if let Some(routes) = coord_routes {
        info!("serving the coordination store to other managers");
        router = router.merge(routes);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    let _ = maintenance_handle.await;
    let _ = eviction_handle.await;
    if let Some(handle) = reaper_handle {
        let _ = handle.await;
    }
    if let Err(e) = session.close().await {
        warn!(error = %e, "session close failed; the lease will expire");
    }

    info!("fleetd stopped");
    Ok(())
}
