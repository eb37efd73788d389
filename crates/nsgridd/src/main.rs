//! nsgridd — the nsgrid daemon.
//!
//! Single binary that assembles the provisioning subsystems:
//! - Cluster registry (redb)
//! - Port allocator
//! - Process supervisor
//! - Readiness aggregator
//! - Provisioner + deadline sweeper
//! - REST API
//!
//! # Usage
//!
//! ```text
//! nsgridd serve --config /etc/nsgrid/nsgrid.toml --listen 0.0.0.0:7400
//! nsgridd check-config --config /etc/nsgrid/nsgrid.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use nsgrid_api::{ApiState, build_router};
use nsgrid_core::NsgridConfig;
use nsgrid_health::{ReadinessAggregator, dns_probe_for};
use nsgrid_ports::PortAllocator;
use nsgrid_provision::{KeyIssuer, NamespaceGuard, ProvisionSettings, Provisioner};
use nsgrid_state::StateStore;
use nsgrid_supervisor::{ProcessLauncher, Supervisor, SupervisorSettings};

#[derive(Parser)]
#[command(name = "nsgridd", about = "nsgrid daemon: per-namespace cluster provisioning")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the provisioning daemon.
    Serve {
        /// Path to nsgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Override `data.root`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Validate a configuration file and print the resolved settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(root) = data_dir {
                config.data.root = root;
            }
            run_serve(config).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nsgridd=debug,nsgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<NsgridConfig> {
    match path {
        Some(path) => NsgridConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(NsgridConfig::default()),
    }
}

fn check_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    let timings = config.provisioning.timings()?;
    println!("{}", config.to_toml_string()?);
    println!(
        "# port blocks: {} ({}..{})",
        config.ports.capacity(),
        config.ports.range_start,
        u32::from(config.ports.range_start) + config.ports.range_size,
    );
    println!(
        "# provisioning deadline {:?}, startup window {:?}",
        timings.deadline, timings.startup_window
    );
    Ok(())
}

async fn run_serve(config: NsgridConfig) -> anyhow::Result<()> {
    config.validate()?;
    let timings = config.provisioning.timings()?;
    info!("nsgrid daemon starting");

    std::fs::create_dir_all(&config.data.root)
        .with_context(|| format!("creating data root {}", config.data.root.display()))?;

    // ── Initialize subsystems ──────────────────────────────────

    let registry_path = config.data.registry_path();
    let registry = StateStore::open(&registry_path)?;
    info!(path = ?registry_path, "cluster registry opened");

    let ports = Arc::new(PortAllocator::new(
        config.ports.range_start,
        config.ports.range_size,
    ));
    info!(
        range_start = config.ports.range_start,
        capacity = ports.capacity(),
        "port allocator initialized"
    );

    let launcher = Arc::new(ProcessLauncher::new(
        config.services.clone(),
        timings.probe_timeout,
    ));
    let supervisor = Arc::new(Supervisor::new(
        launcher,
        SupervisorSettings {
            host: config.services.host.clone(),
            data_root: config.data.namespaces_dir(),
            startup_window: timings.startup_window,
            startup_poll: Duration::from_millis(250),
            liveness_interval: timings.liveness_interval,
            unhealthy_threshold: timings.unhealthy_threshold,
        },
    ));

    let readiness = ReadinessAggregator::http(
        &config.services.sql.health_path,
        &config.services.cache.health_path,
        &config.services.gateway.health_path,
        timings.probe_timeout,
        dns_probe_for(&config.dns, registry.clone()),
    );

    let provisioner = Provisioner::new(
        registry.clone(),
        ports,
        supervisor,
        readiness,
        ProvisionSettings {
            deadline: timings.deadline,
            probe_interval: timings.probe_interval,
            host: config.services.host.clone(),
        },
    );

    let recovered = provisioner.recover()?;
    if recovered > 0 {
        warn!(clusters = recovered, "clusters from previous run marked failed");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = {
        let provisioner = provisioner.clone();
        let interval = timings.probe_interval;
        tokio::spawn(async move {
            provisioner.run_sweeper(interval, shutdown_rx).await;
        })
    };

    // ── Start API server ───────────────────────────────────────

    if config.server.admin_token.is_none() {
        warn!("no admin token configured; operator endpoints are disabled");
    }
    let state = ApiState {
        provisioner: provisioner.clone(),
        keys: KeyIssuer::new(registry.clone()),
        guard: NamespaceGuard::new(
            registry,
            config.default_cluster.clone(),
            &config.services.host,
        ),
        public_url: config.server.public_url.clone(),
        admin_token: config.server.admin_token.clone(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!(addr = %config.server.listen, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = sweeper.await;
    provisioner.shutdown().await;

    info!("nsgrid daemon stopped");
    Ok(())
}
