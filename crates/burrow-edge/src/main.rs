use anyhow::{Context, Result};
use burrow_edge::control_plane::ControlPlaneClient;
use burrow_edge::registry::SharedRegistry;
use burrow_edge::server::{self, AppState};
use burrow_edge::store::{RedisStore, Store};
use burrow_edge::{pod, telemetry};
use burrowconf::EdgeConfig;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// The Burrow edge gateway
///
/// Routes public HTTP requests through agent-held reverse tunnels.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/burrow/config.toml
/// 3. ~/.config/burrow/config.toml
/// 4. ./burrow.toml (or --config path)
/// 5. Environment variables (HOST, PORT, STORE_HOST, ...)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./burrow.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = EdgeConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {var}");
            }
        }
        println!();
        print!("{}", config.to_toml());
        return Ok(());
    }

    telemetry::init(&config.telemetry).context("Failed to initialize tracing")?;

    let pod_id = pod::generate_pod_id();
    info!("🕳️  Burrow edge gateway starting (pod: {})", pod_id);
    for path in &sources.files {
        info!("   config: {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("   env overrides: {:?}", sources.env_overrides);
    }

    // Both collaborators must come up or the pod is useless; fail fast.
    let store = RedisStore::connect(&config.store.url())
        .await
        .context("Failed to connect to shared store")?;
    info!(
        "   shared store: {}:{}/{}",
        config.store.host, config.store.port, config.store.db
    );

    let control_plane = Arc::new(
        ControlPlaneClient::new(&config.control_plane)
            .context("Failed to initialize Control Plane client")?,
    );
    info!("   control plane: {}", config.control_plane.url);

    let config = Arc::new(config);
    let registry = Arc::new(SharedRegistry::new(
        Arc::new(store) as Arc<dyn Store>,
        pod_id.clone(),
        config.tunnel.registry_ttl(),
        config.tunnel.slug_cache_ttl(),
    ));

    let state = AppState::new(config.clone(), registry.clone(), control_plane);
    let app = server::router(state);

    let addr = config.bind.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("🕳️  Burrow edge ready!");
    info!("   Public: http://{}/local_tunnel/{{slug}}/...", addr);
    info!("   Agents: ws://{}/ws/{{tunnel_id}}", addr);
    info!("   Health: GET http://{}/health/live", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(pod_id.clone()))
        .await
        .context("Server error")?;

    info!("Shutting down edge gateway (pod: {})", pod_id);
    if let Err(err) = registry.teardown().await {
        warn!("store cleanup failed during shutdown: {}", err);
    }
    telemetry::shutdown();

    info!("Shutdown complete");
    Ok(())
}

/// Resolves when the pod is asked to stop; the registry teardown that
/// erases this pod's ownership records runs right after.
async fn shutdown_signal(pod_id: String) {
    let sigterm = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!("cannot listen for SIGTERM: {}", err);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, draining pod {}", pod_id);
        }
        _ = sigterm => {
            info!("SIGTERM received, draining pod {}", pod_id);
        }
    }
}
