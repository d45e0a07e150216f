use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard::admin::{AdminServer, PKG_NAME, VERSION};
use switchyard::config::Config;
use switchyard::reconcile::Reconciler;
use switchyard::supervisor::Supervisor;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchyard=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config.path.display(),
        port_range = %format!("{}..={}", config.port_range.min, config.port_range.max),
        "Starting orchestrator"
    );

    // Stop flag: the single cancellation path, observed by the supervisor
    // before any respawn and by the admin accept loop
    let (stop_tx, stop_rx) = watch::channel(false);

    let (supervisor, exit_rx) =
        Supervisor::new(&config.worker.command, config.respawn, stop_rx)?;
    let (respawn_tx, respawn_rx) = mpsc::unbounded_channel();
    tokio::spawn(Arc::clone(&supervisor).run_exit_loop(exit_rx, respawn_tx));

    let admin_port = config.admin_port;
    let reconciler = Arc::new(Reconciler::new(config, Arc::clone(&supervisor))?);
    tokio::spawn(Arc::clone(&reconciler).run_respawn_loop(respawn_rx));

    // Bootstrap pass; the admin listener only starts once this succeeds
    reconciler.reconcile().await.map_err(|e| {
        error!(error = %e, "Bootstrap reconciliation failed");
        e
    })?;

    // SIGINT maps onto the same stop path as the admin /stop route
    {
        let stop_tx = stop_tx.clone();
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping");
                let _ = stop_tx.send(true);
                supervisor.terminate_all();
            }
        });
    }

    let bind_addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], admin_port));
    AdminServer::new(bind_addr, Arc::clone(&reconciler), stop_tx)
        .run()
        .await?;

    info!("Shutdown complete");
    Ok(())
}
