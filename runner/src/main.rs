//! Fleet runner - hosts model instances on one GPU machine and feeds them
//! sessions from the control plane.

use std::future::IntoFuture;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_runner::{Config, ControlPlaneClient, FileHandler, LocalFilestore, Supervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set RUNNER__RUNNER__ID.",
            e
        )
    })?;
    tracing::info!(
        "Starting runner {} (control plane: {})",
        config.runner.id,
        config.api.host
    );

    let client = Arc::new(ControlPlaneClient::new(
        &config.api,
        config.runner.id.clone(),
    )?);
    let files = Arc::new(FileHandler::new(
        Arc::new(LocalFilestore::new(config.filestore.root.clone())),
        config.instances.workspace_dir.clone(),
    ));

    let supervisor = Supervisor::new(config.clone(), client, files);

    // Local server the child processes pull tasks from
    let app = fleet_runner::server::router(supervisor.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Task endpoints listening on {}", addr);

    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor.run().await;
        });
    }

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down, stopping model instances");
            supervisor.stop_all().await;
        }
    }

    Ok(())
}
