//! Fleet control plane - queues sessions and schedules them onto runners.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_control_plane::{router, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().map_err(|e| format!("Failed to load configuration: {}", e))?;
    tracing::info!("Starting control plane on {}:{}", config.host, config.port);

    let state = Arc::new(AppState::new(config.clone()));

    // Expire runners that stop polling
    {
        let scheduler = state.scheduler.clone();
        let ttl = Duration::from_secs(config.scheduler.runner_ttl_secs.max(2));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl / 2);
            loop {
                ticker.tick().await;
                scheduler.expire_runners().await;
            }
        });
    }

    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
