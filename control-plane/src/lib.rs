pub mod config;
pub mod logging;
pub mod push;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use push::PushChannel;
pub use queue::SessionQueue;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{MemorySessionStore, SessionStore};

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub queue: Arc<SessionQueue>,
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn SessionStore>,
    pub push: Arc<PushChannel>,
}

impl AppState {
    /// Wire up the default state for a config: in-memory store, one queue,
    /// one scheduler.
    pub fn new(config: Config) -> Self {
        let queue = Arc::new(SessionQueue::new());
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            SchedulerConfig {
                runner_ttl: Duration::from_secs(config.scheduler.runner_ttl_secs),
                decision_ring: config.scheduler.decision_ring,
                min_age_secs: config.scheduler.min_age_secs,
            },
        ));
        let push = Arc::new(PushChannel::new(config.push.capacity));
        Self {
            config,
            queue,
            scheduler,
            store: Arc::new(MemorySessionStore::new()),
            push,
        }
    }
}

/// Build the full API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/sessions",
            post(routes::sessions::create_session).get(routes::sessions::list_sessions),
        )
        .route("/api/v1/sessions/:id", get(routes::sessions::get_session))
        .route("/api/v1/worker/session", post(routes::worker::poll_session))
        .route("/api/v1/worker/state", post(routes::worker::post_state))
        .route(
            "/api/v1/worker/response/:instance_id",
            post(routes::worker::post_response),
        )
        .route("/api/v1/dashboard", get(routes::dashboard::dashboard))
        .route("/health", get(|| async { "ok" }))
        .layer(axum::middleware::from_fn(logging::request_logger))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
