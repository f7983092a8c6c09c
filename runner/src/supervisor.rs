//! The runner supervisor.
//!
//! Owns every model instance on this host. One tick at a time it reclaims
//! dead instances, evicts idle ones, and — when there is memory to spare —
//! polls the control plane for a session, routing the result onto a live
//! instance's buffer or spawning a fresh instance for it.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use fleet_common::{
    ModelName, RejectEntry, RunnerState, RunnerTaskResponse, Session, SessionFilter,
};

use crate::adapter::{adapter_for, ModelAdapter};
use crate::client::ControlPlaneClient;
use crate::config::Config;
use crate::error::Result;
use crate::files::FileHandler;
use crate::instance::{ModelInstance, ResponseSender};

const RESPONSE_RETRY_LIMIT: u32 = 5;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;

pub struct Supervisor {
    config: Config,
    client: Arc<ControlPlaneClient>,
    files: Arc<FileHandler>,
    adapters: fn(ModelName) -> Arc<dyn ModelAdapter>,
    instances: RwLock<HashMap<String, Arc<ModelInstance>>>,
    response_tx: ResponseSender,
    response_rx: std::sync::Mutex<Option<mpsc::Receiver<(String, RunnerTaskResponse)>>>,
    started: DateTime<Utc>,
    poll_errors: AtomicU32,
}

impl Supervisor {
    pub fn new(config: Config, client: Arc<ControlPlaneClient>, files: Arc<FileHandler>) -> Arc<Self> {
        Self::with_adapters(config, client, files, adapter_for)
    }

    /// Like [`Supervisor::new`] but with a custom adapter lookup. Tests use
    /// this to run instances over stub commands.
    pub fn with_adapters(
        config: Config,
        client: Arc<ControlPlaneClient>,
        files: Arc<FileHandler>,
        adapters: fn(ModelName) -> Arc<dyn ModelAdapter>,
    ) -> Arc<Self> {
        let (response_tx, response_rx) = mpsc::channel(256);
        Arc::new(Self {
            config,
            client,
            files,
            adapters,
            instances: RwLock::new(HashMap::new()),
            response_tx,
            response_rx: std::sync::Mutex::new(Some(response_rx)),
            started: Utc::now(),
            poll_errors: AtomicU32::new(0),
        })
    }

    /// Run the supervisor until the process exits: response forwarding,
    /// heartbeats, and the tick loop.
    pub async fn run(self: Arc<Self>) {
        self.start_response_forwarder();
        self.spawn_heartbeat();

        let period = Duration::from_millis(self.config.instances.poll_period_ms.max(10));
        loop {
            match self.tick().await {
                Ok(()) => {
                    self.poll_errors.store(0, Ordering::SeqCst);
                    tokio::time::sleep(period).await;
                }
                Err(e) => {
                    let errors = self.poll_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = backoff_delay(errors);
                    tracing::warn!(
                        "poll failed ({} consecutive): {}; retrying in {:?}",
                        errors,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Forward task responses to the control plane, with bounded retries
    /// so a transient upload failure never loses a result silently.
    pub fn start_response_forwarder(self: &Arc<Self>) {
        let mut rx = self
            .response_rx
            .lock()
            .unwrap()
            .take()
            .expect("supervisor already running");
        let client = self.client.clone();
        tokio::spawn(async move {
            while let Some((instance_id, response)) = rx.recv().await {
                let mut attempt = 0;
                loop {
                    match client.post_response(&instance_id, &response).await {
                        Ok(()) => break,
                        Err(e) => {
                            attempt += 1;
                            if attempt >= RESPONSE_RETRY_LIMIT {
                                tracing::error!(
                                    "dropping response for session {} after {} attempts: {}",
                                    response.session_id,
                                    attempt,
                                    e
                                );
                                break;
                            }
                            tokio::time::sleep(backoff_delay(attempt)).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let supervisor = self.clone();
        let interval =
            Duration::from_secs(self.config.instances.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let state = supervisor.runner_state().await;
                if let Err(e) = supervisor.client.post_state(&state).await {
                    tracing::warn!("heartbeat failed: {}", e);
                }
            }
        });
    }

    /// One supervisor pass: reap, evict, then poll if memory allows.
    pub async fn tick(&self) -> Result<()> {
        self.reap_stopped().await;
        self.evict_stale().await;

        let free = self.free_memory().await;
        if free < ModelName::lowest_memory_requirement() {
            // no model fits; don't bother the scheduler
            return Ok(());
        }

        let filter = self.build_filter(free).await;
        match self.client.poll_session(&filter).await? {
            Some(session) => self.route_session(session).await,
            None => Ok(()),
        }
    }

    /// Remove instances whose child process has exited.
    async fn reap_stopped(&self) {
        let mut instances = self.instances.write().await;
        instances.retain(|id, instance| {
            if instance.is_stopped() {
                tracing::info!("reaping stopped instance {}", id);
                false
            } else {
                true
            }
        });
    }

    /// Stop and remove instances idle past the configured timeout. Never
    /// touches an instance holding a session in any slot.
    pub async fn evict_stale(&self) {
        let stale: Vec<Arc<ModelInstance>> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .filter(|i| i.is_stale())
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let mut instances = self.instances.write().await;
        for instance in stale {
            tracing::info!(
                "evicting idle instance {} (inactive for over {}s)",
                instance.id,
                self.config.instances.timeout_secs
            );
            instance.stop();
            instances.remove(&instance.id);
        }
    }

    /// Total memory minus the footprints of every live instance.
    pub async fn free_memory(&self) -> u64 {
        let used: u64 = {
            let instances = self.instances.read().await;
            instances.values().map(|i| i.memory_usage()).sum()
        };
        self.config.runner.total_memory.saturating_sub(used)
    }

    /// The broad filter for this tick. Instances whose buffer is occupied
    /// reject their (model, mode) pair so the scheduler cannot hand us a
    /// second copy of something we cannot place.
    async fn build_filter(&self, free_memory: u64) -> SessionFilter {
        let instances = self.instances.read().await;
        let mut reject: Vec<RejectEntry> = vec![];
        for instance in instances.values() {
            if !instance.can_accept() {
                let entry = RejectEntry {
                    model_name: instance.model_name(),
                    mode: instance.mode(),
                };
                if !reject.contains(&entry) {
                    reject.push(entry);
                }
            }
        }
        SessionFilter {
            mode: None,
            session_type: None,
            model_name: None,
            lora_dir: String::new(),
            memory: free_memory,
            reject,
            older_secs: 0,
        }
    }

    /// Place a session the scheduler handed us: onto a matching live
    /// instance's buffer when one exists, otherwise onto a new instance.
    pub async fn route_session(&self, session: Session) -> Result<()> {
        {
            let instances = self.instances.read().await;
            if let Some(instance) = instances
                .values()
                .find(|i| i.can_accept() && i.matches(&session))
            {
                tracing::info!(
                    "routing session {} to live instance {}",
                    session.id,
                    instance.id
                );
                instance.assign(session, false);
                return Ok(());
            }
        }

        let adapter = (self.adapters)(session.model_name);
        let instance = ModelInstance::new(
            &session,
            adapter,
            &self.config.next_task_url(),
            &self.config.initial_session_url(),
            self.config.instances.models_dir.clone(),
            self.config.instances.timeout_secs,
            self.files.clone(),
            self.response_tx.clone(),
        );

        if let Err(e) = instance.start() {
            tracing::error!(
                "failed to start instance for session {}: {}",
                session.id,
                e
            );
            // report the failure; the session is not re-enqueued here
            instance.error_session(&session, &e.to_string()).await;
            return Ok(());
        }

        tracing::info!(
            "spawned instance {} for session {} ({} {:?})",
            instance.id,
            session.id,
            session.model_name,
            session.mode
        );
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        instance.assign(session, true);
        Ok(())
    }

    pub async fn get_instance(&self, id: &str) -> Option<Arc<ModelInstance>> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn instances(&self) -> Vec<Arc<ModelInstance>> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Heartbeat payload for the control plane.
    pub async fn runner_state(&self) -> RunnerState {
        let model_instances = {
            let instances = self.instances.read().await;
            instances.values().map(|i| i.state()).collect()
        };
        let free = self.free_memory().await;
        RunnerState {
            id: self.config.runner.id.clone(),
            created: self.started,
            total_memory: self.config.runner.total_memory,
            free_memory: free as i64,
            labels: self.config.runner.labels.clone(),
            model_instances,
            scheduling_decisions: vec![],
        }
    }

    /// Kill every instance. Called on shutdown.
    pub async fn stop_all(&self) {
        let instances = self.instances.read().await;
        for instance in instances.values() {
            instance.stop();
        }
    }
}

/// Exponential backoff with a little jitter so a fleet of runners does not
/// retry in lockstep.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(6);
    let base = BACKOFF_BASE_MS.saturating_mul(1 << exp);
    let capped = base.min(BACKOFF_CAP_MS);
    let jitter = RandomState::new().build_hasher().finish() % 250;
    Duration::from_millis(capped + jitter)
}
