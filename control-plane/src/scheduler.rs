//! The global scheduler.
//!
//! Tracks the last reported state of every runner and, on each runner poll,
//! selects at most one session from the queue. Matching is two-phase: a
//! warm pass pinned to the runner's idle instances, then a cold pass with
//! the runner's broad filter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;

use fleet_common::{RunnerState, SchedulingDecision, Session, SessionFilter};

use crate::queue::SessionQueue;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Runners that have not polled for this long are expired.
    pub runner_ttl: Duration,
    /// Bound on the per-runner and global decision rings.
    pub decision_ring: usize,
    /// Soft rate limit: cold matches only consider sessions at least this
    /// old. Zero disables it.
    pub min_age_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            runner_ttl: Duration::from_secs(60),
            decision_ring: 256,
            min_age_secs: 0,
        }
    }
}

/// One tracked runner: its last heartbeat plus scheduler bookkeeping.
struct TrackedRunner {
    state: RunnerState,
    last_seen: Instant,
    decisions: VecDeque<String>,
}

/// Matches polling runners to queued sessions.
pub struct Scheduler {
    queue: Arc<SessionQueue>,
    config: SchedulerConfig,
    runners: RwLock<HashMap<String, TrackedRunner>>,
    global_decisions: std::sync::Mutex<VecDeque<SchedulingDecision>>,
}

impl Scheduler {
    pub fn new(queue: Arc<SessionQueue>, config: SchedulerConfig) -> Self {
        Self {
            queue,
            config,
            runners: RwLock::new(HashMap::new()),
            global_decisions: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Record a runner heartbeat. Creates the tracked entry on first
    /// contact and refreshes it on every report.
    pub async fn update_runner(&self, state: RunnerState) {
        let mut runners = self.runners.write().await;
        match runners.get_mut(&state.id) {
            Some(tracked) => {
                tracked.state = state;
                tracked.last_seen = Instant::now();
            }
            None => {
                tracing::info!("runner {} connected", state.id);
                runners.insert(
                    state.id.clone(),
                    TrackedRunner {
                        state,
                        last_seen: Instant::now(),
                        decisions: VecDeque::new(),
                    },
                );
            }
        }
    }

    /// Drop runners that have stopped polling. Returns the expired IDs.
    pub async fn expire_runners(&self) -> Vec<String> {
        let ttl = self.config.runner_ttl;
        let mut expired = vec![];
        let mut runners = self.runners.write().await;
        runners.retain(|id, tracked| {
            if tracked.last_seen.elapsed() > ttl {
                tracing::warn!("expiring runner {} (no poll for {:?})", id, ttl);
                expired.push(id.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Handle one runner poll: pick at most one session for it.
    ///
    /// The warm phase pins a filter to each idle instance reported in the
    /// runner's last heartbeat, so work lands on an already loaded model
    /// without a spawn. The cold phase falls back to the broad filter the
    /// runner sent; the runner is expected to spawn a new instance for a
    /// cold result.
    pub async fn poll(&self, runner_id: &str, mut filter: SessionFilter) -> Option<Session> {
        if filter.older_secs == 0 {
            filter.older_secs = self.config.min_age_secs;
        }

        // warm phase
        for warm in self.warm_filters(runner_id).await {
            if let Some(session) = self.queue.take_matching(&warm) {
                self.record_match(runner_id, &session, &warm).await;
                return Some(session);
            }
        }

        // cold phase
        match self.queue.take_matching(&filter) {
            Some(session) => {
                self.record_match(runner_id, &session, &filter).await;
                Some(session)
            }
            None => {
                self.record_miss(runner_id, &filter).await;
                None
            }
        }
    }

    /// Narrow filters for each idle instance in the runner's last
    /// heartbeat, in reported order.
    async fn warm_filters(&self, runner_id: &str) -> Vec<SessionFilter> {
        let runners = self.runners.read().await;
        let Some(tracked) = runners.get(runner_id) else {
            return vec![];
        };
        tracked
            .state
            .model_instances
            .iter()
            .filter(|i| i.current_session.is_none() && !i.stale)
            .map(|i| SessionFilter {
                mode: Some(i.mode),
                session_type: Some(i.model_name.session_type()),
                model_name: Some(i.model_name),
                lora_dir: i.lora_dir.clone(),
                memory: 0,
                reject: vec![],
                older_secs: 0,
            })
            .collect()
    }

    async fn record_match(&self, runner_id: &str, session: &Session, filter: &SessionFilter) {
        let interaction_id = session
            .working_interaction()
            .map(|i| i.id.clone())
            .unwrap_or_default();

        let line = format!(
            "match session={} model={} mode={:?}",
            session.id, session.model_name, session.mode
        );
        self.push_runner_decision(runner_id, line).await;

        let decision = SchedulingDecision {
            created: Utc::now(),
            runner_id: runner_id.to_string(),
            session_id: session.id.clone(),
            interaction_id,
            model_name: session.model_name,
            mode: session.mode,
            filter: filter.clone(),
        };
        let mut global = self.global_decisions.lock().unwrap();
        global.push_front(decision);
        global.truncate(self.config.decision_ring);
    }

    async fn record_miss(&self, runner_id: &str, filter: &SessionFilter) {
        let line = format!(
            "no match: queue_depth={} memory={} reject={}",
            self.queue.len(),
            filter.memory,
            filter.reject.len()
        );
        self.push_runner_decision(runner_id, line).await;
    }

    async fn push_runner_decision(&self, runner_id: &str, line: String) {
        tracing::debug!("scheduling decision for {}: {}", runner_id, line);
        let mut runners = self.runners.write().await;
        if let Some(tracked) = runners.get_mut(runner_id) {
            tracked.decisions.push_front(line);
            tracked.decisions.truncate(self.config.decision_ring);
        }
    }

    /// Dashboard view of every tracked runner, decision ring included.
    pub async fn runner_states(&self) -> Vec<RunnerState> {
        let runners = self.runners.read().await;
        runners
            .values()
            .map(|tracked| {
                let mut state = tracked.state.clone();
                state.scheduling_decisions = tracked.decisions.iter().cloned().collect();
                state
            })
            .collect()
    }

    /// Recent global scheduling matches, newest first.
    pub fn global_decisions(&self) -> Vec<SchedulingDecision> {
        self.global_decisions.lock().unwrap().iter().cloned().collect()
    }
}
