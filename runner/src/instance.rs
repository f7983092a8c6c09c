//! A model instance: one child process with one model loaded.
//!
//! The instance runs sessions serially and overlaps the next session's file
//! prefetch with the current session's compute. A session moves through
//! three slots:
//!
//! - `queued`: assigned by the supervisor, files still downloading
//! - `next`: fully prepared, waiting for the child to pull it
//! - `current`: being executed by the child right now
//!
//! `current` and `next` are always distinct sessions and `queued` is never
//! also `next`. All slot transitions happen under one mutex; the prefetch
//! task commits its result through [`ModelInstance::assign`]'s completion
//! path rather than poking fields directly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use fleet_common::{
    ModelInstanceState, RunnerProcessConfig, RunnerTask, RunnerTaskResponse, Session,
    SessionFilter, LORA_DIR_NONE,
};

use crate::adapter::ModelAdapter;
use crate::error::{Result, RunnerError};
use crate::files::FileHandler;
use crate::stream::{ConsoleSink, ParserSink, TailBuffer, TailSink, Tee};

const STDERR_TAIL_BYTES: usize = 10 * 1024;
const JOB_HISTORY_LEN: usize = 8;

/// Where an instance is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Created, child process booting, initial session downloading.
    Initializing,
    /// A current session is set.
    Running,
    /// No current session; ready for the next one.
    Idle,
    /// Child exited or was killed. The supervisor reaps these.
    Stopped,
}

struct Slots {
    status: InstanceStatus,
    current: Option<Session>,
    next: Option<Session>,
    queued: Option<Session>,
}

enum ChildEvent {
    Response(RunnerTaskResponse),
    Exited(std::io::Result<std::process::ExitStatus>),
}

/// Responses leave the instance tagged with its ID so the forwarder knows
/// which worker endpoint to post to.
pub type ResponseSender = mpsc::Sender<(String, RunnerTaskResponse)>;

pub struct ModelInstance {
    pub id: String,
    model_name: fleet_common::ModelName,
    mode: fleet_common::SessionMode,
    /// The fine-tune artifact this instance is pinned to. Hoisted from the
    /// initial session: an empty lora dir becomes [`LORA_DIR_NONE`] here so
    /// the instance only ever asks for sessions with explicitly no
    /// artifact, rather than "don't care".
    lora_dir: String,
    initial_session_id: String,
    filter: SessionFilter,
    adapter: Arc<dyn ModelAdapter>,
    process_config: RunnerProcessConfig,
    models_dir: PathBuf,
    timeout_secs: u64,

    slots: Mutex<Slots>,
    /// Wakes the child's long-poll when a prepared task becomes available.
    task_ready: Notify,
    last_activity: AtomicI64,
    pid: AtomicU32,
    job_history: Mutex<VecDeque<fleet_common::SessionSummary>>,
    responses: ResponseSender,
    files: Arc<FileHandler>,
    stderr_tail: Arc<Mutex<TailBuffer>>,
}

impl ModelInstance {
    /// Build an instance for the session that caused it to exist. The
    /// child process is not started yet; call [`ModelInstance::start`].
    pub fn new(
        initial_session: &Session,
        adapter: Arc<dyn ModelAdapter>,
        next_task_url: &str,
        initial_session_url: &str,
        models_dir: impl Into<PathBuf>,
        timeout_secs: u64,
        files: Arc<FileHandler>,
        responses: ResponseSender,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();

        let lora_dir = if initial_session.lora_dir.is_empty() {
            LORA_DIR_NONE.to_string()
        } else {
            initial_session.lora_dir.clone()
        };

        let filter = SessionFilter {
            mode: Some(initial_session.mode),
            session_type: Some(initial_session.session_type),
            model_name: Some(initial_session.model_name),
            lora_dir: lora_dir.clone(),
            memory: 0,
            reject: vec![],
            older_secs: 0,
        };

        let process_config = RunnerProcessConfig {
            instance_id: id.clone(),
            next_task_url: format!("{}/{}", next_task_url, id),
            initial_session_url: format!("{}/{}", initial_session_url, id),
        };

        Arc::new(Self {
            id,
            model_name: initial_session.model_name,
            mode: initial_session.mode,
            lora_dir,
            initial_session_id: initial_session.id.clone(),
            filter,
            adapter,
            process_config,
            models_dir: models_dir.into(),
            timeout_secs,
            slots: Mutex::new(Slots {
                status: InstanceStatus::Initializing,
                current: None,
                next: None,
                queued: None,
            }),
            task_ready: Notify::new(),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
            pid: AtomicU32::new(0),
            job_history: Mutex::new(VecDeque::new()),
            responses,
            files,
            stderr_tail: Arc::new(Mutex::new(TailBuffer::new(STDERR_TAIL_BYTES))),
        })
    }

    /// Spawn the child process and the tasks that shepherd it: stdout and
    /// stderr copiers, the response router, and the exit watcher.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let command = self
            .adapter
            .command(self.mode, &self.process_config, &self.models_dir)?;

        tracing::info!(
            "starting model instance {} ({} {:?}): {} {:?}",
            self.id,
            self.model_name,
            self.mode,
            command.program,
            command.args
        );

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().cloned())
            .current_dir(&command.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // own process group so the whole tree dies on one signal
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Process(format!("spawn {}: {}", command.program, e)))?;

        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::SeqCst);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Process("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Process("no stderr pipe".to_string()))?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChildEvent>();

        // stdout: operator log + model-specific parser
        let parser = self.adapter.stream_parser(self.mode);
        let mut stdout_tee = Tee::new(vec![
            Box::new(ConsoleSink::new(format!("{}/out", self.id))),
            Box::new(ParserSink::new(parser, raw_tx)),
        ]);
        let stdout_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stdout_tee.write_line(&line);
            }
        });

        // stderr: operator log + bounded tail for crash diagnostics
        let mut stderr_tee = Tee::new(vec![
            Box::new(ConsoleSink::new(format!("{}/err", self.id))),
            Box::new(TailSink::new(self.stderr_tail.clone())),
        ]);
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_tee.write_line(&line);
            }
        });

        // feed parsed responses into the event stream
        let forward_tx = event_tx.clone();
        let forward_handle = tokio::spawn(async move {
            while let Some(response) = raw_rx.recv().await {
                if forward_tx.send(ChildEvent::Response(response)).is_err() {
                    break;
                }
            }
        });

        // the exit event is enqueued only after both pipes are drained, so
        // a result that was already on stdout is routed before the exit is
        tokio::spawn(async move {
            let exit = child.wait().await;
            let _ = stdout_handle.await;
            let _ = stderr_handle.await;
            let _ = forward_handle.await;
            let _ = event_tx.send(ChildEvent::Exited(exit));
        });

        // one consumer, so responses stay in emission order
        let instance = self.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    ChildEvent::Response(response) => {
                        instance.handle_task_response(response).await;
                    }
                    ChildEvent::Exited(exit) => {
                        instance.on_exit(exit).await;
                    }
                }
            }
        });

        Ok(())
    }

    async fn on_exit(&self, exit: std::io::Result<std::process::ExitStatus>) {
        let current = {
            let mut slots = self.slots.lock().unwrap();
            slots.status = InstanceStatus::Stopped;
            slots.next = None;
            slots.queued = None;
            slots.current.take()
        };

        match exit {
            Ok(status) if status.success() => {
                tracing::info!("model instance {} exited cleanly", self.id);
            }
            Ok(status) => {
                tracing::error!("model instance {} exited: {}", self.id, status);
                if let Some(session) = current {
                    let tail = self.stderr_tail.lock().unwrap().contents();
                    self.error_session(
                        &session,
                        &format!("model process exited ({}): {}", status, tail),
                    )
                    .await;
                }
            }
            Err(e) => {
                tracing::error!("model instance {} wait failed: {}", self.id, e);
            }
        }

        // wake any long-polling child so it sees the instance is gone
        self.task_ready.notify_waiters();
    }

    /// Kill the child and everything it spawned.
    pub fn stop(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        tracing::info!("stopping model instance {} (pid {})", self.id, pid);
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL) {
                tracing::warn!("failed to kill process group {}: {}", pid, e);
            }
        }
    }

    /// Hand a session to this instance. It parks in the `queued` slot while
    /// its files download, then becomes `next` for the child to pull.
    /// Assigning again before the download finishes replaces the queued
    /// session.
    ///
    /// `fetch_lora` is set for the initial session only: the child loads
    /// the fine-tune artifact once at boot, so later sessions (pinned to
    /// the same artifact by the instance filter) skip the fetch.
    pub fn assign(self: &Arc<Self>, session: Session, fetch_lora: bool) {
        {
            let mut slots = self.slots.lock().unwrap();
            if slots.status == InstanceStatus::Stopped {
                tracing::warn!(
                    "dropping assignment of session {} to stopped instance {}",
                    session.id,
                    self.id
                );
                return;
            }
            slots.queued = Some(session.clone());
            slots.next = None;
        }
        self.touch();

        tracing::debug!("preparing session {} on instance {}", session.id, self.id);
        let instance = self.clone();
        tokio::spawn(async move {
            match instance
                .files
                .download_session(&instance.id, &session, fetch_lora)
                .await
            {
                Ok(prepared) => {
                    let committed = {
                        let mut slots = instance.slots.lock().unwrap();
                        // a newer assignment may have replaced us mid-download
                        if slots.queued.as_ref().map(|q| q.id.as_str())
                            == Some(prepared.id.as_str())
                        {
                            slots.queued = None;
                            slots.next = Some(prepared);
                            true
                        } else {
                            false
                        }
                    };
                    if committed {
                        tracing::debug!(
                            "session {} prepared on instance {}",
                            session.id,
                            instance.id
                        );
                        instance.task_ready.notify_one();
                    }
                }
                Err(e) => {
                    {
                        let mut slots = instance.slots.lock().unwrap();
                        if slots.queued.as_ref().map(|q| q.id.as_str())
                            == Some(session.id.as_str())
                        {
                            slots.queued = None;
                        }
                    }
                    tracing::error!("error preparing session {}: {}", session.id, e);
                    instance.error_session(&session, &e.to_string()).await;
                }
            }
        });
    }

    /// Pop the next prepared task for the child. Sets `current` and clears
    /// `next` in one transition; returns nothing while no session is
    /// prepared.
    pub async fn pop_task(&self) -> Option<RunnerTask> {
        let next = {
            let mut slots = self.slots.lock().unwrap();
            if slots.status == InstanceStatus::Stopped {
                return None;
            }
            slots.next.take()?
        };

        match self.adapter.task(&next) {
            Ok(task) => {
                {
                    let mut slots = self.slots.lock().unwrap();
                    slots.current = Some(next);
                    slots.status = InstanceStatus::Running;
                }
                self.touch();
                Some(task)
            }
            Err(e) => {
                tracing::error!("cannot build task for session {}: {}", next.id, e);
                self.error_session(&next, &e.to_string()).await;
                None
            }
        }
    }

    /// Read-only view of whatever session the instance holds, so the child
    /// can see lora details before its first pop. Never mutates state.
    pub fn peek_session(&self) -> Option<Session> {
        let slots = self.slots.lock().unwrap();
        slots
            .current
            .clone()
            .or_else(|| slots.next.clone())
            .or_else(|| slots.queued.clone())
    }

    /// Route one parsed response from the child. Responses that do not
    /// carry the current session's ID are dropped. The terminal `result`
    /// uploads output files before it is forwarded, then frees the
    /// instance.
    pub async fn handle_task_response(&self, mut response: RunnerTaskResponse) {
        let current = {
            let slots = self.slots.lock().unwrap();
            slots.current.clone()
        };
        let Some(current) = current else {
            tracing::warn!(
                "instance {} dropping response with no current session (session_id={})",
                self.id,
                response.session_id
            );
            return;
        };
        if current.id != response.session_id {
            tracing::warn!(
                "instance {} session ID mismatch: current={} response={}",
                self.id,
                current.id,
                response.session_id
            );
            return;
        }

        response.owner = current.owner.clone();
        response.interaction_id = current
            .working_interaction()
            .map(|i| i.id.clone())
            .unwrap_or_default();
        self.touch();

        if response.is_terminal() {
            if response.error.is_empty() {
                match self.files.upload_response(response).await {
                    Ok(uploaded) => response = uploaded,
                    Err(e) => {
                        tracing::error!(
                            "error uploading result files for session {}: {}",
                            current.id,
                            e
                        );
                        self.clear_current(&current);
                        return;
                    }
                }
            }
            self.clear_current(&current);
        }

        if let Err(e) = self.responses.send((self.id.clone(), response)).await {
            tracing::error!("error forwarding response: {}", e);
        }
    }

    fn clear_current(&self, session: &Session) {
        {
            let mut slots = self.slots.lock().unwrap();
            slots.current = None;
            if slots.status != InstanceStatus::Stopped {
                slots.status = InstanceStatus::Idle;
            }
        }
        let mut history = self.job_history.lock().unwrap();
        history.push_front(session.summary());
        history.truncate(JOB_HISTORY_LEN);
    }

    /// Emit the single terminal error envelope for a session.
    pub async fn error_session(&self, session: &Session, error: &str) {
        let mut response = RunnerTaskResponse::error(session.id.clone(), error.to_string());
        response.owner = session.owner.clone();
        response.interaction_id = session
            .working_interaction()
            .map(|i| i.id.clone())
            .unwrap_or_default();
        if let Err(e) = self.responses.send((self.id.clone(), response)).await {
            tracing::error!("error reporting session error: {}", e);
        }
    }

    /// Whether the supervisor may buffer another session here: the queued
    /// and next slots are both free. The current session may still be
    /// running; that is the prefetch overlap.
    pub fn can_accept(&self) -> bool {
        let slots = self.slots.lock().unwrap();
        slots.status != InstanceStatus::Stopped && slots.queued.is_none() && slots.next.is_none()
    }

    /// Whether this instance would run the session: same model, mode, type
    /// and fine-tune artifact.
    pub fn matches(&self, session: &Session) -> bool {
        self.filter.matches(session, Utc::now())
    }

    /// No session in any slot.
    pub fn is_idle(&self) -> bool {
        let slots = self.slots.lock().unwrap();
        slots.current.is_none() && slots.next.is_none() && slots.queued.is_none()
    }

    pub fn is_stopped(&self) -> bool {
        self.slots.lock().unwrap().status == InstanceStatus::Stopped
    }

    pub fn status(&self) -> InstanceStatus {
        self.slots.lock().unwrap().status
    }

    pub fn model_name(&self) -> fleet_common::ModelName {
        self.model_name
    }

    pub fn mode(&self) -> fleet_common::SessionMode {
        self.mode
    }

    pub fn memory_usage(&self) -> u64 {
        self.adapter.memory_requirements(self.mode)
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    /// Idle for longer than the configured timeout.
    pub fn is_stale(&self) -> bool {
        self.is_idle()
            && Utc::now().timestamp() - self.last_activity() > self.timeout_secs as i64
    }

    pub fn warm_filter(&self) -> &SessionFilter {
        &self.filter
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.task_ready.notified()
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    /// Heartbeat view of this instance.
    pub fn state(&self) -> ModelInstanceState {
        let slots = self.slots.lock().unwrap();
        let current_session = slots
            .current
            .as_ref()
            .or(slots.queued.as_ref())
            .or(slots.next.as_ref())
            .map(|s| s.summary());
        ModelInstanceState {
            id: self.id.clone(),
            model_name: self.model_name,
            mode: self.mode,
            lora_dir: self.lora_dir.clone(),
            initial_session_id: self.initial_session_id.clone(),
            current_session,
            job_history: self.job_history.lock().unwrap().iter().cloned().collect(),
            timeout_secs: self.timeout_secs,
            last_activity: self.last_activity(),
            stale: self.is_stale(),
            memory_usage: self.memory_usage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChildCommand, ModelAdapter};
    use crate::files::LocalFilestore;
    use crate::stream::{SentinelTextParser, StreamParser};
    use chrono::Utc;
    use fleet_common::{
        Interaction, ModelName, SessionMode, SessionType, TaskResponseType,
    };
    use std::path::Path;
    use std::time::Duration;

    struct StubAdapter {
        script: String,
    }

    impl ModelAdapter for StubAdapter {
        fn memory_requirements(&self, _mode: SessionMode) -> u64 {
            1024
        }

        fn task(&self, session: &Session) -> Result<RunnerTask> {
            Ok(RunnerTask {
                session_id: session.id.clone(),
                prompt: session
                    .latest_user_interaction()
                    .map(|i| i.message.clone())
                    .unwrap_or_default(),
                lora_dir: String::new(),
                dataset_dir: String::new(),
            })
        }

        fn command(
            &self,
            _mode: SessionMode,
            _process: &RunnerProcessConfig,
            models_dir: &Path,
        ) -> Result<ChildCommand> {
            Ok(ChildCommand {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), self.script.clone()],
                env: vec![],
                dir: models_dir.to_path_buf(),
            })
        }

        fn stream_parser(&self, _mode: SessionMode) -> Box<dyn StreamParser> {
            Box::new(SentinelTextParser::new())
        }
    }

    fn test_session(id: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            name: String::new(),
            created: now,
            updated: now,
            parent_session: String::new(),
            mode: SessionMode::Inference,
            session_type: SessionType::Text,
            model_name: ModelName::Mistral7bInstruct,
            lora_dir: String::new(),
            interactions: vec![
                Interaction::new_user(format!("{id}-user"), "hello".to_string(), now),
                Interaction::new_system(format!("{id}-system"), now),
            ],
            owner: "user-1".to_string(),
            priority: false,
        }
    }

    struct Fixture {
        instance: Arc<ModelInstance>,
        rx: mpsc::Receiver<(String, RunnerTaskResponse)>,
        _store: tempfile::TempDir,
        _workspace: tempfile::TempDir,
    }

    fn fixture(script: &str) -> Fixture {
        let store = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let files = Arc::new(FileHandler::new(
            Arc::new(LocalFilestore::new(store.path())),
            workspace.path(),
        ));
        let (tx, rx) = mpsc::channel(64);
        let instance = ModelInstance::new(
            &test_session("ses-init"),
            Arc::new(StubAdapter {
                script: script.to_string(),
            }),
            "http://127.0.0.1:8845/api/v1/worker/task",
            "http://127.0.0.1:8845/api/v1/worker/initial_session",
            std::env::temp_dir(),
            10,
            files,
            tx,
        );
        Fixture {
            instance,
            rx,
            _store: store,
            _workspace: workspace,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within deadline");
    }

    #[test]
    fn test_empty_lora_dir_is_hoisted_to_sentinel() {
        let store = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let files = Arc::new(FileHandler::new(
            Arc::new(LocalFilestore::new(store.path())),
            workspace.path(),
        ));
        let (tx, _rx) = mpsc::channel(4);
        let instance = ModelInstance::new(
            &test_session("ses-1"),
            Arc::new(StubAdapter {
                script: String::new(),
            }),
            "http://t/task",
            "http://t/initial_session",
            "/tmp",
            10,
            files,
            tx,
        );

        assert_eq!(instance.warm_filter().lora_dir, LORA_DIR_NONE);
        // the pinned filter accepts sessions with no artifact...
        assert!(instance.matches(&test_session("other")));
        // ...but not ones with a specific artifact
        let mut tuned = test_session("tuned");
        tuned.lora_dir = "sessions/x/lora".to_string();
        assert!(!instance.matches(&tuned));
    }

    #[tokio::test]
    async fn test_assign_prepares_then_pop_runs() {
        let fixture = fixture("");
        let instance = fixture.instance.clone();

        assert!(instance.pop_task().await.is_none());

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }

        let task = instance.pop_task().await.unwrap();
        assert_eq!(task.session_id, "ses-1");
        assert_eq!(task.prompt, "hello");
        assert_eq!(instance.status(), InstanceStatus::Running);

        // next is cleared; current holds the session
        assert!(instance.can_accept());
        assert_eq!(instance.peek_session().unwrap().id, "ses-1");
        assert!(instance.pop_task().await.is_none());
    }

    #[tokio::test]
    async fn test_new_assignment_replaces_buffered_session() {
        let fixture = fixture("");
        let instance = fixture.instance.clone();

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }

        instance.assign(test_session("ses-2"), false);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }

        let task = instance.pop_task().await.unwrap();
        assert_eq!(task.session_id, "ses-2");
    }

    #[tokio::test]
    async fn test_prefetch_failure_emits_terminal_error() {
        let mut fixture = fixture("");
        let instance = fixture.instance.clone();

        let mut session = test_session("ses-1");
        session.interactions[0].files = vec!["sessions/ses-1/missing.txt".to_string()];
        instance.assign(session, true);

        let (_instance_id, response) = fixture.rx.recv().await.unwrap();
        assert_eq!(response.response_type, TaskResponseType::Result);
        assert_eq!(response.session_id, "ses-1");
        assert_eq!(response.interaction_id, "ses-1-system");
        assert_eq!(response.owner, "user-1");
        assert!(response.done);
        assert!(!response.error.is_empty());

        // both slots were cleared
        assert!(instance.is_idle());
    }

    #[tokio::test]
    async fn test_mismatched_session_response_is_dropped() {
        let mut fixture = fixture("");
        let instance = fixture.instance.clone();

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }
        instance.pop_task().await.unwrap();

        let mut stray = RunnerTaskResponse::error("ses-other".to_string(), String::new());
        stray.response_type = TaskResponseType::Stream;
        instance.handle_task_response(stray).await;
        assert!(fixture.rx.try_recv().is_err());

        // the matching session still flows through
        let mut chunk = RunnerTaskResponse::error("ses-1".to_string(), String::new());
        chunk.response_type = TaskResponseType::Stream;
        chunk.error = String::new();
        chunk.message = "hi".to_string();
        instance.handle_task_response(chunk).await;
        let (_, forwarded) = fixture.rx.recv().await.unwrap();
        assert_eq!(forwarded.session_id, "ses-1");
        assert_eq!(forwarded.owner, "user-1");
    }

    #[tokio::test]
    async fn test_terminal_response_frees_instance_exactly_once() {
        let mut fixture = fixture("");
        let instance = fixture.instance.clone();

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }
        instance.pop_task().await.unwrap();

        let mut result = RunnerTaskResponse::error("ses-1".to_string(), String::new());
        result.error = String::new();
        result.message = "answer".to_string();
        instance.handle_task_response(result.clone()).await;

        let (_, forwarded) = fixture.rx.recv().await.unwrap();
        assert!(forwarded.done);
        assert_eq!(instance.status(), InstanceStatus::Idle);
        assert!(instance.is_idle());

        // nothing further is forwarded for that session
        instance.handle_task_response(result).await;
        assert!(fixture.rx.try_recv().is_err());

        // and the run is in the job history
        let state = instance.state();
        assert_eq!(state.job_history.len(), 1);
        assert_eq!(state.job_history[0].session_id, "ses-1");
    }

    #[tokio::test]
    async fn test_prefetch_overlaps_running_session() {
        let mut fixture = fixture("");
        let instance = fixture.instance.clone();

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }
        instance.pop_task().await.unwrap();

        // ses-1 is running; buffering ses-2 is allowed
        assert!(instance.can_accept());
        instance.assign(test_session("ses-2"), false);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }

        // still running ses-1 while ses-2 sits prepared
        let state = instance.state();
        assert_eq!(state.current_session.unwrap().session_id, "ses-1");

        // finish ses-1, then the child pulls ses-2 in one pop
        let mut result = RunnerTaskResponse::error("ses-1".to_string(), String::new());
        result.error = String::new();
        instance.handle_task_response(result).await;
        fixture.rx.recv().await.unwrap();

        let task = instance.pop_task().await.unwrap();
        assert_eq!(task.session_id, "ses-2");
    }

    #[tokio::test]
    async fn test_peek_never_mutates() {
        let fixture = fixture("");
        let instance = fixture.instance.clone();

        assert!(instance.peek_session().is_none());

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }

        assert_eq!(instance.peek_session().unwrap().id, "ses-1");
        assert_eq!(instance.peek_session().unwrap().id, "ses-1");
        // still poppable afterwards
        assert!(instance.pop_task().await.is_some());
    }

    #[tokio::test]
    async fn test_child_crash_errors_current_session_with_stderr_tail() {
        let mut fixture = fixture("echo oops >&2; exit 1");
        let instance = fixture.instance.clone();

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }
        instance.pop_task().await.unwrap();

        instance.start().unwrap();

        let (_, response) = fixture.rx.recv().await.unwrap();
        assert_eq!(response.response_type, TaskResponseType::Result);
        assert_eq!(response.session_id, "ses-1");
        assert!(response.done);
        assert!(response.error.contains("oops"), "error: {}", response.error);

        {
            let instance = instance.clone();
            wait_until(move || instance.is_stopped()).await;
        }
    }

    #[tokio::test]
    async fn test_child_output_streams_then_results() {
        let script = "printf ' [SESSION_START]session_id=ses-1 \\nhello world\\n</s>\\n [SESSION_END]session_id=ses-1 \\n'";
        let mut fixture = fixture(script);
        let instance = fixture.instance.clone();

        instance.assign(test_session("ses-1"), true);
        {
            let instance = instance.clone();
            wait_until(move || !instance.can_accept()).await;
        }
        instance.pop_task().await.unwrap();

        instance.start().unwrap();

        let (_, first) = fixture.rx.recv().await.unwrap();
        assert_eq!(first.response_type, TaskResponseType::Stream);
        assert_eq!(first.message, "hello world\n");
        assert_eq!(first.owner, "user-1");

        let (_, second) = fixture.rx.recv().await.unwrap();
        assert_eq!(second.response_type, TaskResponseType::Result);
        assert_eq!(second.message, "hello world");
        assert!(second.done);
        assert!(second.error.is_empty());

        // clean exit after the result: instance idles then stops, no
        // further envelope for the session
        {
            let instance = instance.clone();
            wait_until(move || instance.is_stopped()).await;
        }
        assert!(fixture.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_after_timeout() {
        let store = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let files = Arc::new(FileHandler::new(
            Arc::new(LocalFilestore::new(store.path())),
            workspace.path(),
        ));
        let (tx, _rx) = mpsc::channel(4);
        let instance = ModelInstance::new(
            &test_session("ses-1"),
            Arc::new(StubAdapter {
                script: String::new(),
            }),
            "http://t/task",
            "http://t/initial_session",
            "/tmp",
            0,
            files,
            tx,
        );

        // zero timeout: stale as soon as a second of idleness passes
        assert!(!instance.is_stale());
        instance
            .last_activity
            .store(Utc::now().timestamp() - 5, Ordering::SeqCst);
        assert!(instance.is_stale());
    }
}

