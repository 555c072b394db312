//! Session registry and per-session update streams.
//!
//! Sessions are the unit of isolation: each one owns an agent handle, a
//! working directory claim, an activity clock, and a replayable buffer of
//! run updates. Everything is keyed by session id; nothing here relies on
//! process-global state.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use utoipa::ToSchema;
use uuid::Uuid;

use workbench_agent_client::{
    build_agent, AgentSettings, IntermediateOutput, LlmSource, ResearchAgent,
};
use workbench_error::WorkbenchError;

use crate::config::RuntimeConfig;
use crate::runner::RunHandle;
use crate::scanner::{self, GeneratedFile, ScanLimits};
use crate::workspace::WorkspaceManager;

/// Updates buffered per session for replay; the live broadcast channel
/// uses the same capacity.
pub(crate) const UPDATE_BUFFER_SIZE: usize = 512;

/// One streamed progress update. `sequence` is per-session, starts at 1,
/// and never repeats or goes backwards for the life of the session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunUpdate {
    pub sequence: u64,
    pub time: String,
    pub session_id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub kind: RunUpdateKind,
    pub data: RunUpdateData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub enum RunUpdateKind {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.log")]
    RunLog,
    #[serde(rename = "run.output")]
    RunOutput,
    #[serde(rename = "run.step")]
    RunStep,
    #[serde(rename = "run.stopping")]
    RunStopping,
    #[serde(rename = "run.completed")]
    RunCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum RunUpdateData {
    Started(RunStartedData),
    Log(RunLogData),
    Output(RunOutputData),
    Step(RunStepData),
    Stopping(RunStoppingData),
    Completed(RunCompletedData),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunStartedData {
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunLogData {
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunOutputData {
    pub output: IntermediateOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunStepData {
    pub step: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunStoppingData {
    pub message: String,
}

/// Terminal update of a run. Exactly one is emitted per run, last.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct RunCompletedData {
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub runtime: String,
    pub files: Vec<GeneratedFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Error,
    NoResult,
    Stopped,
    StopUnconfirmed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Error => "error",
            RunOutcome::NoResult => "no_result",
            RunOutcome::Stopped => "stopped",
            RunOutcome::StopUnconfirmed => "stop_unconfirmed",
        }
    }
}

/// Wire view of one session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub agent_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_error: Option<String>,
    pub run_active: bool,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
}

/// Per-request overrides merged over `RuntimeConfig::agent_defaults`.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub model: Option<String>,
    pub source: Option<LlmSource>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub verbose: Option<bool>,
}

/// Outcome of a create call, before it is shaped for the wire.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: String,
    pub agent_ready: bool,
    pub agent_error: Option<String>,
    pub results_dir: PathBuf,
    pub evicted: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct UpdatesPage {
    pub updates: Vec<RunUpdate>,
    pub has_more: bool,
    pub last_sequence: u64,
}

pub(crate) struct UpdateSubscription {
    pub initial: Vec<RunUpdate>,
    pub receiver: broadcast::Receiver<RunUpdate>,
}

pub(crate) struct RunPreflight {
    pub handle: Arc<RunHandle>,
    pub agent: Option<Arc<dyn ResearchAgent>>,
    pub agent_error: Option<String>,
}

struct SessionRecord {
    id: String,
    agent: Option<Arc<dyn ResearchAgent>>,
    agent_error: Option<String>,
    settings: AgentSettings,
    created_at_ms: u64,
    last_activity_ms: u64,
    active_run: Option<Arc<RunHandle>>,
    updates: VecDeque<RunUpdate>,
    next_sequence: u64,
    broadcaster: broadcast::Sender<RunUpdate>,
}

impl SessionRecord {
    fn run_active(&self) -> bool {
        self.active_run
            .as_ref()
            .is_some_and(|run| !run.is_finished())
    }

    fn touch(&mut self) {
        self.last_activity_ms = self.last_activity_ms.max(now_ms());
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            model: self.settings.model.clone(),
            source: self
                .settings
                .resolved_source()
                .ok()
                .map(|source| source.as_str().to_string()),
            agent_ready: self.agent.is_some(),
            agent_error: self.agent_error.clone(),
            run_active: self.run_active(),
            created_at_ms: self.created_at_ms,
            last_activity_ms: self.last_activity_ms,
        }
    }
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    pub(crate) workspaces: WorkspaceManager,
    pub(crate) config: RuntimeConfig,
}

impl SessionManager {
    pub fn new(config: RuntimeConfig) -> Self {
        let workspaces = WorkspaceManager::new(&config.results_root, &config.data_dir);
        Self {
            sessions: Mutex::new(HashMap::new()),
            workspaces,
            config,
        }
    }

    /// Creates the on-disk scaffold the workspace links point at.
    pub fn ensure_shared_store(&self) -> std::io::Result<()> {
        self.workspaces.ensure_shared_store()
    }

    pub fn generate_session_id() -> String {
        format!("session_{}_{}", now_ms(), id_suffix())
    }

    /// Registers a session under `session_id` (or a generated id), binding
    /// a freshly constructed agent to it. An existing session of the same
    /// id is replaced without ceremony. Agent construction failures do not
    /// fail the call; they are recorded on the session and surface when
    /// the agent is used.
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        options: CreateSessionOptions,
    ) -> Result<CreatedSession, WorkbenchError> {
        let session_id = match session_id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => Self::generate_session_id(),
        };

        let mut settings = self.config.agent_defaults.clone();
        if let Some(model) = options.model {
            settings.model = model;
        }
        if options.source.is_some() {
            settings.source = options.source;
        }
        if options.base_url.is_some() {
            settings.base_url = options.base_url;
        }
        if options.api_key.is_some() {
            settings.api_key = options.api_key;
        }
        if let Some(verbose) = options.verbose {
            settings.verbose = verbose;
        }

        let build_settings = settings.clone();
        let built = tokio::task::spawn_blocking(move || build_agent(&build_settings)).await;
        let (agent, agent_error) = match built {
            Ok(Ok(agent)) => (Some(agent), None),
            Ok(Err(err)) => (None, Some(err.to_string())),
            Err(err) => (None, Some(format!("agent construction task failed: {err}"))),
        };

        if let Some(err) = &agent_error {
            tracing::warn!(session_id = %session_id, error = %err, "session created without a working agent");
        } else {
            tracing::info!(session_id = %session_id, model = %settings.model, "session created");
        }

        let now = now_ms();
        let record = SessionRecord {
            id: session_id.clone(),
            agent,
            agent_error: agent_error.clone(),
            settings,
            created_at_ms: now,
            last_activity_ms: now,
            active_run: None,
            updates: VecDeque::new(),
            next_sequence: 1,
            broadcaster: broadcast::channel(UPDATE_BUFFER_SIZE).0,
        };
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.insert(session_id.clone(), record).is_some() {
                tracing::info!(session_id = %session_id, "replaced existing session");
            }
        }

        let evicted = self.evict_stale().await;
        Ok(CreatedSession {
            session_id: session_id.clone(),
            agent_ready: agent_error.is_none(),
            agent_error,
            results_dir: self.workspaces.session_dir(&session_id),
            evicted,
        })
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(SessionRecord::info).collect();
        infos.sort_by(|a, b| {
            b.last_activity_ms
                .cmp(&a.last_activity_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Refreshes a session's activity clock. Unknown ids are a no-op.
    pub async fn touch(&self, session_id: &str) {
        if let Some(record) = self.sessions.lock().await.get_mut(session_id) {
            record.touch();
        }
    }

    /// Removes a session and asks its agent to stop. Stop failures are
    /// logged and discarded; removal itself cannot fail once the session
    /// exists.
    pub async fn remove_session(&self, session_id: &str) -> Result<(), WorkbenchError> {
        let record = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| WorkbenchError::NoSession {
                session_id: session_id.to_string(),
            })?;
        tracing::info!(session_id = %session_id, "session removed");
        Self::shutdown_record(record).await;
        Ok(())
    }

    /// Prunes least recently active sessions once the registry grows past
    /// `max_sessions`, keeping the `keep_newest` most recent. Returns the
    /// evicted ids.
    pub async fn evict_stale(&self) -> Vec<String> {
        let victims: Vec<SessionRecord> = {
            let mut sessions = self.sessions.lock().await;
            if sessions.len() <= self.config.max_sessions {
                return Vec::new();
            }
            let mut order: Vec<(u64, String)> = sessions
                .values()
                .map(|record| (record.last_activity_ms, record.id.clone()))
                .collect();
            order.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
            order
                .into_iter()
                .skip(self.config.keep_newest)
                .filter_map(|(_, id)| sessions.remove(&id))
                .collect()
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for record in victims {
            tracing::info!(session_id = %record.id, "evicting stale session");
            evicted.push(record.id.clone());
            Self::shutdown_record(record).await;
        }
        evicted
    }

    async fn shutdown_record(record: SessionRecord) {
        if let Some(run) = &record.active_run {
            run.cancel();
        }
        if let Some(agent) = record.agent {
            match tokio::task::spawn_blocking(move || agent.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "agent stop during shutdown failed")
                }
                Err(err) => tracing::debug!(error = %err, "agent stop task failed"),
            }
        }
    }

    /// The session's agent, or the error recorded when construction failed.
    pub(crate) async fn agent_handle(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn ResearchAgent>, WorkbenchError> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| WorkbenchError::NoSession {
                session_id: session_id.to_string(),
            })?;
        record.touch();
        match &record.agent {
            Some(agent) => Ok(agent.clone()),
            None => Err(WorkbenchError::AgentNotReady {
                session_id: session_id.to_string(),
                message: record
                    .agent_error
                    .clone()
                    .unwrap_or_else(|| "agent not constructed".to_string()),
            }),
        }
    }

    /// Checks the session can run, reserves the run slot, and hands back
    /// what the runner needs. The reservation happens under the registry
    /// lock, so two concurrent starts cannot both pass the conflict check.
    pub(crate) async fn run_preflight(
        &self,
        session_id: &str,
        run_id: &str,
    ) -> Result<RunPreflight, WorkbenchError> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| WorkbenchError::NoSession {
                session_id: session_id.to_string(),
            })?;
        record.touch();
        if record.run_active() {
            return Err(WorkbenchError::RunActive {
                session_id: session_id.to_string(),
            });
        }
        let handle = Arc::new(RunHandle::new(run_id.to_string()));
        record.active_run = Some(handle.clone());
        Ok(RunPreflight {
            handle,
            agent: record.agent.clone(),
            agent_error: record.agent_error.clone(),
        })
    }

    /// Clears the run slot, but only if it still belongs to `run_id`.
    pub(crate) async fn clear_active_run(&self, session_id: &str, run_id: &str) {
        if let Some(record) = self.sessions.lock().await.get_mut(session_id) {
            if record
                .active_run
                .as_ref()
                .is_some_and(|run| run.run_id == run_id)
            {
                record.active_run = None;
            }
        }
    }

    /// The live run handle and agent for a stop request.
    pub(crate) async fn stop_targets(
        &self,
        session_id: &str,
    ) -> Result<(Option<Arc<RunHandle>>, Option<Arc<dyn ResearchAgent>>), WorkbenchError> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| WorkbenchError::NoSession {
                session_id: session_id.to_string(),
            })?;
        record.touch();
        let handle = record
            .active_run
            .as_ref()
            .filter(|run| !run.is_finished())
            .cloned();
        Ok((handle, record.agent.clone()))
    }

    /// Appends an update to the session's buffer and fans it out to live
    /// subscribers. Updates for a session that has since been removed are
    /// dropped; the stream died with the session.
    pub(crate) async fn emit_update(
        &self,
        session_id: &str,
        run_id: &str,
        kind: RunUpdateKind,
        data: RunUpdateData,
    ) -> Option<RunUpdate> {
        let mut sessions = self.sessions.lock().await;
        let record = match sessions.get_mut(session_id) {
            Some(record) => record,
            None => {
                tracing::debug!(session_id = %session_id, "dropping update for removed session");
                return None;
            }
        };
        let update = RunUpdate {
            sequence: record.next_sequence,
            time: rfc3339_now(),
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
            kind,
            data,
        };
        record.next_sequence += 1;
        record.updates.push_back(update.clone());
        while record.updates.len() > UPDATE_BUFFER_SIZE {
            record.updates.pop_front();
        }
        let _ = record.broadcaster.send(update.clone());
        Some(update)
    }

    /// Buffered updates with sequence greater than `offset`.
    pub(crate) async fn updates_after(
        &self,
        session_id: &str,
        offset: u64,
        limit: Option<usize>,
    ) -> Result<UpdatesPage, WorkbenchError> {
        let sessions = self.sessions.lock().await;
        let record = sessions
            .get(session_id)
            .ok_or_else(|| WorkbenchError::NoSession {
                session_id: session_id.to_string(),
            })?;
        let mut updates: Vec<RunUpdate> = record
            .updates
            .iter()
            .filter(|update| update.sequence > offset)
            .cloned()
            .collect();
        let mut has_more = false;
        if let Some(limit) = limit {
            if updates.len() > limit {
                updates.truncate(limit);
                has_more = true;
            }
        }
        Ok(UpdatesPage {
            updates,
            has_more,
            last_sequence: record.next_sequence.saturating_sub(1),
        })
    }

    /// Replay-then-live subscription. Replay and receiver are taken under
    /// one lock, so nothing can slip between them.
    pub(crate) async fn subscribe_updates(
        &self,
        session_id: &str,
        offset: u64,
    ) -> Result<UpdateSubscription, WorkbenchError> {
        let sessions = self.sessions.lock().await;
        let record = sessions
            .get(session_id)
            .ok_or_else(|| WorkbenchError::NoSession {
                session_id: session_id.to_string(),
            })?;
        Ok(UpdateSubscription {
            initial: record
                .updates
                .iter()
                .filter(|update| update.sequence > offset)
                .cloned()
                .collect(),
            receiver: record.broadcaster.subscribe(),
        })
    }

    /// Current file listing of the session's workspace.
    pub async fn session_files(
        &self,
        session_id: &str,
    ) -> Result<Vec<GeneratedFile>, WorkbenchError> {
        {
            let mut sessions = self.sessions.lock().await;
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| WorkbenchError::NoSession {
                    session_id: session_id.to_string(),
                })?;
            record.touch();
        }
        let dir = self.workspaces.session_dir(session_id);
        let limits = ScanLimits {
            max_depth: self.config.scan_max_depth,
            max_files: self.config.scan_max_files,
        };
        tokio::task::spawn_blocking(move || scanner::scan_session_files(&dir, limits))
            .await
            .map_err(|err| WorkbenchError::Workspace {
                message: format!("file scan task failed: {err}"),
            })
    }
}

fn validate_session_id(session_id: &str) -> Result<(), WorkbenchError> {
    let well_formed = !session_id.is_empty()
        && session_id.len() <= 120
        && session_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if well_formed {
        Ok(())
    } else {
        Err(WorkbenchError::InvalidRequest {
            message: format!(
                "session id {session_id:?} is invalid: use 1-120 characters from [A-Za-z0-9_-]"
            ),
        })
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn id_suffix() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..8].to_string()
}
