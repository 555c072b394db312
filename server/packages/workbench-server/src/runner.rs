//! Run lifecycle.
//!
//! A run is one question handed to the session's agent. The blocking
//! `agent.run` call goes onto the blocking pool with a result slot; an
//! async poller samples the agent's accessors on a fixed cadence and turns
//! anything new into streamed updates. Counters only ever move forward, so
//! the stream never repeats or drops a log line or output. The poller also
//! owns cancellation: a stop request flips the run's token, the agent gets
//! a best-effort `stop()`, and the worker join is bounded so a wedged agent
//! cannot wedge the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

use workbench_agent_client::{IntermediateOutput, ResearchAgent};
use workbench_error::WorkbenchError;

use crate::scanner::{self, ScanLimits};
use crate::sessions::{
    id_suffix, now_ms, RunCompletedData, RunLogData, RunOutcome, RunOutputData, RunStartedData,
    RunStepData, RunStoppingData, RunUpdateData, RunUpdateKind, SessionManager,
};
use crate::workspace::WorkspaceGuard;

pub(crate) const STOPPING_MESSAGE: &str = "stop requested, waiting for the run to wind down";

/// What the worker thread left in the slot: the agent's answer (possibly
/// none) or its error text.
type RunResult = Result<Option<String>, String>;

/// Shared book-keeping for one in-flight run. The session record, the
/// poller, and the stop endpoint all hold the same handle.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    pub started_at_ms: u64,
    cancel_requested: AtomicBool,
    finished: AtomicBool,
}

impl RunHandle {
    pub(crate) fn new(run_id: String) -> Self {
        Self {
            run_id,
            started_at_ms: now_ms(),
            cancel_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Flips the run's cancellation token. Safe to call any number of
    /// times from any thread.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn generate_run_id() -> String {
    format!("run_{}_{}", now_ms(), id_suffix())
}

impl SessionManager {
    /// Starts a run and returns its id. The call itself returns as soon as
    /// the worker and poller are launched; progress and the final outcome
    /// arrive on the session's update stream.
    ///
    /// Sessions whose agent failed to construct still accept the call: the
    /// recorded construction error comes back as the run's final update,
    /// through the same channel as every other outcome.
    pub async fn start_run(
        self: Arc<Self>,
        session_id: &str,
        question: &str,
    ) -> Result<String, WorkbenchError> {
        let question = question.trim().to_string();
        if question.is_empty() {
            return Err(WorkbenchError::InvalidRequest {
                message: "question must not be empty".to_string(),
            });
        }

        let run_id = generate_run_id();
        let preflight = self.run_preflight(session_id, &run_id).await?;
        let handle = preflight.handle;

        let agent = match preflight.agent {
            Some(agent) => agent,
            None => {
                let message = match preflight.agent_error {
                    Some(err) => format!("agent unavailable: {err}"),
                    None => "agent unavailable".to_string(),
                };
                self.finish_before_start(session_id, &run_id, &handle, &question, message)
                    .await;
                return Ok(run_id);
            }
        };

        let workspaces = self.workspaces.clone();
        let setup_session = session_id.to_string();
        let setup = tokio::task::spawn_blocking(move || workspaces.setup(&setup_session)).await;
        let guard = match setup {
            Ok(Ok(guard)) => guard,
            Ok(Err(err)) => {
                self.finish_before_start(session_id, &run_id, &handle, &question, err.to_string())
                    .await;
                return Ok(run_id);
            }
            Err(err) => {
                let message = format!("workspace setup task failed: {err}");
                self.finish_before_start(session_id, &run_id, &handle, &question, message)
                    .await;
                return Ok(run_id);
            }
        };

        // Fresh accessor state so this run's stream starts from zero.
        {
            let agent = agent.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || agent.clear_execution_logs()).await
            {
                tracing::debug!(error = %err, "clearing agent logs failed");
            }
        }

        self.emit_update(
            session_id,
            &run_id,
            RunUpdateKind::RunStarted,
            RunUpdateData::Started(RunStartedData {
                question: question.clone(),
            }),
        )
        .await;
        tracing::info!(session_id = %session_id, run_id = %run_id, "run started");

        let slot: Arc<Mutex<Option<RunResult>>> = Arc::new(Mutex::new(None));
        let worker = {
            let agent = agent.clone();
            let slot = slot.clone();
            let question = question.clone();
            let dir = guard.dir().to_path_buf();
            tokio::task::spawn_blocking(move || {
                let result = agent.run(&question, &dir).map_err(|err| err.to_string());
                store_result(&slot, result);
            })
        };

        tokio::spawn(drive_run(RunContext {
            manager: self.clone(),
            session_id: session_id.to_string(),
            run_id: run_id.clone(),
            agent,
            handle,
            slot,
            worker,
            guard,
            started: Instant::now(),
        }));

        Ok(run_id)
    }

    /// Requests cancellation of the session's active run. Repeated calls
    /// and calls with nothing running both succeed; the latter still nudge
    /// the agent with a `stop()`.
    pub async fn stop_run(&self, session_id: &str) -> Result<(), WorkbenchError> {
        let (handle, agent) = self.stop_targets(session_id).await?;
        match &handle {
            Some(run) => {
                tracing::info!(session_id = %session_id, run_id = %run.run_id, "stop requested");
                run.cancel();
            }
            None => {
                tracing::debug!(session_id = %session_id, "stop requested with no active run");
            }
        }
        if let Some(agent) = agent {
            stop_agent(&agent).await;
        }
        Ok(())
    }

    /// Emits the started/completed pair for a run that never reached the
    /// worker (agent missing or workspace setup failed) and frees the slot.
    async fn finish_before_start(
        &self,
        session_id: &str,
        run_id: &str,
        handle: &RunHandle,
        question: &str,
        message: String,
    ) {
        tracing::warn!(session_id = %session_id, run_id = %run_id, error = %message, "run failed before start");
        self.emit_update(
            session_id,
            run_id,
            RunUpdateKind::RunStarted,
            RunUpdateData::Started(RunStartedData {
                question: question.to_string(),
            }),
        )
        .await;
        self.emit_update(
            session_id,
            run_id,
            RunUpdateKind::RunCompleted,
            RunUpdateData::Completed(RunCompletedData {
                outcome: RunOutcome::Error,
                answer: None,
                error: Some(message),
                runtime: format_runtime(Duration::ZERO),
                files: Vec::new(),
            }),
        )
        .await;
        handle.mark_finished();
        self.clear_active_run(session_id, run_id).await;
    }
}

struct RunContext {
    manager: Arc<SessionManager>,
    session_id: String,
    run_id: String,
    agent: Arc<dyn ResearchAgent>,
    handle: Arc<RunHandle>,
    slot: Arc<Mutex<Option<RunResult>>>,
    worker: JoinHandle<()>,
    guard: WorkspaceGuard,
    started: Instant,
}

enum RunEnding {
    Finished { join: Result<(), JoinError> },
    Stopped,
    StopUnconfirmed,
    TimedOut { message: String },
}

/// Poll loop for one run. Ticks on the configured cadence; each tick
/// either acts on a cancel, notices the worker is done, enforces the
/// runtime ceiling, or samples the accessors and streams what is new.
async fn drive_run(ctx: RunContext) {
    let RunContext {
        manager,
        session_id,
        run_id,
        agent,
        handle,
        slot,
        mut worker,
        guard,
        started,
    } = ctx;

    let poll_interval = manager.config.poll_interval;
    let stop_join_timeout = manager.config.stop_join_timeout;
    let max_run_duration = manager.config.max_run_duration;
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seen = SeenCounters::default();

    let ending = loop {
        interval.tick().await;

        // Cancellation wins over a finish observed on the same tick: once
        // the stop was requested, the run reports stopped, not whatever
        // the worker managed to leave behind while winding down.
        if handle.cancel_requested() {
            manager
                .emit_update(
                    &session_id,
                    &run_id,
                    RunUpdateKind::RunStopping,
                    RunUpdateData::Stopping(RunStoppingData {
                        message: STOPPING_MESSAGE.to_string(),
                    }),
                )
                .await;
            stop_agent(&agent).await;
            match tokio::time::timeout(stop_join_timeout, &mut worker).await {
                Ok(join) => {
                    if let Err(err) = join {
                        tracing::debug!(run_id = %run_id, error = %err, "stopped worker did not exit cleanly");
                    }
                    break RunEnding::Stopped;
                }
                Err(_) => break RunEnding::StopUnconfirmed,
            }
        }

        if worker.is_finished() {
            break RunEnding::Finished {
                join: (&mut worker).await,
            };
        }

        if started.elapsed() >= max_run_duration {
            let message = format!(
                "run exceeded maximum runtime of {}s and was cancelled",
                max_run_duration.as_secs()
            );
            handle.cancel();
            manager
                .emit_update(
                    &session_id,
                    &run_id,
                    RunUpdateKind::RunStopping,
                    RunUpdateData::Stopping(RunStoppingData {
                        message: message.clone(),
                    }),
                )
                .await;
            stop_agent(&agent).await;
            if tokio::time::timeout(stop_join_timeout, &mut worker)
                .await
                .is_err()
            {
                tracing::warn!(run_id = %run_id, "timed out run did not confirm cancellation");
            }
            break RunEnding::TimedOut { message };
        }

        match snapshot_agent(&agent).await {
            Ok(snapshot) => {
                emit_increments(&manager, &session_id, &run_id, &snapshot, &mut seen).await
            }
            Err(err) => {
                tracing::debug!(run_id = %run_id, error = %err, "agent snapshot failed, will retry")
            }
        }
    };

    // Drain whatever accumulated between the last tick and the ending, so
    // the stream carries the complete transcript exactly once.
    if let Ok(snapshot) = snapshot_agent(&agent).await {
        emit_increments(&manager, &session_id, &run_id, &snapshot, &mut seen).await;
    }

    let (outcome, answer, error) = conclude(ending, &slot);
    let files = {
        let dir = guard.dir().to_path_buf();
        let limits = ScanLimits {
            max_depth: manager.config.scan_max_depth,
            max_files: manager.config.scan_max_files,
        };
        tokio::task::spawn_blocking(move || scanner::scan_session_files(&dir, limits))
            .await
            .unwrap_or_default()
    };
    let runtime = format_runtime(started.elapsed());
    tracing::info!(
        session_id = %session_id,
        run_id = %run_id,
        outcome = outcome.as_str(),
        runtime = %runtime,
        files = files.len(),
        "run finished"
    );
    manager
        .emit_update(
            &session_id,
            &run_id,
            RunUpdateKind::RunCompleted,
            RunUpdateData::Completed(RunCompletedData {
                outcome,
                answer,
                error,
                runtime,
                files,
            }),
        )
        .await;
    handle.mark_finished();
    manager.clear_active_run(&session_id, &run_id).await;
    guard.release();
}

/// Maps how the run ended plus what the worker left in the slot onto the
/// terminal outcome. A clean exit with an empty slot is reported as
/// no-result rather than invented success.
fn conclude(
    ending: RunEnding,
    slot: &Mutex<Option<RunResult>>,
) -> (RunOutcome, Option<String>, Option<String>) {
    match ending {
        RunEnding::Finished { join } => match join {
            Err(join_err) => (RunOutcome::Error, None, Some(panic_message(join_err))),
            Ok(()) => match take_result(slot) {
                Some(Ok(Some(answer))) => (RunOutcome::Success, Some(answer), None),
                Some(Ok(None)) => (RunOutcome::NoResult, None, None),
                Some(Err(message)) => (RunOutcome::Error, None, Some(message)),
                None => (RunOutcome::NoResult, None, None),
            },
        },
        RunEnding::Stopped => (RunOutcome::Stopped, None, None),
        RunEnding::StopUnconfirmed => (
            RunOutcome::StopUnconfirmed,
            None,
            Some("stop requested, not confirmed within the join timeout".to_string()),
        ),
        RunEnding::TimedOut { message } => (RunOutcome::Error, None, Some(message)),
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_panic() {
        match err.into_panic().downcast::<String>() {
            Ok(message) => format!("background run panicked: {message}"),
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => format!("background run panicked: {message}"),
                Err(_) => "background run panicked".to_string(),
            },
        }
    } else {
        format!("background run aborted: {err}")
    }
}

struct AgentSnapshot {
    logs: Vec<String>,
    outputs: Vec<IntermediateOutput>,
    step: Option<String>,
}

#[derive(Default)]
struct SeenCounters {
    logs: usize,
    outputs: usize,
    step: Option<String>,
}

/// One blocking hop reading all three accessors together.
async fn snapshot_agent(agent: &Arc<dyn ResearchAgent>) -> Result<AgentSnapshot, JoinError> {
    let agent = agent.clone();
    tokio::task::spawn_blocking(move || AgentSnapshot {
        logs: agent.execution_logs(),
        outputs: agent.intermediate_outputs(),
        step: agent.current_step(),
    })
    .await
}

/// Streams everything past the counters, then advances them. Counters
/// never move backwards, so a shrunken accessor list (an agent clearing
/// its own state mid-run) yields nothing rather than repeats.
async fn emit_increments(
    manager: &SessionManager,
    session_id: &str,
    run_id: &str,
    snapshot: &AgentSnapshot,
    seen: &mut SeenCounters,
) {
    for line in snapshot.logs.iter().skip(seen.logs) {
        manager
            .emit_update(
                session_id,
                run_id,
                RunUpdateKind::RunLog,
                RunUpdateData::Log(RunLogData { line: line.clone() }),
            )
            .await;
    }
    seen.logs = seen.logs.max(snapshot.logs.len());

    for output in snapshot.outputs.iter().skip(seen.outputs) {
        manager
            .emit_update(
                session_id,
                run_id,
                RunUpdateKind::RunOutput,
                RunUpdateData::Output(RunOutputData {
                    output: output.clone(),
                }),
            )
            .await;
    }
    seen.outputs = seen.outputs.max(snapshot.outputs.len());

    if let Some(step) = &snapshot.step {
        if seen.step.as_deref() != Some(step.as_str()) {
            seen.step = Some(step.clone());
            manager
                .emit_update(
                    session_id,
                    run_id,
                    RunUpdateKind::RunStep,
                    RunUpdateData::Step(RunStepData { step: step.clone() }),
                )
                .await;
        }
    }
}

async fn stop_agent(agent: &Arc<dyn ResearchAgent>) {
    let agent = agent.clone();
    match tokio::task::spawn_blocking(move || agent.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(error = %err, "agent stop returned an error"),
        Err(err) => tracing::debug!(error = %err, "agent stop task failed"),
    }
}

fn store_result(slot: &Mutex<Option<RunResult>>, result: RunResult) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
}

fn take_result(slot: &Mutex<Option<RunResult>>) -> Option<RunResult> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Elapsed runtime the way the workbench shows it.
pub(crate) fn format_runtime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else if secs < 3600.0 {
        let minutes = (secs / 60.0).floor() as u64;
        let rest = secs - minutes as f64 * 60.0;
        format!("{minutes}m{rest:.1}s")
    } else {
        let hours = (secs / 3600.0).floor() as u64;
        let minutes = ((secs % 3600.0) / 60.0).floor() as u64;
        let rest = secs % 60.0;
        format!("{hours}h{minutes}m{rest:.1}s")
    }
}
