//! Recording supervisor
//!
//! Owns the capture processes of the single host-wide session, persists
//! them in the [`StateStore`] and hands the session to the post-processing
//! pipeline on stop. Every decision starts from a reconcile of the store
//! against process liveness, so a session begun by another instance (or
//! left behind by a crash) is always seen for what it is.

use super::capture;
use super::process::{wait_for_exit, ProcessControl, Signal, SystemProcesses};
use super::state::{
    CaptureKind, CaptureOutputs, CaptureProcess, Liveness, RecordingOptions, RecordingSession,
    RecordingStatus, Requirement, SessionPhase,
};
use super::store::{StateStore, StoredSession};
use crate::config::Settings;
use crate::pipeline::ffmpeg::{FfmpegTool, MediaTool};
use crate::pipeline::progress::{self, ProgressReceiver};
use crate::pipeline::stages::{CaptureTerminator, StageContext, StageProgress};
use crate::pipeline::types::{PipelineRun, StageError};
use crate::pipeline::PostProcessingPipeline;
use crate::project::bundle::{self, SessionReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Recorder errors
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("A recording started at {started_at} is already in progress")]
    AlreadyRecording { started_at: DateTime<Utc> },

    #[error("No recording in progress")]
    NotRecording,

    #[error("Failed to start capture: {0}")]
    CaptureSpawnFailure(String),

    #[error("A crashed recording from {started_at} is still on disk; recover or discard it first")]
    StaleSessionDetected {
        started_at: DateTime<Utc>,
        captures: CaptureOutputs,
    },

    #[error("Post-processing task aborted: {0}")]
    PipelineAborted(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of cross-checking the store against process liveness
#[derive(Debug, Clone)]
pub enum Reconciliation {
    NoSession,
    Live(RecordingSession),
    /// Marked active but nothing recorded is alive any more
    Crashed(RecordingSession),
    /// A start died before writing its marker and left captures running
    Interrupted(RecordingSession),
}

/// Why [`ProcessSupervisor::wait_for_stop_request`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    /// The stop-signal file appeared
    Requested,
    /// Another instance already stopped or cleared the session
    StoppedElsewhere,
    /// Every capture process exited on its own
    CapturesExited,
}

/// Supervises capture processes of the host-wide recording session
pub struct ProcessSupervisor {
    store: StateStore,
    processes: Arc<dyn ProcessControl>,
    tool: Arc<dyn MediaTool>,
    settings: Settings,
    /// Captures spawned or adopted by this instance
    captures: Mutex<Vec<CaptureProcess>>,
    /// Recoverable-artifacts hint from the last reconcile
    crashed: Mutex<Option<RecordingSession>>,
}

impl ProcessSupervisor {
    /// Create a supervisor and reconcile whatever is on disk
    pub fn new(
        settings: Settings,
        processes: Arc<dyn ProcessControl>,
        tool: Arc<dyn MediaTool>,
    ) -> Self {
        let supervisor = Self {
            store: StateStore::new(settings.state_dir.clone()),
            processes,
            tool,
            settings,
            captures: Mutex::new(Vec::new()),
            crashed: Mutex::new(None),
        };

        match supervisor.reconcile() {
            Ok(Reconciliation::Crashed(session)) => {
                tracing::warn!(
                    "Found crashed recording from {} with partial captures in {:?}",
                    session.started_at,
                    session.output_dir
                );
            }
            Ok(Reconciliation::Live(session)) => {
                tracing::info!(
                    "Recording from {} is in progress ({})",
                    session.started_at,
                    session.phase.marker()
                );
            }
            Ok(Reconciliation::Interrupted(session)) => {
                tracing::warn!(
                    "Captures {:?} of an unfinished start are still running",
                    session.recorded_pids()
                );
            }
            Ok(Reconciliation::NoSession) => {}
            Err(e) => tracing::warn!("Could not read recording state: {}", e),
        }

        supervisor
    }

    /// Supervisor over real processes and the configured ffmpeg
    pub fn with_system(settings: Settings) -> Self {
        let tool = Arc::new(FfmpegTool::new(settings.ffmpeg.clone(), settings.ffprobe.clone()));
        Self::new(settings, Arc::new(SystemProcesses::new()), tool)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Cross-check the store against liveness and refresh the crashed-session hint
    pub fn reconcile(&self) -> Result<Reconciliation, RecorderError> {
        let reconciliation = match self.store.read(self.processes.as_ref())? {
            StoredSession::Absent => Reconciliation::NoSession,
            StoredSession::Live(session) => Reconciliation::Live(session),
            StoredSession::Stale(mut session) => {
                session.active = false;
                Reconciliation::Crashed(session)
            }
            StoredSession::Interrupted(session) => Reconciliation::Interrupted(session),
        };

        *self.crashed.lock() = match &reconciliation {
            Reconciliation::Crashed(session) | Reconciliation::Interrupted(session) => {
                Some(session.clone())
            }
            _ => None,
        };

        Ok(reconciliation)
    }

    /// The crashed session found by the last reconcile, if any
    pub fn crashed_session(&self) -> Option<RecordingSession> {
        self.crashed.lock().clone()
    }

    /// Captures this instance is supervising
    pub fn captures(&self) -> Vec<CaptureProcess> {
        self.captures.lock().clone()
    }

    /// Current status; reconciles on every call
    pub fn status(&self) -> Result<RecordingStatus, RecorderError> {
        Ok(match self.reconcile()? {
            Reconciliation::NoSession => RecordingStatus::idle(),
            Reconciliation::Live(session) => RecordingStatus::live(&session),
            Reconciliation::Crashed(session) | Reconciliation::Interrupted(session) => {
                RecordingStatus::crashed(&session)
            }
        })
    }

    /// Start a new recording session
    pub async fn start(
        &self,
        options: &RecordingOptions,
    ) -> Result<RecordingSession, RecorderError> {
        match self.reconcile()? {
            Reconciliation::Live(session) => {
                return Err(RecorderError::AlreadyRecording {
                    started_at: session.started_at,
                });
            }
            Reconciliation::Crashed(session) | Reconciliation::Interrupted(session)
                if !options.discard_stale =>
            {
                return Err(RecorderError::StaleSessionDetected {
                    started_at: session.started_at,
                    captures: session.existing_outputs(),
                });
            }
            Reconciliation::Crashed(session) => {
                tracing::warn!("Discarding crashed recording from {}", session.started_at);
                *self.crashed.lock() = None;
            }
            Reconciliation::Interrupted(session) => {
                tracing::warn!("Discarding unfinished start from {}", session.started_at);
                self.terminate_leftovers(&session).await?;
                *self.crashed.lock() = None;
            }
            Reconciliation::NoSession => {}
        }

        let sources = options.enabled_sources();
        if sources.is_empty() {
            return Err(RecorderError::CaptureSpawnFailure(
                "no capture sources enabled".to_string(),
            ));
        }

        let started_at = Utc::now();
        let root = options
            .output_root
            .clone()
            .unwrap_or_else(|| self.settings.output_root.clone());
        let output_dir = bundle::session_dir(&root, &options.metadata, started_at);
        fs::create_dir_all(&output_dir)?;

        // Unmarked facts left here have no live process behind them
        self.store.clear()?;

        let mut session = RecordingSession::new(
            options.monitor_id.clone(),
            Some(output_dir.clone()),
            options.vertical,
        );
        session.started_at = started_at;
        self.store.write_header(&session)?;

        tracing::info!("Starting recording into {:?}", output_dir);

        let mut spawned: Vec<CaptureProcess> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for (kind, source) in sources {
            let command = capture::capture_command(kind, options, &self.settings, &output_dir);
            match self.processes.spawn(&command) {
                Ok(pid) => {
                    let process = CaptureProcess {
                        kind,
                        pid,
                        output_path: command.output_path.clone(),
                        requirement: source.requirement,
                        liveness: Liveness::Alive,
                    };
                    spawned.push(process);
                    if let Err(e) = self.store.write_capture(kind, pid, &command.output_path) {
                        self.abort_start(&spawned, &output_dir).await;
                        return Err(e.into());
                    }
                    session.set_pid(kind, Some(pid));
                    session.set_path(kind, Some(command.output_path));
                    tracing::info!(kind = %kind, pid, "Capture started");
                }
                Err(e) if source.requirement == Requirement::Required => {
                    tracing::error!(kind = %kind, "Required capture failed to start: {}", e);
                    self.abort_start(&spawned, &output_dir).await;
                    return Err(RecorderError::CaptureSpawnFailure(format!(
                        "{} capture: {}",
                        kind, e
                    )));
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, "Optional capture failed to start: {}", e);
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }

        // Give each capture a moment to fail on a bad device before declaring success
        if !spawned.is_empty() && !self.settings.spawn_settle().is_zero() {
            tokio::time::sleep(self.settings.spawn_settle()).await;
        }

        let mut survivors = Vec::with_capacity(spawned.len());
        for mut process in spawned {
            if self.processes.is_alive(process.pid) {
                survivors.push(process);
                continue;
            }

            process.liveness = Liveness::Dead;
            if process.requirement == Requirement::Required {
                let kind = process.kind;
                tracing::error!(
                    kind = %kind,
                    pid = process.pid,
                    "Required capture exited immediately"
                );
                survivors.push(process);
                self.abort_start(&survivors, &output_dir).await;
                return Err(RecorderError::CaptureSpawnFailure(format!(
                    "{} capture exited immediately",
                    kind
                )));
            }

            tracing::warn!(
                kind = %process.kind,
                pid = process.pid,
                "Optional capture exited immediately"
            );
            failures.push(format!("{}: exited immediately", process.kind));
            self.store.remove_capture(process.kind)?;
            session.set_pid(process.kind, None);
            session.set_path(process.kind, None);
        }

        if survivors.is_empty() {
            self.abort_start(&survivors, &output_dir).await;
            return Err(RecorderError::CaptureSpawnFailure(format!(
                "every capture source failed ({})",
                failures.join("; ")
            )));
        }

        session.active = true;
        if let Err(e) = self.store.mark(SessionPhase::Recording) {
            self.abort_start(&survivors, &output_dir).await;
            return Err(e.into());
        }

        tracing::info!("Recording started with {} capture(s)", survivors.len());
        *self.captures.lock() = survivors;
        Ok(session)
    }

    /// Kill whatever a failed start spawned and leave no partial state behind
    async fn abort_start(&self, spawned: &[CaptureProcess], output_dir: &Path) {
        let pids: Vec<u32> = spawned.iter().map(|p| p.pid).collect();
        for pid in &pids {
            if let Err(e) = self.processes.signal(*pid, Signal::Kill) {
                tracing::warn!(pid, "Failed to kill capture: {}", e);
            }
        }
        let survivors = wait_for_exit(
            self.processes.as_ref(),
            &pids,
            self.settings.force_kill_wait(),
            self.settings.poll_interval(),
        )
        .await;
        if !survivors.is_empty() {
            tracing::error!("Captures {:?} survived SIGKILL", survivors);
        }

        if let Err(e) = self.store.clear() {
            tracing::error!("Failed to clear recording state: {}", e);
        }
        // Only succeeds while the folder is still empty
        let _ = fs::remove_dir(output_dir);
        self.captures.lock().clear();
    }

    /// Stop the still-running captures of an unfinished start and forget it
    async fn terminate_leftovers(&self, session: &RecordingSession) -> Result<(), RecorderError> {
        let pids: Vec<u32> = session
            .recorded_pids()
            .into_iter()
            .filter(|pid| self.processes.is_alive(*pid))
            .collect();
        tracing::info!("Stopping leftover captures {:?}", pids);

        let survivors =
            interrupt_then_kill(self.processes.as_ref(), &pids, &self.settings).await?;
        if !survivors.is_empty() {
            return Err(RecorderError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("leftover captures {:?} survived SIGKILL", survivors),
            )));
        }
        self.store.clear()?;
        Ok(())
    }

    /// Adopt a live session started by another instance
    pub fn attach(&self) -> Result<RecordingSession, RecorderError> {
        match self.reconcile()? {
            Reconciliation::NoSession => Err(RecorderError::NotRecording),
            Reconciliation::Crashed(session) | Reconciliation::Interrupted(session) => {
                Err(RecorderError::StaleSessionDetected {
                    started_at: session.started_at,
                    captures: session.existing_outputs(),
                })
            }
            Reconciliation::Live(session) => {
                let adopted: Vec<CaptureProcess> = CaptureKind::ALL
                    .iter()
                    .filter_map(|kind| {
                        let pid = session.pid(*kind)?;
                        let output_path = session.path(*kind)?.to_path_buf();
                        let liveness = if self.processes.is_alive(pid) {
                            Liveness::Alive
                        } else {
                            Liveness::Dead
                        };
                        Some(CaptureProcess {
                            kind: *kind,
                            pid,
                            output_path,
                            requirement: Requirement::Optional,
                            liveness,
                        })
                    })
                    .collect();
                tracing::info!(
                    "Attached to recording from {} ({} captures)",
                    session.started_at,
                    adopted.len()
                );
                *self.captures.lock() = adopted;
                Ok(session)
            }
        }
    }

    /// Stop capture and post-process in the background.
    ///
    /// Returns `None` when there is nothing to stop: no session, a crashed
    /// one (see [`recover`](Self::recover)) or one already being processed.
    pub fn stop(self: &Arc<Self>) -> Result<Option<PipelineHandle>, RecorderError> {
        let session = match self.reconcile()? {
            Reconciliation::NoSession => {
                tracing::debug!("Stop requested with no active recording");
                return Ok(None);
            }
            Reconciliation::Crashed(session) => {
                tracing::info!(
                    "Recording from {} has no live captures; use recover to process it",
                    session.started_at
                );
                return Ok(None);
            }
            Reconciliation::Interrupted(session) => {
                tracing::info!(
                    "Start from {} never finished; use recover or discard",
                    session.started_at
                );
                return Ok(None);
            }
            Reconciliation::Live(session) if session.phase == SessionPhase::Processing => {
                tracing::info!(
                    "Recording is already being processed by pid {:?}",
                    session.processor_pid
                );
                return Ok(None);
            }
            Reconciliation::Live(session) => session,
        };

        self.store.mark_processing(self.processes.current_pid())?;
        self.store.clear_stop_request()?;
        tracing::info!("Stopping recording from {}", session.started_at);
        Ok(Some(self.launch(session)))
    }

    /// Post-process the partial captures of a crashed session.
    ///
    /// Captures still running after an unfinished start are stopped by the
    /// pipeline's first stage like any other.
    pub fn recover(self: &Arc<Self>) -> Result<Option<PipelineHandle>, RecorderError> {
        match self.reconcile()? {
            Reconciliation::NoSession => Ok(None),
            Reconciliation::Live(session) => Err(RecorderError::AlreadyRecording {
                started_at: session.started_at,
            }),
            Reconciliation::Crashed(session) | Reconciliation::Interrupted(session) => {
                self.store.mark_processing(self.processes.current_pid())?;
                *self.crashed.lock() = None;
                tracing::info!("Recovering crashed recording from {}", session.started_at);
                Ok(Some(self.launch(session)))
            }
        }
    }

    /// Clear a crashed session; its files stay in the output folder
    pub async fn discard_stale(&self) -> Result<Option<RecordingSession>, RecorderError> {
        match self.reconcile()? {
            Reconciliation::NoSession => Ok(None),
            Reconciliation::Live(session) => Err(RecorderError::AlreadyRecording {
                started_at: session.started_at,
            }),
            Reconciliation::Interrupted(session) => {
                self.terminate_leftovers(&session).await?;
                *self.crashed.lock() = None;
                tracing::info!("Discarded unfinished start from {}", session.started_at);
                Ok(Some(session))
            }
            Reconciliation::Crashed(session) => {
                self.store.clear()?;
                *self.crashed.lock() = None;
                tracing::info!("Discarded crashed recording from {}", session.started_at);
                Ok(Some(session))
            }
        }
    }

    /// Ask the instance owning the capture to stop it.
    ///
    /// Returns whether a live recording was there to receive the request.
    pub fn request_stop(&self) -> Result<bool, RecorderError> {
        match self.reconcile()? {
            Reconciliation::Live(session) if session.phase == SessionPhase::Recording => {
                self.store.request_stop()?;
                tracing::info!("Stop requested for recording from {}", session.started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.store.stop_requested()
    }

    /// Block until a stop is requested or the session ends some other way
    pub async fn wait_for_stop_request(&self) -> Result<StopTrigger, RecorderError> {
        loop {
            if self.store.stop_requested() {
                return Ok(StopTrigger::Requested);
            }
            match self.store.read(self.processes.as_ref())? {
                StoredSession::Absent => return Ok(StopTrigger::StoppedElsewhere),
                StoredSession::Live(session) if session.phase == SessionPhase::Processing => {
                    return Ok(StopTrigger::StoppedElsewhere);
                }
                StoredSession::Interrupted(_) => return Ok(StopTrigger::StoppedElsewhere),
                StoredSession::Stale(_) => return Ok(StopTrigger::CapturesExited),
                StoredSession::Live(_) => {}
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    /// Run the standard pipeline over `session` on a background task
    fn launch(self: &Arc<Self>, session: RecordingSession) -> PipelineHandle {
        let terminator = Arc::new(SessionTerminator {
            supervisor: Arc::clone(self),
            session: session.clone(),
        });
        let pipeline =
            PostProcessingPipeline::standard(terminator, Arc::clone(&self.tool), &self.settings);
        let run = Arc::new(Mutex::new(pipeline.new_run()));
        let stage_names = pipeline.stage_names().into_iter().map(String::from).collect();
        let (events, receiver) = progress::channel(self.settings.progress_buffer);
        let mut ctx = StageContext::for_session(&session, &self.settings.output_root);

        let supervisor = Arc::clone(self);
        let shared = Arc::clone(&run);
        let join = tokio::spawn(async move {
            let finished = pipeline.run(&mut ctx, &shared, &events).await;
            supervisor.finish_session(&session, &ctx, &finished);
            finished
        });

        PipelineHandle {
            events: receiver,
            stage_names,
            run,
            join,
        }
    }

    /// Write the report and release the host-wide session
    fn finish_session(&self, session: &RecordingSession, ctx: &StageContext, run: &PipelineRun) {
        let report = SessionReport {
            started_at: session.started_at,
            captures: session.existing_outputs(),
            landscape_output: ctx.landscape_output.clone(),
            vertical_output: ctx.vertical_output.clone(),
            warnings: ctx.warnings.clone(),
            run: run.clone(),
        };
        if let Err(e) = bundle::write_report(&report, &ctx.output_dir) {
            tracing::warn!("Failed to write session report: {}", e);
        }

        if let Err(e) = self.store.clear() {
            tracing::error!("Failed to clear recording state: {}", e);
        }
        self.captures.lock().clear();
        tracing::info!("Recording from {} finished ({:?})", session.started_at, run.status);
    }
}

/// First pipeline stage: graceful-then-forced termination of the session's captures
struct SessionTerminator {
    supervisor: Arc<ProcessSupervisor>,
    session: RecordingSession,
}

#[async_trait]
impl CaptureTerminator for SessionTerminator {
    async fn terminate(&self, progress: &StageProgress<'_>) -> Result<CaptureOutputs, StageError> {
        let supervisor = &self.supervisor;
        let control = supervisor.processes.as_ref();
        let settings = &supervisor.settings;

        let live: Vec<(CaptureKind, u32)> = CaptureKind::ALL
            .iter()
            .filter_map(|kind| self.session.pid(*kind).map(|pid| (*kind, pid)))
            .filter(|(_, pid)| control.is_alive(*pid))
            .collect();

        for (kind, pid) in &live {
            tracing::debug!(kind = %kind, pid, "Interrupting capture");
        }
        let pids: Vec<u32> = live.iter().map(|(_, pid)| *pid).collect();
        let survivors = interrupt_then_kill(control, &pids, settings).await?;
        if !survivors.is_empty() {
            return Err(StageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("captures {:?} survived SIGKILL", survivors),
            )));
        }

        for kind in CaptureKind::ALL {
            if self.session.pid(kind).is_some() {
                supervisor.store.remove_pid(kind)?;
            }
        }
        for process in supervisor.captures.lock().iter_mut() {
            process.liveness = Liveness::Dead;
        }
        progress.report(100.0);

        let outputs = self.session.existing_outputs();
        for kind in CaptureKind::ALL {
            if self.session.path(kind).is_some() && output_of(&outputs, kind).is_none() {
                tracing::warn!(kind = %kind, "Capture file is missing");
            }
        }
        Ok(outputs)
    }
}

/// SIGINT, a grace period, then SIGKILL for whatever ignored it.
///
/// Returns the PIDs that outlived the forced kill.
async fn interrupt_then_kill(
    control: &dyn ProcessControl,
    pids: &[u32],
    settings: &Settings,
) -> io::Result<Vec<u32>> {
    for pid in pids {
        control.signal(*pid, Signal::Interrupt)?;
    }
    let stubborn =
        wait_for_exit(control, pids, settings.grace_period(), settings.poll_interval()).await;
    if stubborn.is_empty() {
        return Ok(stubborn);
    }

    tracing::warn!("Captures {:?} ignored the interrupt, killing", stubborn);
    for pid in &stubborn {
        control.signal(*pid, Signal::Kill)?;
    }
    let survivors = wait_for_exit(
        control,
        &stubborn,
        settings.force_kill_wait(),
        settings.poll_interval(),
    )
    .await;
    Ok(survivors)
}

fn output_of(outputs: &CaptureOutputs, kind: CaptureKind) -> Option<&PathBuf> {
    match kind {
        CaptureKind::Screen => outputs.video.as_ref(),
        CaptureKind::Audio => outputs.audio.as_ref(),
        CaptureKind::Webcam => outputs.webcam.as_ref(),
    }
}

/// A post-processing run executing in the background
pub struct PipelineHandle {
    events: ProgressReceiver,
    stage_names: Vec<String>,
    run: Arc<Mutex<PipelineRun>>,
    join: JoinHandle<PipelineRun>,
}

impl PipelineHandle {
    pub fn stage_names(&self) -> &[String] {
        &self.stage_names
    }

    /// Progress events of this run
    pub fn events(&mut self) -> &mut ProgressReceiver {
        &mut self.events
    }

    /// Current state of the run
    pub fn snapshot(&self) -> PipelineRun {
        self.run.lock().clone()
    }

    /// Wait for the run to finish and the session to be released
    pub async fn join(self) -> Result<PipelineRun, RecorderError> {
        self.join
            .await
            .map_err(|e| RecorderError::PipelineAborted(e.to_string()))
    }
}
