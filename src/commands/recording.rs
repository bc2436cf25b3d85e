//! Recording command handlers

use super::processing;
use crate::pipeline::types::{PipelineRun, RunStatus};
use crate::recorder::state::{RecordingOptions, RecordingSession, RecordingStatus};
use crate::recorder::{ProcessSupervisor, StopTrigger};
use crate::utils::{AppError, AppResult};
use colored::*;
use std::sync::Arc;

/// Start recording in the background and return immediately
pub async fn start(
    supervisor: &ProcessSupervisor,
    options: &RecordingOptions,
) -> AppResult<RecordingSession> {
    let session = supervisor.start(options).await?;
    print_started(&session);
    println!("  Run {} to finish and process it", "screenrec stop".bold());
    Ok(session)
}

/// Record in the foreground until Ctrl-C or a stop request, then process
pub async fn record(
    supervisor: &Arc<ProcessSupervisor>,
    options: &RecordingOptions,
) -> AppResult<Option<PipelineRun>> {
    let session = supervisor.start(options).await?;
    print_started(&session);
    println!("  Press {} or run {} to stop", "Ctrl-C".bold(), "screenrec stop".bold());

    let trigger = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            StopTrigger::Requested
        }
        trigger = supervisor.wait_for_stop_request() => trigger?,
    };

    match trigger {
        StopTrigger::StoppedElsewhere => {
            println!("{}", "Recording was stopped by another instance".yellow());
            Ok(None)
        }
        StopTrigger::CapturesExited => {
            println!(
                "{}",
                "Every capture exited on its own, processing what was recorded".yellow()
            );
            recover(supervisor).await
        }
        StopTrigger::Requested => finish(supervisor).await,
    }
}

/// Stop the live recording and process it here, or only signal the owner
pub async fn stop(
    supervisor: &Arc<ProcessSupervisor>,
    signal_only: bool,
) -> AppResult<Option<PipelineRun>> {
    if signal_only {
        if supervisor.request_stop()? {
            println!("{} Stop requested", "✓".green());
        } else {
            println!("{}", "No recording in progress".yellow());
        }
        return Ok(None);
    }
    finish(supervisor).await
}

async fn finish(supervisor: &Arc<ProcessSupervisor>) -> AppResult<Option<PipelineRun>> {
    match supervisor.stop()? {
        Some(handle) => {
            let run = processing::follow(handle, processing::TICK).await?;
            into_result(run).map(Some)
        }
        None => {
            match supervisor.crashed_session() {
                Some(session) => println!(
                    "{} Recording from {} crashed; run {} or {}",
                    "!".yellow(),
                    session.started_at.format("%Y-%m-%d %H:%M:%S"),
                    "screenrec recover".bold(),
                    "screenrec discard".bold()
                ),
                None => println!("{}", "No recording in progress".yellow()),
            }
            Ok(None)
        }
    }
}

/// Print the reconciled status
pub fn status(supervisor: &ProcessSupervisor, json: bool) -> AppResult<RecordingStatus> {
    let status = supervisor.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(status);
    }

    let state = if status.is_recording {
        "recording".green()
    } else if status.is_processing {
        "processing".cyan()
    } else if status.crashed {
        "crashed".red()
    } else {
        "idle".dimmed()
    };
    println!("Status: {}", state);

    if let Some(start) = status.start_time {
        println!("  Started: {}", start.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    for (label, file) in [
        ("Video", &status.video_file),
        ("Audio", &status.audio_file),
        ("Webcam", &status.webcam_file),
    ] {
        if let Some(file) = file {
            println!("  {}: {}", label, file);
        }
    }
    if status.crashed {
        println!(
            "  Partial captures may be usable; run {} or {}",
            "screenrec recover".bold(),
            "screenrec discard".bold()
        );
    }
    Ok(status)
}

/// Process the partial captures of a crashed session
pub async fn recover(supervisor: &Arc<ProcessSupervisor>) -> AppResult<Option<PipelineRun>> {
    match supervisor.recover()? {
        Some(handle) => {
            let run = processing::follow(handle, processing::TICK).await?;
            into_result(run).map(Some)
        }
        None => {
            println!("{}", "No crashed recording to recover".yellow());
            Ok(None)
        }
    }
}

/// Forget a crashed session
pub async fn discard(supervisor: &ProcessSupervisor) -> AppResult<()> {
    match supervisor.discard_stale().await? {
        Some(session) => {
            println!(
                "{} Discarded crashed recording from {}",
                "✓".green(),
                session.started_at.format("%Y-%m-%d %H:%M:%S")
            );
            if let Some(dir) = session.output_dir {
                println!("  Its files are still in {}", dir.display());
            }
        }
        None => println!("{}", "No crashed recording to discard".yellow()),
    }
    Ok(())
}

fn print_started(session: &RecordingSession) {
    println!("{} Recording started", "●".red());
    if let Some(dir) = &session.output_dir {
        println!("  Output: {}", dir.display());
    }
}

fn into_result(run: PipelineRun) -> AppResult<PipelineRun> {
    match (&run.status, &run.overall_error) {
        (RunStatus::Failed, Some(failure)) => Err(AppError::Processing(failure.clone())),
        _ => Ok(run),
    }
}
