//! Processing view
//!
//! Follows a background pipeline run on a fixed tick, draining the
//! progress bus without ever blocking on it, and prints the stage list as
//! it changes.

use crate::pipeline::progress::{ProgressEvent, TryRecvError};
use crate::pipeline::types::{PipelineRun, RunStatus, StageRecord, StageStatus};
use crate::recorder::PipelineHandle;
use crate::utils::AppResult;
use colored::*;
use std::time::Duration;

/// Tick of the presentation loop
pub const TICK: Duration = Duration::from_millis(100);

const SPINNER: [&str; 4] = ["|", "/", "-", "\\"];

/// Percentage steps between two printed progress lines
const PROGRESS_STEP: f32 = 10.0;

/// Render the run until it finishes, then wait for the session to be released
pub async fn follow(mut handle: PipelineHandle, tick: Duration) -> AppResult<PipelineRun> {
    let mut mirror = PipelineRun::new(handle.stage_names().iter().cloned());
    let mut printed_progress: Vec<f32> = vec![0.0; mirror.stages.len()];
    let mut interval = tokio::time::interval(tick);
    let mut frame = 0usize;

    println!("{}", "Processing recording...".cyan());

    'ticks: loop {
        interval.tick().await;
        frame = frame.wrapping_add(1);

        loop {
            match handle.events().try_recv() {
                Ok(event) => {
                    mirror.apply(&event);
                    match &event {
                        ProgressEvent::StageStarted { index }
                        | ProgressEvent::StageFinished { index, .. } => {
                            if let Some(record) = mirror.stages.get(*index) {
                                println!("{}", stage_line(record, None));
                            }
                        }
                        ProgressEvent::StageProgress { index, percent } => {
                            if let (Some(record), Some(last)) =
                                (mirror.stages.get(*index), printed_progress.get_mut(*index))
                            {
                                if *percent - *last >= PROGRESS_STEP {
                                    *last = *percent;
                                    println!("{}", stage_line(record, None));
                                }
                            }
                        }
                        ProgressEvent::RunFinished { .. } => break 'ticks,
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => break 'ticks,
            }
        }

        // Indeterminate stages get a spinner line now and then
        if frame % 50 == 0 {
            if let Some(record) = running_stage(&mirror) {
                println!("{}", stage_line(record, Some(SPINNER[(frame / 50) % SPINNER.len()])));
            }
        }
    }

    if handle.events().dropped() > 0 {
        tracing::debug!("{} progress updates were dropped", handle.events().dropped());
    }

    let run = handle.join().await?;
    print_summary(&run);
    Ok(run)
}

fn running_stage(run: &PipelineRun) -> Option<&StageRecord> {
    let index = usize::try_from(run.current_index).ok()?;
    run.stages
        .get(index)
        .filter(|record| record.status == StageStatus::Running)
}

/// One line of the stage list
pub fn stage_line(record: &StageRecord, spinner: Option<&str>) -> String {
    match record.status {
        StageStatus::Pending => format!("  {} {}", "·".dimmed(), record.name.dimmed()),
        StageStatus::Running => {
            let progress = match record.progress {
                Some(percent) => format!("{:>3.0}%", percent),
                None => spinner.unwrap_or("...").to_string(),
            };
            format!("  {} {} {}", "▶".cyan(), record.name, progress.cyan())
        }
        StageStatus::Complete => format!("  {} {}", "✓".green(), record.name),
        StageStatus::Skipped => match &record.message {
            Some(reason) => format!(
                "  {} {} {}",
                "-".dimmed(),
                record.name.dimmed(),
                format!("({})", reason).dimmed()
            ),
            None => format!("  {} {}", "-".dimmed(), record.name.dimmed()),
        },
        StageStatus::Failed => match &record.message {
            Some(message) => format!("  {} {}: {}", "✗".red(), record.name, message.red()),
            None => format!("  {} {}", "✗".red(), record.name),
        },
    }
}

/// Final stage list with the overall verdict
pub fn print_summary(run: &PipelineRun) {
    println!();
    for record in &run.stages {
        println!("{}", stage_line(record, None));
    }
    println!();

    match (&run.status, &run.overall_error) {
        (RunStatus::Complete, _) => {
            let failed = run.failed_stages().count();
            if failed == 0 {
                println!("{} Processing complete", "✓".green());
            } else {
                println!(
                    "{} Processing complete with {} non-fatal failure(s)",
                    "✓".yellow(),
                    failed
                );
            }
        }
        (_, Some(failure)) => println!("{} {}", "✗".red(), failure.to_string().red()),
        (status, None) => println!("{} Processing ended: {:?}", "✗".red(), status),
    }
}
