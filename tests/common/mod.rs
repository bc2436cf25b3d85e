//! In-memory stand-ins for OS processes and ffmpeg

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use screenrec::config::Settings;
use screenrec::pipeline::ffmpeg::{MediaTool, ToolError, ToolInvocation, ToolOutput};
use screenrec::recorder::process::{CaptureCommand, ProcessControl, Signal};
use screenrec::recorder::state::CaptureKind;
use screenrec::recorder::ProcessSupervisor;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// PID the fake reports for the current instance
pub const INSTANCE_PID: u32 = 1;

pub const LOUDNORM_REPORT: &str = r#"[Parsed_loudnorm_0 @ 0x7f8]
{
	"input_i" : "-24.10",
	"input_tp" : "-3.20",
	"input_lra" : "5.40",
	"input_thresh" : "-34.50",
	"output_i" : "-16.02",
	"output_tp" : "-1.50",
	"output_lra" : "4.90",
	"output_thresh" : "-26.40",
	"normalization_type" : "dynamic",
	"target_offset" : "0.02"
}
"#;

/// Processes that exist only as PIDs in a set
pub struct FakeProcesses {
    alive: Mutex<HashSet<u32>>,
    next_pid: AtomicU32,
    spawned: Mutex<Vec<(CaptureKind, u32)>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    fail_spawn: Mutex<HashSet<CaptureKind>>,
    exit_on_spawn: Mutex<HashSet<CaptureKind>>,
    ignore_interrupt: Mutex<bool>,
    skip_output: Mutex<HashSet<CaptureKind>>,
}

impl FakeProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: Mutex::new(HashSet::from([INSTANCE_PID])),
            next_pid: AtomicU32::new(1000),
            spawned: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            fail_spawn: Mutex::new(HashSet::new()),
            exit_on_spawn: Mutex::new(HashSet::new()),
            ignore_interrupt: Mutex::new(false),
            skip_output: Mutex::new(HashSet::new()),
        })
    }

    /// Spawning `kind` fails outright
    pub fn fail_spawn(&self, kind: CaptureKind) {
        self.fail_spawn.lock().insert(kind);
    }

    /// `kind` spawns but is dead by the time anyone looks
    pub fn exit_on_spawn(&self, kind: CaptureKind) {
        self.exit_on_spawn.lock().insert(kind);
    }

    /// `kind` never writes its capture file
    pub fn skip_output(&self, kind: CaptureKind) {
        self.skip_output.lock().insert(kind);
    }

    /// Captures only die on SIGKILL
    pub fn ignore_interrupt(&self) {
        *self.ignore_interrupt.lock() = true;
    }

    /// Every process dies, the current instance included
    pub fn kill_all(&self) {
        self.alive.lock().clear();
    }

    /// Every capture dies; the current instance survives
    pub fn kill_captures(&self) {
        self.alive.lock().retain(|pid| *pid == INSTANCE_PID);
    }

    pub fn spawned(&self) -> Vec<(CaptureKind, u32)> {
        self.spawned.lock().clone()
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().clone()
    }

    pub fn live_captures(&self) -> usize {
        self.alive.lock().iter().filter(|pid| **pid != INSTANCE_PID).count()
    }
}

impl ProcessControl for FakeProcesses {
    fn spawn(&self, command: &CaptureCommand) -> io::Result<u32> {
        if self.fail_spawn.lock().contains(&command.kind) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        if !self.skip_output.lock().contains(&command.kind) {
            fs::write(&command.output_path, b"raw capture")?;
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if !self.exit_on_spawn.lock().contains(&command.kind) {
            self.alive.lock().insert(pid);
        }
        self.spawned.lock().push((command.kind, pid));
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        self.signals.lock().push((pid, signal));
        if signal == Signal::Kill || !*self.ignore_interrupt.lock() {
            self.alive.lock().remove(&pid);
        }
        Ok(())
    }

    fn current_pid(&self) -> u32 {
        INSTANCE_PID
    }
}

/// ffmpeg stand-in that writes its output file and records each invocation
pub struct FakeTool {
    calls: Mutex<Vec<ToolInvocation>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
}

impl FakeTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
        })
    }

    /// Invocations labelled `label` exit non-zero
    pub fn fail(&self, label: &str) {
        self.failing.lock().insert(label.to_string());
    }

    /// Invocations labelled `label` never finish
    pub fn hang(&self, label: &str) {
        self.hanging.lock().insert(label.to_string());
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls.lock().iter().map(|call| call.label.clone()).collect()
    }

    pub fn call(&self, label: &str) -> Option<ToolInvocation> {
        self.calls.lock().iter().find(|call| call.label == label).cloned()
    }
}

#[async_trait]
impl MediaTool for FakeTool {
    async fn run(
        &self,
        invocation: ToolInvocation,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ToolOutput, ToolError> {
        self.calls.lock().push(invocation.clone());
        let label = invocation.label.clone();

        if self.hanging.lock().contains(&label) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.failing.lock().contains(&label) {
            return Err(ToolError::Exited {
                label,
                code: Some(1),
                stderr: "simulated failure".to_string(),
            });
        }

        progress(25.0);
        progress(75.0);

        if let Some(output) = invocation.args.last().filter(|arg| arg.as_str() != "-") {
            fs::write(output, b"processed")?;
        }

        let stderr = if label == "analyze" {
            LOUDNORM_REPORT.to_string()
        } else {
            String::new()
        };
        Ok(ToolOutput {
            stdout: String::new(),
            stderr,
        })
    }

    async fn probe_duration(&self, _path: &Path) -> Result<Option<Duration>, ToolError> {
        Ok(Some(Duration::from_secs(10)))
    }
}

/// Settings rooted in a temporary directory with near-instant waits
pub fn test_settings(root: &Path) -> Settings {
    Settings {
        state_dir: root.join("state"),
        output_root: root.join("recordings"),
        grace_period_ms: 40,
        force_kill_wait_ms: 40,
        spawn_settle_ms: 0,
        poll_interval_ms: 5,
        stage_timeout_secs: 5,
        ..Settings::default()
    }
}

pub fn supervisor(
    root: &Path,
    processes: &Arc<FakeProcesses>,
    tool: &Arc<FakeTool>,
) -> Arc<ProcessSupervisor> {
    Arc::new(ProcessSupervisor::new(
        test_settings(root),
        Arc::clone(processes) as Arc<dyn ProcessControl>,
        Arc::clone(tool) as Arc<dyn MediaTool>,
    ))
}
