//! OS process control
//!
//! The supervisor never touches `std::process` or signals directly; it goes
//! through [`ProcessControl`] so that liveness and termination can be
//! exercised without spawning real capture tools.

use super::state::CaptureKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::Instant;

/// Signals the supervisor sends to capture processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful stop; ffmpeg finalizes the container on SIGINT
    Interrupt,
    Kill,
}

impl Signal {
    fn as_raw(&self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// A fully resolved capture command
#[derive(Debug, Clone)]
pub struct CaptureCommand {
    pub kind: CaptureKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output_path: PathBuf,
    /// Where the tool's stderr is written
    pub log_path: Option<PathBuf>,
}

/// Spawning, probing and signalling processes
pub trait ProcessControl: Send + Sync {
    /// Spawn a detached capture process and return its PID
    fn spawn(&self, command: &CaptureCommand) -> io::Result<u32>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver a signal; a process that is already gone is not an error
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// PID of the current instance
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// [`ProcessControl`] backed by real processes
#[derive(Default)]
pub struct SystemProcesses {
    /// Children spawned by this instance; kept so they can be reaped
    children: Mutex<HashMap<u32, Child>>,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    fn valid_pid(pid: u32) -> Option<libc::pid_t> {
        // 0 and negative values address process groups
        match libc::pid_t::try_from(pid) {
            Ok(raw) if raw > 0 => Some(raw),
            _ => None,
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn spawn(&self, command: &CaptureCommand) -> io::Result<u32> {
        let stderr = match &command.log_path {
            Some(path) => Stdio::from(File::create(path)?),
            None => Stdio::null(),
        };

        tracing::debug!(
            kind = %command.kind,
            "Spawning capture: {:?} {:?}",
            command.program,
            command.args
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);

        // Own process group: a terminal Ctrl-C must not reach the captures
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;

        let pid = child.id();
        self.children.lock().insert(pid, child);
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        {
            let mut children = self.children.lock();
            if let Some(child) = children.get_mut(&pid) {
                match child.try_wait() {
                    Ok(Some(_)) => {
                        children.remove(&pid);
                        return false;
                    }
                    Ok(None) => return true,
                    Err(e) => {
                        tracing::warn!(pid, "Failed to poll child status: {}", e);
                    }
                }
            }
        }

        let Some(raw) = Self::valid_pid(pid) else {
            return false;
        };

        // Signal 0 only checks existence; EPERM still means the PID is taken
        let exists = unsafe { libc::kill(raw, 0) } == 0
            || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);

        exists && !is_zombie(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let Some(raw) = Self::valid_pid(pid) else {
            return Ok(());
        };

        if unsafe { libc::kill(raw, signal.as_raw()) } == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Exited processes not yet reaped by their parent still answer signal 0
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // The state field follows the parenthesised command name
            let after_name = stat.rfind(')')?;
            stat[after_name + 1..].split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Poll until none of `pids` is alive or `timeout` elapses.
///
/// Returns the PIDs still alive at the deadline.
pub async fn wait_for_exit(
    control: &dyn ProcessControl,
    pids: &[u32],
    timeout: Duration,
    poll: Duration,
) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<u32> = pids
            .iter()
            .copied()
            .filter(|pid| control.is_alive(*pid))
            .collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(poll).await;
    }
}
