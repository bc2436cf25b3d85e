//! Runtime settings
//!
//! Settings have sensible defaults and can be overridden through
//! `SCREENREC_*` environment variables.

use crate::pipeline::ffmpeg::LoudnessTarget;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Input formats and devices handed to ffmpeg for each capture source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureBackend {
    pub screen_format: String,
    /// Screen input; `{monitor}` is replaced by the selected monitor
    pub screen_input: String,
    pub default_monitor: String,
    pub framerate: u32,
    pub audio_format: String,
    pub audio_device: String,
    pub webcam_format: String,
    pub webcam_device: String,
}

impl Default for CaptureBackend {
    #[cfg(target_os = "macos")]
    fn default() -> Self {
        Self {
            screen_format: "avfoundation".to_string(),
            screen_input: "{monitor}:none".to_string(),
            default_monitor: "1".to_string(),
            framerate: 30,
            audio_format: "avfoundation".to_string(),
            audio_device: ":0".to_string(),
            webcam_format: "avfoundation".to_string(),
            webcam_device: "0".to_string(),
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn default() -> Self {
        Self {
            screen_format: "x11grab".to_string(),
            screen_input: "{monitor}".to_string(),
            default_monitor: ":0.0".to_string(),
            framerate: 30,
            audio_format: "pulse".to_string(),
            audio_device: "default".to_string(),
            webcam_format: "v4l2".to_string(),
            webcam_device: "/dev/video0".to_string(),
        }
    }
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Directory holding the one-fact-per-file session state
    pub state_dir: PathBuf,
    /// Root under which session folders are created
    pub output_root: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub capture: CaptureBackend,

    /// How long captures get to exit after the graceful signal
    pub grace_period_ms: u64,
    /// How long to wait after SIGKILL before giving up on a process
    pub force_kill_wait_ms: u64,
    /// Delay after spawning before checking a capture did not die immediately
    pub spawn_settle_ms: u64,
    /// Poll interval for liveness and stop-request checks
    pub poll_interval_ms: u64,
    /// Upper bound for a single pipeline stage
    pub stage_timeout_secs: u64,

    /// Progress events kept before the oldest are dropped
    pub progress_buffer: usize,
    pub loudness_target: LoudnessTarget,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            output_root: default_output_root(),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            capture: CaptureBackend::default(),
            grace_period_ms: 5_000,
            force_kill_wait_ms: 2_000,
            spawn_settle_ms: 500,
            poll_interval_ms: 100,
            stage_timeout_secs: 30 * 60,
            progress_buffer: 32,
            loudness_target: LoudnessTarget::default(),
        }
    }
}

impl Settings {
    /// Defaults overridden by `SCREENREC_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(dir) = lookup("SCREENREC_STATE_DIR") {
            settings.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("SCREENREC_OUTPUT_DIR") {
            settings.output_root = PathBuf::from(dir);
        }
        if let Some(path) = lookup("SCREENREC_FFMPEG") {
            settings.ffmpeg = PathBuf::from(path);
        }
        if let Some(path) = lookup("SCREENREC_FFPROBE") {
            settings.ffprobe = PathBuf::from(path);
        }
        if let Some(monitor) = lookup("SCREENREC_MONITOR") {
            settings.capture.default_monitor = monitor;
        }

        parse_into(&lookup, "SCREENREC_GRACE_MS", &mut settings.grace_period_ms);
        parse_into(&lookup, "SCREENREC_KILL_WAIT_MS", &mut settings.force_kill_wait_ms);
        parse_into(&lookup, "SCREENREC_SETTLE_MS", &mut settings.spawn_settle_ms);
        parse_into(&lookup, "SCREENREC_POLL_MS", &mut settings.poll_interval_ms);
        parse_into(&lookup, "SCREENREC_STAGE_TIMEOUT_SECS", &mut settings.stage_timeout_secs);
        parse_into(&lookup, "SCREENREC_PROGRESS_BUFFER", &mut settings.progress_buffer);

        settings
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn force_kill_wait(&self) -> Duration {
        Duration::from_millis(self.force_kill_wait_ms)
    }

    pub fn spawn_settle(&self) -> Duration {
        Duration::from_millis(self.spawn_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring invalid setting"),
    }
}

fn default_state_dir() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
        .join("screenrec")
}

fn default_output_root() -> PathBuf {
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Videos").join("screenrec"))
        .unwrap_or_else(|| PathBuf::from("./recordings"))
}
