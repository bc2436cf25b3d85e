//! Recording state management
//!
//! Defines the recording session persisted in the state directory, the
//! capture sources that feed it and the status view handed to the
//! presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One of the three capture sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Screen video
    Screen,
    /// Microphone audio
    Audio,
    /// Webcam video
    Webcam,
}

impl CaptureKind {
    pub const ALL: [CaptureKind; 3] = [
        CaptureKind::Screen,
        CaptureKind::Audio,
        CaptureKind::Webcam,
    ];

    /// Stem used for the PID/path files in the state directory
    pub fn file_stem(&self) -> &'static str {
        match self {
            CaptureKind::Screen => "video",
            CaptureKind::Audio => "audio",
            CaptureKind::Webcam => "webcam",
        }
    }

    /// Container extension of the raw capture
    pub fn extension(&self) -> &'static str {
        match self {
            CaptureKind::Screen => "mkv",
            CaptureKind::Audio => "wav",
            CaptureKind::Webcam => "mkv",
        }
    }
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureKind::Screen => "screen",
            CaptureKind::Audio => "audio",
            CaptureKind::Webcam => "webcam",
        };
        f.write_str(name)
    }
}

/// Whether a spawn failure of a source aborts the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    Required,
    #[default]
    Optional,
}

/// Last observed liveness of a capture process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Dead,
}

/// A supervised capture subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureProcess {
    pub kind: CaptureKind,
    pub pid: u32,
    pub output_path: PathBuf,
    pub requirement: Requirement,
    pub liveness: Liveness,
}

/// Per-source toggle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOptions {
    pub enabled: bool,
    #[serde(default)]
    pub requirement: Requirement,
    /// Device override (input name understood by the capture backend)
    #[serde(default)]
    pub device: Option<String>,
}

impl SourceOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn required() -> Self {
        Self {
            enabled: true,
            requirement: Requirement::Required,
            device: None,
        }
    }
}

/// Descriptive metadata; only used to name the output folder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub title: Option<String>,
    pub topic: Option<String>,
    pub presenter: Option<String>,
}

/// Options for starting a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOptions {
    pub screen: SourceOptions,
    pub audio: SourceOptions,
    pub webcam: SourceOptions,

    /// Monitor to capture (empty = backend default)
    #[serde(default)]
    pub monitor_id: String,

    /// Whether to produce the vertical composite after merging
    #[serde(default)]
    pub vertical: bool,

    /// Root under which the session folder is created (None = settings default)
    #[serde(default)]
    pub output_root: Option<PathBuf>,

    #[serde(default)]
    pub metadata: RecordingMetadata,

    /// Clear a crashed session left on disk instead of refusing to start
    #[serde(default)]
    pub discard_stale: bool,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            screen: SourceOptions::enabled(),
            audio: SourceOptions::enabled(),
            webcam: SourceOptions::default(),
            monitor_id: String::new(),
            vertical: false,
            output_root: None,
            metadata: RecordingMetadata::default(),
            discard_stale: false,
        }
    }
}

impl RecordingOptions {
    pub fn source(&self, kind: CaptureKind) -> &SourceOptions {
        match kind {
            CaptureKind::Screen => &self.screen,
            CaptureKind::Audio => &self.audio,
            CaptureKind::Webcam => &self.webcam,
        }
    }

    /// Enabled sources in capture order
    pub fn enabled_sources(&self) -> Vec<(CaptureKind, &SourceOptions)> {
        CaptureKind::ALL
            .iter()
            .map(|kind| (*kind, self.source(*kind)))
            .filter(|(_, source)| source.enabled)
            .collect()
    }
}

/// Phase of an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Capture processes are running
    #[default]
    Recording,
    /// Capture was stopped and the pipeline owns the session
    Processing,
}

impl SessionPhase {
    /// Content of the status file
    pub fn marker(&self) -> &'static str {
        match self {
            SessionPhase::Recording => "recording",
            SessionPhase::Processing => "processing",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker.trim() {
            "recording" => Some(SessionPhase::Recording),
            "processing" => Some(SessionPhase::Processing),
            _ => None,
        }
    }
}

/// The single host-wide recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub active: bool,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
    pub monitor_id: String,
    pub output_dir: Option<PathBuf>,
    pub vertical: bool,

    pub video_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub webcam_path: Option<PathBuf>,

    pub video_pid: Option<u32>,
    pub audio_pid: Option<u32>,
    pub webcam_pid: Option<u32>,

    /// Instance running the pipeline while in [`SessionPhase::Processing`]
    pub processor_pid: Option<u32>,
}

impl RecordingSession {
    /// A session that has not been marked active yet
    pub fn new(monitor_id: impl Into<String>, output_dir: Option<PathBuf>, vertical: bool) -> Self {
        Self {
            active: false,
            phase: SessionPhase::Recording,
            started_at: Utc::now(),
            monitor_id: monitor_id.into(),
            output_dir,
            vertical,
            video_path: None,
            audio_path: None,
            webcam_path: None,
            video_pid: None,
            audio_pid: None,
            webcam_pid: None,
            processor_pid: None,
        }
    }

    pub fn path(&self, kind: CaptureKind) -> Option<&Path> {
        match kind {
            CaptureKind::Screen => self.video_path.as_deref(),
            CaptureKind::Audio => self.audio_path.as_deref(),
            CaptureKind::Webcam => self.webcam_path.as_deref(),
        }
    }

    pub fn pid(&self, kind: CaptureKind) -> Option<u32> {
        match kind {
            CaptureKind::Screen => self.video_pid,
            CaptureKind::Audio => self.audio_pid,
            CaptureKind::Webcam => self.webcam_pid,
        }
    }

    pub fn set_path(&mut self, kind: CaptureKind, path: Option<PathBuf>) {
        match kind {
            CaptureKind::Screen => self.video_path = path,
            CaptureKind::Audio => self.audio_path = path,
            CaptureKind::Webcam => self.webcam_path = path,
        }
    }

    pub fn set_pid(&mut self, kind: CaptureKind, pid: Option<u32>) {
        match kind {
            CaptureKind::Screen => self.video_pid = pid,
            CaptureKind::Audio => self.audio_pid = pid,
            CaptureKind::Webcam => self.webcam_pid = pid,
        }
    }

    pub fn has_capture_paths(&self) -> bool {
        CaptureKind::ALL.iter().any(|kind| self.path(*kind).is_some())
    }

    /// Every PID whose liveness backs this session
    pub fn recorded_pids(&self) -> Vec<u32> {
        CaptureKind::ALL
            .iter()
            .filter_map(|kind| self.pid(*kind))
            .chain(self.processor_pid)
            .collect()
    }

    /// Capture paths that still exist on disk
    pub fn existing_outputs(&self) -> CaptureOutputs {
        let existing = |kind: CaptureKind| {
            self.path(kind)
                .filter(|path| path.exists())
                .map(Path::to_path_buf)
        };
        CaptureOutputs {
            video: existing(CaptureKind::Screen),
            audio: existing(CaptureKind::Audio),
            webcam: existing(CaptureKind::Webcam),
        }
    }
}

/// Capture files handed from the supervisor to the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutputs {
    pub video: Option<PathBuf>,
    pub audio: Option<PathBuf>,
    pub webcam: Option<PathBuf>,
}

impl CaptureOutputs {
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none() && self.webcam.is_none()
    }
}

/// Status polled by the presentation layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub is_recording: bool,
    pub is_processing: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub video_file: Option<String>,
    pub audio_file: Option<String>,
    pub webcam_file: Option<String>,
    /// Persisted session whose capture processes are gone
    pub crashed: bool,
}

impl RecordingStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn live(session: &RecordingSession) -> Self {
        Self {
            is_recording: session.phase == SessionPhase::Recording,
            is_processing: session.phase == SessionPhase::Processing,
            ..Self::from_session(session)
        }
    }

    pub fn crashed(session: &RecordingSession) -> Self {
        Self {
            crashed: true,
            ..Self::from_session(session)
        }
    }

    fn from_session(session: &RecordingSession) -> Self {
        let display = |path: Option<&Path>| path.map(|p| p.to_string_lossy().to_string());
        Self {
            is_recording: false,
            is_processing: false,
            start_time: Some(session.started_at),
            video_file: display(session.video_path.as_deref()),
            audio_file: display(session.audio_path.as_deref()),
            webcam_file: display(session.webcam_path.as_deref()),
            crashed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_sources_keep_capture_order() {
        let options = RecordingOptions {
            webcam: SourceOptions::enabled(),
            screen: SourceOptions::default(),
            ..RecordingOptions::default()
        };
        let kinds: Vec<CaptureKind> = options
            .enabled_sources()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(kinds, vec![CaptureKind::Audio, CaptureKind::Webcam]);
    }

    #[test]
    fn test_recorded_pids_include_processor() {
        let mut session = RecordingSession::new(":0.0", None, false);
        session.set_pid(CaptureKind::Screen, Some(10));
        session.set_pid(CaptureKind::Webcam, Some(12));
        session.processor_pid = Some(99);
        assert_eq!(session.recorded_pids(), vec![10, 12, 99]);
    }

    #[test]
    fn test_phase_marker() {
        assert_eq!(SessionPhase::from_marker("processing\n"), Some(SessionPhase::Processing));
        assert_eq!(
            SessionPhase::from_marker(SessionPhase::Recording.marker()),
            Some(SessionPhase::Recording)
        );
        assert_eq!(SessionPhase::from_marker("garbage"), None);
    }

    #[test]
    fn test_crashed_status_keeps_paths() {
        let mut session = RecordingSession::new(":0.0", None, false);
        session.active = true;
        session.set_path(CaptureKind::Audio, Some(PathBuf::from("/tmp/audio.wav")));
        let status = RecordingStatus::crashed(&session);
        assert!(!status.is_recording);
        assert!(status.crashed);
        assert_eq!(status.audio_file.as_deref(), Some("/tmp/audio.wav"));
    }
}
