//! Filesystem-backed session state
//!
//! Each fact about the session lives in its own plain-text file inside the
//! state directory, so any process (including a crash-recovery path) can
//! test for an active recording with a single existence check on the
//! status file.

use super::process::ProcessControl;
use super::state::{CaptureKind, RecordingSession, SessionPhase};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const STATUS_FILE: &str = "status";
const STARTED_AT_FILE: &str = "started-at";
const MONITOR_FILE: &str = "monitor";
const OUTPUT_DIR_FILE: &str = "output-dir";
const VERTICAL_FILE: &str = "vertical";
const PROCESSOR_PID_FILE: &str = "processor.pid";
const STOP_REQUEST_FILE: &str = "stop-requested";

/// Result of reading the store with a liveness cross-check
#[derive(Debug, Clone)]
pub enum StoredSession {
    /// No active-session marker
    Absent,
    /// Marker present and at least one recorded process is alive
    Live(RecordingSession),
    /// Marker present but nothing recorded is alive any more
    Stale(RecordingSession),
    /// No marker, yet captures recorded by a start that never finished are alive
    Interrupted(RecordingSession),
}

/// One-fact-per-file session store
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn pid_file(&self, kind: CaptureKind) -> PathBuf {
        self.file(&format!("{}.pid", kind.file_stem()))
    }

    fn path_file(&self, kind: CaptureKind) -> PathBuf {
        self.file(&format!("{}.path", kind.file_stem()))
    }

    /// Single existence check for the active-session marker
    pub fn is_marked_active(&self) -> bool {
        self.file(STATUS_FILE).exists()
    }

    /// Persist the whole session; the status marker is written last and only
    /// when the session is active with at least one capture path.
    pub fn write(&self, session: &RecordingSession) -> io::Result<()> {
        self.write_header(session)?;
        for kind in CaptureKind::ALL {
            match (session.pid(kind), session.path(kind)) {
                (Some(pid), Some(path)) => self.write_capture(kind, pid, path)?,
                (None, Some(path)) => {
                    self.remove_pid(kind)?;
                    write_fact(&self.path_file(kind), &path.to_string_lossy())?;
                }
                _ => self.remove_capture(kind)?,
            }
        }
        if let Some(pid) = session.processor_pid {
            write_fact(&self.file(PROCESSOR_PID_FILE), &pid.to_string())?;
        }
        if session.active && session.has_capture_paths() {
            write_fact(&self.file(STATUS_FILE), session.phase.marker())?;
        }
        Ok(())
    }

    /// Session-level facts, without the active marker
    pub fn write_header(&self, session: &RecordingSession) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_fact(&self.file(STARTED_AT_FILE), &session.started_at.to_rfc3339())?;
        write_fact(&self.file(MONITOR_FILE), &session.monitor_id)?;
        match &session.output_dir {
            Some(dir) => write_fact(&self.file(OUTPUT_DIR_FILE), &dir.to_string_lossy())?,
            None => remove_if_exists(&self.file(OUTPUT_DIR_FILE))?,
        }
        if session.vertical {
            write_fact(&self.file(VERTICAL_FILE), "1")?;
        } else {
            remove_if_exists(&self.file(VERTICAL_FILE))?;
        }
        Ok(())
    }

    /// Record one capture process as soon as it is known
    pub fn write_capture(&self, kind: CaptureKind, pid: u32, path: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_fact(&self.path_file(kind), &path.to_string_lossy())?;
        write_fact(&self.pid_file(kind), &pid.to_string())
    }

    pub fn remove_capture(&self, kind: CaptureKind) -> io::Result<()> {
        self.remove_pid(kind)?;
        remove_if_exists(&self.path_file(kind))
    }

    /// Drop the PID record of a terminated capture; its path stays for the pipeline
    pub fn remove_pid(&self, kind: CaptureKind) -> io::Result<()> {
        remove_if_exists(&self.pid_file(kind))
    }

    /// Write the active-session marker for the given phase
    pub fn mark(&self, phase: SessionPhase) -> io::Result<()> {
        write_fact(&self.file(STATUS_FILE), phase.marker())
    }

    /// Hand the session to the pipeline owned by `processor_pid`
    pub fn mark_processing(&self, processor_pid: u32) -> io::Result<()> {
        write_fact(&self.file(PROCESSOR_PID_FILE), &processor_pid.to_string())?;
        self.mark(SessionPhase::Processing)
    }

    /// Read the persisted facts without any liveness check
    pub fn read_raw(&self) -> io::Result<Option<RecordingSession>> {
        let Some(marker) = read_fact(&self.file(STATUS_FILE))? else {
            return Ok(None);
        };

        let phase = SessionPhase::from_marker(&marker).unwrap_or_else(|| {
            tracing::warn!("Unrecognised status marker {:?}, assuming recording", marker);
            SessionPhase::Recording
        });

        let mut session = self.read_facts()?;
        session.active = true;
        session.phase = phase;
        Ok(Some(session))
    }

    /// Facts left behind by a start that never wrote its marker
    pub fn read_unmarked(&self) -> io::Result<Option<RecordingSession>> {
        if self.is_marked_active() {
            return Ok(None);
        }
        let mut session = self.read_facts()?;
        // Only capture PIDs matter before the marker exists
        session.processor_pid = None;
        Ok((!session.recorded_pids().is_empty()).then_some(session))
    }

    fn read_facts(&self) -> io::Result<RecordingSession> {
        let started_at = read_parsed::<DateTime<Utc>>(&self.file(STARTED_AT_FILE))?
            .unwrap_or_else(Utc::now);
        let monitor_id = read_fact(&self.file(MONITOR_FILE))?.unwrap_or_default();
        let output_dir = read_fact(&self.file(OUTPUT_DIR_FILE))?.map(PathBuf::from);
        let vertical = self.file(VERTICAL_FILE).exists();

        let mut session = RecordingSession::new(monitor_id, output_dir, vertical);
        session.started_at = started_at;
        session.processor_pid = read_parsed(&self.file(PROCESSOR_PID_FILE))?;

        for kind in CaptureKind::ALL {
            session.set_path(kind, read_fact(&self.path_file(kind))?.map(PathBuf::from));
            session.set_pid(kind, read_parsed(&self.pid_file(kind))?);
        }
        Ok(session)
    }

    /// Read and cross-check every recorded PID against `probe`.
    ///
    /// Unmarked facts only count when one of their processes is still alive.
    pub fn read(&self, probe: &dyn ProcessControl) -> io::Result<StoredSession> {
        let any_alive = |session: &RecordingSession| {
            session
                .recorded_pids()
                .into_iter()
                .any(|pid| probe.is_alive(pid))
        };

        let Some(session) = self.read_raw()? else {
            return Ok(match self.read_unmarked()? {
                Some(session) if any_alive(&session) => StoredSession::Interrupted(session),
                _ => StoredSession::Absent,
            });
        };

        if any_alive(&session) {
            Ok(StoredSession::Live(session))
        } else {
            Ok(StoredSession::Stale(session))
        }
    }

    /// Remove every session fact; the marker goes first
    pub fn clear(&self) -> io::Result<()> {
        remove_if_exists(&self.file(STATUS_FILE))?;
        for kind in CaptureKind::ALL {
            self.remove_capture(kind)?;
        }
        for name in [
            PROCESSOR_PID_FILE,
            STARTED_AT_FILE,
            MONITOR_FILE,
            OUTPUT_DIR_FILE,
            VERTICAL_FILE,
            STOP_REQUEST_FILE,
        ] {
            remove_if_exists(&self.file(name))?;
        }
        Ok(())
    }

    /// Ask whichever instance owns the capture to stop it
    pub fn request_stop(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_fact(&self.file(STOP_REQUEST_FILE), &Utc::now().to_rfc3339())
    }

    pub fn stop_requested(&self) -> bool {
        self.file(STOP_REQUEST_FILE).exists()
    }

    pub fn clear_stop_request(&self) -> io::Result<()> {
        remove_if_exists(&self.file(STOP_REQUEST_FILE))
    }
}

fn write_fact(path: &Path, value: &str) -> io::Result<()> {
    fs::write(path, format!("{}\n", value))
}

fn read_fact(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let value = content.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_parsed<T: FromStr>(path: &Path) -> io::Result<Option<T>> {
    Ok(read_fact(path)?.and_then(|value| match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring unparseable value {:?} in {:?}", value, path);
            None
        }
    }))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::process::{CaptureCommand, Signal};
    use std::collections::HashSet;
    use tempfile::tempdir;

    struct FixedLiveness(HashSet<u32>);

    impl ProcessControl for FixedLiveness {
        fn spawn(&self, _command: &CaptureCommand) -> io::Result<u32> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "not spawning in tests"))
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }

        fn signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
            Ok(())
        }
    }

    fn active_session() -> RecordingSession {
        let mut session = RecordingSession::new(":0.0", Some(PathBuf::from("/tmp/out")), true);
        session.active = true;
        session.set_path(CaptureKind::Screen, Some(PathBuf::from("/tmp/out/video.mkv")));
        session.set_pid(CaptureKind::Screen, Some(4242));
        session.set_path(CaptureKind::Audio, Some(PathBuf::from("/tmp/out/audio.wav")));
        session.set_pid(CaptureKind::Audio, Some(4243));
        session
    }

    #[test]
    fn test_absent_when_no_marker() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.read_raw().unwrap().is_none());
        let probe = FixedLiveness(HashSet::new());
        assert!(matches!(store.read(&probe).unwrap(), StoredSession::Absent));
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let session = active_session();
        store.write(&session).unwrap();

        assert!(store.is_marked_active());
        assert_eq!(fs::read_to_string(dir.path().join("video.pid")).unwrap().trim(), "4242");
        assert_eq!(fs::read_to_string(dir.path().join("status")).unwrap().trim(), "recording");

        let loaded = store.read_raw().unwrap().unwrap();
        assert!(loaded.active);
        assert!(loaded.vertical);
        assert_eq!(loaded.monitor_id, ":0.0");
        assert_eq!(loaded.audio_pid, Some(4243));
        assert_eq!(loaded.webcam_path, None);
        assert_eq!(loaded.started_at.timestamp(), session.started_at.timestamp());
    }

    #[test]
    fn test_marker_not_written_without_capture_paths() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut session = RecordingSession::new(":0.0", None, false);
        session.active = true;
        store.write(&session).unwrap();
        assert!(!store.is_marked_active());
    }

    #[test]
    fn test_unmarked_captures_count_only_while_alive() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.write_header(&RecordingSession::new(":0.0", None, false)).unwrap();
        store
            .write_capture(CaptureKind::Screen, 4242, Path::new("/tmp/out/video.mkv"))
            .unwrap();
        assert!(store.read_raw().unwrap().is_none());

        let live = FixedLiveness(HashSet::from([4242]));
        match store.read(&live).unwrap() {
            StoredSession::Interrupted(session) => {
                assert!(!session.active);
                assert_eq!(session.video_pid, Some(4242));
            }
            other => panic!("expected interrupted start, got {:?}", other),
        }

        let dead = FixedLiveness(HashSet::new());
        assert!(matches!(store.read(&dead).unwrap(), StoredSession::Absent));
    }

    #[test]
    fn test_live_and_stale_reads() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.write(&active_session()).unwrap();

        let live = FixedLiveness(HashSet::from([4243]));
        assert!(matches!(store.read(&live).unwrap(), StoredSession::Live(_)));

        let dead = FixedLiveness(HashSet::new());
        match store.read(&dead).unwrap() {
            StoredSession::Stale(session) => {
                assert_eq!(session.video_path, Some(PathBuf::from("/tmp/out/video.mkv")));
            }
            other => panic!("expected stale session, got {:?}", other),
        }
    }

    #[test]
    fn test_processing_marker_tracks_processor() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.write(&active_session()).unwrap();
        store.remove_pid(CaptureKind::Screen).unwrap();
        store.remove_pid(CaptureKind::Audio).unwrap();
        store.mark_processing(77).unwrap();

        let probe = FixedLiveness(HashSet::from([77]));
        match store.read(&probe).unwrap() {
            StoredSession::Live(session) => {
                assert_eq!(session.phase, SessionPhase::Processing);
                assert_eq!(session.processor_pid, Some(77));
                assert!(session.audio_path.is_some());
            }
            other => panic!("expected live session, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_pid_is_ignored() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.write(&active_session()).unwrap();
        fs::write(dir.path().join("audio.pid"), "not-a-pid").unwrap();
        let loaded = store.read_raw().unwrap().unwrap();
        assert_eq!(loaded.audio_pid, None);
        assert_eq!(loaded.video_pid, Some(4242));
    }

    #[test]
    fn test_clear_and_stop_request() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.write(&active_session()).unwrap();
        store.request_stop().unwrap();
        assert!(store.stop_requested());

        store.clear().unwrap();
        assert!(!store.is_marked_active());
        assert!(!store.stop_requested());
        assert!(store.read_raw().unwrap().is_none());
        assert!(!dir.path().join("video.path").exists());
    }
}
