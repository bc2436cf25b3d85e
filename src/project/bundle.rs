//! Session output folder
//!
//! Every recording gets its own folder under the output root:
//! - video.mkv / audio.wav / webcam.mkv: raw captures
//! - audio-denoised.wav / audio-normalized.wav: intermediate audio
//! - final.mp4 / final-vertical.mp4: finished videos
//! - session.json: report of the post-processing run

use crate::pipeline::types::PipelineRun;
use crate::recorder::state::{CaptureOutputs, RecordingMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REPORT_FILE: &str = "session.json";

/// Bundle-related errors
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required file: {0}")]
    MissingFile(String),
}

/// What a finished session produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub started_at: DateTime<Utc>,
    pub captures: CaptureOutputs,
    pub landscape_output: Option<PathBuf>,
    pub vertical_output: Option<PathBuf>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub run: PipelineRun,
}

/// Folder for a session started at `started_at`
///
/// `2024-03-01_14-05-09` alone, or followed by the slugged title (falling
/// back to the topic) when one is given.
pub fn session_dir(
    root: &Path,
    metadata: &RecordingMetadata,
    started_at: DateTime<Utc>,
) -> PathBuf {
    let stamp = started_at.format("%Y-%m-%d_%H-%M-%S").to_string();
    let label = metadata
        .title
        .as_deref()
        .or(metadata.topic.as_deref())
        .map(slugify)
        .filter(|slug| !slug.is_empty());

    match label {
        Some(slug) => root.join(format!("{}_{}", stamp, slug)),
        None => root.join(stamp),
    }
}

/// Lowercase ASCII alphanumerics separated by single dashes
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_end_matches('-');
    trimmed.chars().take(64).collect::<String>().trim_end_matches('-').to_string()
}

/// Write `session.json` into the session folder
pub fn write_report(report: &SessionReport, session_dir: &Path) -> Result<PathBuf, BundleError> {
    if !session_dir.exists() {
        fs::create_dir_all(session_dir)?;
    }

    let path = session_dir.join(REPORT_FILE);
    let content = serde_json::to_string_pretty(report)?;
    fs::write(&path, content)?;

    tracing::debug!("Saved session report to {:?}", path);

    Ok(path)
}

/// Read `session.json` back from a session folder
pub fn read_report(session_dir: &Path) -> Result<SessionReport, BundleError> {
    let path = session_dir.join(REPORT_FILE);
    if !path.exists() {
        return Err(BundleError::MissingFile(REPORT_FILE.to_string()));
    }

    let content = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Intro to Rust: Ownership!"), "intro-to-rust-ownership");
        assert_eq!(slugify("  --  "), "");
        assert_eq!(slugify("Ünïcode Talk"), "n-code-talk");
    }

    #[test]
    fn test_session_dir_naming() {
        let root = Path::new("/videos");
        let untitled = session_dir(root, &RecordingMetadata::default(), started());
        assert_eq!(untitled, PathBuf::from("/videos/2024-03-01_14-05-09"));

        let metadata = RecordingMetadata {
            title: None,
            topic: Some("Async Rust".to_string()),
            presenter: Some("Sam".to_string()),
        };
        assert_eq!(
            session_dir(root, &metadata, started()),
            PathBuf::from("/videos/2024-03-01_14-05-09_async-rust")
        );
    }

    #[test]
    fn test_report_round_trip() {
        let dir = tempdir().unwrap();
        let report = SessionReport {
            started_at: started(),
            captures: CaptureOutputs {
                video: Some(dir.path().join("video.mkv")),
                ..CaptureOutputs::default()
            },
            landscape_output: Some(dir.path().join("final.mp4")),
            vertical_output: None,
            warnings: vec!["No audio available".to_string()],
            run: PipelineRun::new(["Stop capture"]),
        };

        let path = write_report(&report, dir.path()).unwrap();
        assert!(path.ends_with(REPORT_FILE));

        let loaded = read_report(dir.path()).unwrap();
        assert_eq!(loaded.captures, report.captures);
        assert_eq!(loaded.run.id, report.run.id);
        assert_eq!(loaded.warnings.len(), 1);
    }

    #[test]
    fn test_missing_report() {
        let dir = tempdir().unwrap();
        assert!(matches!(read_report(dir.path()), Err(BundleError::MissingFile(_))));
    }
}
