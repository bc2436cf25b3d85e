//! ffmpeg capture commands
//!
//! Builds the command line for each capture source. Every source writes a
//! single raw file into the session folder.

use super::process::CaptureCommand;
use super::state::{CaptureKind, RecordingOptions};
use crate::config::Settings;
use std::path::{Path, PathBuf};

/// Raw capture file for `kind` inside the session folder
pub fn output_path(kind: CaptureKind, session_dir: &Path) -> PathBuf {
    session_dir.join(format!("{}.{}", kind.file_stem(), kind.extension()))
}

/// Build the capture command for one source
pub fn capture_command(
    kind: CaptureKind,
    options: &RecordingOptions,
    settings: &Settings,
    session_dir: &Path,
) -> CaptureCommand {
    let backend = &settings.capture;
    let output = output_path(kind, session_dir);
    let device = options.source(kind).device.clone();

    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "warning", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match kind {
        CaptureKind::Screen => {
            let monitor = if options.monitor_id.is_empty() {
                backend.default_monitor.as_str()
            } else {
                options.monitor_id.as_str()
            };
            let input =
                device.unwrap_or_else(|| backend.screen_input.replace("{monitor}", monitor));
            args.extend([
                "-f".to_string(),
                backend.screen_format.clone(),
                "-framerate".to_string(),
                backend.framerate.to_string(),
                "-i".to_string(),
                input,
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "ultrafast".to_string(),
                "-crf".to_string(),
                "18".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
            ]);
        }
        CaptureKind::Audio => {
            args.extend([
                "-f".to_string(),
                backend.audio_format.clone(),
                "-i".to_string(),
                device.unwrap_or_else(|| backend.audio_device.clone()),
                "-ac".to_string(),
                "1".to_string(),
                "-ar".to_string(),
                "48000".to_string(),
                "-c:a".to_string(),
                "pcm_s16le".to_string(),
            ]);
        }
        CaptureKind::Webcam => {
            args.extend([
                "-f".to_string(),
                backend.webcam_format.clone(),
                "-framerate".to_string(),
                backend.framerate.to_string(),
                "-i".to_string(),
                device.unwrap_or_else(|| backend.webcam_device.clone()),
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "ultrafast".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
            ]);
        }
    }

    args.push(output.to_string_lossy().to_string());

    CaptureCommand {
        kind,
        program: settings.ffmpeg.clone(),
        args,
        log_path: Some(session_dir.join(format!("{}.log", kind.file_stem()))),
        output_path: output,
    }
}
