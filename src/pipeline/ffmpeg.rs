//! FFmpeg invocation for pipeline stages
//!
//! Stages describe what they want as a [`ToolInvocation`]; [`FfmpegTool`]
//! runs it with a timeout and turns ffmpeg's `-progress` output into a
//! percentage. The argument builders are plain functions so the filter
//! graphs can be checked without running ffmpeg.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Errors from the external media tool
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} exited with {code:?}: {stderr}")]
    Exited {
        label: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{label} timed out after {}s", .after.as_secs_f64())]
    Timeout { label: String, after: Duration },

    #[error("Unexpected tool output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One run of the media tool
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Short name used in logs and errors
    pub label: String,
    pub args: Vec<String>,
    /// Duration of the media being processed, for progress reporting
    pub expected_duration: Option<Duration>,
    pub timeout: Duration,
}

/// Captured output of a finished tool run
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The external transformation tool
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Run an invocation, calling `progress` with percentages as they become known
    async fn run(
        &self,
        invocation: ToolInvocation,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ToolOutput, ToolError>;

    /// Duration of a media file, if it can be determined
    async fn probe_duration(&self, path: &Path) -> Result<Option<Duration>, ToolError>;
}

/// [`MediaTool`] backed by the ffmpeg and ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTool {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn run_to_completion(
        &self,
        invocation: &ToolInvocation,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ToolOutput, ToolError> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostdin",
            "-y",
            "-nostats",
            "-progress",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(invocation.args.iter().cloned());

        tracing::debug!("Running {}: {:?} {:?}", invocation.label, self.ffmpeg, args);

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: self.ffmpeg.to_string_lossy().to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Parse("Failed to capture FFmpeg stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolError::Parse("Failed to capture FFmpeg stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut collected = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let (Some(total), Some(done)) =
                (invocation.expected_duration, parse_progress_line(&line))
            {
                if !total.is_zero() {
                    progress((done.as_secs_f64() / total.as_secs_f64() * 100.0) as f32);
                }
            }
            collected.push_str(&line);
            collected.push('\n');
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ToolError::Exited {
                label: invocation.label.clone(),
                code: status.code(),
                stderr: tail(&stderr, 12),
            });
        }

        Ok(ToolOutput {
            stdout: collected,
            stderr,
        })
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn run(
        &self,
        invocation: ToolInvocation,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<ToolOutput, ToolError> {
        // Dropping the future on timeout drops the child, which kills it
        let completion = self.run_to_completion(&invocation, progress);
        match tokio::time::timeout(invocation.timeout, completion).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                label: invocation.label.clone(),
                after: invocation.timeout,
            }),
        }
    }

    async fn probe_duration(&self, path: &Path) -> Result<Option<Duration>, ToolError> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                tool: self.ffprobe.to_string_lossy().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Exited {
                label: "ffprobe".to_string(),
                code: output.status.code(),
                stderr: tail(&stderr, 5),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64))
    }
}

/// Position reported by one `-progress` line
fn parse_progress_line(line: &str) -> Option<Duration> {
    let (key, value) = line.split_once('=')?;
    match key.trim() {
        // Despite the name, out_time_ms is in microseconds as well
        "out_time_us" | "out_time_ms" => value
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_micros),
        _ => None,
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Loudness normalization target (EBU R128)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessTarget {
    /// Integrated loudness in LUFS
    pub integrated: f64,
    /// True peak in dBTP
    pub true_peak: f64,
    /// Loudness range in LU
    pub range: f64,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            integrated: -16.0,
            true_peak: -1.5,
            range: 11.0,
        }
    }
}

/// Measurements from a `loudnorm` analysis pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessStats {
    pub input_i: f64,
    pub input_tp: f64,
    pub input_lra: f64,
    pub input_thresh: f64,
    pub target_offset: f64,
}

#[derive(Deserialize)]
struct LoudnormReport {
    input_i: String,
    input_tp: String,
    input_lra: String,
    input_thresh: String,
    target_offset: String,
}

/// Extract the JSON block `loudnorm` prints at the end of stderr
pub fn parse_loudnorm_stats(stderr: &str) -> Result<LoudnessStats, ToolError> {
    let start = stderr
        .rfind('{')
        .ok_or_else(|| ToolError::Parse("No loudnorm report in output".to_string()))?;
    let end = stderr[start..]
        .find('}')
        .map(|offset| start + offset + 1)
        .ok_or_else(|| ToolError::Parse("Unterminated loudnorm report".to_string()))?;

    let report: LoudnormReport = serde_json::from_str(&stderr[start..end])
        .map_err(|e| ToolError::Parse(format!("Invalid loudnorm report: {}", e)))?;

    let number = |name: &str, value: &str| -> Result<f64, ToolError> {
        value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ToolError::Parse(format!("Invalid {} value: {:?}", name, value)))
    };

    Ok(LoudnessStats {
        input_i: number("input_i", &report.input_i)?,
        input_tp: number("input_tp", &report.input_tp)?,
        input_lra: number("input_lra", &report.input_lra)?,
        input_thresh: number("input_thresh", &report.input_thresh)?,
        target_offset: number("target_offset", &report.target_offset)?,
    })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// High-pass plus FFT denoiser
pub fn denoise_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        path_arg(input),
        "-af".to_string(),
        "highpass=f=80,afftdn=nf=-25".to_string(),
        "-c:a".to_string(),
        "pcm_s16le".to_string(),
        path_arg(output),
    ]
}

fn loudnorm_filter(target: &LoudnessTarget) -> String {
    format!(
        "loudnorm=I={}:TP={}:LRA={}",
        target.integrated, target.true_peak, target.range
    )
}

/// Analysis pass; the report lands on stderr
pub fn analyze_args(input: &Path, target: &LoudnessTarget) -> Vec<String> {
    vec![
        "-i".to_string(),
        path_arg(input),
        "-af".to_string(),
        format!("{}:print_format=json", loudnorm_filter(target)),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ]
}

/// Second `loudnorm` pass with measured values, or a single pass without them
pub fn normalize_args(
    input: &Path,
    output: &Path,
    target: &LoudnessTarget,
    measured: Option<&LoudnessStats>,
) -> Vec<String> {
    let filter = match measured {
        Some(stats) => format!(
            concat!(
                "{}:measured_I={}:measured_TP={}:measured_LRA={}",
                ":measured_thresh={}:offset={}:linear=true"
            ),
            loudnorm_filter(target),
            stats.input_i,
            stats.input_tp,
            stats.input_lra,
            stats.input_thresh,
            stats.target_offset
        ),
        None => loudnorm_filter(target),
    };
    vec![
        "-i".to_string(),
        path_arg(input),
        "-af".to_string(),
        filter,
        "-ar".to_string(),
        "48000".to_string(),
        "-c:a".to_string(),
        "pcm_s16le".to_string(),
        path_arg(output),
    ]
}

/// Mux the screen capture with audio, or remux it alone
pub fn merge_args(video: &Path, audio: Option<&Path>, output: &Path) -> Vec<String> {
    let mut args = vec!["-i".to_string(), path_arg(video)];
    match audio {
        Some(audio) => args.extend([
            "-i".to_string(),
            path_arg(audio),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            "-shortest".to_string(),
        ]),
        None => args.extend([
            "-map".to_string(),
            "0:v:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
        ]),
    }
    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        path_arg(output),
    ]);
    args
}

pub const VERTICAL_WIDTH: u32 = 1080;
pub const VERTICAL_HEIGHT: u32 = 1920;
/// Height of the webcam band at the top of the vertical composite
pub const VERTICAL_CAMERA_HEIGHT: u32 = 608;

/// Webcam band stacked above a center crop of the screen, 1080x1920
pub fn vertical_filter() -> String {
    let screen_height = VERTICAL_HEIGHT - VERTICAL_CAMERA_HEIGHT;
    format!(
        "[1:v]scale={w}:{ch}:force_original_aspect_ratio=increase,crop={w}:{ch}[cam];\
         [0:v]scale={w}:{sh}:force_original_aspect_ratio=increase,crop={w}:{sh}[scr];\
         [cam][scr]vstack=inputs=2[v]",
        w = VERTICAL_WIDTH,
        ch = VERTICAL_CAMERA_HEIGHT,
        sh = screen_height
    )
}

/// Compose the vertical cut; audio is taken from the landscape input when present
pub fn vertical_args(screen: &Path, webcam: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        path_arg(screen),
        "-i".to_string(),
        path_arg(webcam),
        "-filter_complex".to_string(),
        vertical_filter(),
        "-map".to_string(),
        "[v]".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "medium".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
        "-shortest".to_string(),
        path_arg(output),
    ]
}
