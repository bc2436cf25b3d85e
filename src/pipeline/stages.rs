//! Pipeline stages
//!
//! The six post-processing stages, in their fixed order:
//!
//! 1. Stop capture (fatal)
//! 2. Denoise audio (non-fatal, keeps the original audio on failure)
//! 3. Analyze audio levels (non-fatal, default target on failure)
//! 4. Normalize audio (non-fatal, un-normalized audio carried forward)
//! 5. Merge video & audio (fatal)
//! 6. Create vertical composite (non-fatal)

use super::ffmpeg::{self, LoudnessStats, LoudnessTarget, MediaTool, ToolInvocation};
use super::progress::{ProgressEvent, ProgressSender};
use super::types::{FailureClass, PipelineRun, StageError, StageOutcome};
use crate::recorder::state::{CaptureOutputs, RecordingSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const STOP_CAPTURE: &str = "Stop capture";
pub const DENOISE_AUDIO: &str = "Denoise audio";
pub const ANALYZE_LEVELS: &str = "Analyze audio levels";
pub const NORMALIZE_AUDIO: &str = "Normalize audio";
pub const MERGE: &str = "Merge video & audio";
pub const VERTICAL_COMPOSITE: &str = "Create vertical composite";

/// Artifacts flowing from stage to stage
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub output_dir: PathBuf,
    pub vertical_requested: bool,

    pub video: Option<PathBuf>,
    /// Latest good audio; replaced as denoise/normalize succeed
    pub audio: Option<PathBuf>,
    pub webcam: Option<PathBuf>,

    pub loudness: Option<LoudnessStats>,
    /// Normalization failed; later stages use the un-normalized audio
    pub audio_branch_failed: bool,

    pub landscape_output: Option<PathBuf>,
    pub vertical_output: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl StageContext {
    /// Context for a session whose capture files are not handed over yet
    pub fn for_session(session: &RecordingSession, fallback_dir: &Path) -> Self {
        let output_dir = session
            .output_dir
            .clone()
            .or_else(|| session.video_path.as_deref().and_then(Path::parent).map(Path::to_path_buf))
            .unwrap_or_else(|| fallback_dir.to_path_buf());
        Self {
            output_dir,
            vertical_requested: session.vertical,
            ..Self::default()
        }
    }

    pub fn accept_captures(&mut self, outputs: CaptureOutputs) {
        self.video = outputs.video;
        self.audio = outputs.audio;
        self.webcam = outputs.webcam;
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Progress reporter handed to a running stage
pub struct StageProgress<'a> {
    index: usize,
    run: Arc<Mutex<PipelineRun>>,
    events: &'a ProgressSender,
}

impl<'a> StageProgress<'a> {
    pub fn new(index: usize, run: Arc<Mutex<PipelineRun>>, events: &'a ProgressSender) -> Self {
        Self { index, run, events }
    }

    /// Report a percentage; regressions are ignored
    pub fn report(&self, percent: f32) {
        let accepted = self.run.lock().update_progress(self.index, percent);
        if accepted {
            self.events.send(ProgressEvent::StageProgress {
                index: self.index,
                percent: percent.clamp(0.0, 100.0),
            });
        }
    }
}

/// A unit of the post-processing pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn failure_class(&self) -> FailureClass;

    async fn run(&self, ctx: &mut StageContext, progress: &StageProgress<'_>) -> StageOutcome;
}

/// Terminates capture and hands over the files it produced
#[async_trait]
pub trait CaptureTerminator: Send + Sync {
    async fn terminate(&self, progress: &StageProgress<'_>) -> Result<CaptureOutputs, StageError>;
}

/// Shared configuration of the tool-backed stages
#[derive(Clone)]
pub struct ToolStageConfig {
    pub tool: Arc<dyn MediaTool>,
    pub timeout: Duration,
    pub target: LoudnessTarget,
}

impl ToolStageConfig {
    async fn run_tool(
        &self,
        label: &str,
        args: Vec<String>,
        duration_of: Option<&Path>,
        progress: &StageProgress<'_>,
    ) -> Result<ffmpeg::ToolOutput, StageError> {
        let expected_duration = match duration_of {
            Some(path) => self.tool.probe_duration(path).await.unwrap_or_else(|e| {
                tracing::debug!("Could not probe {:?}: {}", path, e);
                None
            }),
            None => None,
        };

        let invocation = ToolInvocation {
            label: label.to_string(),
            args,
            expected_duration,
            timeout: self.timeout,
        };
        let report = |percent: f32| progress.report(percent);
        Ok(self.tool.run(invocation, &report).await?)
    }
}

pub struct StopCaptureStage {
    terminator: Arc<dyn CaptureTerminator>,
}

impl StopCaptureStage {
    pub fn new(terminator: Arc<dyn CaptureTerminator>) -> Self {
        Self { terminator }
    }
}

#[async_trait]
impl Stage for StopCaptureStage {
    fn name(&self) -> &'static str {
        STOP_CAPTURE
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::Fatal
    }

    async fn run(&self, ctx: &mut StageContext, progress: &StageProgress<'_>) -> StageOutcome {
        match self.terminator.terminate(progress).await {
            Ok(outputs) if outputs.is_empty() => StageOutcome::failed(
                self.failure_class(),
                StageError::MissingInput("no capture files were produced".to_string()),
            ),
            Ok(outputs) => {
                ctx.accept_captures(outputs);
                StageOutcome::Complete
            }
            Err(e) => StageOutcome::failed(self.failure_class(), e),
        }
    }
}

pub struct DenoiseStage {
    config: ToolStageConfig,
}

impl DenoiseStage {
    pub fn new(config: ToolStageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for DenoiseStage {
    fn name(&self) -> &'static str {
        DENOISE_AUDIO
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::NonFatal
    }

    async fn run(&self, ctx: &mut StageContext, progress: &StageProgress<'_>) -> StageOutcome {
        let Some(input) = ctx.audio.clone() else {
            return StageOutcome::Skipped("no audio capture".to_string());
        };
        let output = ctx.output_dir.join("audio-denoised.wav");

        match self
            .config
            .run_tool("denoise", ffmpeg::denoise_args(&input, &output), Some(&input), progress)
            .await
        {
            Ok(_) => {
                ctx.audio = Some(output);
                StageOutcome::Complete
            }
            Err(e) => {
                ctx.warn(format!("Denoise failed, keeping original audio: {}", e));
                StageOutcome::failed(self.failure_class(), e)
            }
        }
    }
}

pub struct AnalyzeLevelsStage {
    config: ToolStageConfig,
}

impl AnalyzeLevelsStage {
    pub fn new(config: ToolStageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for AnalyzeLevelsStage {
    fn name(&self) -> &'static str {
        ANALYZE_LEVELS
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::NonFatal
    }

    async fn run(&self, ctx: &mut StageContext, progress: &StageProgress<'_>) -> StageOutcome {
        let Some(input) = ctx.audio.clone() else {
            return StageOutcome::Skipped("no audio capture".to_string());
        };

        let result = self
            .config
            .run_tool(
                "analyze",
                ffmpeg::analyze_args(&input, &self.config.target),
                Some(&input),
                progress,
            )
            .await
            .and_then(|output| {
                ffmpeg::parse_loudnorm_stats(&output.stderr).map_err(StageError::from)
            });

        match result {
            Ok(stats) => {
                tracing::info!(
                    "Measured loudness: {} LUFS, {} dBTP, {} LU",
                    stats.input_i,
                    stats.input_tp,
                    stats.input_lra
                );
                ctx.loudness = Some(stats);
                StageOutcome::Complete
            }
            Err(e) => {
                ctx.loudness = None;
                ctx.warn(format!("Level analysis failed, using default target: {}", e));
                StageOutcome::failed(self.failure_class(), e)
            }
        }
    }
}

pub struct NormalizeStage {
    config: ToolStageConfig,
}

impl NormalizeStage {
    pub fn new(config: ToolStageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for NormalizeStage {
    fn name(&self) -> &'static str {
        NORMALIZE_AUDIO
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::NonFatal
    }

    async fn run(&self, ctx: &mut StageContext, progress: &StageProgress<'_>) -> StageOutcome {
        let Some(input) = ctx.audio.clone() else {
            return StageOutcome::Skipped("no audio capture".to_string());
        };
        let output = ctx.output_dir.join("audio-normalized.wav");
        let args =
            ffmpeg::normalize_args(&input, &output, &self.config.target, ctx.loudness.as_ref());

        match self.config.run_tool("normalize", args, Some(&input), progress).await {
            Ok(_) => {
                ctx.audio = Some(output);
                StageOutcome::Complete
            }
            Err(e) => {
                ctx.audio_branch_failed = true;
                ctx.warn(format!("Normalization failed, merging un-normalized audio: {}", e));
                StageOutcome::failed(self.failure_class(), e)
            }
        }
    }
}

pub struct MergeStage {
    config: ToolStageConfig,
}

impl MergeStage {
    pub fn new(config: ToolStageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for MergeStage {
    fn name(&self) -> &'static str {
        MERGE
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::Fatal
    }

    async fn run(&self, ctx: &mut StageContext, progress: &StageProgress<'_>) -> StageOutcome {
        let Some(video) = ctx.video.clone() else {
            return StageOutcome::failed(
                self.failure_class(),
                StageError::MissingInput("no screen capture to merge".to_string()),
            );
        };
        if ctx.audio.is_none() {
            ctx.warn("No audio available, producing video-only output");
        } else if ctx.audio_branch_failed {
            tracing::info!("Merging un-normalized audio {:?}", ctx.audio);
        }

        let output = ctx.output_dir.join("final.mp4");
        let args = ffmpeg::merge_args(&video, ctx.audio.as_deref(), &output);

        match self.config.run_tool("merge", args, Some(&video), progress).await {
            Ok(_) => {
                ctx.landscape_output = Some(output);
                StageOutcome::Complete
            }
            Err(e) => StageOutcome::failed(self.failure_class(), e),
        }
    }
}

pub struct VerticalCompositeStage {
    config: ToolStageConfig,
}

impl VerticalCompositeStage {
    pub fn new(config: ToolStageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for VerticalCompositeStage {
    fn name(&self) -> &'static str {
        VERTICAL_COMPOSITE
    }

    fn failure_class(&self) -> FailureClass {
        FailureClass::NonFatal
    }

    async fn run(&self, ctx: &mut StageContext, progress: &StageProgress<'_>) -> StageOutcome {
        if !ctx.vertical_requested {
            return StageOutcome::Skipped("vertical composite not requested".to_string());
        }
        let (Some(webcam), Some(video)) = (ctx.webcam.clone(), ctx.video.clone()) else {
            return StageOutcome::Skipped("requires both webcam and screen captures".to_string());
        };

        let screen = ctx.landscape_output.clone().unwrap_or(video);
        let output = ctx.output_dir.join("final-vertical.mp4");
        let args = ffmpeg::vertical_args(&screen, &webcam, &output);

        match self.config.run_tool("vertical", args, Some(&screen), progress).await {
            Ok(_) => {
                ctx.vertical_output = Some(output);
                StageOutcome::Complete
            }
            Err(e) => {
                ctx.warn(format!(
                    "Vertical composite failed, landscape output is unaffected: {}",
                    e
                ));
                StageOutcome::failed(self.failure_class(), e)
            }
        }
    }
}

/// The canonical stage list
pub fn standard_stages(
    terminator: Arc<dyn CaptureTerminator>,
    config: ToolStageConfig,
) -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(StopCaptureStage::new(terminator)),
        Box::new(DenoiseStage::new(config.clone())),
        Box::new(AnalyzeLevelsStage::new(config.clone())),
        Box::new(NormalizeStage::new(config.clone())),
        Box::new(MergeStage::new(config.clone())),
        Box::new(VerticalCompositeStage::new(config)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ffmpeg::{ToolError, ToolOutput};
    use crate::pipeline::progress;

    struct UnusedTool;

    #[async_trait]
    impl MediaTool for UnusedTool {
        async fn run(
            &self,
            invocation: ToolInvocation,
            _progress: &(dyn Fn(f32) + Send + Sync),
        ) -> Result<ToolOutput, ToolError> {
            Err(ToolError::Parse(format!("unexpected {}", invocation.label)))
        }

        async fn probe_duration(&self, _path: &Path) -> Result<Option<Duration>, ToolError> {
            Ok(None)
        }
    }

    fn config() -> ToolStageConfig {
        ToolStageConfig {
            tool: Arc::new(UnusedTool),
            timeout: Duration::from_secs(1),
            target: LoudnessTarget::default(),
        }
    }

    async fn run_stage(stage: &dyn Stage, ctx: &mut StageContext) -> StageOutcome {
        let run = Arc::new(Mutex::new(PipelineRun::new([stage.name()])));
        run.lock().start_stage(0);
        let (tx, _rx) = progress::channel(4);
        let progress = StageProgress::new(0, run, &tx);
        stage.run(ctx, &progress).await
    }

    #[test]
    fn test_context_falls_back_to_capture_folder() {
        let mut session = RecordingSession::new(":0.0", None, true);
        session.video_path = Some(PathBuf::from("/rec/2024/video.mkv"));
        let ctx = StageContext::for_session(&session, Path::new("/fallback"));
        assert_eq!(ctx.output_dir, PathBuf::from("/rec/2024"));
        assert!(ctx.vertical_requested);

        let bare = RecordingSession::new(":0.0", None, false);
        let ctx = StageContext::for_session(&bare, Path::new("/fallback"));
        assert_eq!(ctx.output_dir, PathBuf::from("/fallback"));
    }

    #[tokio::test]
    async fn test_audio_stages_skip_without_audio() {
        let mut ctx = StageContext::default();
        for stage in [
            Box::new(DenoiseStage::new(config())) as Box<dyn Stage>,
            Box::new(AnalyzeLevelsStage::new(config())),
            Box::new(NormalizeStage::new(config())),
        ] {
            assert!(matches!(run_stage(stage.as_ref(), &mut ctx).await, StageOutcome::Skipped(_)));
        }
    }

    #[tokio::test]
    async fn test_vertical_skip_reasons() {
        let stage = VerticalCompositeStage::new(config());

        let mut ctx = StageContext {
            webcam: Some(PathBuf::from("/rec/webcam.mkv")),
            video: Some(PathBuf::from("/rec/video.mkv")),
            ..StageContext::default()
        };
        match run_stage(&stage, &mut ctx).await {
            StageOutcome::Skipped(reason) => assert!(reason.contains("not requested")),
            other => panic!("expected skip, got {:?}", other),
        }

        ctx.vertical_requested = true;
        ctx.webcam = None;
        match run_stage(&stage, &mut ctx).await {
            StageOutcome::Skipped(reason) => assert!(reason.contains("webcam")),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analysis_failure_clears_stats() {
        let stage = AnalyzeLevelsStage::new(config());
        let mut ctx = StageContext {
            audio: Some(PathBuf::from("/rec/audio.wav")),
            ..StageContext::default()
        };
        let outcome = run_stage(&stage, &mut ctx).await;
        assert!(matches!(outcome, StageOutcome::Failed { fatal: false, .. }));
        assert!(ctx.loudness.is_none());
        assert_eq!(ctx.warnings.len(), 1);
    }
}
