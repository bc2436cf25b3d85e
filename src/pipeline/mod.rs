//! Post-processing pipeline
//!
//! Turns the raw capture files into the finished videos:
//! - Stage trait and the six-stage catalogue
//! - Driver with per-stage timeout
//! - Progress bus towards the presentation loop
//! - ffmpeg-backed media tool

pub mod ffmpeg;
pub mod progress;
pub mod runner;
pub mod stages;
pub mod types;

pub use ffmpeg::{FfmpegTool, MediaTool};
pub use progress::{ProgressEvent, ProgressReceiver, ProgressSender};
pub use runner::PostProcessingPipeline;
pub use stages::{CaptureTerminator, Stage, StageContext};
pub use types::{PipelineRun, RunStatus, StageFailure, StageRecord, StageStatus};
