//! Recording system module
//!
//! This module implements the capture side of a recording:
//! - ffmpeg capture commands per source
//! - ProcessControl seam over OS processes
//! - StateStore persisting the session one fact per file
//! - ProcessSupervisor owning the session lifecycle

pub mod capture;
pub mod process;
pub mod state;
pub mod store;
pub mod supervisor;

pub use process::{ProcessControl, SystemProcesses};
pub use state::{RecordingOptions, RecordingSession, RecordingStatus};
pub use store::StateStore;
pub use supervisor::{PipelineHandle, ProcessSupervisor, Reconciliation, RecorderError, StopTrigger};
