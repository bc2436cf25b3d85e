//! Error types and handling
//!
//! Common error types used across the application.

use crate::pipeline::types::StageFailure;
use crate::project::bundle::BundleError;
use crate::recorder::supervisor::RecorderError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recording error: {0}")]
    Recording(#[from] RecorderError),

    #[error("Processing error: {0}")]
    Processing(#[from] StageFailure),

    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),
}

/// Error response for collaborators consuming JSON
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Recording(RecorderError::AlreadyRecording { .. }) => "ALREADY_RECORDING",
            AppError::Recording(RecorderError::NotRecording) => "NOT_RECORDING",
            AppError::Recording(RecorderError::CaptureSpawnFailure(_)) => "CAPTURE_SPAWN_FAILURE",
            AppError::Recording(RecorderError::StaleSessionDetected { .. }) => "STALE_SESSION",
            AppError::Recording(_) => "RECORDING_ERROR",
            AppError::Processing(_) => "STAGE_FAILURE",
            AppError::Bundle(_) => "BUNDLE_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
