//! Error and warning types for the upscaling pipeline.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline stage, used to label failures and progress output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probing,
    Extracting,
    Upscaling,
    Normalizing,
    Assembling,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Probing => "probing",
            Stage::Extracting => "extracting",
            Stage::Upscaling => "upscaling",
            Stage::Normalizing => "normalizing",
            Stage::Assembling => "assembling",
        };
        f.write_str(name)
    }
}

/// Fatal errors. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("input file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("{stage} failed: {message}")]
    StageFailure { stage: Stage, message: String },

    #[error("interrupted")]
    Interrupted,

    #[error("{stage} timed out after {secs} seconds")]
    Timeout { stage: Stage, secs: u64 },

    #[error("workspace metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create a stage failure error.
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self::StageFailure {
            stage,
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Interrupted => 130,
            _ => 1,
        }
    }
}

/// Non-fatal conditions absorbed by the pipeline and reported at the end.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineWarning {
    /// The engine exited non-zero or produced fewer frames than were extracted.
    #[error("upscaling produced {produced} of {expected} frames{}", engine_exit_suffix(.exit_code))]
    PartialProcessing {
        expected: usize,
        produced: usize,
        exit_code: Option<i32>,
    },

    /// The source frame rate could not be used; the default rate was applied.
    #[error("unusable frame rate '{expression}', falling back to {} fps", crate::probe::DEFAULT_FRAME_RATE)]
    FrameRateFallback { expression: String },

    /// The source has no audio stream; the output is video only.
    #[error("source has no audio stream, output is video only")]
    AudioMissing,
}

fn engine_exit_suffix(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) if *code != 0 => format!(" (engine exit code {})", code),
        _ => String::new(),
    }
}
