//! Error taxonomy for the sync pipeline
//!
//! Errors are scoped by blast radius: [`RecordError`] affects one record and is
//! tallied, [`PipelineError`] aborts a stage or the whole run. [`ErrorKind`] is
//! the stable, serialisable name of each error used in run results.

use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error classification reported in run results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownStage,
    InvalidStageGraph,
    RunAlreadyInProgress,
    MissingPrerequisite,
    FatalAuth,
    Extraction,
    StageQuality,
    Load,
    CheckpointRegression,
    Store,
    Cancelled,
    Validation,
    UnresolvedReference,
    Rejected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownStage => "unknown_stage",
            ErrorKind::InvalidStageGraph => "invalid_stage_graph",
            ErrorKind::RunAlreadyInProgress => "run_already_in_progress",
            ErrorKind::MissingPrerequisite => "missing_prerequisite",
            ErrorKind::FatalAuth => "fatal_auth",
            ErrorKind::Extraction => "extraction",
            ErrorKind::StageQuality => "stage_quality",
            ErrorKind::Load => "load",
            ErrorKind::CheckpointRegression => "checkpoint_regression",
            ErrorKind::Store => "store",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Validation => "validation",
            ErrorKind::UnresolvedReference => "unresolved_reference",
            ErrorKind::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort a stage or a run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown stage or command: {0}")]
    UnknownStage(String),

    #[error("Invalid stage graph: {0}")]
    InvalidStageGraph(String),

    #[error("A run is already in progress for operator '{operator}'")]
    RunAlreadyInProgress { operator: String },

    #[error("Stage '{stage}' requires '{prerequisite}', which has never completed for this operator")]
    MissingPrerequisite { stage: Stage, prerequisite: Stage },

    #[error("Source rejected credentials: {0}")]
    FatalAuth(String),

    #[error("Extraction failed for stage '{stage}' on page {page} after {attempts} attempt(s): {message}")]
    Extraction {
        stage: Stage,
        page: u32,
        attempts: u32,
        message: String,
    },

    #[error("Stage '{stage}' exceeded the failure threshold: {failed} of {total} records failed (limit {threshold})")]
    StageQuality {
        stage: Stage,
        failed: u64,
        total: u64,
        threshold: f64,
    },

    #[error("Load failed for stage '{stage}': {message}")]
    Load { stage: Stage, message: String },

    #[error("Checkpoint for stage '{stage}' would regress from {current} to {attempted}")]
    CheckpointRegression {
        stage: Stage,
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    #[error("Run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnknownStage(_) => ErrorKind::UnknownStage,
            PipelineError::InvalidStageGraph(_) => ErrorKind::InvalidStageGraph,
            PipelineError::RunAlreadyInProgress { .. } => ErrorKind::RunAlreadyInProgress,
            PipelineError::MissingPrerequisite { .. } => ErrorKind::MissingPrerequisite,
            PipelineError::FatalAuth(_) => ErrorKind::FatalAuth,
            PipelineError::Extraction { .. } => ErrorKind::Extraction,
            PipelineError::StageQuality { .. } => ErrorKind::StageQuality,
            PipelineError::Load { .. } => ErrorKind::Load,
            PipelineError::CheckpointRegression { .. } => ErrorKind::CheckpointRegression,
            PipelineError::Store(_) => ErrorKind::Store,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Errors that end the run as `Failed` rather than `PartiallyFailed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::UnknownStage(_)
                | PipelineError::InvalidStageGraph(_)
                | PipelineError::RunAlreadyInProgress { .. }
                | PipelineError::MissingPrerequisite { .. }
                | PipelineError::FatalAuth(_)
        )
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CheckpointRegression {
                stage,
                current,
                attempted,
            } => PipelineError::CheckpointRegression {
                stage,
                current,
                attempted,
            },
            other => PipelineError::Store(other),
        }
    }
}

/// Per-record transformation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("Invalid field '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Unresolved reference to {entity} '{key}'")]
    UnresolvedReference { entity: Stage, key: String },
}

impl RecordError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RecordError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordError::Validation { .. } => ErrorKind::Validation,
            RecordError::UnresolvedReference { .. } => ErrorKind::UnresolvedReference,
        }
    }
}

/// Failures reported by a [`SourceClient`](crate::source::SourceClient)
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Transient source failure: {0}")]
    Transient(String),

    #[error("Source request timed out")]
    Timeout,

    #[error("Source authentication failed: {0}")]
    Auth(String),

    #[error("Invalid source response: {0}")]
    InvalidResponse(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_) | SourceError::Timeout)
    }
}

/// Failures reported by the target and checkpoint stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record '{natural_key}' rejected: {reason}")]
    Rejected { natural_key: String, reason: String },

    #[error("Checkpoint for stage '{stage}' would regress from {current} to {attempted}")]
    CheckpointRegression {
        stage: Stage,
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
