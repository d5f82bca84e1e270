//! Core types shared by the pipeline components

use crate::error::{ErrorKind, PipelineError};
use crate::stage::{Command, Stage};
use avsync_common::fingerprint::fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a row in the target store
pub type TargetId = i64;

/// Point in source time up to which a stage is known to be synchronised
pub type Watermark = DateTime<Utc>;

#[derive(Debug, Error)]
#[error("Invalid operator '{0}': use lowercase letters, digits, '-' or '_'")]
pub struct InvalidOperatorId(String);

/// Tenant identifier. Every record, checkpoint and run lock is scoped by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperatorId(String);

impl OperatorId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidOperatorId> {
        let value = value.into();
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidOperatorId(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for OperatorId {
    type Err = InvalidOperatorId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for OperatorId {
    type Error = InvalidOperatorId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OperatorId> for String {
    fn from(value: OperatorId) -> Self {
        value.0
    }
}

/// Time bounds of an extraction, both ends optional
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractionWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ExtractionWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// One page of raw source records
#[derive(Debug, Clone)]
pub struct Page {
    pub number: u32,
    pub records: Vec<Value>,
    /// Shorter than the requested page size, nothing follows
    pub is_last: bool,
}

/// Normalised, reference-resolved record ready for upsert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub stage: Stage,
    pub natural_key: String,
    pub data: Value,
    pub fingerprint: String,
}

impl CanonicalRecord {
    pub fn new(stage: Stage, natural_key: impl Into<String>, data: Map<String, Value>) -> Self {
        let data = Value::Object(data);
        let fingerprint = fingerprint(&data);
        Self {
            stage,
            natural_key: natural_key.into(),
            data,
            fingerprint,
        }
    }
}

/// What an upsert did to one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRecord {
    pub natural_key: String,
    pub target_id: TargetId,
    pub outcome: UpsertOutcome,
}

/// Counters of one load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl LoadResult {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Why a single record did not make it into the store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    pub natural_key: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Stored watermark of one (operator, stage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub operator: OperatorId,
    pub stage: Stage,
    pub watermark: Watermark,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Run Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Failed => "failed",
        }
    }

    /// Process exit code for the boundary binary
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::PartiallyFailed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PipelineError> for ErrorReport {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one executed stage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    /// Records intentionally filtered out by the transformer
    pub skipped: u64,
    pub failure_samples: Vec<RecordFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl StageResult {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Succeeded,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            skipped: 0,
            failure_samples: Vec::new(),
            error: None,
        }
    }

    pub fn add_load(&mut self, load: &LoadResult) {
        self.inserted += load.inserted;
        self.updated += load.updated;
        self.unchanged += load.unchanged;
        self.failed += load.failed;
    }

    /// Keep at most `limit` samples; the counter is maintained by the caller.
    pub fn sample_failure(&mut self, failure: RecordFailure, limit: usize) {
        if self.failure_samples.len() < limit {
            self.failure_samples.push(failure);
        }
    }

    pub fn fail(mut self, err: &PipelineError) -> Self {
        self.status = if matches!(err, PipelineError::Cancelled) {
            StageStatus::Cancelled
        } else {
            StageStatus::Failed
        };
        self.error = Some(ErrorReport::from(err));
        self
    }
}

/// Structured outcome of one run, always produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: Uuid,
    pub operator: OperatorId,
    pub command: Command,
    /// Stage list the command resolved to, empty when resolution failed
    pub stages: Vec<Stage>,
    pub status: RunStatus,
    pub per_stage_results: Vec<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunResult {
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.per_stage_results.iter().find(|r| r.stage == stage)
    }
}
