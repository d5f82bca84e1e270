//! Pipeline configuration
//!
//! Plain values handed to the core by the caller. Nothing in this crate's
//! library reads the process environment; the binary builds these structs.

use crate::types::OperatorId;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Page and batch sizing, concurrency and quality limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Records requested per source page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Records per atomic store transaction
    #[serde(default = "default_load_batch_size")]
    pub load_batch_size: usize,
    /// Source pages requested ahead of the one being applied
    #[serde(default = "default_max_in_flight_pages")]
    pub max_in_flight_pages: usize,
    /// A page whose failure rate exceeds this aborts the stage
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    #[serde(default = "default_max_failure_samples")]
    pub max_failure_samples: usize,
}

fn default_page_size() -> u32 {
    1000
}

fn default_load_batch_size() -> usize {
    500
}

fn default_max_in_flight_pages() -> usize {
    4
}

fn default_max_failure_rate() -> f64 {
    0.2
}

fn default_max_failure_samples() -> usize {
    10
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            load_batch_size: default_load_batch_size(),
            max_in_flight_pages: default_max_in_flight_pages(),
            max_failure_rate: default_max_failure_rate(),
            max_failure_samples: default_max_failure_samples(),
        }
    }
}

/// Retry policy for source calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of a single source call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_request_timeout_secs() -> u64 {
    20
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Extraction window sizing for incremental stages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    /// Look-back of a stage that has never completed
    #[serde(default = "default_initial_load_days_past")]
    pub initial_load_days_past: i64,
    /// Overlap subtracted from the checkpoint to catch late edits
    #[serde(default = "default_refresh_days_past")]
    pub refresh_days_past: i64,
    /// Future horizon for scheduled records
    #[serde(default = "default_days_future")]
    pub days_future: i64,
}

fn default_initial_load_days_past() -> i64 {
    60
}

fn default_refresh_days_past() -> i64 {
    3
}

fn default_days_future() -> i64 {
    10
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            initial_load_days_past: default_initial_load_days_past(),
            refresh_days_past: default_refresh_days_past(),
            days_future: default_days_future(),
        }
    }
}

/// Domain constants used by the transformers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformConfig {
    #[serde(default = "default_senior_age_threshold")]
    pub senior_age_threshold: u32,
    /// Assignments starting before this UTC hour count toward the previous duty day
    #[serde(default = "default_duty_cutoff_hour")]
    pub duty_cutoff_hour: u32,
    #[serde(default = "default_pre_duty_minutes")]
    pub pre_duty_minutes: i64,
    #[serde(default = "default_post_duty_minutes")]
    pub post_duty_minutes: i64,
    /// Taxi allowance between block and flight times
    #[serde(default = "default_block_padding_minutes")]
    pub block_padding_minutes: i64,
    /// Duty category codes treated as unavailable whatever the synced
    /// category says
    #[serde(default = "default_unavailable_event_categories")]
    pub unavailable_event_categories: Vec<String>,
}

fn default_senior_age_threshold() -> u32 {
    65
}

fn default_duty_cutoff_hour() -> u32 {
    9
}

fn default_pre_duty_minutes() -> i64 {
    60
}

fn default_post_duty_minutes() -> i64 {
    30
}

fn default_block_padding_minutes() -> i64 {
    6
}

fn default_unavailable_event_categories() -> Vec<String> {
    Vec::new()
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            senior_age_threshold: default_senior_age_threshold(),
            duty_cutoff_hour: default_duty_cutoff_hour(),
            pre_duty_minutes: default_pre_duty_minutes(),
            post_duty_minutes: default_post_duty_minutes(),
            block_padding_minutes: default_block_padding_minutes(),
            unavailable_event_categories: default_unavailable_event_categories(),
        }
    }
}

impl TransformConfig {
    pub fn is_listed_unavailable(&self, code: &str) -> bool {
        self.unavailable_event_categories.iter().any(|listed| listed == code)
    }
}

/// How strictly prerequisites of a resolved stage are verified
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrerequisitePolicy {
    /// The caller guarantees prerequisites ran; unresolved references surface per record
    #[default]
    TrustCaller,
    /// Refuse to start unless every prerequisite ran in this run or has a checkpoint
    RequireCheckpoints,
}

/// Everything the run controller needs besides its collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub prerequisites: PrerequisitePolicy,
}

/// Upper bound for every window day count, about a century
pub const MAX_WINDOW_DAYS: i64 = 36_500;

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch.page_size == 0 {
            anyhow::bail!("page_size must be greater than 0");
        }
        if self.batch.load_batch_size == 0 {
            anyhow::bail!("load_batch_size must be greater than 0");
        }
        if self.batch.max_in_flight_pages == 0 {
            anyhow::bail!("max_in_flight_pages must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.batch.max_failure_rate) {
            anyhow::bail!(
                "max_failure_rate must be between 0 and 1, got {}",
                self.batch.max_failure_rate
            );
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.retry.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }
        let days = [
            self.window.initial_load_days_past,
            self.window.refresh_days_past,
            self.window.days_future,
        ];
        if days.iter().any(|&d| d < 0) {
            anyhow::bail!("window day counts must not be negative");
        }
        if days.iter().any(|&d| d > MAX_WINDOW_DAYS) {
            anyhow::bail!("window day counts must not exceed {MAX_WINDOW_DAYS}");
        }
        if self.transform.duty_cutoff_hour > 23 {
            anyhow::bail!("duty_cutoff_hour must be an hour of the day (0-23)");
        }
        Ok(())
    }
}

/// Connection settings of an operator's source system
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Target database settings
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("database_url is required");
        }
        if self.max_connections < 2 {
            // One connection is pinned by the run lock for the whole run
            anyhow::bail!("max_connections must be at least 2, got {}", self.max_connections);
        }
        Ok(())
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Full configuration of one operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub operator: OperatorId,
    pub source: SourceConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl OperatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.base_url.trim().is_empty() {
            anyhow::bail!("source base_url is required for operator '{}'", self.operator);
        }
        if self.source.client_id.is_empty() || self.source.client_secret.is_empty() {
            anyhow::bail!("source credentials are required for operator '{}'", self.operator);
        }
        self.store
            .validate()
            .with_context(|| format!("Invalid store settings for operator '{}'", self.operator))?;
        self.pipeline.validate()
    }
}
