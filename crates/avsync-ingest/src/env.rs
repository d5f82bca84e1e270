//! Operator configuration from environment files
//!
//! Each operator keeps its credentials in `.env.<operator>`; a plain `.env` is
//! the fallback. Values already present in the process environment win.

use anyhow::{Context, Result};
use avsync_ingest::config::{
    BatchConfig, PipelineConfig, PrerequisitePolicy, RetryConfig, SourceConfig, StoreConfig,
    TransformConfig, WindowConfig,
};
use avsync_ingest::{OperatorConfig, OperatorId};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Load the operator's env file into the process environment.
pub fn load_operator_env(dir: &Path, operator: &OperatorId) -> Result<Option<PathBuf>> {
    let candidates = [dir.join(format!(".env.{operator}")), dir.join(".env")];

    for path in candidates {
        if path.is_file() {
            dotenvy::from_path(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            debug!(path = %path.display(), "Loaded operator environment");
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Build and validate the operator's configuration from `lookup`.
pub fn operator_config<F>(operator: OperatorId, lookup: F) -> Result<OperatorConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key)
            .filter(|value| !value.trim().is_empty())
            .with_context(|| format!("{key} is not set for operator '{operator}'"))
    };

    let source = SourceConfig {
        base_url: required("SOURCE_BASE_URL")?,
        client_id: required("SOURCE_CLIENT_ID")?,
        client_secret: required("SOURCE_CLIENT_SECRET")?,
        timeout_secs: parsed(&lookup, "SOURCE_TIMEOUT_SECS")?
            .unwrap_or(RetryConfig::default().request_timeout_secs),
    };

    let store_defaults = StoreConfig::new(required("DATABASE_URL")?);
    let store = StoreConfig {
        max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS")?
            .unwrap_or(store_defaults.max_connections),
        connect_timeout_secs: parsed(&lookup, "DATABASE_CONNECT_TIMEOUT_SECS")?
            .unwrap_or(store_defaults.connect_timeout_secs),
        ..store_defaults
    };

    let batch_defaults = BatchConfig::default();
    let batch = BatchConfig {
        page_size: parsed(&lookup, "PAGE_SIZE")?.unwrap_or(batch_defaults.page_size),
        load_batch_size: parsed(&lookup, "BATCH_SIZE")?.unwrap_or(batch_defaults.load_batch_size),
        max_in_flight_pages: parsed(&lookup, "MAX_IN_FLIGHT_PAGES")?
            .unwrap_or(batch_defaults.max_in_flight_pages),
        max_failure_rate: parsed(&lookup, "MAX_FAILURE_RATE")?
            .unwrap_or(batch_defaults.max_failure_rate),
        ..batch_defaults
    };

    let window_defaults = WindowConfig::default();
    let initial_load_days_past = match parsed::<i64, _>(&lookup, "INITIAL_LOAD_MONTHS_PAST")? {
        Some(months) => months
            .checked_mul(30)
            .with_context(|| format!("INITIAL_LOAD_MONTHS_PAST '{months}' is out of range"))?,
        None => window_defaults.initial_load_days_past,
    };
    let window = WindowConfig {
        initial_load_days_past,
        refresh_days_past: parsed(&lookup, "REFRESH_DAYS_PAST")?
            .unwrap_or(window_defaults.refresh_days_past),
        days_future: parsed(&lookup, "REFRESH_DAYS_FUTURE")?
            .unwrap_or(window_defaults.days_future),
    };

    let transform_defaults = TransformConfig::default();
    let transform = TransformConfig {
        senior_age_threshold: parsed(&lookup, "SENIOR_CREW_AGE_THRESHOLD")?
            .unwrap_or(transform_defaults.senior_age_threshold),
        unavailable_event_categories: lookup("UNAVAILABLE_EVENT_CATEGORIES")
            .map(|value| split_list(&value))
            .unwrap_or_else(|| transform_defaults.unavailable_event_categories.clone()),
        ..transform_defaults
    };

    let prerequisites = if parsed(&lookup, "REQUIRE_PREREQUISITE_CHECKPOINTS")?.unwrap_or(false) {
        PrerequisitePolicy::RequireCheckpoints
    } else {
        PrerequisitePolicy::TrustCaller
    };

    let config = OperatorConfig {
        operator,
        source,
        store,
        pipeline: PipelineConfig {
            batch,
            retry: RetryConfig::default(),
            window,
            transform,
            prerequisites,
        },
    };
    config.validate()?;
    Ok(config)
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("Invalid {key} '{value}': {err}")),
        _ => Ok(None),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
