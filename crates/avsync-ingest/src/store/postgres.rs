//! PostgreSQL store
//!
//! Records of every entity live in one `sync_records` table keyed by
//! (operator, entity, natural_key) with the canonical data as JSONB. A batch is
//! one transaction; unchanged fingerprints are not rewritten. The run lock is a
//! session advisory lock held on a dedicated connection.

use super::{CheckpointStore, RunLease, TargetStore};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::stage::Stage;
use crate::types::{
    AppliedRecord, CanonicalRecord, Checkpoint, OperatorId, TargetId, UpsertOutcome, Watermark,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS sync_records (
        id BIGSERIAL PRIMARY KEY,
        operator TEXT NOT NULL,
        entity TEXT NOT NULL,
        natural_key TEXT NOT NULL,
        data JSONB NOT NULL,
        fingerprint TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (operator, entity, natural_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_checkpoints (
        operator TEXT NOT NULL,
        stage TEXT NOT NULL,
        watermark TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (operator, stage)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS sync_records_entity_idx
        ON sync_records (operator, entity)
    "#,
];

const UPSERT_RECORD: &str = r#"
    INSERT INTO sync_records (operator, entity, natural_key, data, fingerprint)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (operator, entity, natural_key) DO UPDATE
        SET data = EXCLUDED.data,
            fingerprint = EXCLUDED.fingerprint,
            updated_at = now()
        WHERE sync_records.fingerprint IS DISTINCT FROM EXCLUDED.fingerprint
    RETURNING id, (xmax = 0) AS inserted
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .context("Failed to connect to target database")?;

        info!(max_connections = config.max_connections, "Connected to target database");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the sync tables when they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Sync schema ready");
        Ok(())
    }
}

/// Constraint and data errors name the offending record; anything else is
/// a database failure.
fn classify(err: sqlx::Error, natural_key: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        use sqlx::error::ErrorKind;

        let constraint = matches!(
            db.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        );
        // SQLSTATE class 22: data exception
        let data_exception = db.code().is_some_and(|code| code.starts_with("22"));

        if constraint || data_exception {
            return StoreError::Rejected {
                natural_key: natural_key.to_string(),
                reason: db.message().to_string(),
            };
        }
    }
    StoreError::Database(err)
}

fn checkpoint_from_row(
    operator: &OperatorId,
    (stage, watermark, updated_at): (String, DateTime<Utc>, DateTime<Utc>),
) -> Result<Checkpoint, StoreError> {
    let stage = stage
        .parse::<Stage>()
        .map_err(|err| StoreError::Unavailable(format!("corrupt checkpoint row: {err}")))?;
    Ok(Checkpoint {
        operator: operator.clone(),
        stage,
        watermark,
        updated_at,
    })
}

#[async_trait]
impl TargetStore for PgStore {
    async fn apply_batch(
        &self,
        operator: &OperatorId,
        stage: Stage,
        records: &[CanonicalRecord],
    ) -> Result<Vec<AppliedRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::with_capacity(records.len());

        for record in records {
            let row: Option<(TargetId, bool)> = sqlx::query_as(UPSERT_RECORD)
                .bind(operator.as_str())
                .bind(stage.as_str())
                .bind(&record.natural_key)
                .bind(&record.data)
                .bind(&record.fingerprint)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|err| classify(err, &record.natural_key))?;

            let (target_id, outcome) = match row {
                Some((id, true)) => (id, UpsertOutcome::Inserted),
                Some((id, false)) => (id, UpsertOutcome::Updated),
                // Conflict with an identical fingerprint: nothing written
                None => {
                    let (id,): (TargetId,) = sqlx::query_as(
                        r#"
                        SELECT id FROM sync_records
                        WHERE operator = $1 AND entity = $2 AND natural_key = $3
                        "#,
                    )
                    .bind(operator.as_str())
                    .bind(stage.as_str())
                    .bind(&record.natural_key)
                    .fetch_one(&mut *tx)
                    .await?;
                    (id, UpsertOutcome::Unchanged)
                },
            };

            applied.push(AppliedRecord {
                natural_key: record.natural_key.clone(),
                target_id,
                outcome,
            });
        }

        tx.commit().await?;
        debug!(stage = %stage, records = applied.len(), "Committed batch");
        Ok(applied)
    }

    async fn lookup_keys(
        &self,
        operator: &OperatorId,
        stage: Stage,
    ) -> Result<HashMap<String, TargetId>, StoreError> {
        let rows: Vec<(String, TargetId)> = sqlx::query_as(
            r#"
            SELECT natural_key, id FROM sync_records
            WHERE operator = $1 AND entity = $2
            "#,
        )
        .bind(operator.as_str())
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn lookup_field(
        &self,
        operator: &OperatorId,
        stage: Stage,
        field: &str,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT natural_key, data -> $3 FROM sync_records
            WHERE operator = $1 AND entity = $2 AND data ? $3
            "#,
        )
        .bind(operator.as_str())
        .bind(stage.as_str())
        .bind(field)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn read(
        &self,
        operator: &OperatorId,
        stage: Stage,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row: Option<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT stage, watermark, updated_at FROM sync_checkpoints
            WHERE operator = $1 AND stage = $2
            "#,
        )
        .bind(operator.as_str())
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| checkpoint_from_row(operator, row)).transpose()
    }

    async fn write(
        &self,
        operator: &OperatorId,
        stage: Stage,
        watermark: Watermark,
    ) -> Result<Checkpoint, StoreError> {
        let row: Option<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            INSERT INTO sync_checkpoints (operator, stage, watermark, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (operator, stage) DO UPDATE
                SET watermark = EXCLUDED.watermark,
                    updated_at = EXCLUDED.updated_at
                WHERE sync_checkpoints.watermark <= EXCLUDED.watermark
            RETURNING stage, watermark, updated_at
            "#,
        )
        .bind(operator.as_str())
        .bind(stage.as_str())
        .bind(watermark)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => checkpoint_from_row(operator, row),
            None => {
                let current = self
                    .read(operator, stage)
                    .await?
                    .map_or(watermark, |checkpoint| checkpoint.watermark);
                Err(StoreError::CheckpointRegression {
                    stage,
                    current,
                    attempted: watermark,
                })
            },
        }
    }

    async fn reset(
        &self,
        operator: &OperatorId,
        stage: Stage,
        to: Option<Watermark>,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let Some(watermark) = to else {
            sqlx::query("DELETE FROM sync_checkpoints WHERE operator = $1 AND stage = $2")
                .bind(operator.as_str())
                .bind(stage.as_str())
                .execute(&self.pool)
                .await?;
            return Ok(None);
        };

        let row: (String, DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO sync_checkpoints (operator, stage, watermark, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (operator, stage) DO UPDATE
                SET watermark = EXCLUDED.watermark,
                    updated_at = EXCLUDED.updated_at
            RETURNING stage, watermark, updated_at
            "#,
        )
        .bind(operator.as_str())
        .bind(stage.as_str())
        .bind(watermark)
        .fetch_one(&self.pool)
        .await?;

        checkpoint_from_row(operator, row).map(Some)
    }

    async fn list(&self, operator: &OperatorId) -> Result<Vec<Checkpoint>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT stage, watermark, updated_at FROM sync_checkpoints
            WHERE operator = $1
            "#,
        )
        .bind(operator.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut checkpoints = rows
            .into_iter()
            .map(|row| checkpoint_from_row(operator, row))
            .collect::<Result<Vec<_>, _>>()?;
        checkpoints.sort_by_key(|c| c.stage);
        Ok(checkpoints)
    }

    async fn try_acquire_run_lock(
        &self,
        operator: &OperatorId,
    ) -> Result<Option<RunLease>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let (acquired,): (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(format!("avsync:{operator}"))
                .fetch_one(&mut *conn)
                .await?;

        if !acquired {
            return Ok(None);
        }

        // Session locks die with the connection, so it must not go back to the pool
        conn.close_on_drop();
        Ok(Some(RunLease::new(operator.clone(), AdvisoryLock { _conn: conn })))
    }
}

struct AdvisoryLock {
    _conn: PoolConnection<Postgres>,
}
