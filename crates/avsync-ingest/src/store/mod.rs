//! Target and checkpoint persistence
//!
//! [`TargetStore`] upserts canonical records and answers natural-key lookups.
//! [`CheckpointStore`] keeps the per-(operator, stage) watermark and the
//! per-operator run lock. Both are implemented by [`PgStore`] for production
//! and by [`MemoryStore`] for tests and dry runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::StoreError;
use crate::stage::Stage;
use crate::types::{AppliedRecord, CanonicalRecord, Checkpoint, OperatorId, TargetId, Watermark};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Upsert the records as one atomic unit.
    ///
    /// Either every record is applied or none is. A record the store refuses
    /// is reported as [`StoreError::Rejected`] naming its natural key.
    async fn apply_batch(
        &self,
        operator: &OperatorId,
        stage: Stage,
        records: &[CanonicalRecord],
    ) -> Result<Vec<AppliedRecord>, StoreError>;

    /// All natural keys of the stage's entity with their target ids.
    async fn lookup_keys(
        &self,
        operator: &OperatorId,
        stage: Stage,
    ) -> Result<HashMap<String, TargetId>, StoreError>;

    /// One canonical field of every stored record, by natural key. Records
    /// without the field are left out.
    async fn lookup_field(
        &self,
        operator: &OperatorId,
        stage: Stage,
        field: &str,
    ) -> Result<HashMap<String, Value>, StoreError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read(
        &self,
        operator: &OperatorId,
        stage: Stage,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Advance the watermark. Earlier watermarks fail with
    /// [`StoreError::CheckpointRegression`]; an equal one is accepted.
    async fn write(
        &self,
        operator: &OperatorId,
        stage: Stage,
        watermark: Watermark,
    ) -> Result<Checkpoint, StoreError>;

    /// Administrative override. `None` deletes the checkpoint.
    async fn reset(
        &self,
        operator: &OperatorId,
        stage: Stage,
        to: Option<Watermark>,
    ) -> Result<Option<Checkpoint>, StoreError>;

    async fn list(&self, operator: &OperatorId) -> Result<Vec<Checkpoint>, StoreError>;

    /// `None` when another run of the operator holds the lock.
    async fn try_acquire_run_lock(
        &self,
        operator: &OperatorId,
    ) -> Result<Option<RunLease>, StoreError>;
}

/// Exclusive right to run the pipeline for one operator, released on drop
pub struct RunLease {
    operator: OperatorId,
    _guard: Box<dyn Any + Send>,
}

impl RunLease {
    pub fn new(operator: OperatorId, guard: impl Any + Send) -> Self {
        Self {
            operator,
            _guard: Box::new(guard),
        }
    }

    pub fn operator(&self) -> &OperatorId {
        &self.operator
    }
}

impl fmt::Debug for RunLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLease")
            .field("operator", &self.operator)
            .finish_non_exhaustive()
    }
}
