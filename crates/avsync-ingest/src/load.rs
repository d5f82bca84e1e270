//! Idempotent, batched loading into the target store

use crate::error::{ErrorKind, PipelineError, StoreError};
use crate::stage::Stage;
use crate::store::TargetStore;
use crate::types::{AppliedRecord, CanonicalRecord, LoadResult, OperatorId, RecordFailure, TargetId};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a load committed
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub result: LoadResult,
    /// Records the store rejected
    pub failures: Vec<RecordFailure>,
    /// Natural key to target id of every committed record
    pub keys: Vec<(String, TargetId)>,
}

impl LoadOutcome {
    fn absorb(&mut self, applied: Vec<AppliedRecord>) {
        for record in applied {
            self.result.record(record.outcome);
            self.keys.push((record.natural_key, record.target_id));
        }
    }
}

pub struct Loader {
    store: Arc<dyn TargetStore>,
    batch_size: usize,
}

impl Loader {
    pub fn new(store: Arc<dyn TargetStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Upsert the records in atomic chunks.
    ///
    /// A chunk rejected because of one record is retried once without it.
    /// Any other store error, or a second rejection, aborts with
    /// [`PipelineError::Load`].
    pub async fn load(
        &self,
        operator: &OperatorId,
        stage: Stage,
        records: Vec<CanonicalRecord>,
    ) -> Result<LoadOutcome, PipelineError> {
        let mut outcome = LoadOutcome::default();

        for chunk in records.chunks(self.batch_size) {
            self.load_chunk(operator, stage, chunk, &mut outcome).await?;
        }

        debug!(
            stage = %stage,
            inserted = outcome.result.inserted,
            updated = outcome.result.updated,
            unchanged = outcome.result.unchanged,
            failed = outcome.result.failed,
            "Loaded records"
        );
        Ok(outcome)
    }

    async fn load_chunk(
        &self,
        operator: &OperatorId,
        stage: Stage,
        chunk: &[CanonicalRecord],
        outcome: &mut LoadOutcome,
    ) -> Result<(), PipelineError> {
        let (natural_key, reason) = match self.store.apply_batch(operator, stage, chunk).await {
            Ok(applied) => {
                outcome.absorb(applied);
                return Ok(());
            },
            Err(StoreError::Rejected {
                natural_key,
                reason,
            }) => (natural_key, reason),
            Err(err) => {
                return Err(PipelineError::Load {
                    stage,
                    message: err.to_string(),
                })
            },
        };

        warn!(
            stage = %stage,
            natural_key = %natural_key,
            reason = %reason,
            "Store rejected record, retrying batch without it"
        );

        let remaining: Vec<CanonicalRecord> = chunk
            .iter()
            .filter(|record| record.natural_key != natural_key)
            .cloned()
            .collect();
        outcome.result.failed += (chunk.len() - remaining.len()) as u64;
        outcome.failures.push(RecordFailure {
            natural_key: Some(natural_key.clone()),
            kind: ErrorKind::Rejected,
            message: reason,
        });

        if remaining.is_empty() {
            return Ok(());
        }

        match self.store.apply_batch(operator, stage, &remaining).await {
            Ok(applied) => {
                outcome.absorb(applied);
                Ok(())
            },
            Err(err) => Err(PipelineError::Load {
                stage,
                message: format!("batch failed again after excluding '{natural_key}': {err}"),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{json, Map};

    fn operator() -> OperatorId {
        OperatorId::new("acme").unwrap()
    }

    fn records(count: usize) -> Vec<CanonicalRecord> {
        (0..count)
            .map(|i| {
                let mut data = Map::new();
                data.insert("name".into(), json!(format!("Crew {i}")));
                CanonicalRecord::new(Stage::Crew, format!("p-{i}"), data)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_load_is_chunked_and_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(store.clone(), 4);

        let first = loader.load(&operator(), Stage::Crew, records(10)).await.unwrap();
        assert_eq!(first.result.inserted, 10);
        assert_eq!(first.keys.len(), 10);
        assert_eq!(store.batches_applied(), 3);

        let second = loader.load(&operator(), Stage::Crew, records(10)).await.unwrap();
        assert_eq!(second.result.inserted, 0);
        assert_eq!(second.result.unchanged, 10);
    }

    #[tokio::test]
    async fn test_rejected_record_is_excluded_and_chunk_retried() {
        let store = Arc::new(MemoryStore::new());
        store.reject_key(Stage::Crew, "p-2");
        let loader = Loader::new(store.clone(), 5);

        let outcome = loader.load(&operator(), Stage::Crew, records(5)).await.unwrap();
        assert_eq!(outcome.result.inserted, 4);
        assert_eq!(outcome.result.failed, 1);
        assert_eq!(outcome.failures[0].natural_key.as_deref(), Some("p-2"));
        assert_eq!(outcome.failures[0].kind, ErrorKind::Rejected);
        assert_eq!(store.record_count(&operator(), Stage::Crew), 4);
    }

    #[tokio::test]
    async fn test_second_rejection_aborts_the_load() {
        let store = Arc::new(MemoryStore::new());
        store.reject_key(Stage::Crew, "p-1");
        store.reject_key(Stage::Crew, "p-3");
        let loader = Loader::new(store.clone(), 5);

        let err = loader.load(&operator(), Stage::Crew, records(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Load);
        assert_eq!(store.record_count(&operator(), Stage::Crew), 0);
    }
}
