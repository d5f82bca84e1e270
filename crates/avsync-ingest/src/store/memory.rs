//! In-process store
//!
//! Holds records and checkpoints in memory with the same semantics as the
//! PostgreSQL store: atomic batches, fingerprint change detection, monotonic
//! checkpoints and an exclusive per-operator run lock. Specific natural keys
//! can be marked as rejected to exercise the loader's retry path.

use super::{CheckpointStore, RunLease, TargetStore};
use crate::error::StoreError;
use crate::stage::Stage;
use crate::types::{
    AppliedRecord, CanonicalRecord, Checkpoint, OperatorId, TargetId, UpsertOutcome, Watermark,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct StoredRecord {
    id: TargetId,
    data: Value,
    fingerprint: String,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<(OperatorId, Stage), BTreeMap<String, StoredRecord>>,
    checkpoints: HashMap<(OperatorId, Stage), Checkpoint>,
    rejected: HashSet<(Stage, String)>,
    next_id: TargetId,
    batches_applied: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    locks: Arc<Mutex<HashSet<OperatorId>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse every future upsert of this natural key.
    pub fn reject_key(&self, stage: Stage, natural_key: impl Into<String>) {
        self.state().rejected.insert((stage, natural_key.into()));
    }

    /// Stored data of one entity, ordered by natural key.
    pub fn records(&self, operator: &OperatorId, stage: Stage) -> Vec<(String, Value)> {
        self.state()
            .records
            .get(&(operator.clone(), stage))
            .map(|records| {
                records
                    .iter()
                    .map(|(key, record)| (key.clone(), record.data.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record_count(&self, operator: &OperatorId, stage: Stage) -> usize {
        self.state()
            .records
            .get(&(operator.clone(), stage))
            .map_or(0, BTreeMap::len)
    }

    /// Number of batches committed so far.
    pub fn batches_applied(&self) -> u64 {
        self.state().batches_applied
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn apply_batch(
        &self,
        operator: &OperatorId,
        stage: Stage,
        records: &[CanonicalRecord],
    ) -> Result<Vec<AppliedRecord>, StoreError> {
        let mut state = self.state();

        // Validate the whole batch before touching anything
        if let Some(record) = records
            .iter()
            .find(|r| state.rejected.contains(&(stage, r.natural_key.clone())))
        {
            return Err(StoreError::Rejected {
                natural_key: record.natural_key.clone(),
                reason: "record refused by store".to_string(),
            });
        }

        let mut next_id = state.next_id;
        let table = state.records.entry((operator.clone(), stage)).or_default();
        let mut applied = Vec::with_capacity(records.len());

        for record in records {
            let outcome = match table.get_mut(&record.natural_key) {
                Some(stored) if stored.fingerprint == record.fingerprint => AppliedRecord {
                    natural_key: record.natural_key.clone(),
                    target_id: stored.id,
                    outcome: UpsertOutcome::Unchanged,
                },
                Some(stored) => {
                    stored.data = record.data.clone();
                    stored.fingerprint = record.fingerprint.clone();
                    AppliedRecord {
                        natural_key: record.natural_key.clone(),
                        target_id: stored.id,
                        outcome: UpsertOutcome::Updated,
                    }
                },
                None => {
                    next_id += 1;
                    table.insert(
                        record.natural_key.clone(),
                        StoredRecord {
                            id: next_id,
                            data: record.data.clone(),
                            fingerprint: record.fingerprint.clone(),
                        },
                    );
                    AppliedRecord {
                        natural_key: record.natural_key.clone(),
                        target_id: next_id,
                        outcome: UpsertOutcome::Inserted,
                    }
                },
            };
            applied.push(outcome);
        }

        state.next_id = next_id;
        state.batches_applied += 1;
        Ok(applied)
    }

    async fn lookup_keys(
        &self,
        operator: &OperatorId,
        stage: Stage,
    ) -> Result<HashMap<String, TargetId>, StoreError> {
        Ok(self
            .state()
            .records
            .get(&(operator.clone(), stage))
            .map(|records| {
                records
                    .iter()
                    .map(|(key, record)| (key.clone(), record.id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn lookup_field(
        &self,
        operator: &OperatorId,
        stage: Stage,
        field: &str,
    ) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self
            .state()
            .records
            .get(&(operator.clone(), stage))
            .map(|records| {
                records
                    .iter()
                    .filter_map(|(key, record)| {
                        let value = record.data.get(field)?;
                        Some((key.clone(), value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn read(
        &self,
        operator: &OperatorId,
        stage: Stage,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.state().checkpoints.get(&(operator.clone(), stage)).cloned())
    }

    async fn write(
        &self,
        operator: &OperatorId,
        stage: Stage,
        watermark: Watermark,
    ) -> Result<Checkpoint, StoreError> {
        let mut state = self.state();
        let key = (operator.clone(), stage);

        if let Some(current) = state.checkpoints.get(&key) {
            if current.watermark > watermark {
                return Err(StoreError::CheckpointRegression {
                    stage,
                    current: current.watermark,
                    attempted: watermark,
                });
            }
        }

        let checkpoint = Checkpoint {
            operator: operator.clone(),
            stage,
            watermark,
            updated_at: Utc::now(),
        };
        state.checkpoints.insert(key, checkpoint.clone());
        Ok(checkpoint)
    }

    async fn reset(
        &self,
        operator: &OperatorId,
        stage: Stage,
        to: Option<Watermark>,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let mut state = self.state();
        let key = (operator.clone(), stage);

        match to {
            None => {
                state.checkpoints.remove(&key);
                Ok(None)
            },
            Some(watermark) => {
                let checkpoint = Checkpoint {
                    operator: operator.clone(),
                    stage,
                    watermark,
                    updated_at: Utc::now(),
                };
                state.checkpoints.insert(key, checkpoint.clone());
                Ok(Some(checkpoint))
            },
        }
    }

    async fn list(&self, operator: &OperatorId) -> Result<Vec<Checkpoint>, StoreError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .state()
            .checkpoints
            .values()
            .filter(|c| &c.operator == operator)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|c| c.stage);
        Ok(checkpoints)
    }

    async fn try_acquire_run_lock(
        &self,
        operator: &OperatorId,
    ) -> Result<Option<RunLease>, StoreError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if !locks.insert(operator.clone()) {
            return Ok(None);
        }

        let guard = LockGuard {
            locks: Arc::clone(&self.locks),
            operator: operator.clone(),
        };
        Ok(Some(RunLease::new(operator.clone(), guard)))
    }
}

struct LockGuard {
    locks: Arc<Mutex<HashSet<OperatorId>>>,
    operator: OperatorId,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.operator);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn operator() -> OperatorId {
        OperatorId::new("acme").unwrap()
    }

    fn record(key: &str, name: &str) -> CanonicalRecord {
        let mut data = Map::new();
        data.insert("name".into(), json!(name));
        CanonicalRecord::new(Stage::AircraftCategories, key, data)
    }

    #[tokio::test]
    async fn test_upsert_outcomes() {
        let store = MemoryStore::new();
        let op = operator();

        let first = store
            .apply_batch(&op, Stage::AircraftCategories, &[record("1", "Light"), record("2", "Mid")])
            .await
            .unwrap();
        assert!(first.iter().all(|r| r.outcome == UpsertOutcome::Inserted));

        let second = store
            .apply_batch(&op, Stage::AircraftCategories, &[record("1", "Light"), record("2", "Midsize")])
            .await
            .unwrap();
        assert_eq!(second[0].outcome, UpsertOutcome::Unchanged);
        assert_eq!(second[1].outcome, UpsertOutcome::Updated);
        assert_eq!(second[1].target_id, first[1].target_id);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_not_partially_applied() {
        let store = MemoryStore::new();
        let op = operator();
        store.reject_key(Stage::AircraftCategories, "2");

        let err = store
            .apply_batch(&op, Stage::AircraftCategories, &[record("1", "Light"), record("2", "Mid")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { ref natural_key, .. } if natural_key == "2"));
        assert_eq!(store.record_count(&op, Stage::AircraftCategories), 0);
    }

    #[tokio::test]
    async fn test_operators_are_isolated() {
        let store = MemoryStore::new();
        let other = OperatorId::new("globex").unwrap();
        store
            .apply_batch(&operator(), Stage::AircraftCategories, &[record("1", "Light")])
            .await
            .unwrap();

        assert!(store
            .lookup_keys(&other, Stage::AircraftCategories)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lookup_field_skips_records_without_it() {
        let store = MemoryStore::new();
        let op = operator();
        let mut flagged = Map::new();
        flagged.insert("is_available".into(), json!(false));
        store
            .apply_batch(
                &op,
                Stage::DutyCategories,
                &[
                    CanonicalRecord::new(Stage::DutyCategories, "TRN", flagged),
                    CanonicalRecord::new(Stage::DutyCategories, "SBY", Map::new()),
                ],
            )
            .await
            .unwrap();

        let values = store
            .lookup_field(&op, Stage::DutyCategories, "is_available")
            .await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["TRN"], json!(false));
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic_but_resettable() {
        let store = MemoryStore::new();
        let op = operator();
        let now = Utc::now();

        store.write(&op, Stage::Crew, now).await.unwrap();
        store.write(&op, Stage::Crew, now).await.unwrap();
        let err = store
            .write(&op, Stage::Crew, now - chrono::Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckpointRegression { .. }));

        let earlier = now - chrono::Duration::days(7);
        store.reset(&op, Stage::Crew, Some(earlier)).await.unwrap();
        assert_eq!(store.read(&op, Stage::Crew).await.unwrap().unwrap().watermark, earlier);

        store.reset(&op, Stage::Crew, None).await.unwrap();
        assert!(store.read(&op, Stage::Crew).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_lock_is_released_on_drop() {
        let store = MemoryStore::new();
        let op = operator();

        let lease = store.try_acquire_run_lock(&op).await.unwrap().unwrap();
        assert!(store.try_acquire_run_lock(&op).await.unwrap().is_none());
        assert!(store
            .try_acquire_run_lock(&OperatorId::new("globex").unwrap())
            .await
            .unwrap()
            .is_some());

        drop(lease);
        assert!(store.try_acquire_run_lock(&op).await.unwrap().is_some());
    }
}
