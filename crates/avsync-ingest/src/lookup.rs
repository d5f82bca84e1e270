//! Per-run foreign-key lookup cache
//!
//! Maps the natural key of a referenced entity to its target-store id. The
//! runner seeds a stage's maps from the store before the first stage that
//! needs them and merges each committed stage's keys afterwards; transformers
//! only read it. Stages that expose a canonical field (such as a duty
//! category's availability) also carry that field's value per key.

use crate::error::RecordError;
use crate::stage::Stage;
use crate::types::TargetId;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct LookupCache {
    maps: HashMap<Stage, HashMap<String, TargetId>>,
    fields: HashMap<Stage, HashMap<String, Value>>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the stage's keys were loaded or merged during this run.
    pub fn is_seeded(&self, stage: Stage) -> bool {
        self.maps.contains_key(&stage)
    }

    /// Replace the stage's map with a snapshot from the store.
    pub fn seed(&mut self, stage: Stage, keys: HashMap<String, TargetId>) {
        self.maps.insert(stage, keys);
    }

    /// Add keys committed by the stage during this run.
    pub fn merge<I>(&mut self, stage: Stage, keys: I)
    where
        I: IntoIterator<Item = (String, TargetId)>,
    {
        self.maps.entry(stage).or_default().extend(keys);
    }

    pub fn get(&self, stage: Stage, key: &str) -> Option<TargetId> {
        self.maps.get(&stage)?.get(key).copied()
    }

    pub fn resolve(&self, stage: Stage, key: &str) -> Result<TargetId, RecordError> {
        self.get(stage, key)
            .ok_or_else(|| RecordError::UnresolvedReference {
                entity: stage,
                key: key.to_string(),
            })
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.maps.get(&stage).map_or(0, HashMap::len)
    }

    /// Replace the stage's exposed field values.
    pub fn seed_field(&mut self, stage: Stage, values: HashMap<String, Value>) {
        self.fields.insert(stage, values);
    }

    /// Exposed field value of a referenced record, if it is known.
    pub fn field(&self, stage: Stage, key: &str) -> Option<&Value> {
        self.fields.get(&stage)?.get(key)
    }
}
