//! Record transformation
//!
//! Turns raw source records into [`CanonicalRecord`]s. Each stage has a
//! normaliser function; the shared [`EntityTransformer`] computes the natural
//! key, runs the normaliser and fingerprints the result. Failures are per
//! record: [`transform_page`] tallies them so the runner can apply the stage
//! quality threshold.

mod aircraft;
mod crew;
pub mod fields;
mod flight;

use crate::config::TransformConfig;
use crate::error::RecordError;
use crate::lookup::LookupCache;
use crate::stage::{Stage, StageDef};
use crate::types::{CanonicalRecord, Page, RecordFailure};
use fields::Fields;
use serde_json::{Map, Value};

/// Outcome of normalising one raw record: `None` means filtered out.
pub type Normalised = Result<Option<Map<String, Value>>, RecordError>;

type Normaliser = fn(&Fields<'_>, &LookupCache, &TransformConfig) -> Normalised;

/// Converts raw source records of one stage into canonical records
pub trait Transformer: Send + Sync {
    fn stage(&self) -> Stage;

    /// `Ok(None)` when the record is intentionally skipped.
    fn transform(
        &self,
        raw: &Value,
        lookups: &LookupCache,
    ) -> Result<Option<CanonicalRecord>, RecordError>;

    /// Best-effort natural key, used to label failures.
    fn key_of(&self, _raw: &Value) -> Option<String> {
        None
    }
}

pub struct EntityTransformer {
    stage: Stage,
    key_fields: Vec<&'static str>,
    config: TransformConfig,
    normalise: Normaliser,
}

impl EntityTransformer {
    pub fn new(def: &StageDef, config: &TransformConfig) -> Self {
        let normalise: Normaliser = match def.stage {
            Stage::AircraftCategories => aircraft::category,
            Stage::AircraftTypes => aircraft::aircraft_type,
            Stage::Aircraft => aircraft::aircraft,
            Stage::Crew => crew::crew_member,
            Stage::DutyCategories => crew::duty_category,
            Stage::PersonnelEvents => crew::personnel_event,
            Stage::FlightLegs => flight::flight_leg,
            Stage::AircraftEvents => flight::aircraft_event,
            Stage::CrewAssignments => flight::crew_assignment,
        };

        Self {
            stage: def.stage,
            key_fields: def.key_fields.clone(),
            config: config.clone(),
            normalise,
        }
    }
}

impl Transformer for EntityTransformer {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn transform(
        &self,
        raw: &Value,
        lookups: &LookupCache,
    ) -> Result<Option<CanonicalRecord>, RecordError> {
        let fields = Fields::new(raw)?;
        let natural_key = fields.natural_key(&self.key_fields)?;

        let Some(data) = (self.normalise)(&fields, lookups, &self.config)? else {
            return Ok(None);
        };
        Ok(Some(CanonicalRecord::new(self.stage, natural_key, data)))
    }

    fn key_of(&self, raw: &Value) -> Option<String> {
        Fields::new(raw).ok()?.natural_key(&self.key_fields).ok()
    }
}

pub fn for_stage(def: &StageDef, config: &TransformConfig) -> Box<dyn Transformer> {
    Box::new(EntityTransformer::new(def, config))
}

/// Transformation tally of one page
#[derive(Debug, Default)]
pub struct PageOutcome {
    pub records: Vec<CanonicalRecord>,
    pub failures: Vec<RecordFailure>,
    pub skipped: u64,
}

impl PageOutcome {
    /// Failed share of the records that were not intentionally skipped.
    pub fn failure_rate(&self) -> f64 {
        let failed = self.failures.len();
        let considered = failed + self.records.len();
        if considered == 0 {
            return 0.0;
        }
        failed as f64 / considered as f64
    }

    pub fn exceeds(&self, threshold: f64) -> bool {
        self.failure_rate() > threshold
    }
}

pub fn transform_page(
    transformer: &dyn Transformer,
    page: &Page,
    lookups: &LookupCache,
) -> PageOutcome {
    let mut outcome = PageOutcome::default();

    for raw in &page.records {
        match transformer.transform(raw, lookups) {
            Ok(Some(record)) => outcome.records.push(record),
            Ok(None) => outcome.skipped += 1,
            Err(err) => {
                tracing::debug!(
                    stage = %transformer.stage(),
                    page = page.number,
                    error = %err,
                    "Record failed transformation"
                );
                outcome.failures.push(RecordFailure {
                    natural_key: transformer.key_of(raw),
                    kind: err.kind(),
                    message: err.to_string(),
                });
            },
        }
    }

    outcome
}
