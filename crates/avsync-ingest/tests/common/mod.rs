//! Common test utilities for avsync ingest integration tests
//!
//! Provides a scripted [`SourceClient`] that serves fixture records per
//! endpoint, fixture builders for each entity and a pipeline configuration
//! tuned for fast tests.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{fixtures, ScriptedSource};
//!
//! let source = ScriptedSource::new().with("personnel", fixtures::crew(4));
//! ```

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use avsync_ingest::config::PipelineConfig;
use avsync_ingest::source::{PageRequest, SourceClient};
use avsync_ingest::{MemoryStore, OperatorId, RunController, SourceError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Serves fixture records per endpoint, honouring page and page size
#[derive(Default)]
pub struct ScriptedSource {
    fixtures: Mutex<HashMap<&'static str, Vec<Value>>>,
    failures: Mutex<HashMap<&'static str, SourceError>>,
    cancel_on: Mutex<Option<(&'static str, CancellationToken)>>,
    calls: Mutex<Vec<PageRequest>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, endpoint: &'static str, records: Vec<Value>) -> Self {
        self.set(endpoint, records);
        self
    }

    /// Replace the records served for an endpoint.
    pub fn set(&self, endpoint: &'static str, records: Vec<Value>) {
        self.fixtures.lock().unwrap().insert(endpoint, records);
    }

    /// Every request to the endpoint fails with `error`.
    pub fn fail(&self, endpoint: &'static str, error: SourceError) {
        self.failures.lock().unwrap().insert(endpoint, error);
    }

    /// Cancel `token` when the endpoint is first requested.
    pub fn cancel_on(&self, endpoint: &'static str, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((endpoint, token));
    }

    pub fn requests(&self, endpoint: &str) -> Vec<PageRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.endpoint == endpoint)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    async fn fetch_page(
        &self,
        _operator: &OperatorId,
        request: &PageRequest,
    ) -> Result<Vec<Value>, SourceError> {
        self.calls.lock().unwrap().push(request.clone());

        if let Some((endpoint, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if *endpoint == request.endpoint {
                token.cancel();
            }
        }
        if let Some(err) = self.failures.lock().unwrap().get(request.endpoint) {
            return Err(err.clone());
        }

        let fixtures = self.fixtures.lock().unwrap();
        let records = fixtures.get(request.endpoint).map(Vec::as_slice).unwrap_or(&[]);
        let size = request.page_size as usize;
        let start = (request.page as usize - 1) * size;
        Ok(records.iter().skip(start).take(size).cloned().collect())
    }
}

pub fn operator() -> OperatorId {
    OperatorId::new("test").unwrap()
}

/// Defaults with near-zero retry delays
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.max_attempts = 2;
    config
}

pub fn controller(
    source: &Arc<ScriptedSource>,
    store: &Arc<MemoryStore>,
    config: PipelineConfig,
) -> RunController {
    RunController::new(source.clone(), store.clone(), store.clone(), config).unwrap()
}

/// Raw source payloads as the operational system returns them
pub mod fixtures {
    use serde_json::{json, Value};

    pub fn categories(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| json!({"id": format!("cat-{i}"), "name": format!("Category {i}")}))
            .collect()
    }

    pub fn models(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| {
                json!({
                    "id": format!("model-{i}"),
                    "name": format!("Model {i}"),
                    "manufacturer": "Cessna",
                    "aircraftCategoryID": "cat-0"
                })
            })
            .collect()
    }

    pub fn aircraft(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| {
                json!({
                    "id": format!("ac-{i}"),
                    "tailNumber": format!("n{i}ab"),
                    "active": true,
                    "managed": true,
                    "capacity": 8,
                    "aircraftModelID": "model-0",
                    "aircraftCategoryID": "cat-0"
                })
            })
            .collect()
    }

    pub fn crew(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| {
                json!({
                    "id": format!("p-{i}"),
                    "firstName": "Pilot",
                    "lastName": format!("Number{i}"),
                    "dateOfBirth": "1980-01-01"
                })
            })
            .collect()
    }

    /// Crew records without any name, which fail validation
    pub fn nameless_crew(from: usize, count: usize) -> Vec<Value> {
        (from..from + count)
            .map(|i| json!({"id": format!("p-{i}")}))
            .collect()
    }

    pub fn flight_legs(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| {
                json!({
                    "id": format!("leg-{i}"),
                    "tripNumber": format!("T{i}"),
                    "aircraftID": "ac-0",
                    "departureICAO": "kteb",
                    "arrivalICAO": "kpbi",
                    "scheduledDepartureDateUTC": "2024-05-01T12:00:00Z",
                    "scheduledArrivalDateUTC": "2024-05-01T14:30:00Z",
                    "crew": [
                        {"crewID": "p-0", "crewPosition": "PIC", "firstName": "Pilot", "lastName": "Number0"}
                    ]
                })
            })
            .collect()
    }

    pub fn aircraft_events(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| {
                json!({
                    "id": format!("evt-{i}"),
                    "aircraftID": "ac-0",
                    "maintenanceType": 1,
                    "outOfServiceDateTimeUTC": "2024-05-02T00:00:00Z",
                    "projectedReturnToServiceDateTimeUTC": "2024-05-03T00:00:00Z"
                })
            })
            .collect()
    }

    pub fn crew_assignment(id: &str, aircraft: &str, personnel: &str) -> Value {
        json!({
            "id": id,
            "aircraftID": aircraft,
            "personnelID": personnel,
            "crewPosition": "PIC",
            "startDateTimeUTC": "2024-05-01T10:00:00Z",
            "endDateTimeUTC": "2024-05-01T18:00:00Z"
        })
    }

    pub fn crew_assignments(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| crew_assignment(&format!("ca-{i}"), "ac-0", "p-0"))
            .collect()
    }

    pub fn personnel_events() -> Vec<Value> {
        vec![
            json!({
                "id": "pe-0",
                "personnelID": "p-1",
                "eventType": "hardDayOff",
                "startDateTimeUTC": "2024-05-04T00:00:00Z",
                "endDateTimeUTC": "2024-05-05T00:00:00Z"
            }),
            json!({
                "id": "pe-1",
                "personnelID": "p-1",
                "eventType": "duty",
                "dutyEventCategory": "Standby",
                "startDateTimeUTC": "2024-05-06T00:00:00Z",
                "endDateTimeUTC": "2024-05-06T12:00:00Z"
            }),
            json!({
                "id": "pe-2",
                "personnelID": "p-1",
                "eventType": "duty",
                "dutyEventCategory": "Training",
                "startDateTimeUTC": "2024-05-07T00:00:00Z",
                "endDateTimeUTC": "2024-05-07T08:00:00Z"
            }),
        ]
    }

    /// Training makes crew unavailable, Standby does not
    pub fn duty_categories() -> Vec<Value> {
        vec![
            json!({"id": "dc-1", "code": "Training", "name": "Recurrent training", "isAvailable": false}),
            json!({"id": "dc-2", "code": "Standby", "name": "Standby"}),
        ]
    }
}

/// Source loaded with a consistent fleet: 3 categories, 5 types, 10 aircraft, 4 crew
pub fn fleet_source() -> ScriptedSource {
    ScriptedSource::new()
        .with("AircraftCategory", fixtures::categories(3))
        .with("AircraftModel", fixtures::models(5))
        .with("Aircraft", fixtures::aircraft(10))
        .with("personnel", fixtures::crew(4))
}

/// Fleet plus operational records for every remaining stage
pub fn full_source() -> ScriptedSource {
    fleet_source()
        .with("flightleg", fixtures::flight_legs(6))
        .with("aircraftEvent", fixtures::aircraft_events(2))
        .with("crewAssignment", fixtures::crew_assignments(5))
        .with("dutycategory", fixtures::duty_categories())
        .with("personnelEvent", fixtures::personnel_events())
}
