//! End-to-end runs against the in-memory store and a scripted source

mod common;

use avsync_ingest::config::PrerequisitePolicy;
use avsync_ingest::{
    CheckpointStore, Command, ErrorKind, MemoryStore, RunStatus, SourceError, Stage, StageStatus,
};
use common::{controller, fixtures, fleet_source, full_source, operator, test_config, ScriptedSource};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn setup_stages() -> Vec<Stage> {
    vec![
        Stage::AircraftCategories,
        Stage::AircraftTypes,
        Stage::Aircraft,
        Stage::Crew,
    ]
}

#[tokio::test]
async fn test_setup_loads_reference_data_and_checkpoints() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::Setup, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.stages, setup_stages());
    let inserted: Vec<u64> = result.per_stage_results.iter().map(|r| r.inserted).collect();
    assert_eq!(inserted, vec![3, 5, 10, 4]);

    let checkpoints = store.list(&operator()).await.unwrap();
    assert_eq!(
        checkpoints.iter().map(|c| c.stage).collect::<Vec<_>>(),
        setup_stages()
    );

    // Foreign keys were resolved against ids committed earlier in the run
    let aircraft = store.records(&operator(), Stage::Aircraft);
    assert_eq!(aircraft.len(), 10);
    assert!(aircraft[0].1["aircraft_type_id"].is_i64());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&source, &store, test_config());

    let first = controller
        .run(&operator(), Command::Setup, CancellationToken::new())
        .await;
    let first_marks = store.list(&operator()).await.unwrap();

    let second = controller
        .run(&operator(), Command::Setup, CancellationToken::new())
        .await;
    let second_marks = store.list(&operator()).await.unwrap();

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    for (before, after) in first.per_stage_results.iter().zip(&second.per_stage_results) {
        assert_eq!(after.inserted, 0, "stage {}", after.stage);
        assert_eq!(after.updated, 0, "stage {}", after.stage);
        assert_eq!(after.unchanged, before.inserted, "stage {}", after.stage);
    }
    for (before, after) in first_marks.iter().zip(&second_marks) {
        assert!(after.watermark >= before.watermark);
    }
}

#[tokio::test]
async fn test_changed_source_record_is_updated() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&source, &store, test_config());

    controller
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;

    let mut crew = fixtures::crew(4);
    crew[2]["lastName"] = "Renamed".into();
    source.set("personnel", crew);

    let result = controller
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;
    let stage = result.stage(Stage::Crew).unwrap();
    assert_eq!((stage.inserted, stage.updated, stage.unchanged), (0, 1, 3));
}

#[tokio::test]
async fn test_full_run_executes_every_stage_in_dependency_order() {
    let source = Arc::new(full_source());
    let store = Arc::new(MemoryStore::new());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::Full, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        result.stages,
        vec![
            Stage::AircraftCategories,
            Stage::AircraftTypes,
            Stage::Aircraft,
            Stage::Crew,
            Stage::DutyCategories,
            Stage::FlightLegs,
            Stage::AircraftEvents,
            Stage::CrewAssignments,
            Stage::PersonnelEvents,
        ]
    );
    assert_eq!(result.stage(Stage::FlightLegs).unwrap().inserted, 6);
    assert_eq!(result.stage(Stage::CrewAssignments).unwrap().inserted, 5);

    assert_eq!(result.stage(Stage::DutyCategories).unwrap().inserted, 2);

    // The hard day off and the Training duty are kept, Standby is skipped
    let events = result.stage(Stage::PersonnelEvents).unwrap();
    assert_eq!(events.inserted, 2);
    assert_eq!(events.skipped, 1);
    assert_eq!(store.list(&operator()).await.unwrap().len(), 9);
}

#[tokio::test]
async fn test_synced_duty_category_availability_drives_event_filter() {
    let source = Arc::new(full_source());
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&source, &store, test_config());

    controller
        .run(&operator(), Command::Full, CancellationToken::new())
        .await;

    let mut categories = fixtures::duty_categories();
    categories[1]["isAvailable"] = false.into();
    source.set("dutycategory", categories);
    let crew = controller
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;
    assert_eq!(crew.stage(Stage::DutyCategories).unwrap().updated, 1);

    // Availability is read back from the store, not from this run
    let result = controller
        .run(&operator(), Command::PersonnelEventsOnly, CancellationToken::new())
        .await;
    assert_eq!(result.status, RunStatus::Succeeded);
    let events = result.stage(Stage::PersonnelEvents).unwrap();
    assert_eq!((events.inserted, events.unchanged, events.skipped), (1, 2, 0));
    assert_eq!(store.record_count(&operator(), Stage::PersonnelEvents), 3);
}

#[tokio::test]
async fn test_unknown_reference_is_a_record_failure_not_a_store_error() {
    let source = Arc::new(full_source());
    let mut assignments = fixtures::crew_assignments(9);
    assignments.push(fixtures::crew_assignment("ca-bad", "ac-404", "p-0"));
    source.set("crewAssignment", assignments);
    let store = Arc::new(MemoryStore::new());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::Full, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let stage = result.stage(Stage::CrewAssignments).unwrap();
    assert_eq!(stage.inserted, 9);
    assert_eq!(stage.failed, 1);
    assert_eq!(stage.failure_samples[0].kind, ErrorKind::UnresolvedReference);
    assert_eq!(stage.failure_samples[0].natural_key.as_deref(), Some("ca-bad"));
    assert_eq!(store.record_count(&operator(), Stage::CrewAssignments), 9);
}

#[tokio::test]
async fn test_checkpoints_never_regress() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&source, &store, test_config());

    controller
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;
    let first = store.read(&operator(), Stage::Crew).await.unwrap().unwrap();

    let err = store
        .write(&operator(), Stage::Crew, first.watermark - chrono::Duration::seconds(1))
        .await
        .unwrap_err();
    let err: avsync_ingest::PipelineError = err.into();
    assert_eq!(err.kind(), ErrorKind::CheckpointRegression);

    controller
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;
    let second = store.read(&operator(), Stage::Crew).await.unwrap().unwrap();
    assert!(second.watermark >= first.watermark);

    // The second extraction overlapped the previous watermark
    let requests = source.requests("personnel");
    let since = requests.last().unwrap().window.since.unwrap();
    assert!(since < first.watermark);
}

#[tokio::test]
async fn test_extraction_failure_isolates_later_stages() {
    let source = Arc::new(full_source());
    source.fail("flightleg", SourceError::InvalidResponse("HTML error page".into()));
    let store = Arc::new(MemoryStore::new());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::Full, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    assert_eq!(result.status.exit_code(), 2);
    assert_eq!(result.per_stage_results.len(), 6);

    let failed = result.stage(Stage::FlightLegs).unwrap();
    assert_eq!(failed.status, StageStatus::Failed);
    assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::Extraction);

    for stage in setup_stages() {
        assert_eq!(result.stage(stage).unwrap().status, StageStatus::Succeeded);
        assert!(store.read(&operator(), stage).await.unwrap().is_some());
    }
    for stage in [
        Stage::FlightLegs,
        Stage::AircraftEvents,
        Stage::CrewAssignments,
        Stage::PersonnelEvents,
    ] {
        assert!(store.read(&operator(), stage).await.unwrap().is_none());
    }
    assert!(result.stage(Stage::AircraftEvents).is_none());
}

#[tokio::test]
async fn test_transient_failures_are_retried_within_a_run() {
    let source = Arc::new(fleet_source());
    source.fail("personnel", SourceError::Transient("HTTP 503".into()));
    let store = Arc::new(MemoryStore::new());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    let first_page = source
        .requests("personnel")
        .into_iter()
        .filter(|r| r.page == 1)
        .count();
    assert_eq!(first_page, 2);
    let error = result.stage(Stage::Crew).unwrap().error.clone().unwrap();
    assert!(error.message.contains("after 2 attempt(s)"));
}

#[tokio::test]
async fn test_failure_rate_at_threshold_still_loads() {
    let mut crew = fixtures::crew(81);
    crew.extend(fixtures::nameless_crew(81, 19));
    let source = Arc::new(ScriptedSource::new().with("personnel", crew));
    let store = Arc::new(MemoryStore::new());
    let mut config = test_config();
    config.batch.max_failure_rate = 0.19;

    let result = controller(&source, &store, config)
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let stage = result.stage(Stage::Crew).unwrap();
    assert_eq!(stage.inserted, 81);
    assert_eq!(stage.failed, 19);
    assert_eq!(stage.failure_samples.len(), 10);
    assert_eq!(stage.failure_samples[0].kind, ErrorKind::Validation);
}

#[tokio::test]
async fn test_failure_rate_above_threshold_aborts_stage() {
    let mut crew = fixtures::crew(80);
    crew.extend(fixtures::nameless_crew(80, 20));
    let source = Arc::new(ScriptedSource::new().with("personnel", crew));
    let store = Arc::new(MemoryStore::new());
    let mut config = test_config();
    config.batch.max_failure_rate = 0.19;

    let result = controller(&source, &store, config)
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    let stage = result.stage(Stage::Crew).unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.error.as_ref().unwrap().kind, ErrorKind::StageQuality);
    assert_eq!(store.record_count(&operator(), Stage::Crew), 0);
    assert!(store.read(&operator(), Stage::Crew).await.unwrap().is_none());
}

#[tokio::test]
async fn test_crew_assignments_only_without_aircraft_fails_the_stage() {
    let source = Arc::new(fleet_source().with("crewAssignment", fixtures::crew_assignments(5)));
    let store = Arc::new(MemoryStore::new());
    let controller = controller(&source, &store, test_config());

    controller
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;
    let result = controller
        .run(&operator(), Command::CrewAssignmentsOnly, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    assert_eq!(result.stages, vec![Stage::CrewAssignments]);
    let stage = result.stage(Stage::CrewAssignments).unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.failed, 5);
    assert!(stage
        .failure_samples
        .iter()
        .all(|f| f.kind == ErrorKind::UnresolvedReference));
    assert!(store
        .read(&operator(), Stage::CrewAssignments)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_required_checkpoints_block_unprepared_groups() {
    let source = Arc::new(full_source());
    let store = Arc::new(MemoryStore::new());
    let mut config = test_config();
    config.prerequisites = PrerequisitePolicy::RequireCheckpoints;
    let controller = controller(&source, &store, config);

    let blocked = controller
        .run(&operator(), Command::CrewAssignmentsOnly, CancellationToken::new())
        .await;
    assert_eq!(blocked.status, RunStatus::Failed);
    assert_eq!(blocked.error.unwrap().kind, ErrorKind::MissingPrerequisite);
    assert!(blocked.per_stage_results.is_empty());

    controller
        .run(&operator(), Command::Setup, CancellationToken::new())
        .await;
    let allowed = controller
        .run(&operator(), Command::CrewAssignmentsOnly, CancellationToken::new())
        .await;
    assert_eq!(allowed.status, RunStatus::Succeeded);
    assert_eq!(allowed.stage(Stage::CrewAssignments).unwrap().inserted, 5);
}

#[tokio::test]
async fn test_concurrent_run_for_same_operator_is_refused() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());
    let lease = store.try_acquire_run_lock(&operator()).await.unwrap().unwrap();

    let controller = controller(&source, &store, test_config());
    let result = controller
        .run(&operator(), Command::Setup, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::RunAlreadyInProgress);
    assert!(result.per_stage_results.is_empty());
    assert!(store.list(&operator()).await.unwrap().is_empty());
    assert!(source.requests("AircraftCategory").is_empty());

    // Other operators are unaffected
    let other = avsync_ingest::OperatorId::new("globex").unwrap();
    let result = controller
        .run(&other, Command::CrewOnly, CancellationToken::new())
        .await;
    assert_eq!(result.status, RunStatus::Succeeded);

    drop(lease);
    let result = controller
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;
    assert_eq!(result.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_fatal_auth_fails_the_run() {
    let source = Arc::new(fleet_source());
    source.fail("Aircraft", SourceError::Auth("401 Unauthorized".into()));
    let store = Arc::new(MemoryStore::new());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::Setup, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status.exit_code(), 1);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::FatalAuth);
    assert_eq!(result.per_stage_results.len(), 3);
    assert_eq!(
        result.stage(Stage::Aircraft).unwrap().status,
        StageStatus::Failed
    );
    // Not retried
    let first_page = source
        .requests("Aircraft")
        .into_iter()
        .filter(|r| r.page == 1)
        .count();
    assert_eq!(first_page, 1);
}

#[tokio::test]
async fn test_cancellation_before_start_runs_nothing() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::Setup, cancel)
        .await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(result.per_stage_results.is_empty());
}

#[tokio::test]
async fn test_cancellation_mid_stage_finishes_batch_without_checkpoint() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    source.cancel_on("personnel", cancel.clone());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::Setup, cancel)
        .await;

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);

    let crew = result.stage(Stage::Crew).unwrap();
    assert_eq!(crew.status, StageStatus::Cancelled);
    assert_eq!(crew.inserted, 4);
    assert!(store.read(&operator(), Stage::Crew).await.unwrap().is_none());
    assert!(store.read(&operator(), Stage::Aircraft).await.unwrap().is_some());
}

#[tokio::test]
async fn test_rejected_record_is_excluded_from_batch() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());
    store.reject_key(Stage::Crew, "p-2");

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::CrewOnly, CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let stage = result.stage(Stage::Crew).unwrap();
    assert_eq!((stage.inserted, stage.failed), (3, 1));
    assert_eq!(stage.failure_samples[0].kind, ErrorKind::Rejected);
}

#[tokio::test]
async fn test_run_result_json_shape() {
    let source = Arc::new(fleet_source());
    let store = Arc::new(MemoryStore::new());

    let result = controller(&source, &store, test_config())
        .run(&operator(), Command::AircraftOnly, CancellationToken::new())
        .await;
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["operator"], "test");
    assert_eq!(json["command"], "aircraft-only");
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["stages"][2], "aircraft");
    assert_eq!(json["perStageResults"][2]["inserted"], 10);
    assert!(json["runId"].is_string());
    assert!(json["perStageResults"][0]["failureSamples"].is_array());
}
