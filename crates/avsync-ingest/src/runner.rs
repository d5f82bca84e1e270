//! Run controller
//!
//! Drives one run for one operator through
//! `Pending -> Resolving -> Running(stage) -> Succeeded | PartiallyFailed | Failed`.
//!
//! Stages execute sequentially in dependency order. Within a stage pages are
//! transformed and loaded in page order; the checkpoint is written only after
//! the whole stage committed. The first stage failure stops the run, and every
//! outcome, including early aborts, is reported as a [`RunResult`].

use crate::config::{PipelineConfig, PrerequisitePolicy};
use crate::error::PipelineError;
use crate::extract::{window_for, ExtractSettings, Extractor};
use crate::load::Loader;
use crate::lookup::LookupCache;
use crate::source::SourceClient;
use crate::stage::{Command, Stage, StageGraph};
use crate::store::{CheckpointStore, TargetStore};
use crate::transform::{self, transform_page};
use crate::types::{ErrorReport, OperatorId, RunResult, RunStatus, StageResult};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub struct RunController {
    graph: StageGraph,
    source: Arc<dyn SourceClient>,
    store: Arc<dyn TargetStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: PipelineConfig,
}

impl RunController {
    /// Controller over the standard stage graph.
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn TargetStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        Ok(Self::with_graph(StageGraph::standard()?, source, store, checkpoints, config))
    }

    pub fn with_graph(
        graph: StageGraph,
        source: Arc<dyn SourceClient>,
        store: Arc<dyn TargetStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            graph,
            source,
            store,
            checkpoints,
            config,
        }
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Execute `command` for `operator`. Never fails: errors end up in the result.
    pub async fn run(
        &self,
        operator: &OperatorId,
        command: Command,
        cancel: CancellationToken,
    ) -> RunResult {
        let mut run = pending_result(operator, command);
        let span = tracing::info_span!(
            "run",
            run_id = %run.run_id,
            operator = %operator,
            command = %command
        );

        async {
            info!(state = "pending", "Run started");

            if let Err(err) = self.drive(&mut run, &cancel).await {
                error!(kind = %err.kind(), error = %err, "Run failed");
                run.status = RunStatus::Failed;
                run.error = Some(ErrorReport::from(&err));
            }

            run.ended_at = Utc::now();
            info!(
                state = run.status.as_str(),
                stages = run.per_stage_results.len(),
                elapsed_ms = (run.ended_at - run.started_at).num_milliseconds(),
                "Run finished"
            );
        }
        .instrument(span)
        .await;

        run
    }

    /// Errors returned from here fail the whole run. Stage errors that only
    /// affect the remaining stages are recorded on `run` directly.
    async fn drive(
        &self,
        run: &mut RunResult,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        info!(state = "resolving");
        let stages = self.graph.resolve(run.command)?;
        run.stages = stages.clone();

        let Some(_lease) = self.checkpoints.try_acquire_run_lock(&run.operator).await? else {
            return Err(PipelineError::RunAlreadyInProgress {
                operator: run.operator.to_string(),
            });
        };

        if self.config.prerequisites == PrerequisitePolicy::RequireCheckpoints {
            self.verify_prerequisites(&run.operator, &stages).await?;
        }

        let mut lookups = LookupCache::new();
        for stage in stages {
            if cancel.is_cancelled() {
                warn!(next_stage = %stage, "Run cancelled before stage");
                run.status = RunStatus::PartiallyFailed;
                run.error = Some(ErrorReport::from(&PipelineError::Cancelled));
                return Ok(());
            }

            info!(state = "running", stage = %stage);
            let mut result = StageResult::new(stage);
            let outcome = self
                .run_stage(&run.operator, stage, &mut lookups, cancel, &mut result)
                .await;

            match outcome {
                Ok(()) => run.per_stage_results.push(result),
                Err(err) => {
                    run.per_stage_results.push(result.fail(&err));
                    if err.is_fatal() {
                        return Err(err);
                    }

                    warn!(stage = %stage, kind = %err.kind(), error = %err, "Stage failed");
                    run.status = RunStatus::PartiallyFailed;
                    if matches!(err, PipelineError::Cancelled) {
                        run.error = Some(ErrorReport::from(&err));
                    }
                    return Ok(());
                },
            }
        }

        Ok(())
    }

    /// Every prerequisite must run earlier in this run or have a checkpoint.
    async fn verify_prerequisites(
        &self,
        operator: &OperatorId,
        stages: &[Stage],
    ) -> Result<(), PipelineError> {
        for (position, &stage) in stages.iter().enumerate() {
            for &prerequisite in self.graph.prerequisites(stage) {
                if stages[..position].contains(&prerequisite) {
                    continue;
                }
                if self.checkpoints.read(operator, prerequisite).await?.is_none() {
                    return Err(PipelineError::MissingPrerequisite {
                        stage,
                        prerequisite,
                    });
                }
            }
        }
        Ok(())
    }

    /// Snapshot a stage's keys, and its exposed field if any, from the store.
    async fn seed_lookups(
        &self,
        operator: &OperatorId,
        stage: Stage,
        lookups: &mut LookupCache,
    ) -> Result<(), PipelineError> {
        let keys = self.store.lookup_keys(operator, stage).await?;
        debug!(stage = %stage, keys = keys.len(), "Seeded lookups");
        lookups.seed(stage, keys);

        if let Some(field) = self.graph.definition(stage).and_then(|def| def.lookup_field) {
            lookups.seed_field(stage, self.store.lookup_field(operator, stage, field).await?);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(stage = %stage))]
    async fn run_stage(
        &self,
        operator: &OperatorId,
        stage: Stage,
        lookups: &mut LookupCache,
        cancel: &CancellationToken,
        result: &mut StageResult,
    ) -> Result<(), PipelineError> {
        let def = self
            .graph
            .definition(stage)
            .ok_or_else(|| PipelineError::UnknownStage(stage.to_string()))?;

        for &prerequisite in &def.prerequisites {
            if !lookups.is_seeded(prerequisite) {
                self.seed_lookups(operator, prerequisite, lookups).await?;
            }
        }

        let started = Utc::now();
        let checkpoint = self.checkpoints.read(operator, stage).await?;
        let window = window_for(
            def.window,
            checkpoint.as_ref().map(|c| c.watermark),
            started,
            &self.config.window,
        );
        debug!(since = ?window.since, until = ?window.until, "Extraction window");

        let batch = &self.config.batch;
        let transformer = transform::for_stage(def, &self.config.transform);
        let extractor = Extractor::new(
            def,
            Arc::clone(&self.source),
            ExtractSettings::new(batch, &self.config.retry),
        );
        let loader = Loader::new(Arc::clone(&self.store), batch.load_batch_size);

        let mut pages = extractor.extract(operator, window);
        let mut committed = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            // A page that already arrived is still applied
            let next = tokio::select! {
                biased;
                next = pages.next() => next,
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            };
            let Some(page) = next else {
                break;
            };
            let page = page?;

            let outcome = transform_page(transformer.as_ref(), &page, lookups);
            result.skipped += outcome.skipped;
            let considered = (outcome.failures.len() + outcome.records.len()) as u64;
            let exceeded = outcome.exceeds(batch.max_failure_rate);
            let failed = outcome.failures.len() as u64;
            for failure in outcome.failures {
                result.failed += 1;
                result.sample_failure(failure, batch.max_failure_samples);
            }

            if exceeded {
                return Err(PipelineError::StageQuality {
                    stage,
                    failed,
                    total: considered,
                    threshold: batch.max_failure_rate,
                });
            }

            let loaded = loader.load(operator, stage, outcome.records).await?;
            result.add_load(&loaded.result);
            for failure in loaded.failures {
                result.sample_failure(failure, batch.max_failure_samples);
            }
            committed.extend(loaded.keys);

            debug!(
                page = page.number,
                records = page.records.len(),
                failed,
                "Page applied"
            );
        }

        // The first run of a stage needs the full key set, not just this window
        if lookups.is_seeded(stage) {
            lookups.merge(stage, committed);
            if let Some(field) = def.lookup_field {
                lookups.seed_field(stage, self.store.lookup_field(operator, stage, field).await?);
            }
        } else {
            self.seed_lookups(operator, stage, lookups).await?;
        }

        self.checkpoints.write(operator, stage, started).await?;

        info!(
            inserted = result.inserted,
            updated = result.updated,
            unchanged = result.unchanged,
            failed = result.failed,
            skipped = result.skipped,
            "Stage committed"
        );
        Ok(())
    }
}

fn pending_result(operator: &OperatorId, command: Command) -> RunResult {
    let now = Utc::now();
    RunResult {
        run_id: Uuid::new_v4(),
        operator: operator.clone(),
        command,
        stages: Vec::new(),
        status: RunStatus::Succeeded,
        per_stage_results: Vec::new(),
        error: None,
        started_at: now,
        ended_at: now,
    }
}

/// Run `command` for `operator` over the standard stage graph.
pub async fn run_pipeline(
    source: Arc<dyn SourceClient>,
    store: Arc<dyn TargetStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: PipelineConfig,
    operator: &OperatorId,
    command: Command,
    cancel: CancellationToken,
) -> RunResult {
    match RunController::new(source, store, checkpoints, config) {
        Ok(controller) => controller.run(operator, command, cancel).await,
        Err(err) => {
            error!(error = %err, "Stage graph is invalid");
            let mut run = pending_result(operator, command);
            run.status = RunStatus::Failed;
            run.error = Some(ErrorReport::from(&err));
            run
        },
    }
}
