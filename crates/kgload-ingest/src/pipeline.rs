//! Pipeline orchestrator
//!
//! Walks the stage graph in topological order. Every job of a stage is
//! terminal before the next stage starts; jobs inside a stage share a bounded
//! worker pool. When a blocking stage fails, every stage that depends on it
//! through the graph's prerequisites is reported as skipped.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use kgload_common::{JobStatus, StageName};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::JobCatalog;
use crate::config::LoaderConfig;
use crate::consistency::{check_consistency_with, ConsistencyReport};
use crate::error::{LoadError, Result};
use crate::executor::{BatchLoadExecutor, ExecutorConfig};
use crate::job::LoadJob;
use crate::stage::StageGraph;
use crate::stats::{LoadStatistics, PipelineReport, StageOutcome, StageReport};
use crate::store::{KindSelector, TargetStore};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Concurrent jobs per stage
    pub worker_pool_size: usize,
    /// Stages whose failure does not stop later stages
    pub non_blocking: BTreeSet<StageName>,
    pub run_consistency_check: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: 1,
            non_blocking: BTreeSet::new(),
            run_consistency_check: true,
        }
    }
}

pub struct Pipeline<S: TargetStore> {
    store: Arc<S>,
    catalog: JobCatalog,
    executor: ExecutorConfig,
    options: PipelineOptions,
    graph: StageGraph,
    cancel: CancellationToken,
}

impl<S: TargetStore> Pipeline<S> {
    pub fn new(
        store: Arc<S>,
        catalog: JobCatalog,
        executor: ExecutorConfig,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            catalog,
            executor,
            options,
            graph: StageGraph::standard(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(store: Arc<S>, config: &LoaderConfig, options: PipelineOptions) -> Self {
        Self::new(
            store,
            JobCatalog::new(config.catalog_options()),
            config.executor_config(),
            PipelineOptions {
                worker_pool_size: config.load.workers,
                ..options
            },
        )
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pre-flight referential check over every source file present
    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        let specs = self.catalog.consistency_specs();
        let format = self.executor.format;
        tokio::task::spawn_blocking(move || check_consistency_with(&specs, &format))
            .await
            .map_err(|e| LoadError::Io(std::io::Error::other(e)))?
    }

    /// Replace the standard stage graph
    pub fn with_stage_graph(mut self, graph: StageGraph) -> Self {
        self.graph = graph;
        self
    }

    /// Run the selected stages and close the store.
    ///
    /// Job and stage failures are part of the report; errors are returned only
    /// for problems that prevent the run from starting. The store is closed on
    /// every path.
    #[instrument(skip(self), fields(store = self.store.name()))]
    pub async fn run(&self, stages_selected: &BTreeSet<StageName>) -> Result<PipelineReport> {
        let result = self.run_stages(stages_selected).await;
        if let Err(err) = self.store.close().await {
            warn!(error = %err, "Failed to close store");
        }
        if let Err(err) = &result {
            error!(error = %err, "Pipeline could not run");
        }
        result
    }

    async fn run_stages(&self, stages_selected: &BTreeSet<StageName>) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let order = self.graph.topological_order()?;
        info!(%run_id, stages = ?stages_selected, workers = self.options.worker_pool_size, "Starting pipeline");

        let consistency_warnings = if self.options.run_consistency_check {
            let report = self.check_consistency().await?;
            if report.is_clean() {
                info!(files = report.identifier_counts.len(), "Consistency check passed");
            }
            report.warnings
        } else {
            Vec::new()
        };

        let executor = BatchLoadExecutor::new(Arc::clone(&self.store), self.executor.clone())
            .with_cancellation(self.cancel.clone());

        let mut stages = Vec::with_capacity(order.len());
        let mut statistics = LoadStatistics::new();
        let mut errors = Vec::new();
        // Stages that must not be built upon, with the reason passed to dependents
        let mut blocked: BTreeMap<StageName, String> = BTreeMap::new();
        let mut cancelled = false;

        for stage in order {
            let blocking = !self.options.non_blocking.contains(&stage);
            let inherited = self
                .graph
                .prerequisites(stage)
                .iter()
                .find_map(|p| blocked.get(p).cloned());

            if !stages_selected.contains(&stage) {
                if let Some(reason) = inherited {
                    blocked.insert(stage, reason);
                }
                stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::NotSelected,
                    blocking,
                    elapsed_ms: 0,
                    jobs: Vec::new(),
                });
                continue;
            }

            if !cancelled && self.cancel.is_cancelled() {
                errors.push(format!("pipeline cancelled before stage {stage}"));
                cancelled = true;
            }
            let skip_reason = if cancelled {
                Some("pipeline cancelled".to_string())
            } else {
                inherited
            };
            if let Some(reason) = skip_reason {
                info!(stage = %stage, reason = %reason, "Skipping stage");
                stages.push(self.skipped_stage(stage, blocking, &reason));
                blocked.insert(stage, reason);
                continue;
            }

            let report = self.run_stage(&executor, stage, blocking).await;
            for job in &report.jobs {
                if job.status != JobStatus::Skipped {
                    statistics.record(&job.kind, &job.counters);
                }
            }

            match report.outcome {
                StageOutcome::Cancelled => {
                    errors.push(format!("pipeline cancelled during stage {stage}"));
                    cancelled = true;
                },
                StageOutcome::Failed if blocking => {
                    let err = LoadError::StageBlocked {
                        stage,
                        failed_jobs: report.failed_jobs(),
                    };
                    error!(error = %err, "Blocking stage failed");
                    errors.push(err.to_string());
                    blocked.insert(stage, format!("blocked by failed stage {stage}"));
                },
                StageOutcome::Failed => {
                    warn!(stage = %stage, failed_jobs = ?report.failed_jobs(), "Non-blocking stage failed, continuing");
                },
                _ => {},
            }
            stages.push(report);
        }

        let (final_counts, final_relationship_counts) = if self.cancel.is_cancelled() {
            (BTreeMap::new(), BTreeMap::new())
        } else {
            self.final_counts().await
        };

        let report = PipelineReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stages,
            statistics,
            final_counts,
            final_relationship_counts,
            consistency_warnings,
            errors,
        };
        info!(
            %run_id,
            success = report.is_success(),
            nodes = report.total_nodes(),
            relationships = report.total_relationships(),
            elapsed_ms = report.elapsed().num_milliseconds(),
            "Pipeline finished"
        );
        Ok(report)
    }

    fn skipped_stage(&self, stage: StageName, blocking: bool, reason: &str) -> StageReport {
        let jobs = self
            .catalog
            .jobs_for(stage)
            .into_iter()
            .map(|mut job| {
                job.skip(reason);
                job.report()
            })
            .collect();
        StageReport {
            stage,
            outcome: StageOutcome::Skipped,
            blocking,
            elapsed_ms: 0,
            jobs,
        }
    }

    async fn run_stage(
        &self,
        executor: &BatchLoadExecutor<S>,
        stage: StageName,
        blocking: bool,
    ) -> StageReport {
        let started = Instant::now();
        let jobs = self.catalog.jobs_for(stage);
        let total = jobs.len();
        info!(stage = %stage, jobs = total, "Starting stage");

        let mut finished: Vec<(usize, LoadJob)> = stream::iter(jobs.into_iter().enumerate())
            .map(|(index, mut job)| async move {
                info!(stage = %stage, job = %job.name, "Dispatching job ({} / {})", index + 1, total);
                if let Err(err) = executor.execute(&mut job).await {
                    warn!(job = %job.name, status = %job.status, error = %err, "Job did not complete");
                }
                (index, job)
            })
            .buffer_unordered(self.options.worker_pool_size.max(1))
            .collect()
            .await;
        finished.sort_by_key(|(index, _)| *index);

        let jobs: Vec<_> = finished.into_iter().map(|(_, job)| job.report()).collect();
        let outcome = if jobs.iter().any(|j| j.status == JobStatus::Cancelled) {
            StageOutcome::Cancelled
        } else if jobs.iter().any(|j| j.status == JobStatus::Failed) {
            StageOutcome::Failed
        } else {
            StageOutcome::Succeeded
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(stage = %stage, outcome = ?outcome, elapsed_ms, "Stage finished");
        StageReport {
            stage,
            outcome,
            blocking,
            elapsed_ms,
            jobs,
        }
    }

    /// Node counts per label and relationship counts per type
    async fn final_counts(&self) -> (BTreeMap<String, u64>, BTreeMap<String, u64>) {
        let nodes = self
            .count_each(self.catalog.labels().into_iter().map(KindSelector::Nodes))
            .await;
        let relationships = self
            .count_each(
                self.catalog
                    .relationship_types()
                    .into_iter()
                    .map(KindSelector::Relationships),
            )
            .await;
        (nodes, relationships)
    }

    async fn count_each(
        &self,
        selectors: impl Iterator<Item = KindSelector>,
    ) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for selector in selectors {
            match self.store.count(&selector).await {
                Ok(count) => {
                    counts.insert(selector.name().to_string(), count);
                },
                Err(err) => warn!(kind = selector.name(), error = %err, "Could not count"),
            }
        }
        counts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::CatalogOptions;
    use crate::store::MemoryGraphStore;
    use std::fs;
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir, store: &Arc<MemoryGraphStore>, options: PipelineOptions) -> Pipeline<MemoryGraphStore> {
        Pipeline::new(
            Arc::clone(store),
            JobCatalog::new(CatalogOptions {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            }),
            ExecutorConfig::default(),
            options,
        )
    }

    fn all() -> BTreeSet<StageName> {
        StageName::ALL.into_iter().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_data_dir_skips_file_jobs() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryGraphStore::new());

        let report = pipeline(&dir, &store, PipelineOptions::default())
            .run(&all())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.stages.len(), 4);
        assert_eq!(report.stages[0].outcome, StageOutcome::Succeeded);
        assert!(report.stages[1..]
            .iter()
            .flat_map(|s| &s.jobs)
            .all(|j| j.status == JobStatus::Skipped));
        assert_eq!(report.final_counts.len(), 6);
        assert_eq!(report.final_relationship_counts.len(), 6);
        assert_eq!(report.final_relationship_counts["BELONGS_TO_SAME_CITATION"], 0);
        assert_eq!(report.total_nodes(), 0);
        assert_eq!(report.total_relationships(), 0);
        assert!(store.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_is_closed_when_the_run_cannot_start() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("citations.csv.gz"), b"not gzip at all").unwrap();
        let store = Arc::new(MemoryGraphStore::new());

        let result = pipeline(&dir, &store, PipelineOptions::default())
            .run(&all())
            .await;

        assert!(result.is_err());
        assert!(store.is_closed());
        assert!(store.operation_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_is_closed_on_a_cyclic_graph() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryGraphStore::new());
        let mut graph = StageGraph::standard();
        graph.add_edge(StageName::Relationships, StageName::Constraints);

        let err = pipeline(&dir, &store, PipelineOptions::default())
            .with_stage_graph(graph)
            .run(&all())
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::Config(_)));
        assert!(store.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_only_skips_dependent_stages() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("citations.csv"), "1,x,2001,2001,2001\n").unwrap();
        fs::write(dir.path().join("sentences.csv"), "S1,1,ti,1,0,5,,,Text\n").unwrap();
        let store = Arc::new(MemoryGraphStore::new());
        store.reject("Citation");

        // Dependent entities only wait for the constraints here
        let mut graph = StageGraph::new();
        graph.add_edge(StageName::Constraints, StageName::IndependentEntities);
        graph.add_edge(StageName::Constraints, StageName::DependentEntities);
        graph.add_edge(StageName::IndependentEntities, StageName::Relationships);

        let options = PipelineOptions {
            run_consistency_check: false,
            ..Default::default()
        };
        let report = pipeline(&dir, &store, options)
            .with_stage_graph(graph)
            .run(&all())
            .await
            .unwrap();

        assert!(report.blocking_failure());
        assert_eq!(report.stages[1].outcome, StageOutcome::Failed);
        assert_eq!(report.stages[2].stage, StageName::DependentEntities);
        assert_eq!(report.stages[2].outcome, StageOutcome::Succeeded);
        assert_eq!(report.stages[3].outcome, StageOutcome::Skipped);
        assert_eq!(
            report.stages[3].jobs[0].error.as_deref(),
            Some("blocked by failed stage independent_entities")
        );
        assert_eq!(store.node_count("Sentence"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unselected_stages_are_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("citations.csv"), "1,x,2001,2001,2001\n2,y,2002,2002,2002\n").unwrap();
        let store = Arc::new(MemoryGraphStore::new());

        let selected = BTreeSet::from([StageName::IndependentEntities]);
        let report = pipeline(&dir, &store, PipelineOptions::default())
            .run(&selected)
            .await
            .unwrap();

        assert_eq!(report.stages[0].outcome, StageOutcome::NotSelected);
        assert_eq!(report.stages[1].outcome, StageOutcome::Succeeded);
        assert_eq!(report.stages[3].outcome, StageOutcome::NotSelected);
        assert_eq!(report.statistics.get("Citation").unwrap().rows_committed, 2);
        assert_eq!(report.final_counts["Citation"], 2);
        assert!(store.schema_statements().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_stage_failure_lets_later_stages_run() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("citations.csv"), "1,x,2001,2001,2001\n").unwrap();
        fs::write(dir.path().join("sentences.csv"), "S1,1,ti,1,0,5,,,Text\n").unwrap();
        let store = Arc::new(MemoryGraphStore::new());
        store.reject("Citation");

        let options = PipelineOptions {
            non_blocking: BTreeSet::from([StageName::IndependentEntities]),
            run_consistency_check: false,
            ..Default::default()
        };
        let report = pipeline(&dir, &store, options).run(&all()).await.unwrap();

        assert!(!report.is_success());
        assert!(!report.blocking_failure());
        assert_eq!(report.stages[1].outcome, StageOutcome::Failed);
        assert_eq!(report.stages[2].outcome, StageOutcome::Succeeded);
        assert_eq!(store.node_count("Sentence"), 1);
    }
}
