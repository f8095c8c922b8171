//! Load statistics and reports

use chrono::{DateTime, Utc};
use kgload_common::{JobStatus, StageName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

use crate::consistency::ConsistencyWarning;
use crate::store::OperationCounters;

/// Row, batch and store counters for one job or one kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounters {
    pub rows_attempted: u64,
    pub rows_committed: u64,
    pub rows_failed: u64,
    /// Blank rows, rows without a key, rows with a missing endpoint
    pub rows_skipped: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub retries: u64,
    #[serde(flatten)]
    pub store: OperationCounters,
}

impl KindCounters {
    pub fn merge(&mut self, other: &KindCounters) {
        self.rows_attempted += other.rows_attempted;
        self.rows_committed += other.rows_committed;
        self.rows_failed += other.rows_failed;
        self.rows_skipped += other.rows_skipped;
        self.batches_committed += other.batches_committed;
        self.batches_failed += other.batches_failed;
        self.retries += other.retries;
        self.store += other.store;
    }
}

/// Aggregate counters per entity or relationship kind for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadStatistics {
    by_kind: BTreeMap<String, KindCounters>,
}

impl LoadStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: &str, counters: &KindCounters) {
        self.by_kind.entry(kind.to_string()).or_default().merge(counters);
    }

    pub fn get(&self, kind: &str) -> Option<&KindCounters> {
        self.by_kind.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = (&str, &KindCounters)> {
        self.by_kind.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn total(&self) -> KindCounters {
        let mut total = KindCounters::default();
        for counters in self.by_kind.values() {
            total.merge(counters);
        }
        total
    }
}

/// Final state of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub id: Uuid,
    pub job: String,
    pub stage: StageName,
    pub kind: String,
    pub status: JobStatus,
    #[serde(flatten)]
    pub counters: KindCounters,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    /// Blocked by an earlier stage
    Skipped,
    /// Not selected for this run
    NotSelected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageName,
    pub outcome: StageOutcome,
    pub blocking: bool,
    pub elapsed_ms: u64,
    pub jobs: Vec<JobReport>,
}

impl StageReport {
    pub fn failed_jobs(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| j.job.clone())
            .collect()
    }
}

/// Everything a pipeline run produced
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    pub statistics: LoadStatistics,
    /// Store counts per node label after the run
    pub final_counts: BTreeMap<String, u64>,
    /// Store counts per relationship type after the run
    pub final_relationship_counts: BTreeMap<String, u64>,
    pub consistency_warnings: Vec<ConsistencyWarning>,
    /// Pipeline-level errors (blocked stages, cancellation)
    pub errors: Vec<String>,
}

impl PipelineReport {
    /// True when no stage failed and nothing was cancelled
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
            && self
                .stages
                .iter()
                .all(|s| !matches!(s.outcome, StageOutcome::Failed | StageOutcome::Cancelled))
    }

    /// True when a blocking stage failed
    pub fn blocking_failure(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.blocking && s.outcome == StageOutcome::Failed)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn total_nodes(&self) -> u64 {
        self.final_counts.values().sum()
    }

    pub fn total_relationships(&self) -> u64 {
        self.final_relationship_counts.values().sum()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobReport> {
        self.stages.iter().flat_map(|s| s.jobs.iter())
    }

    /// Plain-text report with one line per job
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let total = self.statistics.total();
        let status = if self.is_success() { "SUCCEEDED" } else { "FAILED" };

        let _ = writeln!(
            out,
            "Pipeline {status} in {:.1}s: {} rows committed, {} failed, {} retries",
            self.elapsed().num_milliseconds() as f64 / 1000.0,
            total.rows_committed,
            total.rows_failed,
            total.retries
        );

        for stage in &self.stages {
            let _ = writeln!(
                out,
                "\n[{}] {:?} ({:.1}s)",
                stage.stage,
                stage.outcome,
                stage.elapsed_ms as f64 / 1000.0
            );
            for job in &stage.jobs {
                let _ = writeln!(
                    out,
                    "  {:<20} {:<10} attempted={:<9} committed={:<9} failed={:<7} retries={}",
                    job.job,
                    job.status,
                    job.counters.rows_attempted,
                    job.counters.rows_committed,
                    job.counters.rows_failed,
                    job.counters.retries
                );
                if let Some(error) = &job.error {
                    let _ = writeln!(out, "    {error}");
                }
            }
        }

        if !self.consistency_warnings.is_empty() {
            let _ = writeln!(out, "\nConsistency warnings:");
            for warning in &self.consistency_warnings {
                let _ = writeln!(out, "  {warning}");
            }
        }

        if !self.final_counts.is_empty() {
            let _ = writeln!(out, "\nFinal store counts:");
            for (label, count) in &self.final_counts {
                let _ = writeln!(out, "  {label:<24} {count}");
            }
            let _ = writeln!(out, "  {:<24} {}", "total nodes", self.total_nodes());
            for (rel_type, count) in &self.final_relationship_counts {
                let _ = writeln!(out, "  {rel_type:<24} {count}");
            }
            let _ = writeln!(
                out,
                "  {:<24} {}",
                "total relationships",
                self.total_relationships()
            );
        }

        for error in &self.errors {
            let _ = writeln!(out, "\nError: {error}");
        }
        out
    }
}
