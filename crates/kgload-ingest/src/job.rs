//! Load jobs
//!
//! A [`LoadJob`] is one file/query pair. The orchestrator creates it at stage
//! entry, the executor mutates it batch by batch, and its final state becomes
//! a [`JobReport`].

use chrono::{DateTime, Utc};
use kgload_common::{FileKind, JobStatus, StageName};
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

use crate::schema::TableSchema;
use crate::stats::{JobReport, KindCounters};
use crate::store::{KindSelector, LoadQuery};

/// Where the rows of a job come from
#[derive(Debug, Clone)]
pub enum JobSource {
    /// Records streamed from a file through a merge template
    File {
        kind: FileKind,
        path: PathBuf,
        schema: &'static TableSchema,
        query: LoadQuery,
    },
    /// Constraint and index statements, one operation each
    Schema(Vec<LoadQuery>),
    /// The source file is not in the data directory
    Missing {
        kind: FileKind,
        expected: PathBuf,
        query: LoadQuery,
    },
}

#[derive(Debug, Clone)]
pub struct LoadJob {
    pub id: Uuid,
    pub name: String,
    pub stage: StageName,
    pub source: JobSource,
    pub batch_size: usize,
    pub status: JobStatus,
    pub counters: KindCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal error, or the first failed batch
    pub error: Option<String>,
}

impl LoadJob {
    fn with_source(
        name: impl Into<String>,
        stage: StageName,
        source: JobSource,
        batch_size: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            stage,
            source,
            batch_size,
            status: JobStatus::Pending,
            counters: KindCounters::default(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn from_file(
        name: impl Into<String>,
        stage: StageName,
        path: impl Into<PathBuf>,
        schema: &'static TableSchema,
        query: LoadQuery,
        batch_size: usize,
    ) -> Self {
        let source = JobSource::File {
            kind: schema.kind,
            path: path.into(),
            schema,
            query,
        };
        Self::with_source(name, stage, source, batch_size)
    }

    pub fn schema(name: impl Into<String>, queries: Vec<LoadQuery>) -> Self {
        Self::with_source(name, StageName::Constraints, JobSource::Schema(queries), 1)
    }

    pub fn missing(
        name: impl Into<String>,
        stage: StageName,
        kind: FileKind,
        expected: impl Into<PathBuf>,
        query: LoadQuery,
    ) -> Self {
        let source = JobSource::Missing {
            kind,
            expected: expected.into(),
            query,
        };
        Self::with_source(name, stage, source, 1)
    }

    pub fn file_kind(&self) -> Option<FileKind> {
        match &self.source {
            JobSource::File { kind, .. } | JobSource::Missing { kind, .. } => Some(*kind),
            JobSource::Schema(_) => None,
        }
    }

    pub fn kind_selector(&self) -> Option<KindSelector> {
        match &self.source {
            JobSource::File { query, .. } | JobSource::Missing { query, .. } => {
                query.kind_selector()
            },
            JobSource::Schema(_) => None,
        }
    }

    /// Label used to aggregate statistics per entity or relationship kind
    pub fn kind_label(&self) -> String {
        self.kind_selector()
            .map_or_else(|| "schema".to_string(), |s| s.name().to_string())
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl ToString) {
        self.error = Some(error.to_string());
        self.finish(JobStatus::Failed);
    }

    /// Mark a job that will never run
    pub fn skip(&mut self, reason: &str) {
        if self.status.is_terminal() {
            return;
        }
        warn!(job = %self.name, stage = %self.stage, reason, "Skipping job");
        self.error = Some(reason.to_string());
        self.finish(JobStatus::Skipped);
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            id: self.id,
            job: self.name.clone(),
            stage: self.stage,
            kind: self.kind_label(),
            status: self.status,
            counters: self.counters.clone(),
            elapsed_ms: self
                .elapsed()
                .map_or(0, |d| d.num_milliseconds().max(0) as u64),
            error: self.error.clone(),
        }
    }
}
