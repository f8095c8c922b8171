//! Error types for the load pipeline

use kgload_common::{CommonError, StageName};
use thiserror::Error;

use crate::retry::Retryable;

/// Failure reported by a target store for one operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Timeout, lock conflict, deadlock or a server-side transient condition
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The connection or session is unusable and should be recreated
    #[error("store connection failure: {0}")]
    Connection(String),

    /// The store refused the operation; resubmitting will not help
    #[error("store rejected operation ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl StoreError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Rejected { .. })
    }
}

/// A single row that could not be sanitized
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecordError {
    #[error("field {column} is {len} characters long (limit {max})")]
    FieldTooLong { column: usize, len: usize, max: usize },
}

/// Errors raised while loading
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no loadable rows in {}", .0.display())]
    EmptySource(std::path::PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {job}: batch {batch} failed after {attempts} attempts: {source}")]
    BatchExhausted {
        job: String,
        batch: u64,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(
        "job {job}: verification of {kind} failed (expected {expected}, observed {observed}, \
         {failed_rows} failed of {committed_rows} committed rows)"
    )]
    VerificationMismatch {
        job: String,
        kind: String,
        expected: u64,
        observed: u64,
        failed_rows: u64,
        committed_rows: u64,
    },

    #[error("stage {stage} blocked the pipeline: failed jobs {failed_jobs:?}")]
    StageBlocked {
        stage: StageName,
        failed_jobs: Vec<String>,
    },

    #[error("job {job} cancelled")]
    Cancelled { job: String },

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl LoadError {
    pub fn config(msg: impl Into<String>) -> Self {
        LoadError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
