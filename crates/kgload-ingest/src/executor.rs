//! Batch load executor
//!
//! Streams the records of one job in bounded batches into a [`TargetStore`].
//! Each batch is submitted as a single operation through the retry
//! combinator; a session is held for exactly one attempt and released before
//! any backoff sleep. Failed batches are recorded and the job moves on. Once
//! the source is exhausted the store is counted again and the observed delta
//! is compared with what the store reported creating.

use kgload_common::JobStatus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LoadError, Result, StoreError};
use crate::job::{JobSource, LoadJob};
use crate::reader::{RecordReader, SourceFormat};
use crate::retry::{Retried, RetryError, RetryPolicy};
use crate::sanitize::SanitizeOptions;
use crate::stats::JobReport;
use crate::store::{KindSelector, LoadQuery, Operation, TargetStore};

/// Allowed share of committed rows that may be missing or failed
pub const DEFAULT_VERIFICATION_THRESHOLD: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub verification_threshold: f64,
    pub sanitize: SanitizeOptions,
    pub format: SourceFormat,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            verification_threshold: DEFAULT_VERIFICATION_THRESHOLD,
            sanitize: SanitizeOptions::default(),
            format: SourceFormat::default(),
        }
    }
}

pub struct BatchLoadExecutor<S: TargetStore> {
    store: Arc<S>,
    config: ExecutorConfig,
    cancel: CancellationToken,
}

impl<S: TargetStore> BatchLoadExecutor<S> {
    pub fn new(store: Arc<S>, config: ExecutorConfig) -> Self {
        Self {
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between batches and during backoff when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run one job to a terminal status.
    ///
    /// Failed batches leave the job `Failed` but still return a report;
    /// errors are returned for conditions that end the job early
    /// (unreadable source, cancellation, verification mismatch).
    #[instrument(skip(self, job), fields(job = %job.name, stage = %job.stage))]
    pub async fn execute(&self, job: &mut LoadJob) -> Result<JobReport> {
        match job.source.clone() {
            JobSource::Missing { expected, .. } => {
                job.skip(&format!("source file not found: {}", expected.display()));
                Ok(job.report())
            },
            JobSource::Schema(queries) => self.execute_schema(job, &queries).await,
            JobSource::File {
                path,
                schema,
                query,
                ..
            } => {
                job.start();
                info!(path = %path.display(), batch_size = job.batch_size, "Starting job");
                let reader =
                    match RecordReader::open(&path, schema, &self.config.format, self.config.sanitize) {
                        Ok(reader) => reader,
                        Err(err) => {
                            error!(error = %err, "Cannot open source");
                            job.fail(&err);
                            return Err(err);
                        },
                    };
                match self.execute_file(job, reader, query).await {
                    Ok(()) => Ok(job.report()),
                    Err(err) => {
                        if matches!(err, LoadError::Cancelled { .. }) {
                            job.error = Some(err.to_string());
                            job.finish(JobStatus::Cancelled);
                        } else {
                            job.fail(&err);
                        }
                        error!(error = %err, status = %job.status, "Job ended early");
                        Err(err)
                    },
                }
            },
        }
    }

    async fn execute_schema(&self, job: &mut LoadJob, queries: &[LoadQuery]) -> Result<JobReport> {
        job.start();
        for (index, query) in queries.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let err = LoadError::Cancelled {
                    job: job.name.clone(),
                };
                job.error = Some(err.to_string());
                job.finish(JobStatus::Cancelled);
                return Err(err);
            }
            debug!(statement = %query.statement(), "Applying schema statement");
            if let Err(err) = self
                .submit_batch(job, index as u64 + 1, &Operation::schema(*query))
                .await
            {
                job.error = Some(err.to_string());
                job.finish(JobStatus::Cancelled);
                return Err(err);
            }
        }
        self.finish(job);
        Ok(job.report())
    }

    async fn execute_file(
        &self,
        job: &mut LoadJob,
        mut reader: RecordReader,
        query: LoadQuery,
    ) -> Result<()> {
        let selector = query.kind_selector();
        let baseline = match selector {
            Some(selector) => self.count(&job.name, &selector).await?,
            None => 0,
        };

        let mut batch_no = 0u64;
        let mut skipped_endpoints = 0u64;
        while let Some(records) = reader.next_batch(job.batch_size.max(1))? {
            if self.cancel.is_cancelled() {
                return Err(LoadError::Cancelled {
                    job: job.name.clone(),
                });
            }

            let rows: Vec<_> = records.iter().filter_map(|r| query.project(r)).collect();
            skipped_endpoints += (records.len() - rows.len()) as u64;
            if rows.is_empty() {
                continue;
            }

            batch_no += 1;
            job.counters.rows_attempted += rows.len() as u64;
            self.submit_batch(job, batch_no, &Operation::new(query, rows))
                .await?;
        }

        let stats = reader.stats();
        job.counters.rows_skipped += stats.rows_skipped() + skipped_endpoints;
        info!(
            rows_read = stats.rows_read,
            rows_repaired = stats.rows_repaired,
            rows_malformed = stats.rows_malformed,
            rows_skipped = job.counters.rows_skipped,
            batches = batch_no,
            "Source exhausted"
        );

        if let Some(selector) = selector {
            self.verify(job, &selector, baseline).await?;
        }
        self.finish(job);
        Ok(())
    }

    fn finish(&self, job: &mut LoadJob) {
        let status = if job.counters.batches_failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        };
        job.finish(status);
        info!(
            status = %job.status,
            rows_attempted = job.counters.rows_attempted,
            rows_committed = job.counters.rows_committed,
            rows_failed = job.counters.rows_failed,
            retries = job.counters.retries,
            nodes_created = job.counters.store.nodes_created,
            relationships_created = job.counters.store.relationships_created,
            "Job finished"
        );
    }

    /// Submit one batch with retries; only cancellation is returned as an error
    async fn submit_batch(&self, job: &mut LoadJob, batch: u64, operation: &Operation) -> Result<()> {
        let rows = operation.rows.len() as u64;
        let name = job.name.clone();
        let status = &mut job.status;

        let outcome = self
            .config
            .retry
            .run(
                &self.cancel,
                |retry| self.attempt(operation, retry),
                |event| {
                    *status = JobStatus::Retrying;
                    warn!(
                        job = %name,
                        batch,
                        retry = event.retry,
                        max_retries = event.max_retries,
                        delay_ms = event.delay.as_millis() as u64,
                        error = %event.error,
                        "Batch failed, backing off"
                    );
                },
            )
            .await;

        let counters = &mut job.counters;
        match outcome {
            Ok(Retried { value, retries }) => {
                job.status = JobStatus::Running;
                counters.rows_committed += rows;
                counters.batches_committed += 1;
                counters.retries += u64::from(retries);
                counters.store += value;
                debug!(job = %name, batch, rows, retries, "Batch committed");
                Ok(())
            },
            Err(RetryError::Cancelled { retries }) => {
                counters.retries += u64::from(retries);
                Err(LoadError::Cancelled { job: name })
            },
            Err(err) => {
                job.status = JobStatus::Running;
                let retries = err.retries();
                counters.retries += u64::from(retries);
                counters.rows_failed += rows;
                counters.batches_failed += 1;
                if let Some(source) = err.into_error() {
                    let failure = LoadError::BatchExhausted {
                        job: name,
                        batch,
                        attempts: retries + 1,
                        source,
                    };
                    error!(error = %failure, rows, "Batch abandoned");
                    if job.error.is_none() {
                        job.error = Some(failure.to_string());
                    }
                }
                Ok(())
            },
        }
    }

    /// One attempt: fresh connection on retries, one session, one operation
    async fn attempt(
        &self,
        operation: &Operation,
        retry: u32,
    ) -> std::result::Result<crate::store::OperationCounters, StoreError> {
        if retry > 0 {
            self.store.reconnect().await?;
        }
        let mut session = self.acquire().await?;
        let result = self.store.run_operation(&mut session, operation).await;
        self.store.release(session).await;
        result
    }

    /// Acquire a session, recreating the connection once on failure
    async fn acquire(&self) -> std::result::Result<S::Session, StoreError> {
        match self.store.acquire_session().await {
            Ok(session) => Ok(session),
            Err(err) => {
                warn!(store = self.store.name(), error = %err, "Session acquisition failed, reconnecting");
                self.store.reconnect().await?;
                self.store.acquire_session().await
            },
        }
    }

    async fn count(&self, job: &str, selector: &KindSelector) -> Result<u64> {
        self.config
            .retry
            .run(
                &self.cancel,
                |retry| async move {
                    if retry > 0 {
                        self.store.reconnect().await?;
                    }
                    self.store.count(selector).await
                },
                |event| {
                    warn!(job, selector = %selector, retry = event.retry, error = %event.error, "Count failed, backing off");
                },
            )
            .await
            .map(|r| r.value)
            .map_err(|err| match err {
                RetryError::Cancelled { .. } => LoadError::Cancelled {
                    job: job.to_string(),
                },
                RetryError::Exhausted { last, .. } => LoadError::Store(last),
                RetryError::Permanent { error, .. } => LoadError::Store(error),
            })
    }

    async fn verify(&self, job: &mut LoadJob, selector: &KindSelector, baseline: u64) -> Result<()> {
        let after = self.count(&job.name, selector).await?;
        let observed = after.saturating_sub(baseline);
        let expected = match selector {
            KindSelector::Nodes(_) => job.counters.store.nodes_created,
            KindSelector::Relationships(_) => job.counters.store.relationships_created,
        };

        let committed = job.counters.rows_committed;
        let allowed = self.config.verification_threshold * committed as f64;
        let discrepancy = expected.abs_diff(observed);
        let failed = job.counters.rows_failed;

        if discrepancy as f64 > allowed || failed as f64 > allowed {
            return Err(LoadError::VerificationMismatch {
                job: job.name.clone(),
                kind: selector.to_string(),
                expected,
                observed,
                failed_rows: failed,
                committed_rows: committed,
            });
        }
        info!(selector = %selector, baseline, after, expected, observed, "Verified load");
        Ok(())
    }
}
