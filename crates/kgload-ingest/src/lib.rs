//! kgload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resilient bulk loading of a biomedical relationship dump into a graph store.
//!
//! # Components
//!
//! - **Sanitizer** ([`sanitize`], [`preprocess`]): fixed-width, printable,
//!   canonically numbered fields
//! - **Consistency checker** ([`consistency`]): dangling cross-file references,
//!   reported before any write
//! - **Batch load executor** ([`executor`], [`retry`]): bounded batches,
//!   backoff, reconnection and post-load verification
//! - **Pipeline** ([`pipeline`], [`stage`], [`catalog`]): stage ordering,
//!   worker pool and the final report
//!
//! # Example
//!
//! ```no_run
//! use kgload_ingest::{LoaderConfig, MemoryGraphStore, Pipeline, PipelineOptions};
//! use kgload_common::StageName;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoaderConfig::builder().data_dir("./data/semmed").build()?;
//!     let store = Arc::new(MemoryGraphStore::new());
//!     let pipeline = Pipeline::from_config(store, &config, PipelineOptions::default());
//!
//!     let report = pipeline.run(&StageName::ALL.into_iter().collect()).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod consistency;
pub mod error;
pub mod executor;
pub mod job;
pub mod pipeline;
pub mod preprocess;
pub mod progress;
pub mod reader;
pub mod record;
pub mod retry;
pub mod sanitize;
pub mod schema;
pub mod stage;
pub mod stats;
pub mod store;

pub use catalog::{CatalogOptions, JobCatalog};
pub use config::LoaderConfig;
pub use consistency::{check_consistency, ConsistencyReport, ConsistencyWarning, FileId, FileSpec};
pub use error::{LoadError, MalformedRecordError, Result, StoreError};
pub use executor::{BatchLoadExecutor, ExecutorConfig};
pub use job::LoadJob;
pub use pipeline::{Pipeline, PipelineOptions};
pub use preprocess::{preprocess_file, PreprocessOptions, PreprocessSummary};
pub use retry::{RetryPolicy, Retryable};
pub use sanitize::sanitize;
pub use stats::{JobReport, KindCounters, LoadStatistics, PipelineReport, StageReport};
pub use store::{MemoryGraphStore, Neo4jConfig, Neo4jHttpStore, TargetStore};
