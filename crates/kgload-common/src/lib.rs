//! kgload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the kgload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber configuration shared by every binary
//! - **Types**: pipeline vocabulary (stages, job status, source file kinds)
//!
//! # Example
//!
//! ```no_run
//! use kgload_common::logging::{init_logging, LogConfig};
//! use kgload_common::types::StageName;
//!
//! fn main() -> kgload_common::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let stage: StageName = "relationships".parse()?;
//!     tracing::info!(stage = %stage, "Selected stage");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{FileKind, JobStatus, SchemaVersion, StageName};
