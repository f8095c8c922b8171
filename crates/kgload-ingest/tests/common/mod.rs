//! Shared fixtures for kgload integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use kgload_common::StageName;
use kgload_ingest::{CatalogOptions, ExecutorConfig, JobCatalog, MemoryGraphStore, Pipeline, PipelineOptions, RetryPolicy};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CITATIONS: &str = "\
1001,0028-0836,2001 Jan,2001-01-05,2001
1002,0028-0836,2002 Feb,2002-02-11,2002
";

pub const GENERIC_CONCEPTS: &str = "\
1,C0004057,Aspirin
2,C0030193,Pain
";

pub const SENTENCES: &str = "\
S1,1001,ti,1,0,42,,,Aspirin relieves pain in adults.
S2,1001,ab,2,43,90,RESULTS,results,Aspirin was well tolerated.
S3,1002,ti,1,0,30,,,Pain management in 2002.
";

pub const ENTITIES: &str = "\
E1,S1,C0004057,Aspirin,phsu,,,Aspirin,0,7,1000
E2,S1,C0030193,Pain,sosy,,,pain,17,21,1000
E3,S3,C0030193,Pain,sosy,,,Pain,0,4,888
";

pub const PREDICATIONS: &str = "\
P1,S1,1001,TREATS,C0004057,Aspirin,phsu,1,C0030193,Pain,sosy,1
P2,S2,1001,ADMINISTERED_TO,C0004057,Aspirin,phsu,1,C0001675,Adult,aggp,0
";

pub const PREDICATION_AUX: &str = "\
A1,P1,Aspirin,0,0,0,7,1000,VERB,8,16,pain,0,0,17,21,1000,2020-01-01 00:00:00
";

/// Writes every source file into a fresh directory
pub fn dataset() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "citations.csv", CITATIONS);
    write(dir.path(), "generic_concept.csv", GENERIC_CONCEPTS);
    write(dir.path(), "sentences.csv", SENTENCES);
    write(dir.path(), "entity.csv", ENTITIES);
    write(dir.path(), "predications.csv", PREDICATIONS);
    write(dir.path(), "predication_aux.csv", PREDICATION_AUX);
    dir
}

pub fn write(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}

pub fn all_stages() -> BTreeSet<StageName> {
    StageName::ALL.into_iter().collect()
}

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(60))
}

pub fn pipeline(
    dir: &Path,
    store: &Arc<MemoryGraphStore>,
    options: PipelineOptions,
) -> Pipeline<MemoryGraphStore> {
    Pipeline::new(
        Arc::clone(store),
        JobCatalog::new(CatalogOptions {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        }),
        ExecutorConfig {
            retry: retry_policy(),
            ..Default::default()
        },
        options,
    )
}
