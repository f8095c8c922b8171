//! End-to-end pipeline runs against the in-memory graph store

mod common;

use common::{all_stages, dataset, pipeline, write, SENTENCES};
use kgload_common::{JobStatus, StageName};
use kgload_ingest::stats::StageOutcome;
use kgload_ingest::store::KindSelector;
use kgload_ingest::{MemoryGraphStore, PipelineOptions, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_full_run_loads_every_kind() {
    let dir = dataset();
    let store = Arc::new(MemoryGraphStore::new());

    let report = pipeline(dir.path(), &store, PipelineOptions::default())
        .run(&all_stages())
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert!(report.consistency_warnings.is_empty());

    assert_eq!(report.final_counts["Citation"], 2);
    assert_eq!(report.final_counts["GenericConcept"], 2);
    assert_eq!(report.final_counts["Sentence"], 3);
    assert_eq!(report.final_counts["Entity"], 3);
    assert_eq!(report.final_counts["Predication"], 2);
    assert_eq!(report.final_counts["PredicationAux"], 1);

    assert_eq!(store.relationship_count("HAS_SENTENCE"), 3);
    assert_eq!(store.relationship_count("HAS_ENTITY"), 3);
    assert_eq!(store.relationship_count("HAS_PREDICATION"), 2);
    assert_eq!(store.relationship_count("HAS_AUX"), 1);
    assert_eq!(store.relationship_count("INSTANCE_OF"), 3);
    // P1 and P2 both cite 1001, which has sentences S1 and S2
    assert_eq!(store.relationship_count("BELONGS_TO_SAME_CITATION"), 4);

    assert_eq!(report.final_relationship_counts["HAS_SENTENCE"], 3);
    assert_eq!(report.final_relationship_counts["BELONGS_TO_SAME_CITATION"], 4);
    assert_eq!(report.total_nodes(), 13);
    assert_eq!(report.total_relationships(), 16);

    let stats = report.statistics.get("INSTANCE_OF").unwrap();
    assert_eq!(stats.store.relationships_created, 3);
    assert_eq!(report.statistics.total().rows_failed, 0);

    let (acquired, released) = store.session_totals();
    assert_eq!(acquired, released);
    assert!(store.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_stages_never_overlap() {
    let dir = dataset();
    let store = Arc::new(MemoryGraphStore::new());
    let options = PipelineOptions {
        worker_pool_size: 4,
        ..Default::default()
    };

    let report = pipeline(dir.path(), &store, options)
        .run(&all_stages())
        .await
        .unwrap();
    assert!(report.is_success());

    let stage_of = |target: &KindSelector| match target {
        KindSelector::Nodes("schema") => StageName::Constraints,
        KindSelector::Nodes("Citation" | "GenericConcept") => StageName::IndependentEntities,
        KindSelector::Nodes(_) => StageName::DependentEntities,
        KindSelector::Relationships(_) => StageName::Relationships,
    };

    let log = store.operation_log();
    assert!(!log.is_empty());
    let stages: Vec<StageName> = log.iter().map(|op| stage_of(&op.target)).collect();
    let mut sorted = stages.clone();
    sorted.sort();
    assert_eq!(stages, sorted, "operations of a later stage ran before an earlier stage finished");
}

#[tokio::test(start_paused = true)]
async fn test_blocking_failure_skips_later_stages() {
    let dir = dataset();
    let store = Arc::new(MemoryGraphStore::new());
    store.reject("Citation");

    let report = pipeline(dir.path(), &store, PipelineOptions::default())
        .run(&all_stages())
        .await
        .unwrap();

    assert!(!report.is_success());
    assert!(report.blocking_failure());
    assert_eq!(report.stages[1].outcome, StageOutcome::Failed);
    assert_eq!(report.stages[2].outcome, StageOutcome::Skipped);
    assert_eq!(report.stages[3].outcome, StageOutcome::Skipped);
    assert!(report.stages[3]
        .jobs
        .iter()
        .all(|j| j.status == JobStatus::Skipped));
    assert!(report.errors[0].contains("stage independent_entities blocked"));
    assert!(report.errors[0].contains("citations"));

    // The other independent job still ran.
    assert_eq!(store.node_count("GenericConcept"), 2);
    assert_eq!(store.node_count("Sentence"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_absorbed() {
    let dir = dataset();
    let store = Arc::new(MemoryGraphStore::new());
    store.fail_next_operations(2, StoreError::Transient("LockClient deadlock".into()));

    let report = pipeline(dir.path(), &store, PipelineOptions::default())
        .run(&all_stages())
        .await
        .unwrap();

    assert!(report.is_success());
    let constraints = &report.stages[0].jobs[0];
    assert_eq!(constraints.counters.retries, 2);
    assert_eq!(store.reconnects(), 2);
    assert_eq!(report.statistics.total().retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_file_is_skipped_not_failed() {
    let dir = dataset();
    std::fs::remove_file(dir.path().join("predication_aux.csv")).unwrap();
    let store = Arc::new(MemoryGraphStore::new());

    let report = pipeline(dir.path(), &store, PipelineOptions::default())
        .run(&all_stages())
        .await
        .unwrap();

    assert!(report.is_success());
    let skipped: BTreeSet<&str> = report
        .jobs()
        .filter(|j| j.status == JobStatus::Skipped)
        .map(|j| j.job.as_str())
        .collect();
    assert_eq!(skipped, BTreeSet::from(["predication_aux", "has_aux"]));
    assert_eq!(report.final_counts["PredicationAux"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_dangling_references_are_reported() {
    let dir = dataset();
    let sentences = format!("{SENTENCES}S9,9999,ti,1,0,10,,,Orphan sentence.\n");
    write(dir.path(), "sentences.csv", &sentences);
    let store = Arc::new(MemoryGraphStore::new());

    let report = pipeline(dir.path(), &store, PipelineOptions::default())
        .run(&BTreeSet::from([StageName::IndependentEntities, StageName::DependentEntities]))
        .await
        .unwrap();

    assert_eq!(report.consistency_warnings.len(), 1);
    let warning = &report.consistency_warnings[0];
    assert_eq!(warning.dependent.as_str(), "sentence");
    assert_eq!(warning.referenced.as_str(), "citation");
    assert_eq!(warning.sample, vec!["9999"]);
    // Advisory only: the orphan sentence is still loaded.
    assert!(report.is_success());
    assert_eq!(store.node_count("Sentence"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_the_run() {
    let dir = dataset();
    let store = Arc::new(MemoryGraphStore::new());
    store.fail_next_operations(1, StoreError::Transient("timeout".into()));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    });

    let selected = BTreeSet::from([StageName::IndependentEntities, StageName::DependentEntities]);
    let options = PipelineOptions {
        run_consistency_check: false,
        ..Default::default()
    };
    let report = pipeline(dir.path(), &store, options)
        .with_cancellation(cancel)
        .run(&selected)
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.stages[1].outcome, StageOutcome::Cancelled);
    assert_eq!(report.stages[1].jobs[0].status, JobStatus::Cancelled);
    assert_eq!(report.stages[2].outcome, StageOutcome::Skipped);
    assert_eq!(store.node_count("Citation"), 0);
    assert!(report.final_counts.is_empty());
    assert!(report.final_relationship_counts.is_empty());
    assert!(store.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_skips_everything() {
    let dir = dataset();
    let store = Arc::new(MemoryGraphStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline(dir.path(), &store, PipelineOptions::default())
        .with_cancellation(cancel)
        .run(&all_stages())
        .await
        .unwrap();

    assert!(!report.is_success());
    assert!(report
        .stages
        .iter()
        .all(|s| s.outcome == StageOutcome::Skipped));
    assert!(store.operation_log().is_empty());
}
