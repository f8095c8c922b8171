//! In-process graph store
//!
//! Applies the same merge-by-key semantics as the Cypher templates so dry
//! runs and tests observe realistic counters. Faults can be scripted to
//! exercise the retry, reconnect and verification paths.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{KindSelector, LoadQuery, NodeRef, Operation, OperationCounters, TargetStore};
use crate::error::StoreError;

/// Session handle of [`MemoryGraphStore`]
#[derive(Debug)]
pub struct MemorySession {
    pub id: u64,
}

/// One executed operation, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOperation {
    pub seq: u64,
    pub target: KindSelector,
    pub rows: usize,
}

#[derive(Debug, Default)]
struct Graph {
    /// label -> merge key value -> properties
    nodes: HashMap<&'static str, BTreeMap<String, Map<String, Value>>>,
    /// label -> merge key property
    keys: HashMap<&'static str, &'static str>,
    /// relationship type -> (from node, to node)
    relationships: HashMap<&'static str, BTreeSet<(String, String)>>,
    schema: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Faults {
    operation_failures: VecDeque<StoreError>,
    acquire_failures: u32,
    /// Labels or relationship types whose operations are always rejected
    rejected: BTreeSet<&'static str>,
    /// Rows reported as written but never stored
    dropped_rows: u64,
    broken: bool,
}

#[derive(Debug, Default)]
struct Telemetry {
    next_session: u64,
    next_seq: u64,
    acquired: u64,
    released: u64,
    open_sessions: u64,
    peak_sessions: u64,
    reconnects: u64,
    closed: bool,
    log: Vec<LoggedOperation>,
}

/// Merge-by-key graph kept in memory
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graph: Mutex<Graph>,
    faults: Mutex<Faults>,
    telemetry: Mutex<Telemetry>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Fault scripting
    // ------------------------------------------------------------------

    /// The next `count` operations fail with `error` before touching the graph
    pub fn fail_next_operations(&self, count: usize, error: StoreError) {
        let mut faults = lock(&self.faults);
        faults
            .operation_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// The next `count` session acquisitions fail
    pub fn fail_next_acquisitions(&self, count: u32) {
        lock(&self.faults).acquire_failures += count;
    }

    /// Every operation on `target` (label or relationship type) is rejected
    pub fn reject(&self, target: &'static str) {
        lock(&self.faults).rejected.insert(target);
    }

    /// The next `rows` node rows are acknowledged but silently discarded
    pub fn drop_rows(&self, rows: u64) {
        lock(&self.faults).dropped_rows += rows;
    }

    /// Break the connection until [`TargetStore::reconnect`] is called
    pub fn break_connection(&self) {
        lock(&self.faults).broken = true;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn node_count(&self, label: &str) -> u64 {
        lock(&self.graph).nodes.get(label).map_or(0, |n| n.len() as u64)
    }

    pub fn relationship_count(&self, rel_type: &str) -> u64 {
        lock(&self.graph)
            .relationships
            .get(rel_type)
            .map_or(0, |r| r.len() as u64)
    }

    pub fn node(&self, label: &str, key: &str) -> Option<Map<String, Value>> {
        lock(&self.graph).nodes.get(label)?.get(key).cloned()
    }

    pub fn schema_statements(&self) -> Vec<String> {
        lock(&self.graph).schema.iter().cloned().collect()
    }

    pub fn operation_log(&self) -> Vec<LoggedOperation> {
        lock(&self.telemetry).log.clone()
    }

    pub fn reconnects(&self) -> u64 {
        lock(&self.telemetry).reconnects
    }

    /// (acquired, released) sessions so far
    pub fn session_totals(&self) -> (u64, u64) {
        let t = lock(&self.telemetry);
        (t.acquired, t.released)
    }

    pub fn peak_sessions(&self) -> u64 {
        lock(&self.telemetry).peak_sessions
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.telemetry).closed
    }

    // ------------------------------------------------------------------
    // Graph mutation
    // ------------------------------------------------------------------

    fn take_dropped_row(&self) -> bool {
        let mut faults = lock(&self.faults);
        if faults.dropped_rows == 0 {
            return false;
        }
        faults.dropped_rows -= 1;
        true
    }

    fn apply(&self, operation: &Operation) -> OperationCounters {
        let mut graph = lock(&self.graph);
        let mut counters = OperationCounters::default();

        match operation.query {
            LoadQuery::Schema { .. } => {
                if graph.schema.insert(operation.query.statement()) {
                    counters.schema_changes += 1;
                }
            },
            LoadQuery::MergeNodes { label, key } => {
                graph.keys.insert(label, key);
                for row in &operation.rows {
                    let Some(props) = row.as_object() else { continue };
                    let Some(id) = props.get(key).and_then(value_key) else {
                        continue;
                    };
                    let set: Map<String, Value> = props
                        .iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    counters.properties_set += set.len() as u64;

                    let nodes = graph.nodes.entry(label).or_default();
                    match nodes.get_mut(&id) {
                        Some(existing) => {
                            counters.nodes_updated += 1;
                            existing.extend(set);
                        },
                        None => {
                            counters.nodes_created += 1;
                            if !self.take_dropped_row() {
                                nodes.insert(id, set);
                            }
                        },
                    }
                }
            },
            LoadQuery::MergeRelationships { rel_type, from, to } => {
                for row in &operation.rows {
                    let sources = matching_nodes(&graph, &from, row.get("from"));
                    let targets = matching_nodes(&graph, &to, row.get("to"));
                    for a in &sources {
                        for b in &targets {
                            let inserted = graph
                                .relationships
                                .entry(rel_type)
                                .or_default()
                                .insert((a.clone(), b.clone()));
                            if inserted {
                                counters.relationships_created += 1;
                            }
                        }
                    }
                }
            },
        }
        counters
    }
}

fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Keys of the nodes matched by `MATCH (x:Label {property: value})`
fn matching_nodes(graph: &Graph, node: &NodeRef, value: Option<&Value>) -> Vec<String> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Vec::new();
    };
    let Some(nodes) = graph.nodes.get(node.label) else {
        return Vec::new();
    };
    if graph.keys.get(node.label) == Some(&node.property) {
        return value_key(value)
            .and_then(|key| nodes.get_key_value(&key))
            .filter(|(_, props)| props.get(node.property) == Some(value))
            .map(|(key, _)| vec![format!("{}:{key}", node.label)])
            .unwrap_or_default();
    }
    nodes
        .iter()
        .filter(|(_, props)| props.get(node.property) == Some(value))
        .map(|(key, _)| format!("{}:{key}", node.label))
        .collect()
}

#[async_trait]
impl TargetStore for MemoryGraphStore {
    type Session = MemorySession;

    fn name(&self) -> &str {
        "memory"
    }

    async fn acquire_session(&self) -> Result<MemorySession, StoreError> {
        {
            let mut faults = lock(&self.faults);
            if faults.broken {
                return Err(StoreError::Connection("connection is broken".to_string()));
            }
            if faults.acquire_failures > 0 {
                faults.acquire_failures -= 1;
                return Err(StoreError::Connection("session pool exhausted".to_string()));
            }
        }

        let mut t = lock(&self.telemetry);
        if t.closed {
            return Err(StoreError::Connection("store is closed".to_string()));
        }
        t.next_session += 1;
        t.acquired += 1;
        t.open_sessions += 1;
        t.peak_sessions = t.peak_sessions.max(t.open_sessions);
        Ok(MemorySession { id: t.next_session })
    }

    async fn release(&self, session: MemorySession) {
        let mut t = lock(&self.telemetry);
        t.released += 1;
        t.open_sessions = t.open_sessions.saturating_sub(1);
        debug!(session = session.id, "Released session");
    }

    async fn run_operation(
        &self,
        _session: &mut MemorySession,
        operation: &Operation,
    ) -> Result<OperationCounters, StoreError> {
        let target = operation.query.kind_selector();
        {
            let mut faults = lock(&self.faults);
            if faults.broken {
                return Err(StoreError::Connection("connection is broken".to_string()));
            }
            if let Some(error) = faults.operation_failures.pop_front() {
                return Err(error);
            }
            if let Some(target) = target.filter(|t| faults.rejected.contains(t.name())) {
                return Err(StoreError::rejected(
                    "Memory.ClientError.Rejected",
                    format!("writes to {target} are rejected"),
                ));
            }
        }

        let counters = self.apply(operation);

        let mut t = lock(&self.telemetry);
        t.next_seq += 1;
        let seq = t.next_seq;
        t.log.push(LoggedOperation {
            seq,
            target: target.unwrap_or(KindSelector::Nodes("schema")),
            rows: operation.rows.len(),
        });
        Ok(counters)
    }

    async fn count(&self, selector: &KindSelector) -> Result<u64, StoreError> {
        if lock(&self.faults).broken {
            return Err(StoreError::Connection("connection is broken".to_string()));
        }
        Ok(match selector {
            KindSelector::Nodes(label) => self.node_count(label),
            KindSelector::Relationships(rel_type) => self.relationship_count(rel_type),
        })
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        lock(&self.faults).broken = false;
        lock(&self.telemetry).reconnects += 1;
        debug!("Recreated in-memory connection");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        lock(&self.telemetry).closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::SchemaChange;
    use serde_json::json;

    fn merge_concepts(ids: &[&str]) -> Operation {
        Operation::new(
            LoadQuery::MergeNodes {
                label: "GenericConcept",
                key: "concept_id",
            },
            ids.iter()
                .map(|id| json!({"concept_id": id, "cui": format!("C{id}"), "preferred_name": null}))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = MemoryGraphStore::new();
        let mut session = store.acquire_session().await.unwrap();

        let first = store
            .run_operation(&mut session, &merge_concepts(&["1", "2", "3"]))
            .await
            .unwrap();
        let second = store
            .run_operation(&mut session, &merge_concepts(&["1", "2", "3"]))
            .await
            .unwrap();
        store.release(session).await;

        assert_eq!(first.nodes_created, 3);
        assert_eq!(first.properties_set, 6);
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.nodes_updated, 3);
        assert_eq!(store.node_count("GenericConcept"), 3);
        assert_eq!(store.session_totals(), (1, 1));
    }

    #[tokio::test]
    async fn test_relationships_match_by_property() {
        let store = MemoryGraphStore::new();
        let mut session = store.acquire_session().await.unwrap();
        store
            .run_operation(&mut session, &merge_concepts(&["1", "2"]))
            .await
            .unwrap();
        store
            .run_operation(
                &mut session,
                &Operation::new(
                    LoadQuery::MergeNodes {
                        label: "Entity",
                        key: "entity_id",
                    },
                    vec![json!({"entity_id": "E1", "cui": "C2"})],
                ),
            )
            .await
            .unwrap();

        let link = Operation::new(
            LoadQuery::MergeRelationships {
                rel_type: "INSTANCE_OF",
                from: NodeRef {
                    label: "Entity",
                    property: "entity_id",
                    column: "entity_id",
                },
                to: NodeRef {
                    label: "GenericConcept",
                    property: "cui",
                    column: "cui",
                },
            },
            vec![
                json!({"from": "E1", "to": "C2"}),
                json!({"from": "E1", "to": "C9"}),
            ],
        );
        let counters = store.run_operation(&mut session, &link).await.unwrap();
        let again = store.run_operation(&mut session, &link).await.unwrap();

        assert_eq!(counters.relationships_created, 1);
        assert_eq!(again.relationships_created, 0);
        assert_eq!(
            store.count(&KindSelector::Relationships("INSTANCE_OF")).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_key_endpoints_match_exact_values() {
        let store = MemoryGraphStore::new();
        let mut session = store.acquire_session().await.unwrap();
        store
            .run_operation(&mut session, &merge_concepts(&["1", "2"]))
            .await
            .unwrap();
        store
            .run_operation(
                &mut session,
                &Operation::new(
                    LoadQuery::MergeNodes {
                        label: "Entity",
                        key: "entity_id",
                    },
                    vec![json!({"entity_id": "E1"}), json!({"entity_id": "E2"})],
                ),
            )
            .await
            .unwrap();

        let link = Operation::new(
            LoadQuery::MergeRelationships {
                rel_type: "MENTIONS",
                from: NodeRef {
                    label: "Entity",
                    property: "entity_id",
                    column: "entity_id",
                },
                to: NodeRef {
                    label: "GenericConcept",
                    property: "concept_id",
                    column: "concept_id",
                },
            },
            vec![
                json!({"from": "E1", "to": "2"}),
                // Stored keys are strings
                json!({"from": "E2", "to": 2}),
                json!({"from": "E9", "to": "1"}),
            ],
        );
        let counters = store.run_operation(&mut session, &link).await.unwrap();

        assert_eq!(counters.relationships_created, 1);
        assert_eq!(store.relationship_count("MENTIONS"), 1);
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let store = MemoryGraphStore::new();
        store.fail_next_operations(1, StoreError::Transient("deadlock".into()));
        store.fail_next_acquisitions(1);

        assert!(store.acquire_session().await.is_err());
        let mut session = store.acquire_session().await.unwrap();
        let err = store
            .run_operation(&mut session, &merge_concepts(&["1"]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Transient("deadlock".into()));
        store
            .run_operation(&mut session, &merge_concepts(&["1"]))
            .await
            .unwrap();

        store.reject("GenericConcept");
        let err = store
            .run_operation(&mut session, &merge_concepts(&["2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
        store.release(session).await;
    }

    #[tokio::test]
    async fn test_broken_connection_until_reconnect() {
        let store = MemoryGraphStore::new();
        store.break_connection();
        assert!(store.acquire_session().await.unwrap_err().is_connection());
        store.reconnect().await.unwrap();
        assert!(store.acquire_session().await.is_ok());
        assert_eq!(store.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_dropped_rows_are_acknowledged_but_not_stored() {
        let store = MemoryGraphStore::new();
        store.drop_rows(2);
        let mut session = store.acquire_session().await.unwrap();
        let counters = store
            .run_operation(&mut session, &merge_concepts(&["1", "2", "3"]))
            .await
            .unwrap();
        assert_eq!(counters.nodes_created, 3);
        assert_eq!(store.node_count("GenericConcept"), 1);
    }

    #[tokio::test]
    async fn test_schema_changes_and_log() {
        let store = MemoryGraphStore::new();
        let op = Operation::schema(LoadQuery::Schema {
            label: "Citation",
            property: "pmid",
            change: SchemaChange::Unique,
        });
        let mut session = store.acquire_session().await.unwrap();
        let first = store.run_operation(&mut session, &op).await.unwrap();
        let second = store.run_operation(&mut session, &op).await.unwrap();

        assert_eq!(first.schema_changes, 1);
        assert_eq!(second.schema_changes, 0);
        assert_eq!(store.schema_statements().len(), 1);
        let log = store.operation_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].seq < log[1].seq);
    }
}
