//! Target store interface
//!
//! The pipeline talks to the graph database only through [`TargetStore`]:
//! sessions are acquired for one batch at a time, each batch is one
//! [`Operation`] (`UNWIND $rows ...`), and verification uses [`TargetStore::count`].

pub mod memory;
pub mod neo4j;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::ops::AddAssign;

use crate::error::StoreError;
use crate::record::Record;

pub use memory::MemoryGraphStore;
pub use neo4j::{Neo4jConfig, Neo4jHttpStore};

/// Graph store the pipeline writes into
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Handle for one unit of work; held for a single batch
    type Session: Send;

    /// Short name for logs
    fn name(&self) -> &str;

    async fn acquire_session(&self) -> Result<Self::Session, StoreError>;

    async fn release(&self, session: Self::Session);

    /// Execute one batch as a single operation
    async fn run_operation(
        &self,
        session: &mut Self::Session,
        operation: &Operation,
    ) -> Result<OperationCounters, StoreError>;

    /// Number of nodes with a label, or relationships of a type
    async fn count(&self, selector: &KindSelector) -> Result<u64, StoreError>;

    /// Drop and recreate the underlying connection
    async fn reconnect(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Counters reported by the store for one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounters {
    pub nodes_created: u64,
    /// Nodes matched by key that already existed
    pub nodes_updated: u64,
    pub relationships_created: u64,
    pub properties_set: u64,
    /// Constraints and indexes added
    pub schema_changes: u64,
}

impl AddAssign for OperationCounters {
    fn add_assign(&mut self, other: Self) {
        self.nodes_created += other.nodes_created;
        self.nodes_updated += other.nodes_updated;
        self.relationships_created += other.relationships_created;
        self.properties_set += other.properties_set;
        self.schema_changes += other.schema_changes;
    }
}

/// What a verification count looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum KindSelector {
    Nodes(&'static str),
    Relationships(&'static str),
}

impl KindSelector {
    pub fn name(&self) -> &'static str {
        match self {
            KindSelector::Nodes(name) | KindSelector::Relationships(name) => name,
        }
    }

    /// Cypher that returns the count as column `count`
    pub fn count_statement(&self) -> String {
        match self {
            KindSelector::Nodes(label) => format!("MATCH (n:{label}) RETURN count(n) AS count"),
            KindSelector::Relationships(rel) => {
                format!("MATCH ()-[r:{rel}]->() RETURN count(r) AS count")
            },
        }
    }
}

impl fmt::Display for KindSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindSelector::Nodes(label) => write!(f, "(:{label})"),
            KindSelector::Relationships(rel) => write!(f, "[:{rel}]"),
        }
    }
}

/// Endpoint of a relationship, matched by one property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    pub label: &'static str,
    /// Property matched on the existing node
    pub property: &'static str,
    /// Source column holding the value
    pub column: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    Unique,
    Index,
}

/// Fixed query template of one load job.
///
/// Every template is a merge by key, so resubmitting a batch is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadQuery {
    Schema {
        label: &'static str,
        property: &'static str,
        change: SchemaChange,
    },
    MergeNodes {
        label: &'static str,
        key: &'static str,
    },
    MergeRelationships {
        rel_type: &'static str,
        from: NodeRef,
        to: NodeRef,
    },
}

impl LoadQuery {
    pub fn statement(&self) -> String {
        match self {
            LoadQuery::Schema {
                label,
                property,
                change: SchemaChange::Unique,
            } => format!(
                "CREATE CONSTRAINT {}_{}_unique IF NOT EXISTS FOR (n:{label}) REQUIRE n.{property} IS UNIQUE",
                label.to_lowercase(),
                property
            ),
            LoadQuery::Schema {
                label,
                property,
                change: SchemaChange::Index,
            } => format!(
                "CREATE INDEX {}_{}_index IF NOT EXISTS FOR (n:{label}) ON (n.{property})",
                label.to_lowercase(),
                property
            ),
            LoadQuery::MergeNodes { label, key } => format!(
                "UNWIND $rows AS row MERGE (n:{label} {{{key}: row.{key}}}) SET n += row"
            ),
            LoadQuery::MergeRelationships { rel_type, from, to } => format!(
                "UNWIND $rows AS row \
                 MATCH (a:{} {{{}: row.from}}) \
                 MATCH (b:{} {{{}: row.to}}) \
                 MERGE (a)-[:{rel_type}]->(b)",
                from.label, from.property, to.label, to.property
            ),
        }
    }

    /// Parameter row for one record; `None` when the record cannot take part
    pub fn project(&self, record: &Record) -> Option<Value> {
        match self {
            LoadQuery::Schema { .. } => None,
            LoadQuery::MergeNodes { .. } => Some(Value::Object(record.to_params())),
            LoadQuery::MergeRelationships { from, to, .. } => {
                let from = record.get(from.column).filter(|v| !v.is_empty())?;
                let to = record.get(to.column).filter(|v| !v.is_empty())?;
                Some(json!({ "from": from, "to": to }))
            },
        }
    }

    /// Selector used to verify the job after loading
    pub fn kind_selector(&self) -> Option<KindSelector> {
        match self {
            LoadQuery::Schema { .. } => None,
            LoadQuery::MergeNodes { label, .. } => Some(KindSelector::Nodes(label)),
            LoadQuery::MergeRelationships { rel_type, .. } => {
                Some(KindSelector::Relationships(rel_type))
            },
        }
    }
}

/// One submission: a template plus all rows of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub query: LoadQuery,
    pub rows: Vec<Value>,
}

impl Operation {
    pub fn new(query: LoadQuery, rows: Vec<Value>) -> Self {
        Self { query, rows }
    }

    pub fn schema(query: LoadQuery) -> Self {
        Self {
            query,
            rows: Vec::new(),
        }
    }

    /// Statement parameters
    pub fn parameters(&self) -> Map<String, Value> {
        let mut params = Map::new();
        if !matches!(self.query, LoadQuery::Schema { .. }) {
            params.insert("rows".to_string(), Value::Array(self.rows.clone()));
        }
        params
    }
}
