//! Neo4j transactional HTTP endpoint
//!
//! Each operation is one auto-committed transaction posted to
//! `{url}/db/{database}/tx/commit` with `includeStats`, so the server reports
//! the counters the executor accumulates. In-flight sessions are bounded by a
//! semaphore sized to the connection limit.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::{KindSelector, LoadQuery, Operation, OperationCounters, TargetStore};
use crate::error::StoreError;

/// Connection settings for [`Neo4jHttpStore`]
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    /// Base HTTP URL, e.g. `http://localhost:7474`
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub max_connections: usize,
    pub request_timeout: Duration,
    /// How long to wait for a free session before reporting a transient failure
    pub acquire_timeout: Duration,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7474".to_string(),
            database: "neo4j".to_string(),
            user: None,
            password: None,
            max_connections: 4,
            request_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

impl Neo4jConfig {
    pub fn commit_url(&self) -> String {
        format!(
            "{}/db/{}/tx/commit",
            self.url.trim_end_matches('/'),
            self.database
        )
    }
}

/// A reserved slot of the connection pool
#[derive(Debug)]
pub struct Neo4jSession {
    id: u64,
    _permit: OwnedSemaphorePermit,
}

pub struct Neo4jHttpStore {
    config: Neo4jConfig,
    client: RwLock<Client>,
    permits: Arc<Semaphore>,
    sessions: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data: Vec<DataRow>,
    #[serde(default)]
    stats: QueryStats,
}

#[derive(Debug, Deserialize)]
struct DataRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryStats {
    #[serde(default)]
    nodes_created: u64,
    #[serde(default)]
    relationships_created: u64,
    #[serde(default)]
    properties_set: u64,
    #[serde(default)]
    indexes_added: u64,
    #[serde(default)]
    constraints_added: u64,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    #[serde(default)]
    message: String,
}

fn build_client(config: &Neo4jConfig) -> Result<Client, StoreError> {
    Client::builder()
        .timeout(config.request_timeout)
        .user_agent(concat!("kgload/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| StoreError::Connection(format!("failed to build HTTP client: {e}")))
}

fn classify_http_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Transient(format!("request timed out: {e}"))
    } else if e.is_connect() {
        StoreError::Connection(format!("connection failed: {e}"))
    } else {
        StoreError::Transient(format!("request failed: {e}"))
    }
}

/// Map a Neo4j status code onto the retry taxonomy
fn classify_neo4j_error(code: &str, message: &str) -> StoreError {
    if code.starts_with("Neo.TransientError") {
        StoreError::Transient(format!("{code}: {message}"))
    } else {
        StoreError::rejected(code, message)
    }
}

impl Neo4jHttpStore {
    pub fn new(config: Neo4jConfig) -> Result<Self, StoreError> {
        if config.max_connections == 0 {
            return Err(StoreError::rejected(
                "kgload.Config",
                "max_connections must be greater than 0",
            ));
        }
        let client = build_client(&config)?;
        info!(
            url = %config.url,
            database = %config.database,
            max_connections = config.max_connections,
            "Configured Neo4j HTTP store"
        );
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            client: RwLock::new(client),
            sessions: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &Neo4jConfig {
        &self.config
    }

    async fn execute(
        &self,
        statement: String,
        parameters: Map<String, Value>,
    ) -> Result<StatementResult, StoreError> {
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": parameters,
                "includeStats": true,
            }]
        });

        let client = self.client.read().await.clone();
        let mut request = client.post(self.config.commit_url()).json(&body);
        if let Some(user) = &self.config.user {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request.send().await.map_err(classify_http_error)?;
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::rejected(format!("HTTP {}", status.as_u16()), text));
        }

        let tx: TxResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Transient(format!("unreadable response: {e}")))?;
        if let Some(error) = tx.errors.first() {
            return Err(classify_neo4j_error(&error.code, &error.message));
        }
        tx.results
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Transient("response carried no result".to_string()))
    }
}

#[async_trait]
impl TargetStore for Neo4jHttpStore {
    type Session = Neo4jSession;

    fn name(&self) -> &str {
        "neo4j"
    }

    async fn acquire_session(&self) -> Result<Neo4jSession, StoreError> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| StoreError::Transient("timed out waiting for a free session".to_string()))?
        .map_err(|_| StoreError::Connection("store is closed".to_string()))?;

        let id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Neo4jSession {
            id,
            _permit: permit,
        })
    }

    async fn release(&self, session: Neo4jSession) {
        debug!(session = session.id, "Released session");
    }

    async fn run_operation(
        &self,
        session: &mut Neo4jSession,
        operation: &Operation,
    ) -> Result<OperationCounters, StoreError> {
        debug!(session = session.id, rows = operation.rows.len(), "Submitting operation");
        let result = self
            .execute(operation.query.statement(), operation.parameters())
            .await?;
        let stats = result.stats;

        let nodes_updated = match operation.query {
            LoadQuery::MergeNodes { .. } => {
                (operation.rows.len() as u64).saturating_sub(stats.nodes_created)
            },
            _ => 0,
        };
        Ok(OperationCounters {
            nodes_created: stats.nodes_created,
            nodes_updated,
            relationships_created: stats.relationships_created,
            properties_set: stats.properties_set,
            schema_changes: stats.indexes_added + stats.constraints_added,
        })
    }

    async fn count(&self, selector: &KindSelector) -> Result<u64, StoreError> {
        let result = self.execute(selector.count_statement(), Map::new()).await?;
        result
            .data
            .first()
            .and_then(|row| row.row.first())
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::Transient(format!("count of {selector} returned no value")))
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let client = build_client(&self.config)?;
        *self.client.write().await = client;
        warn!(url = %self.config.url, "Recreated Neo4j HTTP client");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.permits.close();
        info!("Closed Neo4j HTTP store");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer, max_connections: usize) -> Neo4jHttpStore {
        Neo4jHttpStore::new(Neo4jConfig {
            url: server.uri(),
            user: Some("neo4j".to_string()),
            password: Some("secret".to_string()),
            max_connections,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap()
    }

    fn merge_op() -> Operation {
        Operation::new(
            LoadQuery::MergeNodes {
                label: "Citation",
                key: "pmid",
            },
            vec![json!({"pmid": "1"}), json!({"pmid": "2"}), json!({"pmid": "3"})],
        )
    }

    #[tokio::test]
    async fn test_run_operation_reports_stats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "statements": [{"parameters": {"rows": [{"pmid": "1"}, {"pmid": "2"}, {"pmid": "3"}]}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "columns": [],
                    "data": [],
                    "stats": {"contains_updates": true, "nodes_created": 2, "properties_set": 3}
                }],
                "errors": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server, 2);
        let mut session = store.acquire_session().await.unwrap();
        let counters = store.run_operation(&mut session, &merge_op()).await.unwrap();
        store.release(session).await;

        assert_eq!(counters.nodes_created, 2);
        assert_eq!(counters.nodes_updated, 1);
        assert_eq!(counters.properties_set, 3);
    }

    #[tokio::test]
    async fn test_transient_and_rejected_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "errors": [{"code": "Neo.TransientError.Transaction.DeadlockDetected", "message": "deadlock"}]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "errors": [{"code": "Neo.ClientError.Statement.SyntaxError", "message": "bad"}]
            })))
            .mount(&server)
            .await;

        let store = store_for(&server, 1);
        let mut session = store.acquire_session().await.unwrap();
        let first = store.run_operation(&mut session, &merge_op()).await.unwrap_err();
        let second = store.run_operation(&mut session, &merge_op()).await.unwrap_err();

        assert!(matches!(first, StoreError::Transient(_)));
        assert_eq!(
            second,
            StoreError::rejected("Neo.ClientError.Statement.SyntaxError", "bad")
        );
    }

    #[tokio::test]
    async fn test_http_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let store = store_for(&server, 1);
        let mut session = store.acquire_session().await.unwrap();
        let first = store.run_operation(&mut session, &merge_op()).await.unwrap_err();
        let second = store.run_operation(&mut session, &merge_op()).await.unwrap_err();

        assert!(matches!(first, StoreError::Transient(_)));
        assert_eq!(second, StoreError::rejected("HTTP 401", "unauthorized"));
    }

    #[tokio::test]
    async fn test_count_reads_first_cell() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "statements": [{"statement": "MATCH (n:Citation) RETURN count(n) AS count"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"columns": ["count"], "data": [{"row": [42], "meta": [null]}]}],
                "errors": []
            })))
            .mount(&server)
            .await;

        let store = store_for(&server, 1);
        assert_eq!(store.count(&KindSelector::Nodes("Citation")).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_sessions_are_bounded() {
        let server = MockServer::start().await;
        let store = store_for(&server, 1);

        let held = store.acquire_session().await.unwrap();
        let err = store.acquire_session().await.unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));

        store.release(held).await;
        let again = store.acquire_session().await.unwrap();
        store.release(again).await;

        store.close().await.unwrap();
        assert!(store.acquire_session().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retryable() {
        let store = Neo4jHttpStore::new(Neo4jConfig {
            url: "http://127.0.0.1:9".to_string(),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let mut session = store.acquire_session().await.unwrap();
        let err = store.run_operation(&mut session, &merge_op()).await.unwrap_err();
        assert!(crate::retry::Retryable::is_transient(&err));
        store.reconnect().await.unwrap();
    }
}
