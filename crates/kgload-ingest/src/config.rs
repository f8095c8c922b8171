//! Loader configuration

use kgload_common::SchemaVersion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::catalog::{CatalogOptions, DEFAULT_BATCH_SIZE, DEFAULT_RELATIONSHIP_BATCH_SIZE};
use crate::error::{LoadError, Result};
use crate::executor::{ExecutorConfig, DEFAULT_VERIFICATION_THRESHOLD};
use crate::reader::SourceFormat;
use crate::retry::RetryPolicy;
use crate::sanitize::SanitizeOptions;
use crate::store::Neo4jConfig;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DATA_DIR: &str = "./data";

pub const DEFAULT_STORE_URL: &str = "http://localhost:7474";

pub const DEFAULT_DATABASE: &str = "neo4j";

pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;

pub const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;

/// Jobs of one stage run one at a time unless configured otherwise
pub const DEFAULT_WORKERS: usize = 1;

/// Graph store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub max_connections: usize,
    pub request_timeout_secs: u64,
}

/// Batching, retry and verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSettings {
    pub batch_size: usize,
    pub relationship_batch_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub verification_threshold: f64,
    pub workers: usize,
    pub max_field_len: Option<usize>,
}

/// Layout of the input files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSettings {
    pub delimiter: char,
    pub has_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub data_dir: PathBuf,
    pub schema_version: SchemaVersion,
    pub store: StoreSettings,
    pub load: LoadSettings,
    pub input: InputSettings,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            schema_version: SchemaVersion::V1,
            store: StoreSettings {
                url: DEFAULT_STORE_URL.to_string(),
                database: DEFAULT_DATABASE.to_string(),
                user: None,
                password: None,
                max_connections: DEFAULT_MAX_CONNECTIONS,
                request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            },
            load: LoadSettings {
                batch_size: DEFAULT_BATCH_SIZE,
                relationship_batch_size: DEFAULT_RELATIONSHIP_BATCH_SIZE,
                max_retries: DEFAULT_MAX_RETRIES,
                backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
                backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
                verification_threshold: DEFAULT_VERIFICATION_THRESHOLD,
                workers: DEFAULT_WORKERS,
                max_field_len: None,
            },
            input: InputSettings {
                delimiter: ',',
                has_headers: false,
            },
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LoadError::config(format!("invalid value for {name}: {value}"))),
        Err(_) => Ok(None),
    }
}

impl LoaderConfig {
    /// Defaults overlaid with `KGLOAD_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::default().merge_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(dir) = env_parse::<String>("KGLOAD_DATA_DIR")? {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(version) = env_parse::<String>("KGLOAD_SCHEMA_VERSION")? {
            self.schema_version = version.parse()?;
        }

        let store = &mut self.store;
        if let Some(url) = env_parse("KGLOAD_STORE_URL")? {
            store.url = url;
        }
        if let Some(database) = env_parse("KGLOAD_DATABASE")? {
            store.database = database;
        }
        if let Some(user) = env_parse("KGLOAD_STORE_USER")? {
            store.user = Some(user);
        }
        if let Ok(password) = std::env::var("KGLOAD_STORE_PASSWORD") {
            store.password = Some(password);
        }
        if let Some(n) = env_parse("KGLOAD_MAX_CONNECTIONS")? {
            store.max_connections = n;
        }
        if let Some(secs) = env_parse("KGLOAD_REQUEST_TIMEOUT_SECS")? {
            store.request_timeout_secs = secs;
        }

        let load = &mut self.load;
        if let Some(n) = env_parse("KGLOAD_BATCH_SIZE")? {
            load.batch_size = n;
        }
        if let Some(n) = env_parse("KGLOAD_RELATIONSHIP_BATCH_SIZE")? {
            load.relationship_batch_size = n;
        }
        if let Some(n) = env_parse("KGLOAD_MAX_RETRIES")? {
            load.max_retries = n;
        }
        if let Some(ms) = env_parse("KGLOAD_BACKOFF_BASE_MS")? {
            load.backoff_base_ms = ms;
        }
        if let Some(ms) = env_parse("KGLOAD_BACKOFF_MAX_MS")? {
            load.backoff_max_ms = ms;
        }
        if let Some(threshold) = env_parse("KGLOAD_VERIFY_THRESHOLD")? {
            load.verification_threshold = threshold;
        }
        if let Some(n) = env_parse("KGLOAD_WORKERS")? {
            load.workers = n;
        }
        if let Some(n) = env_parse("KGLOAD_MAX_FIELD_LEN")? {
            load.max_field_len = Some(n);
        }

        if let Ok(delimiter) = std::env::var("KGLOAD_DELIMITER") {
            self.input.delimiter = parse_delimiter(&delimiter)?;
        }
        if let Some(headers) = env_parse("KGLOAD_HAS_HEADERS")? {
            self.input.has_headers = headers;
        }
        Ok(self)
    }

    pub fn builder() -> LoaderConfigBuilder {
        LoaderConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(LoadError::config("store URL cannot be empty"));
        }
        if self.store.max_connections == 0 {
            return Err(LoadError::config("max_connections must be greater than 0"));
        }
        if self.load.batch_size == 0 || self.load.relationship_batch_size == 0 {
            return Err(LoadError::config("batch sizes must be greater than 0"));
        }
        if self.load.workers == 0 {
            return Err(LoadError::config("workers must be greater than 0"));
        }
        if self.load.backoff_base_ms > self.load.backoff_max_ms {
            return Err(LoadError::config(format!(
                "backoff base ({} ms) cannot exceed backoff max ({} ms)",
                self.load.backoff_base_ms, self.load.backoff_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.load.verification_threshold) {
            return Err(LoadError::config(format!(
                "verification threshold must be between 0 and 1, got {}",
                self.load.verification_threshold
            )));
        }
        if !self.input.delimiter.is_ascii() {
            return Err(LoadError::config("delimiter must be a single ASCII character"));
        }
        if self.load.workers > self.store.max_connections {
            tracing::warn!(
                workers = self.load.workers,
                max_connections = self.store.max_connections,
                "More workers than store connections; jobs will wait for sessions"
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.load.max_retries,
            Duration::from_millis(self.load.backoff_base_ms),
            Duration::from_millis(self.load.backoff_max_ms),
        )
    }

    pub fn source_format(&self) -> SourceFormat {
        SourceFormat {
            delimiter: self.input.delimiter as u8,
            has_headers: self.input.has_headers,
        }
    }

    pub fn sanitize_options(&self) -> SanitizeOptions {
        SanitizeOptions {
            max_field_len: self.load.max_field_len,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: self.retry_policy(),
            verification_threshold: self.load.verification_threshold,
            sanitize: self.sanitize_options(),
            format: self.source_format(),
        }
    }

    pub fn neo4j_config(&self) -> Neo4jConfig {
        Neo4jConfig {
            url: self.store.url.clone(),
            database: self.store.database.clone(),
            user: self.store.user.clone(),
            password: self.store.password.clone(),
            max_connections: self.store.max_connections,
            request_timeout: Duration::from_secs(self.store.request_timeout_secs),
            ..Default::default()
        }
    }

    pub fn catalog_options(&self) -> CatalogOptions {
        CatalogOptions {
            data_dir: self.data_dir.clone(),
            schema_version: self.schema_version,
            batch_size: self.load.batch_size,
            relationship_batch_size: self.load.relationship_batch_size,
        }
    }
}

/// Accepts a literal character or the names `tab`, `comma`, `pipe`
pub fn parse_delimiter(s: &str) -> Result<char> {
    match s {
        "tab" | "\\t" | "\t" => Ok('\t'),
        "comma" => Ok(','),
        "pipe" => Ok('|'),
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => Ok(c),
                _ => Err(LoadError::config(format!("invalid delimiter: {other:?}"))),
            }
        },
    }
}

/// Builder for LoaderConfig
#[derive(Debug, Default)]
pub struct LoaderConfigBuilder {
    config: LoaderConfig,
}

impl LoaderConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn schema_version(mut self, version: SchemaVersion) -> Self {
        self.config.schema_version = version;
        self
    }

    pub fn store_url(mut self, url: impl Into<String>) -> Self {
        self.config.store.url = url.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.store.database = database.into();
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.store.user = Some(user.into());
        self.config.store.password = Some(password.into());
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.load.batch_size = size;
        self
    }

    pub fn relationship_batch_size(mut self, size: usize) -> Self {
        self.config.load.relationship_batch_size = size;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.load.max_retries = retries;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.load.backoff_base_ms = base.as_millis() as u64;
        self.config.load.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn verification_threshold(mut self, threshold: f64) -> Self {
        self.config.load.verification_threshold = threshold;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.load.workers = workers;
        self
    }

    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.config.input.delimiter = delimiter;
        self
    }

    pub fn has_headers(mut self, has_headers: bool) -> Self {
        self.config.input.has_headers = has_headers;
        self
    }

    pub fn build(self) -> Result<LoaderConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
