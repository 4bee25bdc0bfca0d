//! Keyed document storage
//!
//! The orchestration core needs only an atomic single-row upsert, a point
//! read and a simple equality query. Two backends are provided: an
//! in-memory map for tests and single-process use, and a directory of JSON
//! files that survives restarts.
//!
//! Stores shared between OS processes also hand out a [`RunLease`] per key
//! so only one of them drives a process at a time. The file store keeps a
//! lock file fresh while the lease is held; a lock file left behind by a
//! crashed holder goes stale after the lease TTL and is taken over.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const LEASES: &str = "leases";

/// Age after which an unrefreshed lock file no longer holds its key
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key '{key}'")]
    InvalidKey { key: String },

    #[error("Storage backend unavailable: {message}")]
    Unavailable { message: String },
}

/// Equality conditions on top-level document fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    conditions: Vec<(String, Value)>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq<S: Into<String>>(mut self, field: S, value: Value) -> Self {
        self.conditions.push((field.into(), value));
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace one document atomically
    async fn upsert(&self, table: &str, key: &str, document: Value) -> Result<(), StoreError>;

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn query(&self, table: &str, filter: &DocumentFilter) -> Result<Vec<Value>, StoreError>;

    /// Claim `key` for a single writer across OS processes. `None` means
    /// someone else holds it. Stores private to one OS process need no
    /// claim beyond the in-process run lock.
    async fn acquire_lease(&self, _key: &str) -> Result<Option<RunLease>, StoreError> {
        Ok(Some(RunLease::local()))
    }
}

/// Exclusive claim on one key, released on drop
#[derive(Debug, Default)]
pub struct RunLease {
    path: Option<PathBuf>,
    refresher: Option<JoinHandle<()>>,
}

impl RunLease {
    /// Lease that guards nothing outside this OS process
    pub fn local() -> Self {
        Self::default()
    }

    pub fn is_local(&self) -> bool {
        self.path.is_none()
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Run lease released"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to release run lease"),
            }
        }
    }
}

type Tables = HashMap<String, HashMap<String, Value>>;

/// Thread-safe in-memory store
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `table`
    pub async fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, table: &str) -> bool {
        self.len(table).await == 0
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn upsert(&self, table: &str, key: &str, document: Value) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), document);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn query(&self, table: &str, filter: &DocumentFilter) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// One JSON file per document under `<root>/<table>/<key>.json`
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
    lease_ttl: Duration,
}

impl FileDocumentStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Lock files are refreshed at a third of `ttl`
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, table: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(table)?;
        validate_key(key)?;
        Ok(self.root.join(table).join(format!("{key}.json")))
    }

    async fn lease_is_stale(&self, path: &Path) -> Result<bool, StoreError> {
        let modified = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(age > self.lease_ttl)
    }
}

fn lease_holder() -> String {
    format!("{}\n", std::process::id())
}

/// Touch the lock file until aborted
fn spawn_lease_refresher(path: PathBuf, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = tokio::fs::write(&path, lease_holder()).await {
                warn!(path = %path.display(), error = %e, "Failed to refresh run lease");
            }
        }
    })
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey {
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn upsert(&self, table: &str, key: &str, document: Value) -> Result<(), StoreError> {
        let path = self.document_path(table, key)?;
        let dir = self.root.join(table);
        tokio::fs::create_dir_all(&dir).await?;

        // Write then rename so readers never see a partial document
        let tmp = dir.join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(&document)?;
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.document_path(table, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn query(&self, table: &str, filter: &DocumentFilter) -> Result<Vec<Value>, StoreError> {
        validate_key(table)?;
        let dir = self.root.join(table);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let document: Value = serde_json::from_slice(&bytes)?;
            if filter.matches(&document) {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    async fn acquire_lease(&self, key: &str) -> Result<Option<RunLease>, StoreError> {
        validate_key(key)?;
        let dir = self.root.join(LEASES);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{key}.lock"));

        // Second pass only after removing a stale lock file
        for _ in 0..2 {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match created {
                Ok(mut file) => {
                    file.write_all(lease_holder().as_bytes()).await?;
                    let refresher = spawn_lease_refresher(path.clone(), self.lease_ttl / 3);
                    debug!(key, "Run lease acquired");
                    return Ok(Some(RunLease {
                        path: Some(path),
                        refresher: Some(refresher),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !self.lease_is_stale(&path).await? {
                        return Ok(None);
                    }
                    warn!(key, "Taking over stale run lease");
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}
