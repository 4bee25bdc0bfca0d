//! Save, load, snapshot and restore execution contexts
//!
//! Snapshots form a chain through parent pointers. The HEAD of a process is
//! the `head_snapshot_id` stored on its live context. Restoring a snapshot
//! is a checkout: the live context is replaced by the snapshot's copy and
//! HEAD moves there. Progress after a restore creates children of the
//! restored snapshot, so the previous HEAD and its ancestors that are not
//! shared stay stored but are no longer on the active chain.

use super::store::{DocumentFilter, DocumentStore, FileDocumentStore, InMemoryDocumentStore, RunLease};
use super::{PersistenceError, PersistenceResult};
use crate::agent::telemetry::{InvocationTelemetry, TelemetryError, TelemetrySink};
use crate::config::{ConfigError, StorageBackend, StorageSection};
use crate::context::{ErrorRecord, ExecutionContext, ProcessStatus};
use crate::gate::InputKind;
use crate::session::ConnectionState;
use crate::steps::{self, Step};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROCESSES: &str = "processes";
const SNAPSHOTS: &str = "snapshots";
const ARCHIVE: &str = "archive";
const TELEMETRY: &str = "telemetry";

/// Immutable copy of a context taken after `step` completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub process_id: String,
    pub owner_id: String,
    pub parent_id: Option<String>,
    pub step: Step,
    pub created_at: DateTime<Utc>,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: String,
    pub parent_id: Option<String>,
    pub step: Step,
    pub resumes_at: Step,
    pub created_at: DateTime<Utc>,
    pub is_head: bool,
}

/// Lightweight status read for dashboards and CLI queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatusView {
    pub process_id: String,
    pub current_step: Step,
    pub status: ProcessStatus,
    pub awaiting: Option<InputKind>,
    pub head_snapshot_id: Option<String>,
    pub last_error: Option<ErrorRecord>,
    pub updated_at: DateTime<Utc>,
    /// Operator connection of a live session; storage alone never knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
}

#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn DocumentStore>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Gateway over the backend named in configuration
    pub fn from_config(section: &StorageSection) -> Result<Self, ConfigError> {
        let store: Arc<dyn DocumentStore> = match section.backend {
            StorageBackend::Memory => Arc::new(InMemoryDocumentStore::new()),
            StorageBackend::File => {
                let path = section.path.clone().ok_or_else(|| {
                    ConfigError::InvalidConfig(
                        "storage.path is required for the file backend".to_string(),
                    )
                })?;
                Arc::new(FileDocumentStore::new(path))
            }
        };
        Ok(Self::new(store))
    }

    /// Persist the live context. Writing an unchanged context is a no-op.
    /// A failed write is retried once before the error is returned.
    pub async fn save(&self, ctx: &ExecutionContext) -> PersistenceResult<String> {
        let document = serde_json::to_value(ctx).map_err(|e| PersistenceError::Corrupt {
            key: ctx.process_id.clone(),
            message: e.to_string(),
        })?;

        match self.store.get(PROCESSES, &ctx.process_id).await {
            Ok(Some(existing)) if existing == document => {
                debug!(process_id = %ctx.process_id, "Context unchanged, skipping write");
                return Ok(ctx.process_id.clone());
            }
            Ok(_) => {}
            Err(e) => {
                debug!(process_id = %ctx.process_id, error = %e, "Pre-save read failed, writing anyway");
            }
        }

        if let Err(first) = self
            .store
            .upsert(PROCESSES, &ctx.process_id, document.clone())
            .await
        {
            warn!(
                process_id = %ctx.process_id,
                step = %ctx.current_step,
                error = %first,
                "Context save failed, retrying once"
            );
            crate::observability::metrics::metrics().persistence_failure();
            self.store
                .upsert(PROCESSES, &ctx.process_id, document)
                .await?;
        }

        Ok(ctx.process_id.clone())
    }

    pub async fn load(&self, process_id: &str) -> PersistenceResult<ExecutionContext> {
        let document = self.store.get(PROCESSES, process_id).await?.ok_or_else(|| {
            PersistenceError::ProcessNotFound {
                process_id: process_id.to_string(),
            }
        })?;
        decode_context(process_id, document)
    }

    /// Load a context, treating a different owner as not found
    pub async fn load_owned(
        &self,
        process_id: &str,
        owner_id: &str,
    ) -> PersistenceResult<ExecutionContext> {
        let ctx = self.load(process_id).await?;
        if ctx.owner_id != owner_id {
            return Err(PersistenceError::ProcessNotFound {
                process_id: process_id.to_string(),
            });
        }
        Ok(ctx)
    }

    pub async fn exists(&self, process_id: &str) -> PersistenceResult<bool> {
        Ok(self.store.get(PROCESSES, process_id).await?.is_some())
    }

    /// Claim `process_id` against other OS processes sharing the store.
    /// `None` while another holder drives it.
    pub async fn acquire_run_lease(&self, process_id: &str) -> PersistenceResult<Option<RunLease>> {
        Ok(self.store.acquire_lease(process_id).await?)
    }

    /// Record `ctx` after `step` completed and advance HEAD.
    ///
    /// If HEAD already holds this exact context for the same step, the
    /// existing snapshot is returned and nothing is written.
    pub async fn create_snapshot(
        &self,
        ctx: &mut ExecutionContext,
        step: Step,
    ) -> PersistenceResult<Snapshot> {
        if let Some(head_id) = ctx.head_snapshot_id.clone() {
            match self.get_snapshot(&head_id).await {
                Ok(head) if head.step == step && head.context == *ctx => {
                    debug!(process_id = %ctx.process_id, snapshot_id = %head_id, "HEAD already matches context");
                    return Ok(head);
                }
                Ok(_) | Err(PersistenceError::SnapshotNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let snapshot_id = Uuid::new_v4().to_string();
        let parent_id = ctx.head_snapshot_id.replace(snapshot_id.clone());

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            process_id: ctx.process_id.clone(),
            owner_id: ctx.owner_id.clone(),
            parent_id: parent_id.clone(),
            step,
            created_at: Utc::now(),
            context: ctx.clone(),
        };

        if let Err(e) = self.insert_snapshot(&snapshot).await {
            ctx.head_snapshot_id = parent_id;
            return Err(e);
        }
        self.save(ctx).await?;

        crate::observability::metrics::metrics().snapshot_created();
        debug!(
            process_id = %ctx.process_id,
            snapshot_id = %snapshot_id,
            parent_id = ?parent_id,
            step = %step,
            "Snapshot created"
        );
        Ok(snapshot)
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> PersistenceResult<()> {
        if self
            .store
            .get(SNAPSHOTS, &snapshot.snapshot_id)
            .await?
            .is_some()
        {
            return Err(PersistenceError::SnapshotExists {
                snapshot_id: snapshot.snapshot_id.clone(),
            });
        }
        let document = serde_json::to_value(snapshot).map_err(|e| PersistenceError::Corrupt {
            key: snapshot.snapshot_id.clone(),
            message: e.to_string(),
        })?;
        // The id is fresh, so a second upsert of the same document is safe
        if let Err(first) = self
            .store
            .upsert(SNAPSHOTS, &snapshot.snapshot_id, document.clone())
            .await
        {
            warn!(
                process_id = %snapshot.process_id,
                snapshot_id = %snapshot.snapshot_id,
                step = %snapshot.step,
                error = %first,
                "Snapshot write failed, retrying once"
            );
            crate::observability::metrics::metrics().persistence_failure();
            self.store
                .upsert(SNAPSHOTS, &snapshot.snapshot_id, document)
                .await?;
        }
        Ok(())
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> PersistenceResult<Snapshot> {
        let document = self
            .store
            .get(SNAPSHOTS, snapshot_id)
            .await?
            .ok_or_else(|| PersistenceError::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            })?;
        decode(snapshot_id, document)
    }

    /// Check out `snapshot_id` as the live context of `process_id`
    pub async fn restore(
        &self,
        process_id: &str,
        snapshot_id: &str,
        owner_id: &str,
    ) -> PersistenceResult<ExecutionContext> {
        let live = self.load_owned(process_id, owner_id).await?;

        let snapshot = match self.get_snapshot(snapshot_id).await {
            Ok(s) if s.process_id == live.process_id && s.owner_id == live.owner_id => s,
            Ok(_) | Err(PersistenceError::SnapshotNotFound { .. }) => {
                return Err(PersistenceError::SnapshotNotFound {
                    snapshot_id: snapshot_id.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        let mut ctx = snapshot.context;
        ctx.head_snapshot_id = Some(snapshot.snapshot_id.clone());
        ctx.last_error = None;
        let step = ctx.current_step;
        ctx.advance_to(step);
        self.save(&ctx).await?;

        info!(
            process_id = %process_id,
            snapshot_id = %snapshot_id,
            previous_head = ?live.head_snapshot_id,
            resumes_at = %ctx.current_step,
            "Restored snapshot"
        );
        Ok(ctx)
    }

    /// All snapshots of a process, oldest first
    pub async fn list_snapshots(&self, process_id: &str) -> PersistenceResult<Vec<SnapshotSummary>> {
        let ctx = self.load(process_id).await?;
        let filter = DocumentFilter::new().eq("process_id", json!(process_id));
        let mut snapshots = Vec::new();
        for document in self.store.query(SNAPSHOTS, &filter).await? {
            let snapshot: Snapshot = decode("snapshot", document)?;
            snapshots.push(SnapshotSummary {
                is_head: ctx.head_snapshot_id.as_deref() == Some(snapshot.snapshot_id.as_str()),
                snapshot_id: snapshot.snapshot_id,
                parent_id: snapshot.parent_id,
                step: snapshot.step,
                resumes_at: snapshot.context.current_step,
                created_at: snapshot.created_at,
            });
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    /// The chain from `snapshot_id` back to the first snapshot
    pub async fn lineage(&self, snapshot_id: &str) -> PersistenceResult<Vec<Snapshot>> {
        let mut chain = Vec::new();
        let mut cursor = Some(snapshot_id.to_string());
        while let Some(id) = cursor {
            let snapshot = self.get_snapshot(&id).await?;
            cursor = snapshot.parent_id.clone();
            chain.push(snapshot);
        }
        Ok(chain)
    }

    /// Store the final context of a finished run
    pub async fn archive(&self, ctx: &ExecutionContext) -> PersistenceResult<()> {
        let document = json!({
            "process_id": ctx.process_id,
            "owner_id": ctx.owner_id,
            "final_step": ctx.current_step,
            "status": ctx.status,
            "archived_at": Utc::now(),
            "context": ctx,
        });
        self.store
            .upsert(ARCHIVE, &ctx.process_id, document)
            .await?;
        Ok(())
    }

    /// Move a stored process that is not running straight to `cancelled`
    /// and archive it. A finished process is returned unchanged.
    pub async fn cancel_stored(&self, process_id: &str) -> PersistenceResult<ExecutionContext> {
        let mut ctx = self.load(process_id).await?;
        if ctx.is_terminal() {
            return Ok(ctx);
        }
        ctx.advance_to(Step::Cancelled);
        self.save(&ctx).await?;
        if let Err(e) = self.archive(&ctx).await {
            warn!(process_id, error = %e, "Failed to archive cancelled process");
        }
        info!(process_id, "Stored process cancelled");
        Ok(ctx)
    }

    pub async fn archived(&self, process_id: &str) -> PersistenceResult<Option<ExecutionContext>> {
        match self.store.get(ARCHIVE, process_id).await? {
            Some(mut document) => {
                let context = document
                    .get_mut("context")
                    .map(Value::take)
                    .ok_or_else(|| PersistenceError::Corrupt {
                        key: process_id.to_string(),
                        message: "archive entry has no context".to_string(),
                    })?;
                decode_context(process_id, context).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Status read that tolerates slightly stale state
    pub async fn status(&self, process_id: &str) -> PersistenceResult<ProcessStatusView> {
        let ctx = self.load(process_id).await?;
        Ok(ProcessStatusView {
            awaiting: ctx.pending_input.as_ref().map(|r| r.kind),
            process_id: ctx.process_id,
            current_step: ctx.current_step,
            status: ctx.status,
            head_snapshot_id: ctx.head_snapshot_id,
            last_error: ctx.last_error,
            updated_at: ctx.updated_at,
            connection: None,
        })
    }

    /// Processes left waiting on the operator, e.g. after a restart
    pub async fn awaiting_input(&self) -> PersistenceResult<Vec<ProcessStatusView>> {
        let filter = DocumentFilter::new().eq("status", json!(ProcessStatus::AwaitingInput));
        let mut views = Vec::new();
        for document in self.store.query(PROCESSES, &filter).await? {
            let ctx = decode_context("process", document)?;
            views.push(self.status(&ctx.process_id).await?);
        }
        Ok(views)
    }

    pub async fn telemetry_for(&self, process_id: &str) -> PersistenceResult<Vec<InvocationTelemetry>> {
        let filter = DocumentFilter::new().eq("process_id", json!(process_id));
        self.store
            .query(TELEMETRY, &filter)
            .await?
            .into_iter()
            .map(|doc| decode("telemetry", doc))
            .collect()
    }
}

#[async_trait]
impl TelemetrySink for PersistenceGateway {
    async fn record(&self, telemetry: &InvocationTelemetry) -> Result<(), TelemetryError> {
        let document = serde_json::to_value(telemetry).map_err(|e| TelemetryError::new(e.to_string()))?;
        self.store
            .upsert(TELEMETRY, &telemetry.invocation_id, document)
            .await
            .map_err(|e| TelemetryError::new(e.to_string()))
    }
}

fn decode<T: DeserializeOwned>(key: &str, document: Value) -> PersistenceResult<T> {
    serde_json::from_value(document).map_err(|e| PersistenceError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn decode_context(key: &str, document: Value) -> PersistenceResult<ExecutionContext> {
    // Surface unknown step names as step errors rather than generic corruption
    if let Some(name) = document.get("current_step").and_then(Value::as_str) {
        steps::resolve(name)?;
    }
    decode(key, document)
}
