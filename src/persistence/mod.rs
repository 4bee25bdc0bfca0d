//! Durable state for pipeline runs
//!
//! [`PersistenceGateway`] stores the live [`ExecutionContext`] of every
//! process, an immutable snapshot chain per process, archived terminal
//! contexts and best-effort invocation telemetry, all on top of a keyed
//! [`DocumentStore`].

pub mod gateway;
pub mod store;

pub use gateway::{PersistenceGateway, ProcessStatusView, Snapshot, SnapshotSummary};
pub use store::{
    DocumentFilter, DocumentStore, FileDocumentStore, InMemoryDocumentStore, RunLease, StoreError,
};

use crate::steps::StepError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Process not found: {process_id}")]
    ProcessNotFound { process_id: String },

    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Snapshot {snapshot_id} already exists and cannot be modified")]
    SnapshotExists { snapshot_id: String },

    #[error("Stored document {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
