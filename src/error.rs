//! Error taxonomy for the telemetry engine.
//!
//! - [`StoreError`]: a single durable-store operation failed.
//! - [`PersistError`]: a history batch could not be written even after the
//!   synchronizer's retry. The batch travels with the error so the caller can
//!   reschedule it; nothing is dropped.
//! - [`CoreError`]: what query-path callers see, including rejected arguments.
//! - [`DataQualityWarning`]: not an error. An unparsable reading was
//!   defaulted to `0.0`; it is logged and reported, never fatal.
//!
//! Malformed telemetry is rejected by the decoder before it reaches the
//! core, so there is no decode variant here.

use serde::Serialize;
use thiserror::Error;

use crate::model::HistoryRecord;

/// Failure of a single durable-store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be mapped back into a model type.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// The store is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A history batch that could not be persisted.
#[derive(Debug, Error)]
#[error("failed to persist {} history records after {attempts} attempts: {source}", .batch.len())]
pub struct PersistError {
    /// The untouched batch, for the caller to retry later.
    pub batch: Vec<HistoryRecord>,
    pub attempts: u32,
    #[source]
    pub source: StoreError,
}

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The caller passed an argument outside the operation's domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A background computation panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidArgument(message.into())
    }
}

/// An unparsable numeric field that was defaulted during normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("device {device_id}: unparsable {field} value {raw:?}, defaulted")]
pub struct DataQualityWarning {
    pub device_id: String,
    pub field: &'static str,
    pub raw: String,
}
