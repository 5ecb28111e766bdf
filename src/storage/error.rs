// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use thiserror::Error;

/// Error taxonomy of the storage core.
///
/// Every variant is returned to the immediate caller of the shard queue; the
/// worker resolves each dequeued request exactly once, with success or one of
/// these.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("duplicated {0}: {1}")]
    AlreadyExists(&'static str, String),
    /// Backpressure, not data loss. The caller should retry.
    #[error("shard queue is full")]
    QueueFull,
    /// The shard is shutting down while the request was pending.
    #[error("shard queue stopped")]
    Cancelled,
    /// The append would exceed a block's fixed row capacity; route the rows
    /// to a new block instead.
    #[error("block capacity exceeded: {left} rows left, {requested} requested")]
    CapacityExceeded { left: u32, requested: u32 },
    /// Decompression or structural check failure on read. Fatal for the
    /// block, not retried automatically.
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("invalid column index: {0}")]
    InvalidColumn(usize),
    #[error("invalid batch or schema: {0}")]
    InvalidBatch(String),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("JSON decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
}

impl From<std::io::Error> for StorageError {
    #[inline]
    fn from(e: std::io::Error) -> StorageError {
        StorageError::Io(e.into())
    }
}

impl StorageError {
    pub fn not_found(ty: &'static str, item: impl ToString) -> Self {
        StorageError::NotFound(ty, item.to_string())
    }

    pub fn already_exists(ty: &'static str, item: impl ToString) -> Self {
        StorageError::AlreadyExists(ty, item.to_string())
    }

    pub fn corrupt(message: impl ToString) -> Self {
        StorageError::CorruptData(message.to_string())
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
