// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Strata is the storage core of a columnar database: it durably records
//! writes, organizes them into immutable on-disk column blocks, and
//! maintains a versioned catalog of databases, tables, segments and blocks
//! with point-in-time views and asynchronous compaction of deleted objects.
//!
//! Each shard owns an independent command queue, operation-index sequence
//! and durable safe id; operations against one shard are totally ordered,
//! while shards proceed in parallel.

pub mod batch;
pub mod compress;
pub mod storage;
pub mod types;

pub use batch::{Batch, Column};
pub use storage::{StorageEngine, StorageError, StorageOptions, StorageResult};
