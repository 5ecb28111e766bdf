// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Read-only catalog snapshots.
//!
//! A view is computed by filtering entities on their lifecycle indices: an
//! entity is present iff `create_index <= version` and its deletion index is
//! absent or greater than `version`. Views copy out ids, names and schema
//! handles; they never touch shared mutable state afterwards.

use std::sync::Arc;

use super::schema::Schema;
use super::table::TableId;
use super::DatabaseId;
use crate::storage::wal::{OpIndex, ShardId};

/// Snapshot of one table visible in a view.
#[derive(Clone, Debug)]
pub struct TableView {
    pub id: TableId,
    pub name: String,
    pub schema: Arc<Schema>,
    pub row_count: u64,
}

/// Snapshot of one database visible in a view.
#[derive(Clone, Debug)]
pub struct DatabaseView {
    pub id: DatabaseId,
    pub name: String,
    pub shard_id: ShardId,
    tables: Vec<TableView>,
}

impl DatabaseView {
    pub(super) fn new(
        id: DatabaseId,
        name: String,
        shard_id: ShardId,
        tables: Vec<TableView>,
    ) -> Self {
        Self {
            id,
            name,
            shard_id,
            tables,
        }
    }

    pub fn tables(&self) -> &[TableView] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableView> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Read-only snapshot of the whole catalog at one operation index.
#[derive(Clone, Debug)]
pub struct View {
    pub version: OpIndex,
    databases: Vec<DatabaseView>,
}

impl View {
    pub(super) fn new(version: OpIndex, databases: Vec<DatabaseView>) -> Self {
        Self { version, databases }
    }

    pub fn databases(&self) -> &[DatabaseView] {
        &self.databases
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseView> {
        self.databases.iter().find(|d| d.name == name)
    }
}
