// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use std::collections::{BTreeMap, HashMap};

use super::table::{TableId, TableMeta};
use crate::storage::wal::{OpIndex, ShardId};

pub type DatabaseId = u64;

/// Metadata of one database: owning shard, lifecycle indices, and the table
/// arena with its name index.
///
/// The name index always points at the latest incarnation of a name; older
/// soft-deleted incarnations stay in the arena until compaction so that
/// historical views keep resolving.
#[derive(Debug)]
pub struct DatabaseMeta {
    pub id: DatabaseId,
    pub name: String,
    pub shard_id: ShardId,
    pub create_index: OpIndex,
    pub delete_index: Option<OpIndex>,
    pub(super) tables: BTreeMap<TableId, TableMeta>,
    pub(super) table_names: HashMap<String, TableId>,
    pub(super) next_table_id: TableId,
}

impl DatabaseMeta {
    pub fn new(id: DatabaseId, name: String, shard_id: ShardId, create_index: OpIndex) -> Self {
        Self {
            id,
            name,
            shard_id,
            create_index,
            delete_index: None,
            tables: BTreeMap::new(),
            table_names: HashMap::new(),
            next_table_id: 1,
        }
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.delete_index.is_some()
    }

    pub fn is_visible_at(&self, version: OpIndex) -> bool {
        self.create_index <= version && self.delete_index.map_or(true, |d| version < d)
    }

    /// The id of the currently visible (not soft-deleted) table under `name`.
    pub fn visible_table_id(&self, name: &str) -> Option<TableId> {
        let id = *self.table_names.get(name)?;
        let table = self.tables.get(&id)?;
        (!table.is_soft_deleted()).then_some(id)
    }

    pub fn table(&self, id: TableId) -> Option<&TableMeta> {
        self.tables.get(&id)
    }

    pub fn table_mut(&mut self, id: TableId) -> Option<&mut TableMeta> {
        self.tables.get_mut(&id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values()
    }

    pub(super) fn insert_table(&mut self, table: TableMeta) {
        self.table_names
            .insert(table.name().to_string(), table.id);
        self.next_table_id = self.next_table_id.max(table.id + 1);
        self.tables.insert(table.id, table);
    }

    pub(super) fn allocate_table_id(&mut self) -> TableId {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }

    /// Physically remove a table; the name index entry goes with it only if
    /// it still points at this incarnation.
    pub(super) fn remove_table(&mut self, id: TableId) -> Option<TableMeta> {
        let table = self.tables.remove(&id)?;
        if self.table_names.get(table.name()) == Some(&id) {
            self.table_names.remove(table.name());
        }
        Some(table)
    }
}
