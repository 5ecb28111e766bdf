// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Versioned metadata graph: Database → Table → Segment → Block.
//!
//! Entities live in per-level arenas keyed by stable integer ids, with
//! parent ids instead of owning pointers. Lifecycle fields (`create_index`,
//! `delete_index`) are set exactly once, which is what makes concurrent
//! [`view`](Catalog::view) snapshots sound: a view filters on those fields
//! and never follows mutable links.
//!
//! All mutators take the operation index assigned by the owning shard's
//! queue; the catalog itself allocates nothing.

mod database;
mod listener;
mod schema;
mod segment;
mod table;
mod view;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

pub use self::database::{DatabaseId, DatabaseMeta};
pub use self::listener::{CompactedDatabase, CompactedTable, CompactionOutcome};
pub use self::schema::{ColumnDef, Schema};
pub use self::segment::{BlockId, BlockMeta, SegmentId, SegmentMeta, SegmentState};
pub use self::table::{TableId, TableMeta};
pub use self::view::{DatabaseView, TableView, View};

use super::wal::{LogRange, OpIndex, ShardId, WalTracker};
use super::{StorageError, StorageResult};

/// Storage-shape configuration stamped onto tables at creation time.
#[derive(Clone, Copy, Debug)]
pub struct CatalogCfg {
    pub block_max_rows: u32,
    pub segment_max_blocks: u32,
}

/// Result of soft-deleting a database: the tables dropped in cascade at the
/// same operation index.
#[derive(Debug)]
pub struct DroppedDatabase {
    pub id: DatabaseId,
    pub shard_id: ShardId,
    pub cascaded_tables: Vec<TableId>,
}

/// Everything the append path needs to know about its target table.
#[derive(Clone, Debug)]
pub struct ResolvedTable {
    pub database_id: DatabaseId,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub schema: Arc<Schema>,
    pub block_max_rows: u32,
    pub segment_max_blocks: u32,
}

#[derive(Default)]
struct CatalogInner {
    databases: BTreeMap<DatabaseId, DatabaseMeta>,
    database_names: HashMap<String, DatabaseId>,
    next_database_id: DatabaseId,
}

impl CatalogInner {
    fn visible_database_id(&self, name: &str) -> Option<DatabaseId> {
        let id = *self.database_names.get(name)?;
        let db = self.databases.get(&id)?;
        (!db.is_soft_deleted()).then_some(id)
    }

    fn visible_database_mut(&mut self, name: &str) -> StorageResult<&mut DatabaseMeta> {
        let id = self
            .visible_database_id(name)
            .ok_or_else(|| StorageError::not_found("database", name))?;
        Ok(self.databases.get_mut(&id).unwrap())
    }
}

/// Root of the metadata graph. One per storage instance.
pub struct Catalog {
    cfg: CatalogCfg,
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    pub fn new(cfg: CatalogCfg) -> Self {
        Self {
            cfg,
            inner: RwLock::new(CatalogInner {
                next_database_id: 1,
                ..CatalogInner::default()
            }),
        }
    }

    pub fn cfg(&self) -> CatalogCfg {
        self.cfg
    }

    pub fn create_database(
        &self,
        name: &str,
        shard_id: ShardId,
        op_index: OpIndex,
    ) -> StorageResult<DatabaseId> {
        let mut inner = self.inner.write();
        if inner.visible_database_id(name).is_some() {
            return Err(StorageError::already_exists("database", name));
        }
        let id = inner.next_database_id;
        inner.next_database_id += 1;
        inner
            .databases
            .insert(id, DatabaseMeta::new(id, name.to_string(), shard_id, op_index));
        inner.database_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Replay path: re-insert a database under its recorded id.
    pub fn create_database_with_id(
        &self,
        id: DatabaseId,
        name: &str,
        shard_id: ShardId,
        op_index: OpIndex,
    ) {
        let mut inner = self.inner.write();
        inner.next_database_id = inner.next_database_id.max(id + 1);
        inner
            .databases
            .insert(id, DatabaseMeta::new(id, name.to_string(), shard_id, op_index));
        inner.database_names.insert(name.to_string(), id);
    }

    /// Soft-delete a database and, in cascade at the same index, every table
    /// of it that is still live.
    pub fn drop_database(&self, name: &str, op_index: OpIndex) -> StorageResult<DroppedDatabase> {
        let mut inner = self.inner.write();
        let db = inner.visible_database_mut(name)?;
        db.delete_index = Some(op_index);
        let mut cascaded = Vec::new();
        let shard_id = db.shard_id;
        let id = db.id;
        for table in db.tables.values_mut() {
            if table.delete_index.is_none() {
                table.delete_index = Some(op_index);
                cascaded.push(table.id);
            }
        }
        Ok(DroppedDatabase {
            id,
            shard_id,
            cascaded_tables: cascaded,
        })
    }

    pub fn create_table(
        &self,
        db_name: &str,
        schema: Schema,
        op_index: OpIndex,
    ) -> StorageResult<(DatabaseId, TableId)> {
        schema.validate()?;
        let cfg = self.cfg;
        let mut inner = self.inner.write();
        let db = inner.visible_database_mut(db_name)?;
        if db.visible_table_id(&schema.name).is_some() {
            return Err(StorageError::already_exists("table", &schema.name));
        }
        let table_id = db.allocate_table_id();
        let db_id = db.id;
        db.insert_table(TableMeta::new(
            table_id,
            db_id,
            Arc::new(schema),
            op_index,
            cfg.block_max_rows,
            cfg.segment_max_blocks,
        ));
        Ok((db_id, table_id))
    }

    /// Replay path: re-insert a table under its recorded ids and capacities.
    pub fn create_table_with_id(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
        schema: Schema,
        op_index: OpIndex,
        block_max_rows: u32,
        segment_max_blocks: u32,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let db = inner
            .databases
            .get_mut(&database_id)
            .ok_or_else(|| StorageError::not_found("database", database_id))?;
        db.insert_table(TableMeta::new(
            table_id,
            database_id,
            Arc::new(schema),
            op_index,
            block_max_rows,
            segment_max_blocks,
        ));
        Ok(())
    }

    pub fn drop_table(
        &self,
        db_name: &str,
        table_name: &str,
        op_index: OpIndex,
    ) -> StorageResult<(DatabaseId, TableId)> {
        let mut inner = self.inner.write();
        let db = inner.visible_database_mut(db_name)?;
        let table_id = db
            .visible_table_id(table_name)
            .ok_or_else(|| StorageError::not_found("table", table_name))?;
        let db_id = db.id;
        db.table_mut(table_id).unwrap().delete_index = Some(op_index);
        Ok((db_id, table_id))
    }

    /// Shard owning the named database; used to route requests.
    pub fn shard_of_database(&self, name: &str) -> StorageResult<ShardId> {
        let inner = self.inner.read();
        let id = inner
            .visible_database_id(name)
            .ok_or_else(|| StorageError::not_found("database", name))?;
        Ok(inner.databases[&id].shard_id)
    }

    pub fn resolve_table(&self, db_name: &str, table_name: &str) -> StorageResult<ResolvedTable> {
        let inner = self.inner.read();
        let db_id = inner
            .visible_database_id(db_name)
            .ok_or_else(|| StorageError::not_found("database", db_name))?;
        let db = &inner.databases[&db_id];
        let table_id = db
            .visible_table_id(table_name)
            .ok_or_else(|| StorageError::not_found("table", table_name))?;
        let table = db.table(table_id).unwrap();
        Ok(ResolvedTable {
            database_id: db_id,
            table_id,
            shard_id: db.shard_id,
            schema: table.schema.clone(),
            block_max_rows: table.block_max_rows,
            segment_max_blocks: table.segment_max_blocks,
        })
    }

    /// The (segment, block) the next append to the table should land in,
    /// together with the block's current row count and capacity.
    pub fn append_target(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
    ) -> StorageResult<(SegmentId, BlockId, u32, u32)> {
        let mut inner = self.inner.write();
        let table = inner
            .databases
            .get_mut(&database_id)
            .and_then(|db| db.table_mut(table_id))
            .ok_or_else(|| StorageError::not_found("table", table_id))?;
        let (seg_id, blk_id) = table.append_target();
        let blk = &table.segments[&seg_id].blocks[&blk_id];
        Ok((seg_id, blk_id, blk.row_count, blk.capacity))
    }

    /// Create-if-absent registration of a segment under a table.
    pub fn simple_get_segment(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
        segment_id: SegmentId,
    ) -> StorageResult<SegmentId> {
        let mut inner = self.inner.write();
        let table = inner
            .databases
            .get_mut(&database_id)
            .and_then(|db| db.table_mut(table_id))
            .ok_or_else(|| StorageError::not_found("table", table_id))?;
        table.get_or_create_segment(segment_id);
        Ok(segment_id)
    }

    /// Create-if-absent registration of a block; returns its metadata.
    pub fn simple_get_block(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
        segment_id: SegmentId,
        block_id: BlockId,
    ) -> StorageResult<BlockMeta> {
        let mut inner = self.inner.write();
        let table = inner
            .databases
            .get_mut(&database_id)
            .and_then(|db| db.table_mut(table_id))
            .ok_or_else(|| StorageError::not_found("table", table_id))?;
        let capacity = table.block_max_rows;
        let seg = table.get_or_create_segment(segment_id);
        Ok(seg.get_or_create_block(block_id, capacity).clone())
    }

    /// Record the durable row count and log range of a block after a sync.
    pub fn record_block(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
        segment_id: SegmentId,
        block_id: BlockId,
        rows: u32,
        range: LogRange,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let table = inner
            .databases
            .get_mut(&database_id)
            .and_then(|db| db.table_mut(table_id))
            .ok_or_else(|| StorageError::not_found("table", table_id))?;
        let capacity = table.block_max_rows;
        let seg = table.get_or_create_segment(segment_id);
        seg.get_or_create_block(block_id, capacity).record(rows, range);
        Ok(())
    }

    /// Read-only snapshot at `version`; see the module docs for the
    /// visibility rule.
    pub fn view(&self, version: OpIndex) -> View {
        let inner = self.inner.read();
        let databases = inner
            .databases
            .values()
            .filter(|db| db.is_visible_at(version))
            .map(|db| {
                let tables = db
                    .tables()
                    .filter(|t| t.is_visible_at(version))
                    .map(|t| TableView {
                        id: t.id,
                        name: t.name().to_string(),
                        schema: t.schema.clone(),
                        row_count: t.row_count(),
                    })
                    .collect();
                DatabaseView::new(db.id, db.name.clone(), db.shard_id, tables)
            })
            .collect();
        View::new(version, databases)
    }

    /// Hard-delete every soft-deleted entity whose deletion index is durable
    /// (`delete_index <= safe_id` of the owning shard), invoking the
    /// listeners exactly once per removed entity.
    ///
    /// Tables are compacted independently of their database's own pending
    /// deletion; a database goes only once its table arena is empty. With no
    /// newly-safe deletions the pass removes nothing.
    pub fn compact(
        &self,
        wal: &WalTracker,
        db_listener: &mut dyn FnMut(&CompactedDatabase),
        table_listener: &mut dyn FnMut(&CompactedTable),
    ) -> CompactionOutcome {
        let mut outcome = CompactionOutcome::default();
        let mut inner = self.inner.write();

        for db in inner.databases.values_mut() {
            let safe_id = wal.shard_checkpoint_id(db.shard_id);
            let victims: Vec<TableId> = db
                .tables()
                .filter(|t| t.delete_index.map_or(false, |d| d <= safe_id))
                .map(|t| t.id)
                .collect();
            for table_id in victims {
                let table = db.remove_table(table_id).unwrap();
                let compacted = CompactedTable {
                    database_id: db.id,
                    id: table.id,
                    name: table.name().to_string(),
                };
                table_listener(&compacted);
                outcome.tables.push(compacted);
            }
        }

        let db_victims: Vec<DatabaseId> = inner
            .databases
            .values()
            .filter(|db| {
                db.delete_index
                    .map_or(false, |d| d <= wal.shard_checkpoint_id(db.shard_id))
                    && db.tables().next().is_none()
            })
            .map(|db| db.id)
            .collect();
        for id in db_victims {
            let db = inner.databases.remove(&id).unwrap();
            if inner.database_names.get(&db.name) == Some(&id) {
                inner.database_names.remove(&db.name);
            }
            let compacted = CompactedDatabase {
                id: db.id,
                name: db.name,
                shard_id: db.shard_id,
            };
            db_listener(&compacted);
            outcome.databases.push(compacted);
        }

        outcome
    }

    /// Replay path: soft-delete a database by id, cascading to its live
    /// tables exactly like [`Self::drop_database`].
    pub fn soft_delete_database(&self, id: DatabaseId, op_index: OpIndex) {
        let mut inner = self.inner.write();
        if let Some(db) = inner.databases.get_mut(&id) {
            db.delete_index = Some(op_index);
            for table in db.tables.values_mut() {
                if table.delete_index.is_none() {
                    table.delete_index = Some(op_index);
                }
            }
        }
    }

    /// Replay path counterpart of [`Self::drop_table`].
    pub fn soft_delete_table(&self, database_id: DatabaseId, table_id: TableId, op_index: OpIndex) {
        let mut inner = self.inner.write();
        if let Some(table) = inner
            .databases
            .get_mut(&database_id)
            .and_then(|db| db.table_mut(table_id))
        {
            table.delete_index = Some(op_index);
        }
    }

    /// Replay path: physically remove entities recorded as hard-deleted.
    pub fn remove_table(&self, database_id: DatabaseId, table_id: TableId) {
        let mut inner = self.inner.write();
        if let Some(db) = inner.databases.get_mut(&database_id) {
            db.remove_table(table_id);
        }
    }

    /// Replay path counterpart of [`Self::remove_table`] for databases.
    pub fn remove_database(&self, id: DatabaseId) {
        let mut inner = self.inner.write();
        if let Some(db) = inner.databases.remove(&id) {
            if inner.database_names.get(&db.name) == Some(&id) {
                inner.database_names.remove(&db.name);
            }
        }
    }

    /// Roll back a create that could not be logged.
    pub fn forget_table(&self, database_id: DatabaseId, table_id: TableId) {
        self.remove_table(database_id, table_id);
    }

    /// Roll back a create that could not be logged.
    pub fn forget_database(&self, id: DatabaseId) {
        self.remove_database(id);
    }

    /// Roll back a drop that could not be logged.
    pub fn undo_drop_table(&self, database_id: DatabaseId, table_id: TableId) {
        let mut inner = self.inner.write();
        if let Some(table) = inner
            .databases
            .get_mut(&database_id)
            .and_then(|db| db.table_mut(table_id))
        {
            table.delete_index = None;
        }
    }

    /// Roll back a drop that could not be logged, including its cascade.
    pub fn undo_drop_database(&self, dropped: &DroppedDatabase) {
        let mut inner = self.inner.write();
        if let Some(db) = inner.databases.get_mut(&dropped.id) {
            db.delete_index = None;
            for table_id in &dropped.cascaded_tables {
                if let Some(table) = db.table_mut(*table_id) {
                    table.delete_index = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressAlgo;
    use crate::types::{PhysicalType, Type};

    fn cfg() -> CatalogCfg {
        CatalogCfg {
            block_max_rows: 10,
            segment_max_blocks: 4,
        }
    }

    fn schema(name: &str) -> Schema {
        Schema::new(
            name,
            vec![ColumnDef::new(
                "v",
                Type::new(PhysicalType::Int32),
                CompressAlgo::Lz4,
            )],
        )
    }

    #[test]
    fn test_view_consistency_window() {
        let catalog = Catalog::new(cfg());
        catalog.create_database("db1", 1, 5).unwrap();
        catalog.drop_database("db1", 12).unwrap();

        assert!(catalog.view(4).database("db1").is_none());
        assert!(catalog.view(5).database("db1").is_some());
        assert!(catalog.view(10).database("db1").is_some());
        assert!(catalog.view(12).database("db1").is_none());
    }

    #[test]
    fn test_duplicate_and_missing_entities() {
        let catalog = Catalog::new(cfg());
        catalog.create_database("db1", 1, 1).unwrap();
        assert!(matches!(
            catalog.create_database("db1", 1, 2),
            Err(StorageError::AlreadyExists("database", _))
        ));

        catalog.create_table("db1", schema("t1"), 3).unwrap();
        assert!(matches!(
            catalog.create_table("db1", schema("t1"), 4),
            Err(StorageError::AlreadyExists("table", _))
        ));
        assert!(matches!(
            catalog.create_table("nodb", schema("t2"), 5),
            Err(StorageError::NotFound("database", _))
        ));

        catalog.drop_table("db1", "t1", 6).unwrap();
        // second drop of the same entity reports NotFound
        assert!(matches!(
            catalog.drop_table("db1", "t1", 7),
            Err(StorageError::NotFound("table", _))
        ));
    }

    #[test]
    fn test_name_reuse_after_soft_delete() {
        let catalog = Catalog::new(cfg());
        catalog.create_database("db1", 1, 1).unwrap();
        let (_, old_id) = catalog.create_table("db1", schema("t"), 2).unwrap();
        catalog.drop_table("db1", "t", 3).unwrap();
        let (_, new_id) = catalog.create_table("db1", schema("t"), 4).unwrap();
        assert_ne!(old_id, new_id);

        // the old incarnation still resolves in historical views
        let view = catalog.view(2);
        let db = view.database("db1").unwrap();
        assert_eq!(db.tables().len(), 1);
        assert_eq!(db.tables()[0].id, old_id);

        let view = catalog.view(4);
        assert_eq!(view.database("db1").unwrap().tables()[0].id, new_id);
    }

    #[test]
    fn test_compaction_gated_on_safe_id() {
        let catalog = Catalog::new(cfg());
        let wal = WalTracker::new();
        catalog.create_database("db1", 1, 1).unwrap();
        catalog.create_table("db1", schema("t"), 2).unwrap();
        catalog.drop_table("db1", "t", 3).unwrap();

        let mut db_hits = 0;
        let mut tbl_hits = 0;

        wal.advance(1, 2);
        let outcome = catalog.compact(&wal, &mut |_| db_hits += 1, &mut |_| tbl_hits += 1);
        assert!(outcome.is_empty());
        assert_eq!((db_hits, tbl_hits), (0, 0));

        wal.advance(1, 3);
        let outcome = catalog.compact(&wal, &mut |_| db_hits += 1, &mut |_| tbl_hits += 1);
        assert_eq!(outcome.tables.len(), 1);
        assert_eq!((db_hits, tbl_hits), (0, 1));

        // idempotent: nothing newly safe, zero callbacks
        let outcome = catalog.compact(&wal, &mut |_| db_hits += 1, &mut |_| tbl_hits += 1);
        assert!(outcome.is_empty());
        assert_eq!((db_hits, tbl_hits), (0, 1));
    }

    #[test]
    fn test_database_compaction_requires_empty_table_arena() {
        let catalog = Catalog::new(cfg());
        let wal = WalTracker::new();
        catalog.create_database("db1", 1, 1).unwrap();
        catalog.create_table("db1", schema("t"), 2).unwrap();
        let dropped = catalog.drop_database("db1", 3).unwrap();
        assert_eq!(dropped.cascaded_tables.len(), 1);

        wal.advance(1, 3);
        let mut db_hits = 0;
        let mut tbl_hits = 0;
        let outcome = catalog.compact(&wal, &mut |_| db_hits += 1, &mut |_| tbl_hits += 1);
        // tables go first, then the emptied database, in one pass
        assert_eq!(outcome.tables.len(), 1);
        assert_eq!(outcome.databases.len(), 1);
        assert_eq!((db_hits, tbl_hits), (1, 1));
    }

    #[test]
    fn test_simple_get_creates_segments_and_blocks() {
        let catalog = Catalog::new(cfg());
        catalog.create_database("db1", 100, 1).unwrap();
        let (db_id, tbl_id) = catalog.create_table("db1", schema("t"), 2).unwrap();

        let seg = catalog.simple_get_segment(db_id, tbl_id, 1).unwrap();
        assert_eq!(seg, 1);
        let blk = catalog.simple_get_block(db_id, tbl_id, 1, 1).unwrap();
        assert_eq!(blk.capacity, 10);
        assert_eq!(blk.row_count, 0);

        catalog
            .record_block(db_id, tbl_id, 1, 1, 4, LogRange::single(3))
            .unwrap();
        let blk = catalog.simple_get_block(db_id, tbl_id, 1, 1).unwrap();
        assert_eq!(blk.row_count, 4);
        assert_eq!(blk.log_range, Some(LogRange { start: 3, end: 3 }));
    }
}
