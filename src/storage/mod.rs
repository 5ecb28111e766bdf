// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! The storage engine facade.
//!
//! [`StorageEngine`] composes the per-shard command queues, the versioned
//! catalog, the metadata log and the block codec into the operations exposed
//! to callers: `create_database`, `create_table`, `drop_table`,
//! `drop_database` and `append`. Each request is routed to the owning
//! shard's queue; the queue's single worker allocates the operation index,
//! applies the mutation, waits for durability, advances the shard's safe id
//! and resolves the caller.

pub mod block;
pub mod catalog;
mod error;
mod metalog;
mod options;
mod shard;
mod wal;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use self::error::{StorageError, StorageResult};
pub use self::options::StorageOptions;
pub use self::shard::{OpOutput, ShardRequest};
pub use self::wal::{IndexAllocator, LogRange, OpIndex, ShardId, WalTracker};

use self::block::{BufferPool, TransientBlockFile, UnsortedSegmentFile};
use self::catalog::{
    BlockId, Catalog, CatalogCfg, CompactedDatabase, CompactedTable, CompactionOutcome,
    DatabaseId, ResolvedTable, Schema, SegmentId, TableId, View,
};
use self::metalog::{
    BlockSyncEntry, CreateDatabaseEntry, CreateTableEntry, DropDatabaseEntry, DropTableEntry,
    HardDeleteDatabaseEntry, HardDeleteTableEntry, MetaLog, MetaRecord,
};
use self::shard::ShardQueue;
use crate::batch::Batch;

const META_LOG_FILE_NAME: &str = "meta.log";

/// The tail block one table is currently appending into.
struct ActiveBlock {
    segment_id: SegmentId,
    block_id: BlockId,
    file: TransientBlockFile,
}

/// Engine-side runtime state of one table, owned by the shard worker of the
/// table's database.
#[derive(Default)]
struct TableData {
    active: Option<ActiveBlock>,
}

/// State shared between the engine facade and the shard workers.
pub(crate) struct EngineCore {
    options: StorageOptions,
    catalog: Catalog,
    wal: WalTracker,
    allocator: IndexAllocator,
    metalog: tokio::sync::Mutex<MetaLog>,
    buffers: Arc<BufferPool>,
    tables: Mutex<HashMap<(DatabaseId, TableId), Arc<tokio::sync::Mutex<TableData>>>>,
}

impl EngineCore {
    fn table_dir(&self, database_id: DatabaseId, table_id: TableId) -> PathBuf {
        self.options
            .path
            .join(format!("tbl_{}_{}", database_id, table_id))
    }

    fn segment_dir(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
        segment_id: SegmentId,
    ) -> PathBuf {
        self.table_dir(database_id, table_id)
            .join(format!("seg_{}", segment_id))
    }

    fn table_data(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
    ) -> Arc<tokio::sync::Mutex<TableData>> {
        self.tables
            .lock()
            .entry((database_id, table_id))
            .or_default()
            .clone()
    }

    /// Process one dequeued request. Runs on the shard's single worker, so
    /// everything touching this shard's catalog subtree is serialized.
    pub(crate) async fn process(
        self: &Arc<Self>,
        shard_id: ShardId,
        request: ShardRequest,
    ) -> StorageResult<OpOutput> {
        match request {
            ShardRequest::CreateDatabase { name } => {
                self.process_create_database(shard_id, name).await
            }
            ShardRequest::DropDatabase { name } => {
                self.process_drop_database(shard_id, name).await
            }
            ShardRequest::CreateTable { database, schema } => {
                self.process_create_table(shard_id, database, schema).await
            }
            ShardRequest::DropTable { database, table } => {
                self.process_drop_table(shard_id, database, table).await
            }
            ShardRequest::Append {
                database,
                table,
                batch,
            } => self.process_append(shard_id, database, table, batch).await,
        }
    }

    async fn process_create_database(
        self: &Arc<Self>,
        shard_id: ShardId,
        name: String,
    ) -> StorageResult<OpOutput> {
        let op_index = self.allocator.shard(shard_id).alloc();
        let database_id = self.catalog.create_database(&name, shard_id, op_index)?;
        let record = MetaRecord::CreateDatabase(CreateDatabaseEntry {
            database_id,
            name: name.clone(),
            shard_id,
            op_index,
        });
        if let Err(e) = self.metalog.lock().await.append(&[record]).await {
            self.catalog.forget_database(database_id);
            return Err(e);
        }
        self.wal.advance(shard_id, op_index);
        info!(database = %name, shard_id, op_index, "database created");
        Ok(OpOutput::Database(database_id))
    }

    async fn process_drop_database(
        self: &Arc<Self>,
        shard_id: ShardId,
        name: String,
    ) -> StorageResult<OpOutput> {
        let op_index = self.allocator.shard(shard_id).alloc();
        let dropped = self.catalog.drop_database(&name, op_index)?;
        if dropped.shard_id != shard_id {
            // routed on stale metadata; the database moved under our feet
            self.catalog.undo_drop_database(&dropped);
            return Err(StorageError::not_found("database", &name));
        }
        let record = MetaRecord::DropDatabase(DropDatabaseEntry {
            database_id: dropped.id,
            shard_id,
            op_index,
        });
        if let Err(e) = self.metalog.lock().await.append(&[record]).await {
            self.catalog.undo_drop_database(&dropped);
            return Err(e);
        }
        self.wal.advance(shard_id, op_index);
        info!(database = %name, shard_id, op_index, "database dropped");
        Ok(OpOutput::Done)
    }

    async fn process_create_table(
        self: &Arc<Self>,
        shard_id: ShardId,
        database: String,
        schema: Schema,
    ) -> StorageResult<OpOutput> {
        if self.catalog.shard_of_database(&database)? != shard_id {
            return Err(StorageError::not_found("database", &database));
        }
        let op_index = self.allocator.shard(shard_id).alloc();
        let (database_id, table_id) =
            self.catalog.create_table(&database, schema.clone(), op_index)?;
        let cfg = self.catalog.cfg();
        let record = MetaRecord::CreateTable(CreateTableEntry {
            database_id,
            table_id,
            schema,
            shard_id,
            op_index,
            block_max_rows: cfg.block_max_rows,
            segment_max_blocks: cfg.segment_max_blocks,
        });
        if let Err(e) = self.metalog.lock().await.append(&[record]).await {
            self.catalog.forget_table(database_id, table_id);
            return Err(e);
        }
        self.wal.advance(shard_id, op_index);
        Ok(OpOutput::Table(table_id))
    }

    async fn process_drop_table(
        self: &Arc<Self>,
        shard_id: ShardId,
        database: String,
        table: String,
    ) -> StorageResult<OpOutput> {
        if self.catalog.shard_of_database(&database)? != shard_id {
            return Err(StorageError::not_found("database", &database));
        }
        let op_index = self.allocator.shard(shard_id).alloc();
        let (database_id, table_id) = self.catalog.drop_table(&database, &table, op_index)?;
        let record = MetaRecord::DropTable(DropTableEntry {
            database_id,
            table_id,
            shard_id,
            op_index,
        });
        if let Err(e) = self.metalog.lock().await.append(&[record]).await {
            self.catalog.undo_drop_table(database_id, table_id);
            return Err(e);
        }
        self.wal.advance(shard_id, op_index);
        Ok(OpOutput::Done)
    }

    fn validate_batch(resolved: &ResolvedTable, batch: &Batch) -> StorageResult<()> {
        let schema = &resolved.schema;
        if batch.column_count() != schema.columns.len() {
            return Err(StorageError::InvalidBatch(format!(
                "{} columns, schema has {}",
                batch.column_count(),
                schema.columns.len()
            )));
        }
        for (idx, (column, def)) in batch.columns().iter().zip(schema.columns.iter()).enumerate() {
            if column.ty() != &def.ty {
                return Err(StorageError::InvalidBatch(format!(
                    "column {} is {}, schema wants {}",
                    idx,
                    column.ty(),
                    def.ty
                )));
            }
        }
        if batch.row_count() == 0 {
            return Err(StorageError::InvalidBatch("empty batch".into()));
        }
        Ok(())
    }

    /// Activate the table's tail block for appending, discarding any rows a
    /// torn earlier write left beyond the committed count.
    fn activate_block(&self, resolved: &ResolvedTable) -> StorageResult<ActiveBlock> {
        let (segment_id, block_id, committed_rows, capacity) = self
            .catalog
            .append_target(resolved.database_id, resolved.table_id)?;
        let dir = self.segment_dir(resolved.database_id, resolved.table_id, segment_id);
        std::fs::create_dir_all(&dir)?;
        let path = block::block_file_path(&dir, block_id);
        let file = if path.exists() {
            let types = resolved.schema.types();
            let algos = resolved
                .schema
                .columns
                .iter()
                .map(|c| c.compression)
                .collect_vec();
            let mut file = TransientBlockFile::load(
                &path,
                capacity,
                &types,
                &algos,
                self.options.checksum_type,
                self.options.enable_fsync,
            )?;
            if file.rows() > committed_rows {
                let meta = self.catalog.simple_get_block(
                    resolved.database_id,
                    resolved.table_id,
                    segment_id,
                    block_id,
                )?;
                file.truncate(committed_rows);
                file.reset_log_range(meta.log_range);
            }
            file
        } else {
            TransientBlockFile::new(
                &path,
                capacity,
                self.options.checksum_type,
                self.options.enable_fsync,
            )
        };
        Ok(ActiveBlock {
            segment_id,
            block_id,
            file,
        })
    }

    /// Roll over to the block after `active`: the next slot in the same
    /// segment, or the first block of a fresh segment.
    fn next_block(&self, resolved: &ResolvedTable, active: &ActiveBlock) -> StorageResult<ActiveBlock> {
        let (segment_id, block_id) = if active.block_id < resolved.segment_max_blocks as u64 {
            (active.segment_id, active.block_id + 1)
        } else {
            (active.segment_id + 1, 1)
        };
        let dir = self.segment_dir(resolved.database_id, resolved.table_id, segment_id);
        std::fs::create_dir_all(&dir)?;
        Ok(ActiveBlock {
            segment_id,
            block_id,
            file: TransientBlockFile::new(
                block::block_file_path(&dir, block_id),
                resolved.block_max_rows,
                self.options.checksum_type,
                self.options.enable_fsync,
            ),
        })
    }

    async fn process_append(
        self: &Arc<Self>,
        shard_id: ShardId,
        database: String,
        table: String,
        batch: Batch,
    ) -> StorageResult<OpOutput> {
        let resolved = self.catalog.resolve_table(&database, &table)?;
        if resolved.shard_id != shard_id {
            return Err(StorageError::not_found("database", &database));
        }
        Self::validate_batch(&resolved, &batch)?;

        let range = self.allocator.shard(shard_id).alloc_range(1);
        let algos = resolved
            .schema
            .columns
            .iter()
            .map(|c| c.compression)
            .collect_vec();

        let table_data = self.table_data(resolved.database_id, resolved.table_id);
        let mut data = table_data.lock().await;

        // Write all block files first; catalog row counts and the safe id
        // move only after the sync records are committed to the log.
        let total = batch.row_count();
        let mut offset = 0;
        let mut synced: Vec<(SegmentId, BlockId, u32)> = Vec::new();
        let result: StorageResult<()> = (|| {
            while offset < total {
                if data.active.as_ref().map_or(true, |a| a.file.is_full()) {
                    let next = match data.active.take() {
                        Some(active) => self.next_block(&resolved, &active)?,
                        None => self.activate_block(&resolved)?,
                    };
                    data.active = Some(next);
                }
                let active = data.active.as_mut().unwrap();
                let room = (resolved.block_max_rows - active.file.rows()) as usize;
                let take = room.min(total - offset);
                debug_assert!(active.file.pre_sync(take as u32));
                let chunk = batch.slice(offset, take);
                let rows_after = active.file.sync(&chunk, &algos, range)?;
                synced.push((active.segment_id, active.block_id, rows_after));
                offset += take;
            }
            Ok(())
        })();
        if let Err(e) = result {
            // drop the staged state; the next append re-activates from the
            // committed catalog counts and truncates torn rows
            data.active = None;
            return Err(e);
        }

        let records: Vec<MetaRecord> = synced
            .iter()
            .map(|(segment_id, block_id, row_count)| {
                MetaRecord::BlockSync(BlockSyncEntry {
                    database_id: resolved.database_id,
                    table_id: resolved.table_id,
                    segment_id: *segment_id,
                    block_id: *block_id,
                    row_count: *row_count,
                    shard_id,
                    range,
                })
            })
            .collect();
        if let Err(e) = self.metalog.lock().await.append(&records).await {
            data.active = None;
            return Err(e);
        }

        for (segment_id, block_id, row_count) in &synced {
            self.catalog.record_block(
                resolved.database_id,
                resolved.table_id,
                *segment_id,
                *block_id,
                *row_count,
                range,
            )?;
        }
        self.wal.advance(shard_id, range.end);
        Ok(OpOutput::Appended { rows: total as u32 })
    }

    /// Rebuild catalog, allocators and safe ids from the committed log.
    fn apply_replayed(&self, records: Vec<MetaRecord>) -> StorageResult<()> {
        for record in records {
            match record {
                MetaRecord::CreateDatabase(e) => {
                    self.catalog
                        .create_database_with_id(e.database_id, &e.name, e.shard_id, e.op_index);
                    self.observe(e.shard_id, e.op_index);
                }
                MetaRecord::DropDatabase(e) => {
                    self.catalog.soft_delete_database(e.database_id, e.op_index);
                    self.observe(e.shard_id, e.op_index);
                }
                MetaRecord::CreateTable(e) => {
                    self.catalog.create_table_with_id(
                        e.database_id,
                        e.table_id,
                        e.schema,
                        e.op_index,
                        e.block_max_rows,
                        e.segment_max_blocks,
                    )?;
                    self.observe(e.shard_id, e.op_index);
                }
                MetaRecord::DropTable(e) => {
                    self.catalog
                        .soft_delete_table(e.database_id, e.table_id, e.op_index);
                    self.observe(e.shard_id, e.op_index);
                }
                MetaRecord::BlockSync(e) => {
                    self.catalog.record_block(
                        e.database_id,
                        e.table_id,
                        e.segment_id,
                        e.block_id,
                        e.row_count,
                        e.range,
                    )?;
                    self.observe(e.shard_id, e.range.end);
                }
                MetaRecord::HardDeleteTable(e) => {
                    self.catalog.remove_table(e.database_id, e.table_id);
                }
                MetaRecord::HardDeleteDatabase(e) => {
                    self.catalog.remove_database(e.database_id);
                }
                MetaRecord::Begin | MetaRecord::End => {}
            }
        }
        Ok(())
    }

    fn observe(&self, shard_id: ShardId, op_index: OpIndex) {
        self.allocator.shard(shard_id).observe(op_index);
        self.wal.advance(shard_id, op_index);
    }
}

/// Storage instance: one catalog, one metadata log, one queue per shard.
pub struct StorageEngine {
    core: Arc<EngineCore>,
    shards: RwLock<HashMap<ShardId, Arc<ShardQueue>>>,
    #[allow(clippy::type_complexity)]
    compactor: tokio::sync::Mutex<(Option<oneshot::Sender<()>>, Option<JoinHandle<()>>)>,
}

impl StorageEngine {
    /// Open a storage instance, replaying the metadata log found under
    /// `options.path`.
    pub async fn open(options: StorageOptions) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&options.path).await?;
        let mut metalog =
            MetaLog::open(options.path.join(META_LOG_FILE_NAME), options.enable_fsync).await?;
        let records = metalog.replay().await?;

        let core = Arc::new(EngineCore {
            catalog: Catalog::new(CatalogCfg {
                block_max_rows: options.block_max_rows,
                segment_max_blocks: options.segment_max_blocks,
            }),
            wal: WalTracker::new(),
            allocator: IndexAllocator::new(),
            metalog: tokio::sync::Mutex::new(metalog),
            buffers: BufferPool::new(),
            tables: Mutex::new(HashMap::new()),
            options,
        });
        if !records.is_empty() {
            info!(records = records.len(), "replaying metadata log");
        }
        core.apply_replayed(records)?;

        Ok(Self {
            core,
            shards: RwLock::new(HashMap::new()),
            compactor: tokio::sync::Mutex::new((None, None)),
        })
    }

    fn shard_queue(&self, shard_id: ShardId) -> StorageResult<Arc<ShardQueue>> {
        if let Some(queue) = self.shards.read().get(&shard_id) {
            return Ok(queue.clone());
        }
        Ok(self
            .shards
            .write()
            .entry(shard_id)
            .or_insert_with(|| {
                ShardQueue::spawn(shard_id, self.core.clone(), self.core.options.queue_capacity)
            })
            .clone())
    }

    /// Create a database owned by `shard_id`.
    pub async fn create_database(
        &self,
        name: &str,
        shard_id: ShardId,
    ) -> StorageResult<DatabaseId> {
        let queue = self.shard_queue(shard_id)?;
        match queue
            .enqueue(ShardRequest::CreateDatabase { name: name.into() })
            .await?
        {
            OpOutput::Database(id) => Ok(id),
            output => unreachable!("unexpected output {:?}", output),
        }
    }

    pub async fn drop_database(&self, name: &str) -> StorageResult<()> {
        let shard_id = self.core.catalog.shard_of_database(name)?;
        self.shard_queue(shard_id)?
            .enqueue(ShardRequest::DropDatabase { name: name.into() })
            .await?;
        Ok(())
    }

    /// Create a table under `database`, named by the schema.
    pub async fn create_table(&self, database: &str, schema: Schema) -> StorageResult<TableId> {
        let shard_id = self.core.catalog.shard_of_database(database)?;
        match self
            .shard_queue(shard_id)?
            .enqueue(ShardRequest::CreateTable {
                database: database.into(),
                schema,
            })
            .await?
        {
            OpOutput::Table(id) => Ok(id),
            output => unreachable!("unexpected output {:?}", output),
        }
    }

    pub async fn drop_table(&self, database: &str, table: &str) -> StorageResult<()> {
        let shard_id = self.core.catalog.shard_of_database(database)?;
        self.shard_queue(shard_id)?
            .enqueue(ShardRequest::DropTable {
                database: database.into(),
                table: table.into(),
            })
            .await?;
        Ok(())
    }

    /// Append a columnar batch to `table`, splitting it across blocks on
    /// capacity boundaries.
    pub async fn append(&self, database: &str, table: &str, batch: Batch) -> StorageResult<()> {
        let shard_id = self.core.catalog.shard_of_database(database)?;
        self.shard_queue(shard_id)?
            .enqueue(ShardRequest::Append {
                database: database.into(),
                table: table.into(),
                batch,
            })
            .await?;
        Ok(())
    }

    /// Read-only catalog snapshot at `version`.
    pub fn view(&self, version: OpIndex) -> View {
        self.core.catalog.view(version)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.core.catalog
    }

    /// Highest operation index known durable for `shard_id`.
    pub fn shard_checkpoint_id(&self, shard_id: ShardId) -> OpIndex {
        self.core.wal.shard_checkpoint_id(shard_id)
    }

    /// Last operation index allocated for `shard_id`.
    pub fn last_allocated(&self, shard_id: ShardId) -> OpIndex {
        self.core.allocator.shard(shard_id).current()
    }

    /// Decompression buffer arena shared by readers.
    pub fn buffers(&self) -> Arc<BufferPool> {
        self.core.buffers.clone()
    }

    /// Read-only handle to one segment's block files.
    pub fn segment_file(
        &self,
        database_id: DatabaseId,
        table_id: TableId,
        segment_id: SegmentId,
    ) -> UnsortedSegmentFile {
        UnsortedSegmentFile::new(self.core.segment_dir(database_id, table_id, segment_id))
    }

    /// Hard-delete every soft-deleted entity whose deletion index is durable,
    /// invoking the listeners exactly once per removed entity, then reclaim
    /// the removed tables' files.
    pub async fn compact(
        &self,
        mut db_listener: impl FnMut(&CompactedDatabase),
        mut table_listener: impl FnMut(&CompactedTable),
    ) -> StorageResult<CompactionOutcome> {
        let outcome = self
            .core
            .catalog
            .compact(&self.core.wal, &mut db_listener, &mut table_listener);
        if outcome.is_empty() {
            return Ok(outcome);
        }

        let records: Vec<MetaRecord> = outcome
            .tables
            .iter()
            .map(|t| {
                MetaRecord::HardDeleteTable(HardDeleteTableEntry {
                    database_id: t.database_id,
                    table_id: t.id,
                })
            })
            .chain(outcome.databases.iter().map(|d| {
                MetaRecord::HardDeleteDatabase(HardDeleteDatabaseEntry { database_id: d.id })
            }))
            .collect();
        self.core.metalog.lock().await.append(&records).await?;

        for table in &outcome.tables {
            self.core.tables.lock().remove(&(table.database_id, table.id));
            let dir = self.core.table_dir(table.database_id, table.id);
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(?dir, error = %e, "failed to reclaim table files");
                }
            }
        }
        info!(
            tables = outcome.tables.len(),
            databases = outcome.databases.len(),
            "compaction pass complete"
        );
        Ok(outcome)
    }

    /// Run compaction periodically until [`Self::shutdown`].
    pub async fn spawn_compactor(self: &Arc<Self>) {
        let (tx, mut rx) = oneshot::channel();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.compact(|_| {}, |_| {}).await {
                            warn!(error = %e, "background compaction failed");
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });
        *self.compactor.lock().await = (Some(tx), Some(handle));
    }

    /// Stop the background compactor and every shard queue. Requests still
    /// waiting in a queue resolve with `Cancelled`.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let mut compactor = self.compactor.lock().await;
        if let Some(tx) = compactor.0.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = compactor.1.take() {
            let _ = handle.await;
        }

        let queues: Vec<_> = self.shards.read().values().cloned().collect();
        for queue in queues {
            queue.stop().await;
        }
        info!("storage engine shut down");
        Ok(())
    }
}
