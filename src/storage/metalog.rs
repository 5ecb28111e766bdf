// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Append-only metadata log.
//!
//! Every catalog mutation and every durable block sync is recorded here
//! before the shard's safe id advances. Records are newline-free JSON values
//! wrapped in `Begin`/`End` markers so that a torn trailing transaction can
//! be detected and ignored on replay.

use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::warn;

use super::catalog::{BlockId, DatabaseId, Schema, SegmentId, TableId};
use super::wal::{LogRange, OpIndex, ShardId};
use super::StorageResult;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateDatabaseEntry {
    pub database_id: DatabaseId,
    pub name: String,
    pub shard_id: ShardId,
    pub op_index: OpIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DropDatabaseEntry {
    pub database_id: DatabaseId,
    pub shard_id: ShardId,
    pub op_index: OpIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTableEntry {
    pub database_id: DatabaseId,
    pub table_id: TableId,
    pub schema: Schema,
    pub shard_id: ShardId,
    pub op_index: OpIndex,
    pub block_max_rows: u32,
    pub segment_max_blocks: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DropTableEntry {
    pub database_id: DatabaseId,
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub op_index: OpIndex,
}

/// One durable block write: which block, how many rows it now holds, and the
/// operation-index range it covers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockSyncEntry {
    pub database_id: DatabaseId,
    pub table_id: TableId,
    pub segment_id: SegmentId,
    pub block_id: BlockId,
    pub row_count: u32,
    pub shard_id: ShardId,
    pub range: LogRange,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardDeleteDatabaseEntry {
    pub database_id: DatabaseId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardDeleteTableEntry {
    pub database_id: DatabaseId,
    pub table_id: TableId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MetaRecord {
    CreateDatabase(CreateDatabaseEntry),
    DropDatabase(DropDatabaseEntry),
    CreateTable(CreateTableEntry),
    DropTable(DropTableEntry),
    BlockSync(BlockSyncEntry),
    HardDeleteDatabase(HardDeleteDatabaseEntry),
    HardDeleteTable(HardDeleteTableEntry),
    // begin transaction
    Begin,
    // end transaction
    End,
}

/// Handles all reads and writes to the metadata log file.
pub struct MetaLog {
    file: tokio::fs::File,
    enable_fsync: bool,
}

impl MetaLog {
    pub async fn open(path: impl AsRef<Path>, enable_fsync: bool) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .await?;
        Ok(Self { file, enable_fsync })
    }

    /// Read back every committed record, in order. Records outside a
    /// `Begin`/`End` pair and a torn trailing transaction are skipped with a
    /// warning.
    pub async fn replay(&mut self) -> StorageResult<Vec<MetaRecord>> {
        let mut data = String::new();
        {
            self.file.seek(SeekFrom::Start(0)).await?;
            let mut reader = BufReader::new(&mut self.file);
            reader.read_to_string(&mut data).await?;
        }

        let stream = Deserializer::from_str(&data).into_iter::<MetaRecord>();

        let mut records = vec![];
        let mut buffered = vec![];
        let mut begin = false;

        for value in stream {
            let value = match value {
                Ok(value) => value,
                Err(e) => {
                    warn!("metalog: stopping replay at undecodable record: {}", e);
                    break;
                }
            };
            match value {
                MetaRecord::Begin => begin = true,
                MetaRecord::End => {
                    records.append(&mut buffered);
                    begin = false;
                }
                record => {
                    if begin {
                        buffered.push(record);
                    } else {
                        warn!("metalog: record outside txn markers, skipping");
                    }
                }
            }
        }

        if !buffered.is_empty() {
            warn!("metalog: dropping {} uncommitted records", buffered.len());
        }

        // subsequent appends continue after the committed prefix
        self.file.seek(SeekFrom::End(0)).await?;

        Ok(records)
    }

    /// Append `records` as one committed transaction.
    pub async fn append(&mut self, records: &[MetaRecord]) -> StorageResult<()> {
        let mut json = Vec::new();
        serde_json::to_writer(&mut json, &MetaRecord::Begin)?;
        for record in records {
            serde_json::to_writer(&mut json, record)?;
        }
        serde_json::to_writer(&mut json, &MetaRecord::End)?;
        self.file.write_all(&json).await?;
        if self.enable_fsync {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.log");

        let mut log = MetaLog::open(&path, false).await.unwrap();
        log.append(&[MetaRecord::CreateDatabase(CreateDatabaseEntry {
            database_id: 1,
            name: "db1".into(),
            shard_id: 7,
            op_index: 1,
        })])
        .await
        .unwrap();
        log.append(&[MetaRecord::DropDatabase(DropDatabaseEntry {
            database_id: 1,
            shard_id: 7,
            op_index: 2,
        })])
        .await
        .unwrap();
        drop(log);

        let mut log = MetaLog::open(&path, false).await.unwrap();
        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], MetaRecord::CreateDatabase(e) if e.name == "db1"));
        assert!(matches!(&records[1], MetaRecord::DropDatabase(e) if e.op_index == 2));
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.log");

        let mut log = MetaLog::open(&path, false).await.unwrap();
        log.append(&[MetaRecord::CreateDatabase(CreateDatabaseEntry {
            database_id: 1,
            name: "db1".into(),
            shard_id: 1,
            op_index: 1,
        })])
        .await
        .unwrap();
        drop(log);

        // simulate a crash mid-commit: Begin + record without End
        {
            use std::io::Write;
            let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            let mut tail = Vec::new();
            serde_json::to_writer(&mut tail, &MetaRecord::Begin).unwrap();
            serde_json::to_writer(
                &mut tail,
                &MetaRecord::DropDatabase(DropDatabaseEntry {
                    database_id: 1,
                    shard_id: 1,
                    op_index: 2,
                }),
            )
            .unwrap();
            raw.write_all(&tail[..tail.len() - 3]).unwrap();
        }

        let mut log = MetaLog::open(&path, false).await.unwrap();
        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(&records[0], MetaRecord::CreateDatabase(_)));
    }
}
