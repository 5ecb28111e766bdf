// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! End-to-end shard scenarios: concurrent clients against a multi-shard
//! engine, safe-id convergence, views and compaction.

use std::sync::Arc;

use strata::batch::{Batch, Column};
use strata::compress::CompressAlgo;
use strata::storage::catalog::{ColumnDef, Schema};
use strata::storage::{StorageEngine, StorageError, StorageOptions};
use strata::types::{PhysicalType, Type};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn mock_schema(name: &str, columns: usize) -> Schema {
    let defs = (0..columns)
        .map(|i| {
            ColumnDef::new(
                format!("attr-{}", i),
                Type::new(PhysicalType::Int32),
                CompressAlgo::Lz4,
            )
        })
        .collect();
    Schema::new(name, defs).with_primary_key(0)
}

fn mock_batch(columns: usize, rows: usize) -> Batch {
    let values: Vec<i32> = (0..rows as i32).collect();
    Batch::new((0..columns).map(|_| Column::from_i32(&values)).collect()).unwrap()
}

async fn open_engine(dir: &tempfile::TempDir) -> Arc<StorageEngine> {
    Arc::new(
        StorageEngine::open(StorageOptions::default_for_test(dir.path()))
            .await
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_create_drop_across_shards() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let shard_count: u64 = 8;
    let table_count = 20;
    for shard_id in 1..=shard_count {
        engine
            .create_database(&format!("shard-{}", shard_id), shard_id)
            .await
            .unwrap();
    }

    // two clients, each owning half the tables, routed table-index % shards
    let mut clients = Vec::new();
    for client in 0..2usize {
        let engine = engine.clone();
        clients.push(tokio::spawn(async move {
            let tables: Vec<usize> =
                (client * table_count / 2..(client + 1) * table_count / 2).collect();
            for pos in &tables {
                let db = format!("shard-{}", (*pos as u64 % shard_count) + 1);
                engine
                    .create_table(&db, mock_schema(&format!("mock-{}", pos), 20))
                    .await
                    .unwrap();
            }
            for pos in &tables {
                let db = format!("shard-{}", (*pos as u64 % shard_count) + 1);
                engine
                    .drop_table(&db, &format!("mock-{}", pos))
                    .await
                    .unwrap();
            }
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    for shard_id in 1..=shard_count {
        assert_eq!(
            engine.last_allocated(shard_id),
            engine.shard_checkpoint_id(shard_id),
            "shard-{} safe id must reach the last allocated index",
            shard_id
        );
    }

    let mut db_compacts = 0;
    let mut tbl_compacts = 0;
    engine
        .compact(|_| db_compacts += 1, |_| tbl_compacts += 1)
        .await
        .unwrap();
    assert_eq!(db_compacts, 0);
    assert_eq!(tbl_compacts, table_count);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_insert_drop_then_compact_databases() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    let shard_count: u64 = 4;
    let table_count = 10;
    for shard_id in 1..=shard_count {
        engine
            .create_database(&format!("shard-{}", shard_id), shard_id)
            .await
            .unwrap();
    }

    let mut clients = Vec::new();
    for client in 0..2usize {
        let engine = engine.clone();
        clients.push(tokio::spawn(async move {
            let tables: Vec<usize> =
                (client * table_count / 2..(client + 1) * table_count / 2).collect();
            for pos in &tables {
                let db = format!("shard-{}", (*pos as u64 % shard_count) + 1);
                engine
                    .create_table(&db, mock_schema(&format!("mock-{}", pos), 2))
                    .await
                    .unwrap();
            }
            // batches sized to span multiple blocks (block capacity is 10)
            for round in 0..2usize {
                for pos in &tables {
                    let db = format!("shard-{}", (*pos as u64 % shard_count) + 1);
                    let rows = (pos % 5 + 1) * 2 + round * 10;
                    engine
                        .append(&db, &format!("mock-{}", pos), mock_batch(2, rows))
                        .await
                        .unwrap();
                }
            }
            for pos in &tables {
                let db = format!("shard-{}", (*pos as u64 % shard_count) + 1);
                engine
                    .drop_table(&db, &format!("mock-{}", pos))
                    .await
                    .unwrap();
            }
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    for shard_id in 1..=shard_count {
        assert_eq!(
            engine.last_allocated(shard_id),
            engine.shard_checkpoint_id(shard_id)
        );
    }

    // nothing existed at index 0, and all tables are dropped at the safe id
    let total: usize = (1..=shard_count)
        .map(|shard_id| {
            let name = format!("shard-{}", shard_id);
            assert!(engine.view(0).database(&name).is_none());
            let view = engine.view(engine.shard_checkpoint_id(shard_id));
            view.database(&name).map_or(0, |db| db.tables().len())
        })
        .sum();
    assert_eq!(total, 0);

    let mut db_compacts = 0;
    let mut tbl_compacts = 0;
    engine
        .compact(|_| db_compacts += 1, |_| tbl_compacts += 1)
        .await
        .unwrap();
    assert_eq!(db_compacts, 0);
    assert_eq!(tbl_compacts, table_count);

    for shard_id in 1..=shard_count {
        engine
            .drop_database(&format!("shard-{}", shard_id))
            .await
            .unwrap();
        assert_eq!(
            engine.last_allocated(shard_id),
            engine.shard_checkpoint_id(shard_id)
        );
    }

    db_compacts = 0;
    tbl_compacts = 0;
    engine
        .compact(|_| db_compacts += 1, |_| tbl_compacts += 1)
        .await
        .unwrap();
    assert_eq!(db_compacts, shard_count as usize);
    assert_eq!(tbl_compacts, 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_append_roundtrip_through_segment_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    engine.create_database("db1", 1).await.unwrap();
    let schema = Schema::new(
        "t",
        vec![
            ColumnDef::new("id", Type::new(PhysicalType::Int32), CompressAlgo::Lz4),
            ColumnDef::new("name", Type::new(PhysicalType::Varchar), CompressAlgo::Lz4),
        ],
    )
    .with_primary_key(1);
    engine.create_table("db1", schema).await.unwrap();

    let batch = Batch::new(vec![
        Column::from_i32(&[3, 1, 2, 0]),
        Column::from_strs(&["str1", "str0", "str2", "str3"]),
    ])
    .unwrap();
    engine.append("db1", "t", batch).await.unwrap();

    let view = engine.view(engine.shard_checkpoint_id(1));
    let db = view.database("db1").unwrap();
    let table = db.table("t").unwrap();
    assert_eq!(table.row_count, 4);

    // read one column at a time through the segment file
    let seg = engine.segment_file(db.id, table.id, 1);
    let pool = engine.buffers();

    let mut compressed = pool.acquire(seg.part_size(0, 1, false).unwrap() as usize);
    seg.read_part(0, 1, &mut compressed).unwrap();
    let mut original = pool.acquire(seg.part_size(0, 1, true).unwrap() as usize);
    let written =
        strata::compress::decompress(CompressAlgo::Lz4, &compressed, &mut original).unwrap();
    assert_eq!(written, original.len());
    let col = strata::storage::block::decode_part(Type::new(PhysicalType::Int32), &original)
        .unwrap();
    assert_eq!(col.as_i32(), vec![3, 1, 2, 0]);

    let mut compressed = pool.acquire(seg.part_size(1, 1, false).unwrap() as usize);
    seg.read_part(1, 1, &mut compressed).unwrap();
    let mut original = pool.acquire(seg.part_size(1, 1, true).unwrap() as usize);
    strata::compress::decompress(CompressAlgo::Lz4, &compressed, &mut original).unwrap();
    let col = strata::storage::block::decode_part(Type::new(PhysicalType::Varchar), &original)
        .unwrap();
    assert_eq!(col.var_len_at(0), b"str1");
    assert_eq!(col.var_len_at(1), b"str0");
    assert_eq!(col.var_len_at(2), b"str2");
    assert_eq!(col.var_len_at(3), b"str3");

    // one column of one block as a self-contained stream
    let mut vf = seg.make_virtual_part_file(1, 0).unwrap();
    let stat = vf.stat();
    let mut buf = vec![0u8; stat.size as usize];
    assert_eq!(vf.read(&mut buf).unwrap() as u64, stat.size);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovery_replays_metadata_log() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = open_engine(&dir).await;
        engine.create_database("db1", 1).await.unwrap();
        engine
            .create_table("db1", mock_schema("t", 2))
            .await
            .unwrap();
        // 12 rows span two blocks of capacity 10
        engine.append("db1", "t", mock_batch(2, 12)).await.unwrap();
        engine.shutdown().await.unwrap();
    }

    let engine = open_engine(&dir).await;
    let last = engine.last_allocated(1);
    assert_eq!(last, 3);
    assert_eq!(engine.shard_checkpoint_id(1), 3);

    let view = engine.view(last);
    let table_view = view.database("db1").unwrap().table("t").unwrap().clone();
    assert_eq!(table_view.row_count, 12);

    // appends keep working after recovery, continuing the tail block
    engine.append("db1", "t", mock_batch(2, 4)).await.unwrap();
    assert_eq!(engine.last_allocated(1), 4);
    assert_eq!(engine.shard_checkpoint_id(1), 4);
    let view = engine.view(4);
    assert_eq!(view.database("db1").unwrap().table("t").unwrap().row_count, 16);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_new_requests() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    engine.create_database("db1", 1).await.unwrap();
    engine.shutdown().await.unwrap();

    let err = engine.create_table("db1", mock_schema("t", 2)).await;
    assert!(matches!(err, Err(StorageError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_shard_ordering_under_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir).await;

    engine.create_database("db1", 1).await.unwrap();

    let mut clients = Vec::new();
    for client in 0..4usize {
        let engine = engine.clone();
        clients.push(tokio::spawn(async move {
            for i in 0..5usize {
                let table = format!("t-{}-{}", client, i);
                engine
                    .create_table("db1", mock_schema(&table, 2))
                    .await
                    .unwrap();
                engine.append("db1", &table, mock_batch(2, 7)).await.unwrap();
            }
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    // 1 create database + 20 creates + 20 appends, all durable
    assert_eq!(engine.last_allocated(1), 41);
    assert_eq!(engine.shard_checkpoint_id(1), 41);

    let view = engine.view(41);
    let db = view.database("db1").unwrap();
    assert_eq!(db.tables().len(), 20);
    assert!(db.tables().iter().all(|t| t.row_count == 7));

    engine.shutdown().await.unwrap();
}
