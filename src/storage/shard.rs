// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Per-shard command queue.
//!
//! One dedicated worker task per shard drains requests in arrival order, so
//! every mutation of that shard's catalog subtree and WAL state is
//! serialized without locks. `enqueue` never blocks on processing — it fails
//! fast with `QueueFull` on backpressure — and every dequeued request is
//! resolved exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use super::catalog::{DatabaseId, Schema, TableId};
use super::wal::ShardId;
use super::{EngineCore, StorageError, StorageResult};
use crate::batch::Batch;

/// A mutating request destined for one shard.
#[derive(Debug)]
pub enum ShardRequest {
    CreateDatabase { name: String },
    DropDatabase { name: String },
    CreateTable { database: String, schema: Schema },
    DropTable { database: String, table: String },
    Append { database: String, table: String, batch: Batch },
}

/// What a successfully processed request produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutput {
    Database(DatabaseId),
    Table(TableId),
    Appended { rows: u32 },
    Done,
}

struct QueueItem {
    request: ShardRequest,
    reply: oneshot::Sender<StorageResult<OpOutput>>,
}

/// Single-consumer ordered processing actor for one shard.
pub struct ShardQueue {
    shard_id: ShardId,
    tx: parking_lot::Mutex<Option<mpsc::Sender<QueueItem>>>,
    stopped: Arc<AtomicBool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ShardQueue {
    pub fn spawn(shard_id: ShardId, core: Arc<EngineCore>, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<QueueItem>(capacity);
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_stopped = stopped.clone();
        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if worker_stopped.load(Ordering::Acquire) {
                    // stop() was requested while this item waited in queue
                    let _ = item.reply.send(Err(StorageError::Cancelled));
                    continue;
                }
                let result = core.process(shard_id, item.request).await;
                let _ = item.reply.send(result);
            }
        });

        Arc::new(Self {
            shard_id,
            tx: parking_lot::Mutex::new(Some(tx)),
            stopped,
            worker: tokio::sync::Mutex::new(Some(worker)),
        })
    }

    /// Submit a request and await its result.
    ///
    /// Fails fast with `QueueFull` when the queue is at capacity and with
    /// `Cancelled` once the shard is stopping.
    pub async fn enqueue(&self, request: ShardRequest) -> StorageResult<OpOutput> {
        let (reply, response) = oneshot::channel();
        let tx = self
            .tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or(StorageError::Cancelled)?;
        tx.try_send(QueueItem { request, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => StorageError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => StorageError::Cancelled,
            })?;
        response.await.map_err(|_| StorageError::Cancelled)?
    }

    /// Reject further enqueues, let the in-progress item finish, resolve
    /// still-queued items with `Cancelled`, and release the worker.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
            info!(shard_id = self.shard_id, "shard queue stopped");
        }
    }
}
