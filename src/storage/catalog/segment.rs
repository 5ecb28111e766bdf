// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;

use crate::storage::wal::LogRange;

pub type SegmentId = u64;
pub type BlockId = u64;

/// Lifecycle of a segment's contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    /// Actively receiving appends.
    Unsorted,
    /// Immutable, produced by background merge of unsorted segments.
    Sorted,
}

/// Metadata of one on-disk block within a segment.
#[derive(Clone, Debug)]
pub struct BlockMeta {
    pub id: BlockId,
    /// Fixed row capacity, decided at table creation time.
    pub capacity: u32,
    pub row_count: u32,
    /// Operation-index range covered by the block's durable contents, used
    /// to match blocks back to the log during crash recovery.
    pub log_range: Option<LogRange>,
}

impl BlockMeta {
    pub fn new(id: BlockId, capacity: u32) -> Self {
        Self {
            id,
            capacity,
            row_count: 0,
            log_range: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.row_count >= self.capacity
    }

    /// Record `rows` durable rows covering `range`.
    pub fn record(&mut self, rows: u32, range: LogRange) {
        self.row_count = rows;
        match &mut self.log_range {
            Some(existing) => existing.extend(range),
            None => self.log_range = Some(range),
        }
    }
}

/// A bounded, append-only grouping of blocks belonging to one table.
#[derive(Clone, Debug)]
pub struct SegmentMeta {
    pub id: SegmentId,
    pub state: SegmentState,
    pub blocks: BTreeMap<BlockId, BlockMeta>,
}

impl SegmentMeta {
    pub fn new(id: SegmentId) -> Self {
        Self {
            id,
            state: SegmentState::Unsorted,
            blocks: BTreeMap::new(),
        }
    }

    /// Create-if-absent lookup of a block.
    pub fn get_or_create_block(&mut self, id: BlockId, capacity: u32) -> &mut BlockMeta {
        self.blocks
            .entry(id)
            .or_insert_with(|| BlockMeta::new(id, capacity))
    }

    pub fn row_count(&self) -> u64 {
        self.blocks.values().map(|b| b.row_count as u64).sum()
    }
}
