// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::schema::Schema;
use super::segment::{BlockId, SegmentId, SegmentMeta, SegmentState};
use super::DatabaseId;
use crate::storage::wal::OpIndex;

pub type TableId = u64;

/// Metadata of one table: schema, lifecycle indices, and the segment arena.
#[derive(Clone, Debug)]
pub struct TableMeta {
    pub id: TableId,
    pub database_id: DatabaseId,
    pub schema: Arc<Schema>,
    pub create_index: OpIndex,
    pub delete_index: Option<OpIndex>,
    pub block_max_rows: u32,
    pub segment_max_blocks: u32,
    pub segments: BTreeMap<SegmentId, SegmentMeta>,
}

impl TableMeta {
    pub fn new(
        id: TableId,
        database_id: DatabaseId,
        schema: Arc<Schema>,
        create_index: OpIndex,
        block_max_rows: u32,
        segment_max_blocks: u32,
    ) -> Self {
        Self {
            id,
            database_id,
            schema,
            create_index,
            delete_index: None,
            block_max_rows,
            segment_max_blocks,
            segments: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.delete_index.is_some()
    }

    pub fn is_visible_at(&self, version: OpIndex) -> bool {
        self.create_index <= version && self.delete_index.map_or(true, |d| version < d)
    }

    /// Create-if-absent lookup of a segment.
    pub fn get_or_create_segment(&mut self, id: SegmentId) -> &mut SegmentMeta {
        self.segments.entry(id).or_insert_with(|| SegmentMeta::new(id))
    }

    /// The (segment, block) pair the next append should land in, allocating a
    /// fresh block — and a fresh segment once the tail segment's block arena
    /// is full — as needed.
    pub fn append_target(&mut self) -> (SegmentId, BlockId) {
        let tail = self.segments.iter().next_back().map(|(id, _)| *id);
        if let Some(seg_id) = tail {
            let max_blocks = self.segment_max_blocks;
            let block_max_rows = self.block_max_rows;
            let seg = self.segments.get_mut(&seg_id).unwrap();
            if seg.state == SegmentState::Unsorted {
                if let Some((blk_id, blk)) = seg.blocks.iter().next_back() {
                    if !blk.is_full() {
                        return (seg_id, *blk_id);
                    }
                    if (seg.blocks.len() as u32) < max_blocks {
                        let next = blk_id + 1;
                        seg.get_or_create_block(next, block_max_rows);
                        return (seg_id, next);
                    }
                } else {
                    seg.get_or_create_block(1, block_max_rows);
                    return (seg_id, 1);
                }
            }
        }
        let seg_id = tail.map_or(1, |id| id + 1);
        let block_max_rows = self.block_max_rows;
        let seg = self.get_or_create_segment(seg_id);
        seg.get_or_create_block(1, block_max_rows);
        (seg_id, 1)
    }

    pub fn row_count(&self) -> u64 {
        self.segments.values().map(|s| s.row_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressAlgo;
    use crate::storage::catalog::schema::ColumnDef;
    use crate::storage::wal::LogRange;
    use crate::types::{PhysicalType, Type};

    fn table(block_rows: u32, seg_blocks: u32) -> TableMeta {
        let schema = Schema::new(
            "t",
            vec![ColumnDef::new(
                "v",
                Type::new(PhysicalType::Int32),
                CompressAlgo::Lz4,
            )],
        );
        TableMeta::new(1, 1, Arc::new(schema), 1, block_rows, seg_blocks)
    }

    #[test]
    fn test_append_target_rolls_blocks_and_segments() {
        let mut t = table(10, 2);
        assert_eq!(t.append_target(), (1, 1));
        // still room in block (1, 1)
        assert_eq!(t.append_target(), (1, 1));

        t.get_or_create_segment(1)
            .get_or_create_block(1, 10)
            .record(10, LogRange::single(1));
        assert_eq!(t.append_target(), (1, 2));

        t.get_or_create_segment(1)
            .get_or_create_block(2, 10)
            .record(10, LogRange::single(2));
        // segment 1 is out of block slots, roll over
        assert_eq!(t.append_target(), (2, 1));
    }

    #[test]
    fn test_visibility_window() {
        let mut t = table(10, 2);
        t.create_index = 5;
        assert!(!t.is_visible_at(4));
        assert!(t.is_visible_at(5));
        t.delete_index = Some(12);
        assert!(t.is_visible_at(10));
        assert!(!t.is_visible_at(12));
    }
}
