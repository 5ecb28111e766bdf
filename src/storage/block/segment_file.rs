// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::block_file::BlockFile;
use crate::storage::catalog::BlockId;
use crate::storage::StorageResult;

/// File name of one block within its segment directory.
pub fn block_file_path(dir: impl AsRef<Path>, block_id: BlockId) -> PathBuf {
    dir.as_ref().join(format!("{}.blk", block_id))
}

/// Aggregates the block files of one unsorted segment.
///
/// Block handles are opened on demand and kept for reuse; a transient block
/// that was rewritten must be [`invalidate`](Self::invalidate)d so the next
/// reference re-opens the fresh file.
pub struct UnsortedSegmentFile {
    dir: PathBuf,
    blocks: RwLock<HashMap<BlockId, Arc<BlockFile>>>,
}

impl UnsortedSegmentFile {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open-if-absent handle to one block of this segment.
    pub fn ref_block(&self, block_id: BlockId) -> StorageResult<Arc<BlockFile>> {
        if let Some(block) = self.blocks.read().get(&block_id) {
            return Ok(block.clone());
        }
        let block = Arc::new(BlockFile::open(block_file_path(&self.dir, block_id))?);
        self.blocks.write().insert(block_id, block.clone());
        Ok(block)
    }

    /// Drop the cached handle of a rewritten block.
    pub fn invalidate(&self, block_id: BlockId) {
        self.blocks.write().remove(&block_id);
    }

    /// Compressed (or original) length of one column's part of one block.
    pub fn part_size(&self, col: usize, block_id: BlockId, original: bool) -> StorageResult<u64> {
        self.ref_block(block_id)?.part_size(col, original)
    }

    /// Copy one column's compressed part of one block into `buf`.
    pub fn read_part(
        &self,
        col: usize,
        block_id: BlockId,
        buf: &mut [u8],
    ) -> StorageResult<usize> {
        self.ref_block(block_id)?.read_part(col, buf)
    }

    /// Present one block's one column as a self-contained read-only stream.
    pub fn make_virtual_part_file(
        &self,
        block_id: BlockId,
        col: usize,
    ) -> StorageResult<VirtualPartFile> {
        let block = self.ref_block(block_id)?;
        let part = *block.part(col)?;
        Ok(VirtualPartFile {
            file: block.shared_file(),
            name: format!(
                "{}/{}.blk#{}",
                self.dir.file_name().and_then(|n| n.to_str()).unwrap_or(""),
                block_id,
                col
            ),
            offset: part.offset,
            len: part.compressed_len,
            pos: 0,
        })
    }
}

/// Size and name of a virtual part file.
#[derive(Clone, Debug)]
pub struct PartStat {
    pub name: String,
    pub size: u64,
}

/// One column of one block, exposed through a minimal seekable-file
/// contract: `stat` for the size, `read` for sequential consumption.
pub struct VirtualPartFile {
    file: Arc<std::fs::File>,
    name: String,
    offset: u64,
    len: u64,
    pos: u64,
}

impl VirtualPartFile {
    pub fn stat(&self) -> PartStat {
        PartStat {
            name: self.name.clone(),
            size: self.len,
        }
    }

    /// Read up to `buf.len()` bytes from the current position; returns 0 at
    /// end of part.
    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let remaining = (self.len - self.pos) as usize;
        let n = remaining.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.file
            .read_exact_at(&mut buf[..n], self.offset + self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;
    use crate::compress::CompressAlgo;
    use crate::storage::block::{BlockWriter, ChecksumType};
    use crate::storage::wal::LogRange;

    fn write_block(dir: &Path, block_id: BlockId, values: &[i32]) {
        let columns = vec![Column::from_i32(values)];
        BlockWriter::new(
            &columns,
            &[CompressAlgo::Lz4],
            block_file_path(dir, block_id),
            LogRange::single(1),
            ChecksumType::Crc32,
            false,
        )
        .execute()
        .unwrap();
    }

    #[test]
    fn test_segment_file_serves_multiple_blocks() {
        let dir = tempfile::tempdir().unwrap();
        write_block(dir.path(), 1, &[1, 2, 3]);
        write_block(dir.path(), 2, &[4, 5]);

        let seg = UnsortedSegmentFile::new(dir.path());
        assert_eq!(seg.ref_block(1).unwrap().row_count(), 3);
        assert_eq!(seg.ref_block(2).unwrap().row_count(), 2);

        let sz = seg.part_size(0, 1, false).unwrap();
        let mut buf = vec![0u8; sz as usize];
        assert_eq!(seg.read_part(0, 1, &mut buf).unwrap(), sz as usize);
    }

    #[test]
    fn test_virtual_part_file_reads_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_block(dir.path(), 1, &[7; 64]);

        let seg = UnsortedSegmentFile::new(dir.path());
        let mut vf = seg.make_virtual_part_file(1, 0).unwrap();
        let stat = vf.stat();
        assert_eq!(stat.size, seg.part_size(0, 1, false).unwrap());

        let mut collected = Vec::new();
        let mut chunk = [0u8; 10];
        loop {
            let n = vf.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(collected.len() as u64, stat.size);

        // the stream matches a direct part read
        let mut direct = vec![0u8; stat.size as usize];
        seg.read_part(0, 1, &mut direct).unwrap();
        assert_eq!(collected, direct);
    }
}
