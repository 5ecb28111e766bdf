// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use std::path::{Path, PathBuf};

use super::block_file::{BlockFile, BlockWriter};
use super::{decode_part, ChecksumType};
use crate::batch::Batch;
use crate::compress::{decompress, CompressAlgo};
use crate::storage::wal::LogRange;
use crate::storage::{StorageError, StorageResult};
use crate::types::Type;

/// An in-flight block undergoing a two-phase write.
///
/// `pre_sync` reserves capacity: it answers whether the block can still take
/// that many additional rows, letting the write path decide between this
/// block and a rollover before committing bytes. `sync` then performs the
/// durable write, rewriting the block file with everything staged so far.
pub struct TransientBlockFile {
    path: PathBuf,
    capacity: u32,
    rows: u32,
    staged: Option<Batch>,
    log_range: Option<LogRange>,
    checksum_type: ChecksumType,
    enable_fsync: bool,
}

impl TransientBlockFile {
    pub fn new(
        path: impl AsRef<Path>,
        capacity: u32,
        checksum_type: ChecksumType,
        enable_fsync: bool,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capacity,
            rows: 0,
            staged: None,
            log_range: None,
            checksum_type,
            enable_fsync,
        }
    }

    /// Re-stage a block that already exists on disk, e.g. after a restart,
    /// so further appends keep accumulating into it.
    pub fn load(
        path: impl AsRef<Path>,
        capacity: u32,
        column_types: &[Type],
        algos: &[CompressAlgo],
        checksum_type: ChecksumType,
        enable_fsync: bool,
    ) -> StorageResult<Self> {
        let block = BlockFile::open(path.as_ref())?;
        let mut columns = Vec::with_capacity(column_types.len());
        for (col, (ty, algo)) in column_types.iter().zip(algos.iter()).enumerate() {
            let compressed_len = block.part_size(col, false)? as usize;
            let original_len = block.part_size(col, true)? as usize;
            let mut compressed = vec![0u8; compressed_len];
            block.read_part(col, &mut compressed)?;
            let mut original = vec![0u8; original_len];
            decompress(*algo, &compressed, &mut original)?;
            columns.push(decode_part(*ty, &original)?);
        }
        let staged = Batch::new(columns)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            capacity,
            rows: block.row_count(),
            staged: Some(staged),
            log_range: Some(block.log_range()),
            checksum_type,
            enable_fsync,
        })
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn is_full(&self) -> bool {
        self.rows >= self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the block can still accept `additional` rows without
    /// exceeding its fixed capacity.
    pub fn pre_sync(&self, additional: u32) -> bool {
        self.rows.saturating_add(additional) <= self.capacity
    }

    /// Durably write `batch` appended to everything staged so far. Returns
    /// the total row count of the block.
    pub fn sync(
        &mut self,
        batch: &Batch,
        algos: &[CompressAlgo],
        range: LogRange,
    ) -> StorageResult<u32> {
        let additional = batch.row_count() as u32;
        if self.rows + additional > self.capacity {
            return Err(StorageError::CapacityExceeded {
                left: self.capacity - self.rows,
                requested: additional,
            });
        }

        match &mut self.staged {
            Some(staged) => staged.extend(batch),
            None => self.staged = Some(batch.clone()),
        }
        match &mut self.log_range {
            Some(existing) => existing.extend(range),
            None => self.log_range = Some(range),
        }

        let staged = self.staged.as_ref().unwrap();
        let full_range = self.log_range.unwrap();
        BlockWriter::new(
            staged.columns(),
            algos,
            &self.path,
            full_range,
            self.checksum_type,
            self.enable_fsync,
        )
        .execute()?;
        self.rows += additional;
        Ok(self.rows)
    }

    /// Forget staged rows that failed to commit downstream; the on-disk file
    /// is rewritten from the surviving rows on the next sync.
    pub fn truncate(&mut self, rows: u32) {
        if rows >= self.rows {
            return;
        }
        if let Some(staged) = &self.staged {
            self.staged = Some(staged.slice(0, rows as usize));
        }
        self.rows = rows;
    }

    /// Override the staged log range with the committed one, after torn rows
    /// were truncated away.
    pub fn reset_log_range(&mut self, range: Option<LogRange>) {
        self.log_range = range;
    }
}
