// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! One on-disk block: a header, one compressed part per column, a part
//! directory, and a fixed-size footer locating the directory.
//!
//! ```plain
//! | magic (4B) | version (4B) | row count (4B) | column count (4B)
//! | log range start (8B) | log range end (8B)
//! | part 0 | part 1 | ...
//! | directory: per part offset (8B) + compressed len (8B) + original len (8B)
//! | footer: directory offset (8B) | part count (4B)
//! |         checksum type (4B) | checksum (8B) | magic (4B)
//! ```
//!
//! The checksum covers the directory. Readers fetch the footer from the file
//! tail, then the directory, and can afterwards answer part sizes and reads
//! without scanning any other part.

// Positioned reads keep one shared read-only handle per block.
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut};

use super::{build_checksum, verify_checksum, ChecksumType};
use crate::batch::Column;
use crate::compress::{compress, CompressAlgo};
use crate::storage::wal::LogRange;
use crate::storage::{StorageError, StorageResult};

pub const BLOCK_MAGIC: u32 = 0x5354_5242; // "STRB"
pub const BLOCK_FORMAT_VERSION: u32 = 1;

pub const BLOCK_HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8 + 8;
pub const DIRECTORY_ENTRY_SIZE: usize = 8 + 8 + 8;
pub const BLOCK_FOOTER_SIZE: usize = 8 + 4 + 4 + 8 + 4;

/// Location and sizes of one column's part within a block file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartMeta {
    pub offset: u64,
    pub compressed_len: u64,
    pub original_len: u64,
}

/// Writes a full block file in one shot: all parts, the directory, the
/// footer, then an atomic rename over the target path.
pub struct BlockWriter<'a> {
    columns: &'a [Column],
    algos: &'a [CompressAlgo],
    path: PathBuf,
    log_range: LogRange,
    checksum_type: ChecksumType,
    enable_fsync: bool,
}

impl<'a> BlockWriter<'a> {
    pub fn new(
        columns: &'a [Column],
        algos: &'a [CompressAlgo],
        path: impl AsRef<Path>,
        log_range: LogRange,
        checksum_type: ChecksumType,
        enable_fsync: bool,
    ) -> Self {
        assert_eq!(columns.len(), algos.len());
        Self {
            columns,
            algos,
            path: path.as_ref().to_path_buf(),
            log_range,
            checksum_type,
            enable_fsync,
        }
    }

    pub fn execute(self) -> StorageResult<()> {
        let rows = self.columns.first().map(|c| c.len()).unwrap_or(0);
        if self.columns.iter().any(|c| c.len() != rows) {
            return Err(StorageError::InvalidBatch(
                "columns have differing row counts".into(),
            ));
        }

        let mut buf = Vec::new();
        buf.put_u32(BLOCK_MAGIC);
        buf.put_u32(BLOCK_FORMAT_VERSION);
        buf.put_u32(rows as u32);
        buf.put_u32(self.columns.len() as u32);
        buf.put_u64(self.log_range.start);
        buf.put_u64(self.log_range.end);

        let mut parts = Vec::with_capacity(self.columns.len());
        for (column, algo) in self.columns.iter().zip(self.algos.iter()) {
            let payload = super::encode_part(column);
            let compressed = compress(*algo, &payload)?;
            parts.push(PartMeta {
                offset: buf.len() as u64,
                compressed_len: compressed.len() as u64,
                original_len: payload.len() as u64,
            });
            buf.extend_from_slice(&compressed);
        }

        let directory_offset = buf.len() as u64;
        let mut directory = Vec::with_capacity(parts.len() * DIRECTORY_ENTRY_SIZE);
        for part in &parts {
            directory.put_u64(part.offset);
            directory.put_u64(part.compressed_len);
            directory.put_u64(part.original_len);
        }
        let checksum = build_checksum(self.checksum_type, &directory);
        buf.extend_from_slice(&directory);

        buf.put_u64(directory_offset);
        buf.put_u32(parts.len() as u32);
        buf.put_u32(self.checksum_type.to_u32());
        buf.put_u64(checksum);
        buf.put_u32(BLOCK_MAGIC);

        // Stage under a temp name so readers of the target path only ever
        // observe a complete block.
        let tmp = self.path.with_extension("blk.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            std::io::Write::write_all(&mut file, &buf)?;
            if self.enable_fsync {
                file.sync_data()?;
            }
        }
        std::fs::rename(&tmp, &self.path)?;
        if self.enable_fsync {
            if let Some(dir) = self.path.parent() {
                std::fs::File::open(dir)?.sync_data()?;
            }
        }
        Ok(())
    }
}

/// Read-only handle to one block file. The directory is loaded once at open;
/// part reads are positioned and touch only the requested column.
pub struct BlockFile {
    file: Arc<std::fs::File>,
    row_count: u32,
    log_range: LogRange,
    parts: Vec<PartMeta>,
}

impl BlockFile {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        if (file_len as usize) < BLOCK_HEADER_SIZE + BLOCK_FOOTER_SIZE {
            return Err(StorageError::corrupt("block file too short"));
        }

        let mut header = [0u8; BLOCK_HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        let mut cursor = &header[..];
        if cursor.get_u32() != BLOCK_MAGIC {
            return Err(StorageError::corrupt("bad block header magic"));
        }
        let version = cursor.get_u32();
        if version != BLOCK_FORMAT_VERSION {
            return Err(StorageError::corrupt(format!(
                "unsupported block format version {}",
                version
            )));
        }
        let row_count = cursor.get_u32();
        let column_count = cursor.get_u32();
        let log_range = LogRange {
            start: cursor.get_u64(),
            end: cursor.get_u64(),
        };

        let mut footer = [0u8; BLOCK_FOOTER_SIZE];
        file.read_exact_at(&mut footer, file_len - BLOCK_FOOTER_SIZE as u64)?;
        let mut cursor = &footer[..];
        let directory_offset = cursor.get_u64();
        let part_count = cursor.get_u32();
        let checksum_type = ChecksumType::from_u32(cursor.get_u32())
            .ok_or_else(|| StorageError::corrupt("invalid checksum type"))?;
        let checksum = cursor.get_u64();
        if cursor.get_u32() != BLOCK_MAGIC {
            return Err(StorageError::corrupt("bad block footer magic"));
        }
        if part_count != column_count {
            return Err(StorageError::corrupt("part count does not match header"));
        }

        let directory_len = part_count as usize * DIRECTORY_ENTRY_SIZE;
        if directory_offset + directory_len as u64 + BLOCK_FOOTER_SIZE as u64 != file_len {
            return Err(StorageError::corrupt("directory does not fit file"));
        }
        let mut directory = vec![0u8; directory_len];
        file.read_exact_at(&mut directory, directory_offset)?;
        verify_checksum(checksum_type, &directory, checksum)?;

        let mut cursor = &directory[..];
        let mut parts = Vec::with_capacity(part_count as usize);
        for _ in 0..part_count {
            parts.push(PartMeta {
                offset: cursor.get_u64(),
                compressed_len: cursor.get_u64(),
                original_len: cursor.get_u64(),
            });
        }

        Ok(Self {
            file: Arc::new(file),
            row_count,
            log_range,
            parts,
        })
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn column_count(&self) -> usize {
        self.parts.len()
    }

    pub fn log_range(&self) -> LogRange {
        self.log_range
    }

    pub(super) fn part(&self, col: usize) -> StorageResult<&PartMeta> {
        self.parts.get(col).ok_or(StorageError::InvalidColumn(col))
    }

    pub(super) fn shared_file(&self) -> Arc<std::fs::File> {
        self.file.clone()
    }

    /// Compressed (or, with `original`, decompressed) length of one column's
    /// part, without reading any data.
    pub fn part_size(&self, col: usize, original: bool) -> StorageResult<u64> {
        let part = self.part(col)?;
        Ok(if original {
            part.original_len
        } else {
            part.compressed_len
        })
    }

    /// Copy the compressed bytes of one column's part into `buf`, which must
    /// be sized to the compressed length. The caller decompresses explicitly
    /// using the recorded original size.
    pub fn read_part(&self, col: usize, buf: &mut [u8]) -> StorageResult<usize> {
        let part = self.part(col)?;
        if buf.len() != part.compressed_len as usize {
            return Err(StorageError::corrupt(format!(
                "part buffer of {} bytes, expected {}",
                buf.len(),
                part.compressed_len
            )));
        }
        self.file.read_exact_at(buf, part.offset)?;
        Ok(buf.len())
    }
}
