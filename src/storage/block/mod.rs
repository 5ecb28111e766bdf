// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! On-disk block and segment files.
//!
//! A block file stores one independently compressed part per column plus a
//! directory that locates each part, so a reader can fetch and decompress a
//! single column without touching the others. An unsorted segment file
//! aggregates the block files currently receiving writes.

mod block_file;
mod buffer_pool;
mod segment_file;
mod transient;

pub use block_file::{BlockFile, BlockWriter, PartMeta};
pub use buffer_pool::{BufferPool, PoolBuffer};
pub use segment_file::{block_file_path, PartStat, UnsortedSegmentFile, VirtualPartFile};
pub use transient::TransientBlockFile;

use bytes::{Buf, BufMut};

use crate::batch::Column;
use crate::storage::{StorageError, StorageResult};
use crate::types::Type;

/// Checksum applied to a block file's part directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumType {
    None,
    Crc32,
}

impl ChecksumType {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Crc32 => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Crc32),
            _ => None,
        }
    }
}

pub fn build_checksum(checksum_type: ChecksumType, data: &[u8]) -> u64 {
    match checksum_type {
        ChecksumType::None => 0,
        ChecksumType::Crc32 => crc32fast::hash(data) as u64,
    }
}

pub fn verify_checksum(
    checksum_type: ChecksumType,
    data: &[u8],
    expected: u64,
) -> StorageResult<()> {
    let found = build_checksum(checksum_type, data);
    if found != expected {
        return Err(StorageError::corrupt(format!(
            "checksum mismatch: found {}, expected {}",
            found, expected
        )));
    }
    Ok(())
}

/// Serialize one column into its raw part payload.
///
/// Fixed-width columns are the dense value bytes verbatim; variable-length
/// columns carry their offset/length tables ahead of the blob.
pub fn encode_part(column: &Column) -> Vec<u8> {
    match column {
        Column::Fixed { data, .. } => data.clone(),
        Column::VarLen {
            data,
            offsets,
            lengths,
            ..
        } => {
            let mut buf = Vec::with_capacity(4 + offsets.len() * 8 + data.len());
            buf.put_u32(offsets.len() as u32);
            for off in offsets {
                buf.put_u32(*off);
            }
            for len in lengths {
                buf.put_u32(*len);
            }
            buf.extend_from_slice(data);
            buf
        }
    }
}

/// Inverse of [`encode_part`] for a column of type `ty`.
pub fn decode_part(ty: Type, data: &[u8]) -> StorageResult<Column> {
    if !ty.is_var_len() {
        let width = ty.oid.storage_size() as usize;
        if data.len() % width != 0 {
            return Err(StorageError::corrupt(format!(
                "fixed-width part of {} bytes is not a multiple of {}",
                data.len(),
                width
            )));
        }
        return Ok(Column::Fixed {
            ty,
            data: data.to_vec(),
        });
    }

    let mut cursor = data;
    if cursor.remaining() < 4 {
        return Err(StorageError::corrupt("var-len part truncated"));
    }
    let rows = cursor.get_u32() as usize;
    if cursor.remaining() < rows * 8 {
        return Err(StorageError::corrupt("var-len part tables truncated"));
    }
    let mut offsets = Vec::with_capacity(rows);
    for _ in 0..rows {
        offsets.push(cursor.get_u32());
    }
    let mut lengths = Vec::with_capacity(rows);
    for _ in 0..rows {
        lengths.push(cursor.get_u32());
    }
    let blob = cursor.to_vec();
    for (off, len) in offsets.iter().zip(lengths.iter()) {
        if *off as usize + *len as usize > blob.len() {
            return Err(StorageError::corrupt("var-len row out of blob bounds"));
        }
    }
    Ok(Column::VarLen {
        ty,
        data: blob,
        offsets,
        lengths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhysicalType;

    #[test]
    fn test_part_roundtrip_fixed() {
        let col = Column::from_i32(&[3, 1, 2, 0]);
        let encoded = encode_part(&col);
        let decoded = decode_part(Type::new(PhysicalType::Int32), &encoded).unwrap();
        assert_eq!(decoded, col);
    }

    #[test]
    fn test_part_roundtrip_var_len() {
        let col = Column::from_strs(&["str1", "str0", "str2", "str3"]);
        let encoded = encode_part(&col);
        let decoded = decode_part(Type::new(PhysicalType::Varchar), &encoded).unwrap();
        assert_eq!(decoded, col);
        assert_eq!(decoded.var_len_at(1), b"str0");
    }

    #[test]
    fn test_decode_rejects_misaligned_fixed_part() {
        let err = decode_part(Type::new(PhysicalType::Int32), &[0, 1, 2]);
        assert!(matches!(err, Err(StorageError::CorruptData(_))));
    }
}
