// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Column compression codecs.
//!
//! The algorithm is part of the column/table configuration, not of the block,
//! so every block of a column family shares one codec. Decompression writes
//! into a caller-supplied buffer sized to the recorded original length.

use serde::{Deserialize, Serialize};

use crate::storage::{StorageError, StorageResult};

/// Compression algorithm identifier stored in column configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressAlgo {
    /// Store bytes verbatim.
    None,
    #[default]
    Lz4,
    Zstd,
}

impl CompressAlgo {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Zstd => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Compress `data` with `algo`.
pub fn compress(algo: CompressAlgo, data: &[u8]) -> StorageResult<Vec<u8>> {
    match algo {
        CompressAlgo::None => Ok(data.to_vec()),
        CompressAlgo::Lz4 => Ok(lz4_flex::block::compress(data)),
        CompressAlgo::Zstd => zstd::bulk::compress(data, 0).map_err(StorageError::from),
    }
}

/// Decompress `data` into `out`, which must be sized to the original length.
/// Returns the number of bytes written.
pub fn decompress(algo: CompressAlgo, data: &[u8], out: &mut [u8]) -> StorageResult<usize> {
    match algo {
        CompressAlgo::None => {
            if out.len() < data.len() {
                return Err(StorageError::CorruptData(
                    "decompression buffer too small".into(),
                ));
            }
            out[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }
        CompressAlgo::Lz4 => lz4_flex::block::decompress_into(data, out)
            .map_err(|e| StorageError::CorruptData(format!("lz4: {}", e))),
        CompressAlgo::Zstd => zstd::bulk::decompress_to_buffer(data, out)
            .map_err(|e| StorageError::CorruptData(format!("zstd: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algo: CompressAlgo) {
        let data: Vec<u8> = (0..4096u32).flat_map(|v| (v % 13).to_le_bytes()).collect();
        let compressed = compress(algo, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        let written = decompress(algo, &compressed, &mut out).unwrap();
        assert_eq!(written, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn test_roundtrip_all_algos() {
        roundtrip(CompressAlgo::None);
        roundtrip(CompressAlgo::Lz4);
        roundtrip(CompressAlgo::Zstd);
    }

    #[test]
    fn test_corrupt_input_is_reported() {
        let mut out = vec![0u8; 128];
        let err = decompress(CompressAlgo::Lz4, &[0xff, 0xee, 0x01], &mut out);
        assert!(matches!(err, Err(StorageError::CorruptData(_))));
    }
}
