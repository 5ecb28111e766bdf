// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Columnar value containers handed to the write path.
//!
//! A [`Column`] is a closed tagged variant over the two physical encodings
//! the storage core understands: a dense fixed-width byte buffer, or a
//! variable-length byte blob with per-row offset/length tables. A [`Batch`]
//! is an ordered set of equally sized columns.

use crate::storage::{StorageError, StorageResult};
use crate::types::{PhysicalType, Type};

/// One column of values in its dense physical encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    /// Fixed-width values, `data.len() == rows * ty.oid.storage_size()`.
    Fixed { ty: Type, data: Vec<u8> },
    /// Variable-length values: a byte blob plus per-row offset/length tables.
    VarLen {
        ty: Type,
        data: Vec<u8>,
        offsets: Vec<u32>,
        lengths: Vec<u32>,
    },
}

impl Column {
    pub fn ty(&self) -> &Type {
        match self {
            Self::Fixed { ty, .. } | Self::VarLen { ty, .. } => ty,
        }
    }

    /// Number of rows held by this column.
    pub fn len(&self) -> usize {
        match self {
            Self::Fixed { ty, data } => data.len() / ty.oid.storage_size() as usize,
            Self::VarLen { offsets, .. } => offsets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out `len` rows starting at `start`.
    pub fn slice(&self, start: usize, len: usize) -> Column {
        assert!(start + len <= self.len(), "slice out of bounds");
        match self {
            Self::Fixed { ty, data } => {
                let width = ty.oid.storage_size() as usize;
                Self::Fixed {
                    ty: *ty,
                    data: data[start * width..(start + len) * width].to_vec(),
                }
            }
            Self::VarLen {
                ty,
                data,
                offsets,
                lengths,
            } => {
                let mut out_data = Vec::new();
                let mut out_offsets = Vec::with_capacity(len);
                let mut out_lengths = Vec::with_capacity(len);
                for row in start..start + len {
                    let (off, n) = (offsets[row] as usize, lengths[row] as usize);
                    out_offsets.push(out_data.len() as u32);
                    out_lengths.push(n as u32);
                    out_data.extend_from_slice(&data[off..off + n]);
                }
                Self::VarLen {
                    ty: *ty,
                    data: out_data,
                    offsets: out_offsets,
                    lengths: out_lengths,
                }
            }
        }
    }

    /// Append all rows of `other` to this column. The type descriptors must
    /// match.
    pub fn extend(&mut self, other: &Column) {
        assert_eq!(self.ty(), other.ty(), "column type mismatch");
        match (self, other) {
            (Self::Fixed { data, .. }, Self::Fixed { data: rhs, .. }) => {
                data.extend_from_slice(rhs);
            }
            (
                Self::VarLen {
                    data,
                    offsets,
                    lengths,
                    ..
                },
                Self::VarLen {
                    data: rhs_data,
                    offsets: rhs_offsets,
                    lengths: rhs_lengths,
                    ..
                },
            ) => {
                for (off, n) in rhs_offsets.iter().zip(rhs_lengths.iter()) {
                    let (off, n) = (*off as usize, *n as usize);
                    offsets.push(data.len() as u32);
                    lengths.push(n as u32);
                    data.extend_from_slice(&rhs_data[off..off + n]);
                }
            }
            _ => unreachable!("column encoding mismatch"),
        }
    }

    pub fn from_i32(values: &[i32]) -> Column {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::Fixed {
            ty: Type::new(PhysicalType::Int32),
            data,
        }
    }

    pub fn from_i64(values: &[i64]) -> Column {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::Fixed {
            ty: Type::new(PhysicalType::Int64),
            data,
        }
    }

    pub fn from_strs(values: &[&str]) -> Column {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(values.len());
        let mut lengths = Vec::with_capacity(values.len());
        for v in values {
            offsets.push(data.len() as u32);
            lengths.push(v.len() as u32);
            data.extend_from_slice(v.as_bytes());
        }
        Self::VarLen {
            ty: Type::new(PhysicalType::Varchar),
            data,
            offsets,
            lengths,
        }
    }

    /// Reinterpret a fixed-width `Int32` column as values.
    pub fn as_i32(&self) -> Vec<i32> {
        match self {
            Self::Fixed { ty, data } if ty.oid == PhysicalType::Int32 => data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
                .collect(),
            _ => panic!("not an int32 column"),
        }
    }

    /// Raw bytes of one row of a variable-length column.
    pub fn var_len_at(&self, row: usize) -> &[u8] {
        match self {
            Self::VarLen {
                data,
                offsets,
                lengths,
                ..
            } => {
                let (off, n) = (offsets[row] as usize, lengths[row] as usize);
                &data[off..off + n]
            }
            _ => panic!("not a var-len column"),
        }
    }
}

/// An ordered set of columns with a uniform row count.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    columns: Vec<Column>,
}

impl Batch {
    pub fn new(columns: Vec<Column>) -> StorageResult<Self> {
        if let Some(first) = columns.first() {
            let rows = first.len();
            if columns.iter().any(|c| c.len() != rows) {
                return Err(StorageError::InvalidBatch(
                    "columns have differing row counts".into(),
                ));
            }
        }
        Ok(Self { columns })
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Copy out `len` rows starting at `start` from every column.
    pub fn slice(&self, start: usize, len: usize) -> Batch {
        Batch {
            columns: self.columns.iter().map(|c| c.slice(start, len)).collect(),
        }
    }

    /// Append all rows of `other` column by column.
    pub fn extend(&mut self, other: &Batch) {
        assert_eq!(self.column_count(), other.column_count());
        for (lhs, rhs) in self.columns.iter_mut().zip(other.columns.iter()) {
            lhs.extend(rhs);
        }
    }
}
