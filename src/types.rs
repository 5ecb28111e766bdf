// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

//! Physical column types.
//!
//! A [`Type`] describes the on-disk representation of one column. Fixed-width
//! families (integers, floats, date/datetime) store their values inline;
//! char/varchar columns store a fixed-size descriptor in typed containers
//! while the actual bytes live out-of-line next to per-row offset/length
//! tables.

use serde::{Deserialize, Serialize};

/// Size of the descriptor recorded for variable-length (char/varchar) values.
pub const VARLEN_DESCRIPTOR_SIZE: i32 = 24;

/// Closed set of physical column type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Date,
    Datetime,
    Char,
    Varchar,
}

impl PhysicalType {
    /// Fixed storage size of one value of this type, in bytes.
    ///
    /// Char/varchar map to the fixed descriptor size, not to a per-instance
    /// length.
    pub fn storage_size(self) -> i32 {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 | Self::Date => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Datetime => 8,
            Self::Char | Self::Varchar => VARLEN_DESCRIPTOR_SIZE,
        }
    }

    /// Whether values of this type are stored out-of-line with offset/length
    /// tables.
    pub fn is_var_len(self) -> bool {
        matches!(self, Self::Char | Self::Varchar)
    }
}

impl std::fmt::Display for PhysicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int8 => "TINYINT",
            Self::Int16 => "SMALLINT",
            Self::Int32 => "INT",
            Self::Int64 => "BIGINT",
            Self::UInt8 => "TINYINT UNSIGNED",
            Self::UInt16 => "SMALLINT UNSIGNED",
            Self::UInt32 => "INT UNSIGNED",
            Self::UInt64 => "BIGINT UNSIGNED",
            Self::Float32 => "FLOAT",
            Self::Float64 => "DOUBLE",
            Self::Date => "DATE",
            Self::Datetime => "DATETIME",
            Self::Char => "CHAR",
            Self::Varchar => "VARCHAR",
        };
        write!(f, "{}", name)
    }
}

/// Physical type descriptor of one column.
///
/// Equality is structural over all four fields. Immutable once constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type {
    pub oid: PhysicalType,
    pub size: i32,
    pub width: i32,
    pub precision: i32,
}

impl Type {
    /// Build a descriptor with the canonical storage size for `oid`.
    pub fn new(oid: PhysicalType) -> Self {
        Self {
            oid,
            size: oid.storage_size(),
            width: 0,
            precision: 0,
        }
    }

    pub fn with_width(oid: PhysicalType, width: i32) -> Self {
        Self {
            width,
            ..Self::new(oid)
        }
    }

    pub fn is_var_len(&self) -> bool {
        self.oid.is_var_len()
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.oid)
    }
}
