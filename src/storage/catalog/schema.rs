// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

use crate::compress::CompressAlgo;
use crate::storage::{StorageError, StorageResult};
use crate::types::Type;

/// One named, typed column of a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: Type,
    /// Codec shared by every block of this column family.
    pub compression: CompressAlgo,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: Type, compression: CompressAlgo) -> Self {
        Self {
            name: name.into(),
            ty,
            compression,
        }
    }
}

/// Ordered column layout of a table, immutable after table creation.
///
/// The table is created under the name carried here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Index into `columns` of the designated primary key, if any.
    pub primary_key: Option<usize>,
}

impl Schema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: None,
        }
    }

    pub fn with_primary_key(mut self, column: usize) -> Self {
        assert!(column < self.columns.len());
        self.primary_key = Some(column);
        self
    }

    pub fn types(&self) -> Vec<Type> {
        self.columns.iter().map(|c| c.ty).collect()
    }

    /// Structural sanity checks applied before a table is created.
    pub fn validate(&self) -> StorageResult<()> {
        if self.name.is_empty() {
            return Err(StorageError::InvalidBatch("empty table name".into()));
        }
        if self.columns.is_empty() {
            return Err(StorageError::InvalidBatch(format!(
                "table {} has no columns",
                self.name
            )));
        }
        for (idx, col) in self.columns.iter().enumerate() {
            if self.columns[..idx].iter().any(|c| c.name == col.name) {
                return Err(StorageError::already_exists("column", &col.name));
            }
        }
        if let Some(pk) = self.primary_key {
            if pk >= self.columns.len() {
                return Err(StorageError::InvalidColumn(pk));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhysicalType;

    #[test]
    fn test_schema_rejects_duplicate_columns() {
        let schema = Schema::new(
            "t",
            vec![
                ColumnDef::new("a", Type::new(PhysicalType::Int32), CompressAlgo::Lz4),
                ColumnDef::new("a", Type::new(PhysicalType::Int64), CompressAlgo::Lz4),
            ],
        );
        assert!(matches!(
            schema.validate(),
            Err(StorageError::AlreadyExists("column", _))
        ));
    }
}
