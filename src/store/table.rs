//! Table definitions as handed over by the host catalog.

use serde::{Deserialize, Serialize};

use super::chunk::TableKey;
use crate::config::{ColumnOptions, TableOptions};

/// Storage width of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnWidth {
    /// Every value takes exactly this many bytes.
    Fixed(usize),
    /// Length-prefixed values, deduplicated per chunk.
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub width: ColumnWidth,
    pub options: ColumnOptions,
}

impl ColumnDef {
    pub fn fixed(name: &str, width: usize) -> Self {
        Self {
            name: name.to_string(),
            width: ColumnWidth::Fixed(width),
            options: ColumnOptions::default(),
        }
    }

    pub fn variable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: ColumnWidth::Variable,
            options: ColumnOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ColumnOptions) -> Self {
        self.options = options;
        self
    }
}

/// A GPU store table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub key: TableKey,
    pub options: TableOptions,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(key: TableKey, options: TableOptions, columns: Vec<ColumnDef>) -> Self {
        Self {
            key,
            options,
            columns,
        }
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }
}
