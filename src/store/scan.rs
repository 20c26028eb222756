//! Row-by-row scan of a table's visible chunk.

use super::chunk::TableKey;
use super::mvcc::{Snapshot, TransactionOracle};
use super::view::{ColumnarView, Datum};
use crate::error::Result;
use crate::process::ProcessState;

/// Cursor over the rows of one table.
///
/// The visible chunk is looked up on the first call to
/// [`ChunkScan::next_row`]; [`ChunkScan::rescan`] starts over and looks it
/// up again.
pub struct ChunkScan<'a> {
    process: &'a ProcessState,
    table: TableKey,
    snapshot: Snapshot,
    oracle: &'a dyn TransactionOracle,
    view: Option<ColumnarView>,
    index: usize,
    exhausted: bool,
}

impl<'a> ChunkScan<'a> {
    pub fn new(
        process: &'a ProcessState,
        table: TableKey,
        snapshot: Snapshot,
        oracle: &'a dyn TransactionOracle,
    ) -> Self {
        Self {
            process,
            table,
            snapshot,
            oracle,
            view: None,
            index: 0,
            exhausted: false,
        }
    }

    pub fn next_row(&mut self) -> Result<Option<Vec<Datum<'_>>>> {
        if self.view.is_none() {
            if self.exhausted {
                return Ok(None);
            }
            let found = self
                .process
                .region()
                .chunks()
                .find_visible(&self.table, &self.snapshot, self.oracle)?;
            match found {
                Some(info) => self.view = Some(self.process.open_chunk(&info)?),
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }

        let Some(view) = self.view.as_ref() else {
            return Ok(None);
        };
        if self.index >= view.nitems() {
            return Ok(None);
        }
        let row = self.index;
        self.index += 1;
        view.row(row).map(Some)
    }

    /// Restart from the first row.
    pub fn rescan(&mut self) {
        self.view = None;
        self.index = 0;
        self.exhausted = false;
    }

    /// Rows returned so far.
    pub fn position(&self) -> usize {
        self.index
    }
}
