//! Bulk-insert staging area.
//!
//! Rows are accumulated column by column in process-local buffers. Capacity
//! starts at `store.initial_rows` and grows by `nrooms + 5000` each time it
//! runs out. Variable-width values are deduplicated through a per-column
//! dictionary, so repeated values share one copy in the extra area.
//! [`BulkInsert::build_image`] lays the realized rows out as a chunk image
//! sized to fit exactly.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use super::compressor::Compressor;
use super::layout::{
    align_up, bitmap_len, sections_offset, ColumnMetaRaw, ImageHeader, COLMETA_FLAG_HASNULL,
    COLMETA_FLAG_ZSTD, COLMETA_LEN, HEADER_LEN, IMAGE_MAGIC, IMAGE_VERSION,
};
use super::table::{ColumnWidth, TableDef};
use crate::config::Compression;
use crate::context::ContextHandle;
use crate::error::{Result, StoreError};

/// Extra rows added on top of doubling when the staging area is full.
const STAGING_GROWTH: usize = 5000;

#[derive(Debug)]
enum ColumnBuffer {
    Fixed {
        width: usize,
        values: Vec<u8>,
        nullmap: Vec<u8>,
        has_null: bool,
    },
    Variable {
        /// Per row: 0 for null, else 1 + offset of the entry in `extra`.
        offsets: Vec<u32>,
        extra: Vec<u8>,
        dict: HashMap<Vec<u8>, u32>,
        has_null: bool,
    },
}

impl ColumnBuffer {
    fn new(width: ColumnWidth, nrooms: usize) -> Self {
        match width {
            ColumnWidth::Fixed(width) => ColumnBuffer::Fixed {
                width,
                values: Vec::with_capacity(width * nrooms),
                nullmap: Vec::with_capacity(bitmap_len(nrooms)),
                has_null: false,
            },
            ColumnWidth::Variable => ColumnBuffer::Variable {
                offsets: Vec::with_capacity(nrooms),
                extra: Vec::new(),
                dict: HashMap::new(),
                has_null: false,
            },
        }
    }

    fn reserve(&mut self, additional: usize) {
        match self {
            ColumnBuffer::Fixed {
                width,
                values,
                nullmap,
                ..
            } => {
                values.reserve_exact(*width * additional);
                nullmap.reserve_exact(bitmap_len(additional));
            }
            ColumnBuffer::Variable { offsets, .. } => offsets.reserve_exact(additional),
        }
    }

    fn push(&mut self, row: usize, value: Option<&[u8]>) -> Result<()> {
        match self {
            ColumnBuffer::Fixed {
                width,
                values,
                nullmap,
                has_null,
            } => {
                if row % 8 == 0 {
                    nullmap.push(0);
                }
                match value {
                    Some(v) => {
                        if v.len() != *width {
                            return Err(StoreError::InvalidOption(format!(
                                "value of {} bytes for a {}-byte column",
                                v.len(),
                                width
                            )));
                        }
                        values.extend_from_slice(v);
                        if let Some(bits) = nullmap.last_mut() {
                            *bits |= 1 << (row % 8);
                        }
                    }
                    None => {
                        values.resize(values.len() + *width, 0);
                        *has_null = true;
                    }
                }
            }
            ColumnBuffer::Variable {
                offsets,
                extra,
                dict,
                has_null,
            } => match value {
                None => {
                    offsets.push(0);
                    *has_null = true;
                }
                Some(v) => {
                    let offset = match dict.get(v) {
                        Some(&offset) => offset,
                        None => {
                            let offset = u32::try_from(extra.len()).map_err(|_| {
                                StoreError::AllocationFailure(
                                    "variable-width area exceeds 4GB".to_string(),
                                )
                            })?;
                            let len = u32::try_from(v.len()).map_err(|_| {
                                StoreError::InvalidOption("value exceeds 4GB".to_string())
                            })?;
                            extra.extend_from_slice(&len.to_le_bytes());
                            extra.extend_from_slice(v);
                            dict.insert(v.to_vec(), offset);
                            offset
                        }
                    };
                    offsets.push(offset + 1);
                }
            },
        }
        Ok(())
    }
}

/// One column's encoded sections, ready to be copied into the image.
struct EncodedColumn {
    meta: ColumnMetaRaw,
    nullmap: Option<Vec<u8>>,
    values: Vec<u8>,
    extra: Vec<u8>,
}

/// An in-progress bulk insert into an empty table.
#[derive(Debug)]
pub struct BulkInsert {
    table: TableDef,
    context: Option<ContextHandle>,
    nrooms: usize,
    nitems: usize,
    columns: Vec<ColumnBuffer>,
}

impl BulkInsert {
    pub(crate) fn new(table: TableDef, initial_rows: usize, context: Option<ContextHandle>) -> Self {
        let nrooms = initial_rows.max(1);
        let columns = table
            .columns
            .iter()
            .map(|c| ColumnBuffer::new(c.width, nrooms))
            .collect();
        Self {
            table,
            context,
            nrooms,
            nitems: 0,
            columns,
        }
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    /// Context bound to the pinning device, held for the insert's lifetime.
    pub fn context(&self) -> Option<&ContextHandle> {
        self.context.as_ref()
    }

    pub(crate) fn take_context(&mut self) -> Option<ContextHandle> {
        self.context.take()
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    /// Current row capacity of the staging area.
    pub fn nrooms(&self) -> usize {
        self.nrooms
    }

    /// Append one row; `None` entries are nulls.
    pub fn insert_row(&mut self, row: &[Option<&[u8]>]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(StoreError::InvalidOption(format!(
                "row has {} values, table {} has {} columns",
                row.len(),
                self.table.key,
                self.columns.len()
            )));
        }
        // validate before touching any buffer so a bad row leaves no trace
        for (def, value) in self.table.columns.iter().zip(row) {
            if let (ColumnWidth::Fixed(width), Some(v)) = (def.width, value) {
                if v.len() != width {
                    return Err(StoreError::InvalidOption(format!(
                        "column {} expects {} bytes, got {}",
                        def.name,
                        width,
                        v.len()
                    )));
                }
            }
        }
        if self.nitems >= self.nrooms {
            self.expand();
        }
        for (buffer, value) in self.columns.iter_mut().zip(row) {
            buffer.push(self.nitems, *value)?;
        }
        self.nitems += 1;
        Ok(())
    }

    fn expand(&mut self) {
        let additional = self.nrooms + STAGING_GROWTH;
        self.nrooms += additional;
        for buffer in &mut self.columns {
            buffer.reserve(additional);
        }
        debug!(table = %self.table.key, nrooms = self.nrooms, "Expanded staging area");
    }

    fn encode_column(
        &self,
        index: usize,
        compressor: &Compressor,
    ) -> Result<EncodedColumn> {
        let mode = self.table.columns[index].options.compression;
        let flags_for = |has_null: bool| {
            let mut flags = 0;
            if has_null {
                flags |= COLMETA_FLAG_HASNULL;
            }
            if mode == Compression::Zstd {
                flags |= COLMETA_FLAG_ZSTD;
            }
            flags
        };

        let encoded = match &self.columns[index] {
            ColumnBuffer::Fixed {
                width,
                values,
                nullmap,
                has_null,
            } => {
                let stored = compressor.compress(mode, values)?;
                EncodedColumn {
                    meta: ColumnMetaRaw {
                        width: *width as i32,
                        flags: flags_for(*has_null),
                        values_length: stored.len() as u64,
                        values_raw_length: values.len() as u64,
                        ..ColumnMetaRaw::default()
                    },
                    nullmap: has_null.then(|| nullmap.clone()),
                    values: stored,
                    extra: Vec::new(),
                }
            }
            ColumnBuffer::Variable {
                offsets,
                extra,
                has_null,
                ..
            } => {
                let raw: Vec<u8> = offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
                let stored = compressor.compress(mode, &raw)?;
                let stored_extra = compressor.compress(mode, extra)?;
                EncodedColumn {
                    meta: ColumnMetaRaw {
                        width: -1,
                        flags: flags_for(*has_null),
                        values_length: stored.len() as u64,
                        values_raw_length: raw.len() as u64,
                        extra_length: stored_extra.len() as u64,
                        extra_raw_length: extra.len() as u64,
                        ..ColumnMetaRaw::default()
                    },
                    nullmap: None,
                    values: stored,
                    extra: stored_extra,
                }
            }
        };
        Ok(encoded)
    }

    /// Lay the staged rows out as a chunk image.
    pub fn build_image(&self, compressor: &Compressor) -> Result<Bytes> {
        let mut encoded = (0..self.columns.len())
            .map(|i| self.encode_column(i, compressor))
            .collect::<Result<Vec<_>>>()?;

        // assign section offsets
        let mut offset = sections_offset(encoded.len());
        for col in &mut encoded {
            if let Some(nullmap) = &col.nullmap {
                col.meta.nullmap_offset = offset as u64;
                offset = align_up(offset + nullmap.len());
            }
            col.meta.values_offset = offset as u64;
            offset = align_up(offset + col.values.len());
            if col.meta.extra_raw_length > 0 {
                col.meta.extra_offset = offset as u64;
                offset = align_up(offset + col.extra.len());
            }
        }
        let length = offset;

        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            ncols: encoded.len() as u32,
            table_id: self.table.key.table,
            nitems: self.nitems as u64,
            length: length as u64,
        };

        let mut image = vec![0u8; length];
        image[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
        for (i, col) in encoded.iter().enumerate() {
            let at = HEADER_LEN + COLMETA_LEN * i;
            image[at..at + COLMETA_LEN].copy_from_slice(bytemuck::bytes_of(&col.meta));
            if let Some(nullmap) = &col.nullmap {
                let at = col.meta.nullmap_offset as usize;
                image[at..at + nullmap.len()].copy_from_slice(nullmap);
            }
            let at = col.meta.values_offset as usize;
            image[at..at + col.values.len()].copy_from_slice(&col.values);
            if col.meta.extra_raw_length > 0 {
                let at = col.meta.extra_offset as usize;
                image[at..at + col.extra.len()].copy_from_slice(&col.extra);
            }
        }

        debug!(
            table = %self.table.key,
            nitems = self.nitems,
            length,
            "Built chunk image"
        );
        Ok(Bytes::from(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::chunk::TableKey;
    use crate::store::layout::{read_column, read_header};
    use crate::store::table::ColumnDef;
    use crate::config::TableOptions;

    fn table() -> TableDef {
        TableDef::new(
            TableKey::new(1, 100),
            TableOptions::default(),
            vec![ColumnDef::fixed("id", 4), ColumnDef::variable("name")],
        )
    }

    #[test]
    fn test_staging_grows_by_doubling_plus_5000() {
        let mut insert = BulkInsert::new(table(), 2, None);
        for i in 0u32..3 {
            insert
                .insert_row(&[Some(&i.to_le_bytes()), Some(b"x")])
                .unwrap();
        }
        assert_eq!(insert.nitems(), 3);
        assert_eq!(insert.nrooms(), 2 + 2 + 5000);
    }

    #[test]
    fn test_bad_rows_are_rejected_without_side_effects() {
        let mut insert = BulkInsert::new(table(), 10, None);
        assert!(insert.insert_row(&[Some(b"abc"), None]).is_err());
        assert!(insert.insert_row(&[None]).is_err());
        assert_eq!(insert.nitems(), 0);
    }

    #[test]
    fn test_variable_values_are_deduplicated() {
        let mut insert = BulkInsert::new(table(), 10, None);
        for i in 0u32..4 {
            insert
                .insert_row(&[Some(&i.to_le_bytes()), Some(b"same")])
                .unwrap();
        }
        match &insert.columns[1] {
            ColumnBuffer::Variable { extra, .. } => assert_eq!(extra.len(), 4 + 4),
            ColumnBuffer::Fixed { .. } => panic!("expected variable column"),
        }
    }

    #[test]
    fn test_image_is_sized_exactly() {
        let mut insert = BulkInsert::new(table(), 10, None);
        insert.insert_row(&[Some(&7u32.to_le_bytes()), None]).unwrap();
        insert.insert_row(&[None, Some(b"hello")]).unwrap();

        let image = insert.build_image(&Compressor::new(1)).unwrap();
        let header = read_header(&image).unwrap();
        assert_eq!(header.nitems, 2);
        assert_eq!(header.ncols, 2);
        assert_eq!(header.length as usize, image.len());

        let id = read_column(&image, 0).unwrap();
        assert_eq!(id.width, 4);
        assert!(id.has_null());
        let name = read_column(&image, 1).unwrap();
        assert!(name.is_variable());
        assert_eq!(name.extra_raw_length, 4 + 5);
    }
}
