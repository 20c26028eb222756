//! Read-only columnar view over an attached chunk image.

use super::compressor::Compressor;
use super::layout::{bitmap_len, read_column, read_header, section, ColumnMetaRaw, ImageHeader};
use crate::config::Compression;
use crate::error::{Result, StoreError};
use crate::shmem::Mapping;

/// One value of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datum<'a> {
    Null,
    Fixed(&'a [u8]),
    Variable(&'a [u8]),
}

impl<'a> Datum<'a> {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn bytes(&self) -> Option<&'a [u8]> {
        match self {
            Datum::Null => None,
            Datum::Fixed(b) | Datum::Variable(b) => Some(*b),
        }
    }

    /// Little-endian `i32` of a 4-byte fixed value.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Datum::Fixed(b) => Some(i32::from_le_bytes((*b).try_into().ok()?)),
            _ => None,
        }
    }

    /// Little-endian `i64` of an 8-byte fixed value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Fixed(b) => Some(i64::from_le_bytes((*b).try_into().ok()?)),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Area {
    /// Range of the mapping, stored uncompressed.
    Raw(usize, usize),
    Inflated(Vec<u8>),
}

#[derive(Debug)]
struct ColumnData {
    meta: ColumnMetaRaw,
    nullmap: Option<Area>,
    values: Area,
    extra: Area,
}

/// A chunk image opened for reading. Compressed areas are inflated once,
/// when the view is opened.
#[derive(Debug)]
pub struct ColumnarView {
    mapping: Mapping,
    header: ImageHeader,
    columns: Vec<ColumnData>,
}

fn open_area(
    image: &[u8],
    compressor: &Compressor,
    mode: Compression,
    offset: u64,
    stored: u64,
    raw: u64,
) -> Result<Area> {
    let bytes = section(image, offset, stored)?;
    match mode {
        Compression::None => {
            if stored != raw {
                return Err(StoreError::Layout(format!(
                    "uncompressed area of {stored} bytes declares {raw} raw bytes"
                )));
            }
            Ok(Area::Raw(offset as usize, stored as usize))
        }
        Compression::Zstd => Ok(Area::Inflated(compressor.decompress(
            mode,
            bytes,
            raw as usize,
        )?)),
    }
}

impl ColumnarView {
    pub fn open(mapping: Mapping, compressor: &Compressor) -> Result<Self> {
        let image = mapping.bytes();
        let header = read_header(image)?;
        let nitems = header.nitems as usize;

        let mut columns = Vec::with_capacity(header.ncols as usize);
        for index in 0..header.ncols as usize {
            let meta = read_column(image, index)?;
            let mode = meta.compression();
            let nullmap = if meta.has_null() && !meta.is_variable() {
                let len = bitmap_len(nitems);
                section(image, meta.nullmap_offset, len as u64)?;
                Some(Area::Raw(meta.nullmap_offset as usize, len))
            } else {
                None
            };
            let expected = if meta.is_variable() {
                nitems * 4
            } else {
                nitems * meta.width as usize
            };
            if meta.values_raw_length as usize != expected {
                return Err(StoreError::Layout(format!(
                    "column {index} value area is {} bytes, expected {expected}",
                    meta.values_raw_length
                )));
            }
            let values = open_area(
                image,
                compressor,
                mode,
                meta.values_offset,
                meta.values_length,
                meta.values_raw_length,
            )?;
            let extra = if meta.extra_raw_length > 0 {
                open_area(
                    image,
                    compressor,
                    mode,
                    meta.extra_offset,
                    meta.extra_length,
                    meta.extra_raw_length,
                )?
            } else {
                Area::Inflated(Vec::new())
            };
            columns.push(ColumnData {
                meta,
                nullmap,
                values,
                extra,
            });
        }

        Ok(Self {
            mapping,
            header,
            columns,
        })
    }

    pub fn nitems(&self) -> usize {
        self.header.nitems as usize
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn length(&self) -> usize {
        self.mapping.len()
    }

    pub fn column_meta(&self, col: usize) -> Option<&ColumnMetaRaw> {
        self.columns.get(col).map(|c| &c.meta)
    }

    fn area<'a>(&'a self, area: &'a Area) -> &'a [u8] {
        match area {
            Area::Raw(offset, len) => &self.mapping.bytes()[*offset..*offset + *len],
            Area::Inflated(buf) => buf,
        }
    }

    /// Value of column `col` in row `row`.
    pub fn datum(&self, col: usize, row: usize) -> Result<Datum<'_>> {
        let column = self.columns.get(col).ok_or_else(|| {
            StoreError::Layout(format!("column {col} out of {}", self.columns.len()))
        })?;
        if row >= self.nitems() {
            return Err(StoreError::Layout(format!(
                "row {row} out of {}",
                self.nitems()
            )));
        }
        let values = self.area(&column.values);

        if column.meta.is_variable() {
            let at = row * 4;
            let raw: [u8; 4] = values[at..at + 4]
                .try_into()
                .map_err(|_| StoreError::Layout("short offset entry".to_string()))?;
            let offset = u32::from_le_bytes(raw) as usize;
            if offset == 0 {
                return Ok(Datum::Null);
            }
            let extra = self.area(&column.extra);
            let start = offset - 1;
            let len_bytes: [u8; 4] = extra
                .get(start..start + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| StoreError::Layout(format!("bad extra offset {start}")))?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            let value = extra
                .get(start + 4..start + 4 + len)
                .ok_or_else(|| StoreError::Layout(format!("value at {start} overruns extra area")))?;
            return Ok(Datum::Variable(value));
        }

        if let Some(nullmap) = &column.nullmap {
            let bits = self.area(nullmap);
            if bits[row / 8] & (1 << (row % 8)) == 0 {
                return Ok(Datum::Null);
            }
        }
        let width = column.meta.width as usize;
        Ok(Datum::Fixed(&values[row * width..(row + 1) * width]))
    }

    /// All values of row `row`.
    pub fn row(&self, row: usize) -> Result<Vec<Datum<'_>>> {
        (0..self.ncols()).map(|col| self.datum(col, row)).collect()
    }
}
