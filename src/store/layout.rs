//! On-segment chunk image.
//!
//! ```text
//! +------------------+  0
//! | ImageHeader      |  32 bytes
//! +------------------+
//! | ColumnMetaRaw[n] |  64 bytes each
//! +------------------+
//! | column sections  |  each 8-byte aligned
//! +------------------+  header.length
//! ```
//!
//! All integers are little-endian. Offsets are relative to the image start.

use bytemuck::{Pod, Zeroable};

use crate::config::Compression;
use crate::error::{Result, StoreError};

pub const IMAGE_MAGIC: [u8; 4] = *b"GSTR";
pub const IMAGE_VERSION: u32 = 1;

/// Section alignment inside the image.
pub const IMAGE_ALIGN: usize = 8;

pub const COLMETA_FLAG_HASNULL: u32 = 0x0001;
pub const COLMETA_FLAG_ZSTD: u32 = 0x0002;

pub fn align_up(n: usize) -> usize {
    n.div_ceil(IMAGE_ALIGN) * IMAGE_ALIGN
}

/// Size of a null bitmap covering `nitems` rows.
pub fn bitmap_len(nitems: usize) -> usize {
    nitems.div_ceil(8)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ImageHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub ncols: u32,
    pub table_id: u32,
    pub nitems: u64,
    pub length: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ColumnMetaRaw {
    /// Value width in bytes, or -1 for variable width.
    pub width: i32,
    pub flags: u32,
    /// Zero when the column has no null bitmap.
    pub nullmap_offset: u64,
    pub values_offset: u64,
    pub values_length: u64,
    pub values_raw_length: u64,
    pub extra_offset: u64,
    pub extra_length: u64,
    pub extra_raw_length: u64,
}

pub const HEADER_LEN: usize = std::mem::size_of::<ImageHeader>();
pub const COLMETA_LEN: usize = std::mem::size_of::<ColumnMetaRaw>();

const _: () = assert!(HEADER_LEN == 32);
const _: () = assert!(COLMETA_LEN == 64);

impl ColumnMetaRaw {
    pub fn is_variable(&self) -> bool {
        self.width < 0
    }

    pub fn has_null(&self) -> bool {
        self.flags & COLMETA_FLAG_HASNULL != 0
    }

    pub fn compression(&self) -> Compression {
        if self.flags & COLMETA_FLAG_ZSTD != 0 {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Offset of the first section after the column metadata.
pub fn sections_offset(ncols: usize) -> usize {
    align_up(HEADER_LEN + COLMETA_LEN * ncols)
}

fn read_pod<T: Pod>(image: &[u8], offset: usize) -> Result<T> {
    let end = offset + std::mem::size_of::<T>();
    let bytes = image.get(offset..end).ok_or_else(|| {
        StoreError::Layout(format!("record at {offset} overruns {}-byte image", image.len()))
    })?;
    Ok(bytemuck::pod_read_unaligned(bytes))
}

/// Read and validate the image header.
pub fn read_header(image: &[u8]) -> Result<ImageHeader> {
    let header: ImageHeader = read_pod(image, 0)?;
    if header.magic != IMAGE_MAGIC {
        return Err(StoreError::Layout("bad magic".to_string()));
    }
    if header.version != IMAGE_VERSION {
        return Err(StoreError::Layout(format!(
            "unsupported image version {}",
            header.version
        )));
    }
    if header.length as usize != image.len() {
        return Err(StoreError::Layout(format!(
            "header length {} does not match segment length {}",
            header.length,
            image.len()
        )));
    }
    Ok(header)
}

/// Read the metadata record of column `index`.
pub fn read_column(image: &[u8], index: usize) -> Result<ColumnMetaRaw> {
    read_pod(image, HEADER_LEN + COLMETA_LEN * index)
}

/// Bytes of a section, checked against the image bounds.
pub fn section(image: &[u8], offset: u64, len: u64) -> Result<&[u8]> {
    let start = offset as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| StoreError::Layout("section length overflow".to_string()))?;
    image.get(start..end).ok_or_else(|| {
        StoreError::Layout(format!(
            "section {start}..{end} overruns {}-byte image",
            image.len()
        ))
    })
}
