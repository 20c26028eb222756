//! Dynamically created shared segments.
//!
//! A segment is identified by a [`SegmentHandle`] that is meaningful in every
//! process. Attaching yields a process-local [`Mapping`]; the segment stays
//! attachable while it is pinned, and a mapping stays readable until it is
//! dropped even after the segment was unpinned.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Cross-process identifier of a shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(u32);

impl SegmentHandle {
    /// Handle of no segment.
    pub const INVALID: SegmentHandle = SegmentHandle(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A process-local attachment of a shared segment.
#[derive(Debug, Clone)]
pub struct Mapping {
    handle: SegmentHandle,
    data: Bytes,
}

impl Mapping {
    pub fn handle(&self) -> SegmentHandle {
        self.handle
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Default)]
struct SegmentTable {
    next: u32,
    segments: HashMap<SegmentHandle, Bytes>,
    bytes_total: usize,
}

/// Registry of live shared segments.
#[derive(Debug, Default)]
pub struct SegmentManager {
    table: Mutex<SegmentTable>,
}

impl SegmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fully written image as a new pinned segment.
    pub fn create(&self, data: Bytes) -> SegmentHandle {
        let mut table = self.table.lock();
        let handle = SegmentHandle(table.next);
        table.next = table.next.wrapping_add(1);
        if table.next == u32::MAX {
            table.next = 0;
        }
        table.bytes_total += data.len();
        debug!(segment = handle.0, len = data.len(), "Created shared segment");
        table.segments.insert(handle, data);
        handle
    }

    /// Create a zero-filled segment of `len` bytes.
    pub fn create_zeroed(&self, len: usize) -> SegmentHandle {
        self.create(Bytes::from(vec![0u8; len]))
    }

    /// Map a segment into the calling process.
    pub fn attach(&self, handle: SegmentHandle) -> Result<Mapping> {
        let table = self.table.lock();
        let data = table.segments.get(&handle).cloned().ok_or_else(|| {
            StoreError::ProtocolViolation(format!("shared segment {} does not exist", handle.0))
        })?;
        Ok(Mapping { handle, data })
    }

    /// Drop the pin; the segment can no longer be attached.
    pub fn unpin(&self, handle: SegmentHandle) -> Result<()> {
        let mut table = self.table.lock();
        match table.segments.remove(&handle) {
            Some(data) => {
                table.bytes_total -= data.len();
                debug!(segment = handle.0, "Released shared segment");
                Ok(())
            }
            None => Err(StoreError::ProtocolViolation(format!(
                "shared segment {} released twice",
                handle.0
            ))),
        }
    }

    pub fn contains(&self, handle: SegmentHandle) -> bool {
        self.table.lock().segments.contains_key(&handle)
    }

    /// Number of live segments.
    pub fn live_count(&self) -> usize {
        self.table.lock().segments.len()
    }

    /// Bytes held by live segments.
    pub fn bytes_total(&self) -> usize {
        self.table.lock().bytes_total
    }
}
