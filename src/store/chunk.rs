//! Chunk records of the shared registry.

use std::fmt;
use std::hash::{Hash, Hasher};

use ahash::AHasher;

use serde::{Deserialize, Serialize};

use super::mvcc::ChunkVersion;
use crate::gpu::IpcMemHandle;
use crate::shmem::SegmentHandle;

/// Catalog object id of the host.
pub type Oid = u32;

/// Number of hash buckets of the chunk registry.
pub const CHUNK_HASH_NSLOTS: usize = 97;

/// A table of one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub database: Oid,
    pub table: Oid,
}

impl TableKey {
    pub fn new(database: Oid, table: Oid) -> Self {
        Self { database, table }
    }

    /// Fixed-key hash of (database, table); selects the registry bucket.
    pub fn hash(&self) -> u32 {
        let mut hasher = AHasher::default();
        self.database.hash(&mut hasher);
        self.table.hash(&mut hasher);
        hasher.finish() as u32
    }

    pub fn bucket(&self) -> usize {
        self.hash() as usize % CHUNK_HASH_NSLOTS
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.table)
    }
}

/// Index of a chunk slot in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSlot(pub u32);

impl ChunkSlot {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A materialized chunk as stored in a registry slot.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub key: TableKey,
    pub hash: u32,
    pub version: ChunkVersion,
    pub nitems: usize,
    pub length: usize,
    /// GPU device holding a preserved copy, if pinned.
    pub device: Option<usize>,
    /// Zero unless pinned.
    pub ipc_handle: IpcMemHandle,
    pub segment: SegmentHandle,
}

impl Chunk {
    pub fn matches(&self, key: &TableKey, hash: u32) -> bool {
        self.hash == hash && self.key == *key
    }
}

/// Copy of a chunk handed out of the registry lock.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub slot: ChunkSlot,
    pub key: TableKey,
    pub version: ChunkVersion,
    pub nitems: usize,
    pub length: usize,
    pub device: Option<usize>,
    pub ipc_handle: IpcMemHandle,
    pub segment: SegmentHandle,
}

impl ChunkInfo {
    pub(crate) fn of(slot: ChunkSlot, chunk: &Chunk) -> Self {
        Self {
            slot,
            key: chunk.key,
            version: chunk.version,
            nitems: chunk.nitems,
            length: chunk.length,
            device: chunk.device,
            ipc_handle: chunk.ipc_handle,
            segment: chunk.segment,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.device.is_some()
    }
}
