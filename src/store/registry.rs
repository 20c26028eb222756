//! The shared chunk registry.
//!
//! A fixed array of chunk slots, an index free list and a hash table of
//! active slots, all behind a single lock. Lookups, mutations and the
//! transaction-end sweep are linearizable under that lock.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::chunk::{Chunk, ChunkInfo, ChunkSlot, TableKey, CHUNK_HASH_NSLOTS};
use super::mvcc::{EndOutcome, Snapshot, TransactionId, TransactionOracle};
use crate::error::{Result, StoreError};

#[derive(Debug)]
struct RegistryState {
    slots: Vec<Option<Chunk>>,
    free: Vec<u32>,
    buckets: Vec<Vec<u32>>,
}

impl RegistryState {
    fn find_visible(
        &mut self,
        key: &TableKey,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<Option<u32>> {
        let hash = key.hash();
        let bucket = hash as usize % CHUNK_HASH_NSLOTS;
        let mut found = None;

        for &index in &self.buckets[bucket] {
            let Some(chunk) = self.slots[index as usize].as_mut() else {
                continue;
            };
            if chunk.matches(key, hash) && chunk.version.satisfies(snapshot, oracle) {
                if let Some(first) = found {
                    return Err(StoreError::ProtocolViolation(format!(
                        "multiple chunks of table {key} are visible (slots {first} and {index})"
                    )));
                }
                found = Some(index);
            }
        }
        Ok(found)
    }

    /// A chunk of `key` that a new insert by the current transaction would
    /// race with.
    fn find_conflicting(&self, key: &TableKey, oracle: &dyn TransactionOracle) -> Option<u32> {
        let hash = key.hash();
        self.buckets[hash as usize % CHUNK_HASH_NSLOTS]
            .iter()
            .copied()
            .find(|&index| {
                self.slots[index as usize]
                    .as_ref()
                    .is_some_and(|c| c.matches(key, hash) && c.version.blocks_writer(oracle))
            })
    }

    fn insert(&mut self, chunk: Chunk, capacity: usize) -> Result<u32> {
        let index = self.free.pop().ok_or(StoreError::ResourceExhausted {
            resource: "chunk slot",
            capacity,
        })?;
        let bucket = chunk.hash as usize % CHUNK_HASH_NSLOTS;
        debug!(
            slot = index,
            table = %chunk.key,
            xmin = %chunk.version.xmin,
            nitems = chunk.nitems,
            "Published chunk"
        );
        self.slots[index as usize] = Some(chunk);
        self.buckets[bucket].push(index);
        Ok(index)
    }

    fn info(&self, index: u32) -> Option<ChunkInfo> {
        self.slots[index as usize]
            .as_ref()
            .map(|chunk| ChunkInfo::of(ChunkSlot(index), chunk))
    }

    fn release(&mut self, bucket: usize, index: u32) -> Option<Chunk> {
        self.buckets[bucket].retain(|&i| i != index);
        let chunk = self.slots[index as usize].take();
        self.free.push(index);
        chunk
    }
}

/// Occupancy of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub capacity: usize,
    pub active: usize,
    pub free: usize,
    pub has_warm_chunks: bool,
}

#[derive(Debug)]
pub struct ChunkRegistry {
    state: Mutex<RegistryState>,
    /// Nonzero while some chunk may have a pending state change.
    has_warm_chunks: AtomicU32,
    capacity: usize,
}

impl ChunkRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                slots: vec![None; capacity],
                free: (0..capacity as u32).rev().collect(),
                buckets: (0..CHUNK_HASH_NSLOTS).map(|_| Vec::new()).collect(),
            }),
            has_warm_chunks: AtomicU32::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The single chunk of `key` visible to `snapshot`.
    ///
    /// Two visible chunks mean the registry is corrupt; that is reported
    /// as a [`StoreError::ProtocolViolation`] rather than picking one.
    pub fn find_visible(
        &self,
        key: &TableKey,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<Option<ChunkInfo>> {
        let mut state = self.state.lock();
        let found = state.find_visible(key, snapshot, oracle)?;
        Ok(found.and_then(|index| state.info(index)))
    }

    /// Copy of the chunk in `slot`, if any.
    pub fn get(&self, slot: ChunkSlot) -> Option<ChunkInfo> {
        let state = self.state.lock();
        if slot.index() >= state.slots.len() {
            return None;
        }
        state.info(slot.0)
    }

    /// Publish a finished chunk into its bucket.
    pub fn publish(&self, chunk: Chunk) -> Result<ChunkSlot> {
        let index = self.state.lock().insert(chunk, self.capacity)?;
        self.has_warm_chunks.fetch_add(1, Ordering::AcqRel);
        Ok(ChunkSlot(index))
    }

    /// Publish a chunk unless another live or in-flight chunk of the same
    /// table exists, in which case [`StoreError::ConcurrentUpdate`] is
    /// returned. Check and insert happen under one lock acquisition.
    pub fn publish_exclusive(
        &self,
        chunk: Chunk,
        oracle: &dyn TransactionOracle,
    ) -> Result<ChunkSlot> {
        let mut state = self.state.lock();
        if let Some(index) = state.find_conflicting(&chunk.key, oracle) {
            debug!(slot = index, table = %chunk.key, "Insert conflicts with a live chunk");
            return Err(StoreError::ConcurrentUpdate(chunk.key));
        }
        let index = state.insert(chunk, self.capacity)?;
        drop(state);
        self.has_warm_chunks.fetch_add(1, Ordering::AcqRel);
        Ok(ChunkSlot(index))
    }

    /// Stamp the deletion of the chunk of `key` visible to `snapshot`.
    ///
    /// Returns the deleted chunk, or `None` when the table is empty.
    pub fn delete_visible(
        &self,
        key: &TableKey,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<Option<ChunkInfo>> {
        let mut state = self.state.lock();
        let Some(index) = state.find_visible(key, snapshot, oracle)? else {
            return Ok(None);
        };
        let Some(chunk) = state.slots[index as usize].as_mut() else {
            return Ok(None);
        };
        if chunk.version.xmax.is_valid() {
            if oracle.is_current_transaction(chunk.version.xmax) {
                return Err(StoreError::ProtocolViolation(format!(
                    "visible chunk of table {key} already has xmax {}",
                    chunk.version.xmax
                )));
            }
            // deleted by a transaction our snapshot cannot see yet
            return Err(StoreError::ConcurrentUpdate(*key));
        }
        chunk.version.xmax = oracle.current_transaction_id();
        chunk.version.cid = oracle.current_command_id();
        debug!(slot = index, table = %key, xmax = %chunk.version.xmax, "Deleted chunk");

        self.has_warm_chunks.fetch_add(1, Ordering::AcqRel);
        Ok(state.info(index))
    }

    /// Apply a commit or abort to every active chunk.
    ///
    /// Returns the chunks that were released from their slots; the caller
    /// frees their segment and device memory.
    pub fn on_transaction_end(
        &self,
        is_commit: bool,
        oracle: &dyn TransactionOracle,
        oldest_xmin: TransactionId,
    ) -> Vec<(ChunkSlot, Chunk)> {
        if self.has_warm_chunks.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }

        let mut released = Vec::new();
        let mut meet_warm_chunks = false;
        let mut state = self.state.lock();

        for bucket in 0..CHUNK_HASH_NSLOTS {
            let members = state.buckets[bucket].clone();
            for index in members {
                let Some(chunk) = state.slots[index as usize].as_mut() else {
                    continue;
                };
                match chunk.version.on_transaction_end(is_commit, oracle, oldest_xmin) {
                    EndOutcome::KeepWarm => meet_warm_chunks = true,
                    EndOutcome::Settled => {}
                    EndOutcome::Release => {
                        if let Some(chunk) = state.release(bucket, index) {
                            debug!(slot = index, table = %chunk.key, "Released chunk");
                            released.push((ChunkSlot(index), chunk));
                        }
                    }
                }
            }
        }

        if !meet_warm_chunks {
            self.has_warm_chunks.store(0, Ordering::Release);
        }
        released
    }

    /// Mark every live chunk of a dropped table as deleted by the current
    /// transaction. Returns the number of chunks stamped.
    pub fn on_table_dropped(&self, key: &TableKey, oracle: &dyn TransactionOracle) -> usize {
        let hash = key.hash();
        let xid = oracle.current_transaction_id();
        let mut stamped = 0;

        let mut state = self.state.lock();
        let members = state.buckets[hash as usize % CHUNK_HASH_NSLOTS].clone();
        for index in members {
            if let Some(chunk) = state.slots[index as usize].as_mut() {
                if chunk.matches(key, hash) && !chunk.version.xmax.is_valid() {
                    chunk.version.xmax = xid;
                    stamped += 1;
                }
            }
        }
        self.has_warm_chunks.fetch_add(1, Ordering::AcqRel);
        drop(state);

        if stamped == 0 {
            warn!(table = %key, "Dropped table had no live chunk");
        }
        stamped
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            capacity: self.capacity,
            active: self.capacity - state.free.len(),
            free: state.free.len(),
            has_warm_chunks: self.has_warm_chunks.load(Ordering::Acquire) != 0,
        }
    }

    /// Chunks of `key` in any state, visible or not.
    pub fn versions_of(&self, key: &TableKey) -> usize {
        let hash = key.hash();
        let state = self.state.lock();
        state.buckets[hash as usize % CHUNK_HASH_NSLOTS]
            .iter()
            .filter(|&&i| {
                state.slots[i as usize]
                    .as_ref()
                    .is_some_and(|c| c.matches(key, hash))
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::IpcMemHandle;
    use crate::shmem::SegmentHandle;
    use crate::store::mvcc::{ChunkVersion, CommandId};

    struct Oracle(TransactionId);

    impl TransactionOracle for Oracle {
        fn is_current_transaction(&self, xid: TransactionId) -> bool {
            xid.is_valid() && xid == self.0
        }
        fn did_commit(&self, _xid: TransactionId) -> bool {
            true
        }
        fn current_transaction_id(&self) -> TransactionId {
            self.0
        }
        fn current_command_id(&self) -> CommandId {
            1
        }
    }

    fn chunk(key: TableKey, xmin: u32) -> Chunk {
        Chunk {
            key,
            hash: key.hash(),
            version: ChunkVersion::created(TransactionId(xmin), 0),
            nitems: 1,
            length: 64,
            device: None,
            ipc_handle: IpcMemHandle::ZERO,
            segment: SegmentHandle::INVALID,
        }
    }

    fn snap(xmin: u32, xmax: u32, curcid: CommandId) -> Snapshot {
        Snapshot {
            xmin: TransactionId(xmin),
            xmax: TransactionId(xmax),
            xip: Vec::new(),
            curcid,
        }
    }

    #[test]
    fn test_publish_until_exhausted() {
        let registry = ChunkRegistry::new(1);
        let key = TableKey::new(1, 100);
        registry.publish(chunk(key, 10)).unwrap();
        let err = registry.publish(chunk(key, 11)).unwrap_err();
        assert!(matches!(err, StoreError::ResourceExhausted { capacity: 1, .. }));
        assert_eq!(registry.stats().active, 1);
    }

    #[test]
    fn test_two_visible_chunks_is_a_violation() {
        let registry = ChunkRegistry::new(4);
        let key = TableKey::new(1, 100);
        registry.publish(chunk(key, 10)).unwrap();
        registry.publish(chunk(key, 11)).unwrap();

        let err = registry
            .find_visible(&key, &snap(20, 20, 0), &Oracle(TransactionId(20)))
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_sweep_skipped_when_nothing_is_warm() {
        let registry = ChunkRegistry::new(4);
        let key = TableKey::new(1, 100);
        let oracle = Oracle(TransactionId(10));
        registry.publish(chunk(key, 10)).unwrap();

        assert!(registry.on_transaction_end(true, &oracle, TransactionId(10)).is_empty());
        assert!(registry.stats().has_warm_chunks);

        let later = Oracle(TransactionId(11));
        registry.on_transaction_end(true, &later, TransactionId(11));
        assert!(!registry.stats().has_warm_chunks);
    }

    #[test]
    fn test_abort_releases_slot() {
        let registry = ChunkRegistry::new(2);
        let key = TableKey::new(1, 100);
        let oracle = Oracle(TransactionId(10));
        let slot = registry.publish(chunk(key, 10)).unwrap();

        let released = registry.on_transaction_end(false, &oracle, TransactionId(10));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, slot);
        assert!(registry.get(slot).is_none());
        assert_eq!(registry.stats().free, 2);
    }

    #[test]
    fn test_exclusive_publish_rejects_live_chunk() {
        let registry = ChunkRegistry::new(4);
        let key = TableKey::new(1, 100);
        registry.publish(chunk(key, 10)).unwrap();

        // Committed and not deleted.
        let err = registry
            .publish_exclusive(chunk(key, 11), &Oracle(TransactionId(11)))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentUpdate(k) if k == key));

        // Deleted by ourselves first.
        registry
            .delete_visible(&key, &snap(11, 11, 2), &Oracle(TransactionId(11)))
            .unwrap()
            .unwrap();
        registry
            .publish_exclusive(chunk(key, 11), &Oracle(TransactionId(11)))
            .unwrap();
        assert_eq!(registry.versions_of(&key), 2);
    }

    #[test]
    fn test_drop_stamps_live_chunks() {
        let registry = ChunkRegistry::new(2);
        let key = TableKey::new(1, 100);
        let slot = registry.publish(chunk(key, 10)).unwrap();
        assert_eq!(registry.on_table_dropped(&key, &Oracle(TransactionId(12))), 1);
        assert_eq!(registry.get(slot).unwrap().version.xmax, TransactionId(12));
        assert_eq!(registry.on_table_dropped(&key, &Oracle(TransactionId(13))), 0);
        assert_eq!(registry.versions_of(&key), 1);
    }
}
