//! Table-level operations: bulk insert, delete, transaction end, drop and
//! size introspection.

use tracing::{debug, info, warn};

use super::chunk::{Chunk, ChunkSlot, TableKey};
use super::mvcc::{ChunkVersion, Snapshot, TransactionId, TransactionOracle};
use super::staging::BulkInsert;
use super::table::TableDef;
use crate::context::ContextHandle;
use crate::error::{Result, StoreError};
use crate::gpu::{GpuDriver, IpcMemHandle};
use crate::process::ProcessState;
use crate::shmem::{SegmentHandle, SegmentManager};

/// Undoes a half-published chunk unless disarmed.
struct PublishGuard<'a> {
    segments: &'a SegmentManager,
    driver: &'a dyn GpuDriver,
    segment: Option<SegmentHandle>,
    preserved: Option<(usize, IpcMemHandle)>,
}

impl PublishGuard<'_> {
    fn disarm(mut self) {
        self.segment = None;
        self.preserved = None;
    }
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        if let Some((device, handle)) = self.preserved.take() {
            if let Err(e) = self.driver.mem_free_preserved(device, &handle) {
                warn!(device, error = %e, "Failed to free preserved memory of unpublished chunk");
            }
        }
        if let Some(segment) = self.segment.take() {
            if let Err(e) = self.segments.unpin(segment) {
                warn!(segment = segment.raw(), error = %e, "Failed to unpin unpublished chunk");
            }
        }
    }
}

impl ProcessState {
    /// Start a bulk insert into `table`, which must have no visible chunk.
    ///
    /// Pinned tables acquire a context on the pinning device that is held
    /// until [`ProcessState::finish_insert`] or [`ProcessState::abort_insert`].
    pub fn begin_insert(
        &self,
        table: &TableDef,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<BulkInsert> {
        if self
            .region()
            .chunks()
            .find_visible(&table.key, snapshot, oracle)?
            .is_some()
        {
            return Err(StoreError::TableNotEmpty(table.key));
        }

        let context = match table.options.pinning.device() {
            Some(device) => Some(self.acquire_context_on(device, false)?),
            None => None,
        };
        let initial_rows = self.region().config().store.initial_rows;
        debug!(table = %table.key, pinned = context.is_some(), "Began bulk insert");
        Ok(BulkInsert::new(table.clone(), initial_rows, context))
    }

    /// Build and publish the chunk of a finished bulk insert.
    ///
    /// Returns `None` when no row was inserted.
    pub fn finish_insert(
        &self,
        mut insert: BulkInsert,
        oracle: &dyn TransactionOracle,
    ) -> Result<Option<ChunkSlot>> {
        let context = insert.take_context();
        let result = self.publish_insert(&insert, context.as_ref(), oracle);
        if let Some(ctx) = context {
            if let Err(e) = self.release(&ctx) {
                self.report_violation(&e);
            }
        }
        result
    }

    /// Discard a bulk insert without publishing anything.
    pub fn abort_insert(&self, mut insert: BulkInsert) -> Result<()> {
        debug!(table = %insert.table().key, nitems = insert.nitems(), "Aborted bulk insert");
        match insert.take_context() {
            Some(ctx) => self.release(&ctx),
            None => Ok(()),
        }
    }

    fn publish_insert(
        &self,
        insert: &BulkInsert,
        context: Option<&ContextHandle>,
        oracle: &dyn TransactionOracle,
    ) -> Result<Option<ChunkSlot>> {
        let table = insert.table();
        if insert.nitems() == 0 {
            debug!(table = %table.key, "Bulk insert produced no rows");
            return Ok(None);
        }

        let image = insert.build_image(&self.compressor())?;
        let segments = self.region().segments();
        let segment = segments.create(image.clone());
        let mut guard = PublishGuard {
            segments,
            driver: self.driver(),
            segment: Some(segment),
            preserved: None,
        };

        let (device, ipc_handle) = match (table.options.pinning.device(), context) {
            (Some(device), Some(ctx)) => {
                let handle = self.load_gpu_preserved(ctx, &image)?;
                guard.preserved = Some((device, handle));
                (Some(device), handle)
            }
            (Some(device), None) => {
                return Err(StoreError::ProtocolViolation(format!(
                    "insert into table {} pinned on device {device} holds no context",
                    table.key
                )));
            }
            (None, _) => (None, IpcMemHandle::ZERO),
        };

        let chunk = Chunk {
            key: table.key,
            hash: table.key.hash(),
            version: ChunkVersion::created(
                oracle.current_transaction_id(),
                oracle.current_command_id(),
            ),
            nitems: insert.nitems(),
            length: image.len(),
            device,
            ipc_handle,
            segment,
        };
        let slot = self.region().chunks().publish_exclusive(chunk, oracle)?;
        guard.disarm();
        self.region().metrics().chunks_in_use.inc();

        // keep our own attachment, as the inserting backend still maps it
        let mapping = segments.attach(segment)?;
        if let Some(entry) = self.chunk_maps.lock().get_mut(slot.index()) {
            *entry = Some(mapping);
        }

        info!(
            table = %table.key,
            slot = slot.0,
            nitems = insert.nitems(),
            length = image.len(),
            device = ?device,
            "Published chunk"
        );
        Ok(Some(slot))
    }

    /// Delete the chunk of `table` visible to `snapshot`. Returns the number
    /// of rows removed.
    pub fn delete_all(
        &self,
        table: &TableDef,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<usize> {
        let deleted = self
            .region()
            .chunks()
            .delete_visible(&table.key, snapshot, oracle)
            .inspect_err(|e| {
                if e.is_protocol_violation() {
                    self.report_violation(e);
                }
            })?;
        let Some(info) = deleted else {
            return Ok(0);
        };
        self.drop_chunk_mapping(info.slot.index());
        debug!(table = %table.key, slot = info.slot.0, nitems = info.nitems, "Deleted table rows");
        Ok(info.nitems)
    }

    /// Commit or abort hook of the host transaction. Physically frees every
    /// chunk no snapshot can see any more and returns how many were freed.
    pub fn on_transaction_end(
        &self,
        is_commit: bool,
        oracle: &dyn TransactionOracle,
        oldest_xmin: TransactionId,
    ) -> usize {
        let released = self
            .region()
            .chunks()
            .on_transaction_end(is_commit, oracle, oldest_xmin);
        let count = released.len();
        for (slot, chunk) in released {
            self.release_chunk(slot, chunk);
        }
        if count > 0 {
            debug!(is_commit, released = count, "Released chunks at transaction end");
        }
        count
    }

    fn release_chunk(&self, slot: ChunkSlot, chunk: Chunk) {
        if let Some(device) = chunk.device {
            if let Err(e) = self.driver().mem_free_preserved(device, &chunk.ipc_handle) {
                warn!(table = %chunk.key, device, error = %e, "Failed to free preserved memory");
            }
        }
        self.drop_chunk_mapping(slot.index());
        if let Err(e) = self.region().segments().unpin(chunk.segment) {
            warn!(table = %chunk.key, error = %e, "Failed to unpin chunk segment");
        }
        let metrics = self.region().metrics();
        metrics.chunks_in_use.dec();
        metrics.chunks_released.inc();
    }

    /// The host dropped `table`; its chunks die with the current transaction.
    pub fn on_table_dropped(&self, table: &TableKey, oracle: &dyn TransactionOracle) -> usize {
        self.region().chunks().on_table_dropped(table, oracle)
    }

    /// Row count of the visible chunk, 0 when there is none.
    pub fn table_height(
        &self,
        table: &TableDef,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<usize> {
        let info = self
            .region()
            .chunks()
            .find_visible(&table.key, snapshot, oracle)?;
        Ok(info.map_or(0, |i| i.nitems))
    }

    /// Image size of the visible chunk in bytes, 0 when there is none.
    pub fn table_rawsize(
        &self,
        table: &TableDef,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<usize> {
        let info = self
            .region()
            .chunks()
            .find_visible(&table.key, snapshot, oracle)?;
        Ok(info.map_or(0, |i| i.length))
    }

    pub fn table_width(&self, table: &TableDef) -> usize {
        table.width()
    }

    pub fn table_format(&self, table: &TableDef) -> &'static str {
        table.options.format.name()
    }
}
