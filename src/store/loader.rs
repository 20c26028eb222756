//! Chunk mapping and GPU loading.
//!
//! Unpinned chunks are copied into managed memory for each load. Pinned
//! chunks live in preserved device memory published at insert time and are
//! only mapped into the caller's context. Every device pointer handed out is
//! tracked by the context, so aborting the owning scope frees it.

use tracing::{debug, warn};

use super::chunk::{ChunkInfo, TableKey};
use super::compressor::Compressor;
use super::mvcc::{Snapshot, TransactionOracle};
use super::table::TableDef;
use super::view::ColumnarView;
use crate::config::Pinning;
use crate::context::{ContextHandle, GpuContext, MemExtra};
use crate::error::{Result, StoreError};
use crate::gpu::{DevicePtr, GpuDriver, IpcMemHandle};
use crate::process::ProcessState;
use crate::shmem::Mapping;

/// A table loaded into a context's device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedTable {
    pub key: TableKey,
    /// `None` when the table had no visible chunk.
    pub ptr: Option<DevicePtr>,
    pub pinning: Pinning,
    pub length: usize,
}

/// Frees a preserved allocation unless disarmed.
struct PreservedGuard<'a> {
    driver: &'a dyn GpuDriver,
    device: usize,
    handle: Option<IpcMemHandle>,
}

impl PreservedGuard<'_> {
    fn disarm(mut self) -> Option<IpcMemHandle> {
        self.handle.take()
    }
}

impl Drop for PreservedGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.driver.mem_free_preserved(self.device, &handle) {
                warn!(device = self.device, error = %e, "Failed to free preserved memory");
            }
        }
    }
}

impl ProcessState {
    pub(crate) fn compressor(&self) -> Compressor {
        Compressor::new(self.region().config().devices.zstd_level)
    }

    /// Attach the segment of a chunk, reusing this process's mapping while
    /// the slot still refers to the same segment.
    pub fn map_chunk(&self, info: &ChunkInfo) -> Result<Mapping> {
        let mut maps = self.chunk_maps.lock();
        let entry = maps.get_mut(info.slot.index()).ok_or_else(|| {
            StoreError::ProtocolViolation(format!("chunk slot {} out of range", info.slot.0))
        })?;
        if let Some(mapping) = entry.as_ref() {
            if mapping.handle() == info.segment {
                return Ok(mapping.clone());
            }
            debug!(slot = info.slot.0, "Dropping stale chunk mapping");
        }
        let mapping = self.region().segments().attach(info.segment)?;
        if mapping.len() != info.length {
            return Err(StoreError::Layout(format!(
                "segment of table {} is {} bytes, chunk records {}",
                info.key,
                mapping.len(),
                info.length
            )));
        }
        *entry = Some(mapping.clone());
        Ok(mapping)
    }

    /// Open the chunk for reading.
    pub fn open_chunk(&self, info: &ChunkInfo) -> Result<ColumnarView> {
        ColumnarView::open(self.map_chunk(info)?, &self.compressor())
    }

    pub(crate) fn drop_chunk_mapping(&self, info_slot: usize) {
        if let Some(entry) = self.chunk_maps.lock().get_mut(info_slot) {
            *entry = None;
        }
    }

    /// Copy `image` into new preserved memory on the context's device.
    pub(crate) fn load_gpu_preserved(&self, ctx: &GpuContext, image: &[u8]) -> Result<IpcMemHandle> {
        let device = ctx.device().ok_or_else(|| {
            StoreError::ProtocolViolation(
                "preserved load needs a context bound to a device".to_string(),
            )
        })?;
        let driver = self.driver();
        let handle = driver.mem_alloc_preserved(device, image.len())?;
        let guard = PreservedGuard {
            driver,
            device,
            handle: Some(handle),
        };

        let ptr = driver.ipc_open(device, &handle)?;
        let copied = driver.memcpy_htod(ptr, image);
        let closed = driver.ipc_close(ptr);
        copied?;
        closed?;

        debug!(device, len = image.len(), "Loaded chunk into preserved memory");
        guard.disarm().ok_or_else(|| {
            StoreError::ProtocolViolation("preserved handle vanished".to_string())
        })
    }

    fn load_unpinned(&self, ctx: &GpuContext, info: &ChunkInfo) -> Result<DevicePtr> {
        let mapping = self.map_chunk(info)?;
        let driver = self.driver();
        let ptr = driver.mem_alloc_managed(mapping.len())?;
        let loaded = driver
            .memcpy_htod(ptr, mapping.bytes())
            .map_err(StoreError::from)
            .and_then(|()| {
                if ctx.track_gpu_memory(ptr, MemExtra { device: None }) {
                    Ok(())
                } else {
                    Err(StoreError::AllocationFailure(
                        "out of resource tracker entries".to_string(),
                    ))
                }
            });
        if let Err(e) = loaded {
            if let Err(free_err) = driver.mem_free(ptr) {
                warn!(ptr, error = %free_err, "Failed to free managed memory");
            }
            return Err(e);
        }
        Ok(ptr)
    }

    fn load_pinned(&self, ctx: &GpuContext, info: &ChunkInfo, device: usize) -> Result<DevicePtr> {
        if ctx.device() != Some(device) {
            return Err(StoreError::DeviceMismatch {
                table: info.key,
                pinned: device,
                context: ctx.device(),
            });
        }
        let driver = self.driver();
        let ptr = driver.ipc_open(device, &info.ipc_handle)?;
        if !ctx.track_iomap(ptr, device) {
            if let Err(e) = driver.ipc_close(ptr) {
                warn!(ptr, error = %e, "Failed to close IPC mapping");
            }
            return Err(StoreError::AllocationFailure(
                "out of resource tracker entries".to_string(),
            ));
        }
        Ok(ptr)
    }

    /// Load the chunk of `table` visible to `snapshot` into `ctx`.
    pub fn load_table(
        &self,
        ctx: &ContextHandle,
        table: &TableDef,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<LoadedTable> {
        let pinning = table.options.pinning;
        if let Some(device) = pinning.device() {
            if ctx.device() != Some(device) {
                return Err(StoreError::DeviceMismatch {
                    table: table.key,
                    pinned: device,
                    context: ctx.device(),
                });
            }
        }

        let Some(info) = self
            .region()
            .chunks()
            .find_visible(&table.key, snapshot, oracle)?
        else {
            return Ok(LoadedTable {
                key: table.key,
                ptr: None,
                pinning,
                length: 0,
            });
        };

        let ptr = match info.device {
            Some(device) => self.load_pinned(ctx, &info, device)?,
            None => self.load_unpinned(ctx, &info)?,
        };
        debug!(
            table = %table.key,
            shared = ctx.shared_id().0,
            ptr,
            pinned = info.is_pinned(),
            "Loaded table"
        );
        Ok(LoadedTable {
            key: table.key,
            ptr: Some(ptr),
            pinning: info.device.map_or(Pinning::Unpinned, Pinning::Device),
            length: info.length,
        })
    }

    /// Release what [`ProcessState::load_table`] mapped or allocated.
    pub fn unload_table(&self, ctx: &ContextHandle, loaded: &LoadedTable) -> Result<()> {
        let Some(ptr) = loaded.ptr else {
            return Ok(());
        };
        let driver = self.driver();
        match loaded.pinning {
            Pinning::Device(_) => {
                if ctx.untrack_iomap(ptr).is_none() {
                    return Err(StoreError::ProtocolViolation(format!(
                        "IPC mapping {ptr:#x} of table {} is not tracked",
                        loaded.key
                    )));
                }
                driver.ipc_close(ptr)?;
            }
            Pinning::Unpinned => {
                if ctx.untrack_gpu_memory(ptr).is_none() {
                    return Err(StoreError::ProtocolViolation(format!(
                        "device memory {ptr:#x} of table {} is not tracked",
                        loaded.key
                    )));
                }
                driver.mem_free(ptr)?;
            }
        }
        Ok(())
    }

    /// The device every pinned table in `tables` lives on, if any.
    pub fn preferable_device(&self, tables: &[&TableDef]) -> Result<Option<usize>> {
        let mut preferred: Option<(usize, TableKey)> = None;
        for table in tables {
            let Some(device) = table.options.pinning.device() else {
                continue;
            };
            match preferred {
                None => preferred = Some((device, table.key)),
                Some((first, _)) if first == device => {}
                Some((first, _)) => {
                    return Err(StoreError::DeviceMismatch {
                        table: table.key,
                        pinned: device,
                        context: Some(first),
                    });
                }
            }
        }
        Ok(preferred.map(|(device, _)| device))
    }

    /// Load every distinct table of `tables` into `ctx`. On failure the
    /// tables loaded so far are unloaded again.
    pub fn load_tables(
        &self,
        ctx: &ContextHandle,
        tables: &[&TableDef],
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<Vec<LoadedTable>> {
        let mut loaded: Vec<LoadedTable> = Vec::with_capacity(tables.len());
        for table in tables {
            if loaded.iter().any(|l| l.key == table.key) {
                continue;
            }
            match self.load_table(ctx, table, snapshot, oracle) {
                Ok(l) => loaded.push(l),
                Err(e) => {
                    for l in &loaded {
                        if let Err(unload_err) = self.unload_table(ctx, l) {
                            warn!(table = %l.key, error = %unload_err, "Failed to unload table");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(loaded)
    }

    /// The 64-byte IPC handle of a pinned table's visible chunk.
    pub fn export_ipc_handle(
        &self,
        table: &TableDef,
        snapshot: &Snapshot,
        oracle: &dyn TransactionOracle,
    ) -> Result<Option<IpcMemHandle>> {
        let Some(device) = table.options.pinning.device() else {
            return Err(StoreError::NotPinned(table.key));
        };
        if device >= self.driver().device_count() {
            return Err(StoreError::InvalidOption(format!(
                "table {} is pinned on missing GPU device {device}",
                table.key
            )));
        }
        let info = self
            .region()
            .chunks()
            .find_visible(&table.key, snapshot, oracle)?;
        Ok(info.map(|i| i.ipc_handle))
    }
}
