//! Shared context descriptors.
//!
//! The pool is a fixed array of [`SharedContext`] slots plus an index free
//! list, sized once when the shared region is built. One extra slot past the
//! end is the master context: its reference count is pinned at one and it
//! never enters the free list.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::process::ProcessId;
use crate::shmem::{SegmentHandle, SegmentManager};

/// Slot index of a shared context; valid in every process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedContextId(pub u32);

/// Value of `in_termination` while a client drains outstanding tasks.
pub const TERMINATION_SYNC: u32 = 1;

/// Value of `in_termination` once async tasks are to be discarded.
pub const TERMINATION_DISCARD: u32 = 2;

#[derive(Debug, Default)]
struct SharedState {
    backend: Option<ProcessId>,
    server: Option<ProcessId>,
    refcnt: u32,
    num_async_tasks: u32,
    dma_buffers: Vec<SegmentHandle>,
}

/// A context descriptor living in the shared region.
#[derive(Debug)]
pub struct SharedContext {
    id: SharedContextId,
    state: Mutex<SharedState>,
    in_termination: AtomicU32,
}

/// Point-in-time copy of a shared context's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedContextInfo {
    pub id: SharedContextId,
    pub backend: Option<ProcessId>,
    pub server: Option<ProcessId>,
    pub refcnt: u32,
    pub num_async_tasks: u32,
    pub dma_buffers: usize,
    pub in_termination: u32,
}

impl SharedContext {
    fn new(id: u32) -> Self {
        Self {
            id: SharedContextId(id),
            state: Mutex::new(SharedState::default()),
            in_termination: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> SharedContextId {
        self.id
    }

    pub fn in_termination(&self) -> u32 {
        self.in_termination.load(Ordering::Acquire)
    }

    pub fn set_in_termination(&self, value: u32) {
        self.in_termination.store(value, Ordering::Release);
    }

    pub fn refcnt(&self) -> u32 {
        self.state.lock().refcnt
    }

    pub fn num_async_tasks(&self) -> u32 {
        self.state.lock().num_async_tasks
    }

    pub fn info(&self) -> SharedContextInfo {
        let state = self.state.lock();
        SharedContextInfo {
            id: self.id,
            backend: state.backend,
            server: state.server,
            refcnt: state.refcnt,
            num_async_tasks: state.num_async_tasks,
            dma_buffers: state.dma_buffers.len(),
            in_termination: self.in_termination(),
        }
    }

    /// Account one task handed to the GPU server.
    pub fn add_async_task(&self) {
        self.state.lock().num_async_tasks += 1;
    }

    /// Account `n` completed tasks; returns the number still outstanding.
    pub fn complete_async_tasks(&self, n: u32) -> Result<u32> {
        let mut state = self.state.lock();
        if n > state.num_async_tasks {
            return Err(StoreError::ProtocolViolation(format!(
                "{n} task completions on shared context {} with {} outstanding",
                self.id.0, state.num_async_tasks
            )));
        }
        state.num_async_tasks -= n;
        Ok(state.num_async_tasks)
    }

    /// Record a DMA buffer segment owned by this context.
    pub fn add_dma_buffer(&self, handle: SegmentHandle) {
        self.state.lock().dma_buffers.push(handle);
    }

    /// Create a zeroed DMA buffer owned by this context. It is released
    /// with the context's last reference.
    pub fn alloc_dma_buffer(&self, segments: &SegmentManager, len: usize) -> SegmentHandle {
        let handle = segments.create_zeroed(len);
        self.add_dma_buffer(handle);
        debug!(shared = self.id.0, segment = handle.raw(), len, "Allocated DMA buffer");
        handle
    }
}

/// Occupancy of the context pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub in_use: usize,
}

/// Fixed pool of shared contexts.
#[derive(Debug)]
pub struct ContextPool {
    slots: Vec<Arc<SharedContext>>,
    free_list: Mutex<Vec<u32>>,
    capacity: usize,
}

impl ContextPool {
    /// Build `capacity` free slots plus the master context.
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Arc<SharedContext>> = (0..=capacity as u32)
            .map(|i| Arc::new(SharedContext::new(i)))
            .collect();

        // The master context is permanently referenced.
        slots[capacity].state.lock().refcnt = 1;

        // Pop from the tail hands out slot 0 first.
        let free_list = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free_list: Mutex::new(free_list),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn master(&self) -> &Arc<SharedContext> {
        &self.slots[self.capacity]
    }

    pub fn get(&self, id: SharedContextId) -> Option<&Arc<SharedContext>> {
        self.slots.get(id.0 as usize)
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free_list.lock().len();
        PoolStats {
            capacity: self.capacity,
            free,
            in_use: self.capacity - free,
        }
    }

    /// Take a free slot and hand it to `backend` with one reference.
    pub fn pop_free(&self, backend: ProcessId) -> Result<Arc<SharedContext>> {
        let index = self
            .free_list
            .lock()
            .pop()
            .ok_or(StoreError::ResourceExhausted {
                resource: "shared GPU context",
                capacity: self.capacity,
            })?;
        let shared = Arc::clone(&self.slots[index as usize]);

        {
            let mut state = shared.state.lock();
            *state = SharedState {
                backend: Some(backend),
                refcnt: 1,
                ..Default::default()
            };
        }
        shared.set_in_termination(0);

        debug!(shared = index, backend = backend.0, "Acquired shared GPU context");
        Ok(shared)
    }

    /// Bind `server` as the serving side of a context owned by a client.
    pub fn attach_server(
        &self,
        id: SharedContextId,
        server: ProcessId,
    ) -> Result<Arc<SharedContext>> {
        let shared = self.get(id).ok_or_else(|| {
            StoreError::ProtocolViolation(format!("shared context {} does not exist", id.0))
        })?;

        let mut state = shared.state.lock();
        if state.refcnt == 0
            || state.backend.is_none()
            || state.server.is_some()
            || state.num_async_tasks != 0
        {
            let msg = format!(
                "cannot attach server to shared context {} (refcnt={}, backend={:?}, server={:?}, tasks={})",
                id.0, state.refcnt, state.backend, state.server, state.num_async_tasks
            );
            drop(state);
            warn!(shared = id.0, "{msg}");
            return Err(StoreError::ProtocolViolation(msg));
        }
        state.refcnt += 1;
        state.server = Some(server);
        drop(state);

        debug!(shared = id.0, server = server.0, "Attached GPU server");
        Ok(Arc::clone(shared))
    }

    /// Drop one reference on behalf of the client or the server side.
    ///
    /// On the last reference the DMA buffers are released and the slot goes
    /// back to the free list; returns whether that happened.
    pub fn put(
        &self,
        shared: &SharedContext,
        is_server: bool,
        segments: &SegmentManager,
    ) -> Result<bool> {
        let buffers = {
            let mut state = shared.state.lock();
            if state.refcnt == 0 {
                return Err(StoreError::ProtocolViolation(format!(
                    "shared context {} released with zero references",
                    shared.id.0
                )));
            }
            if is_server {
                state.server = None;
            } else {
                state.backend = None;
            }
            state.refcnt -= 1;
            if state.refcnt > 0 {
                return Ok(false);
            }
            if state.server.is_some() || state.backend.is_some() {
                return Err(StoreError::ProtocolViolation(format!(
                    "shared context {} freed while still owned",
                    shared.id.0
                )));
            }
            std::mem::take(&mut state.dma_buffers)
        };

        for handle in buffers {
            if let Err(e) = segments.unpin(handle) {
                warn!(shared = shared.id.0, segment = handle.raw(), error = %e, "Failed to release DMA buffer");
            }
        }

        if shared.id.0 as usize == self.capacity {
            return Err(StoreError::ProtocolViolation(
                "master GPU context released".to_string(),
            ));
        }
        self.free_list.lock().push(shared.id.0);
        debug!(shared = shared.id.0, "Returned shared GPU context to free list");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_until_exhausted() {
        let pool = ContextPool::new(2);
        let a = pool.pop_free(ProcessId(1)).unwrap();
        let _b = pool.pop_free(ProcessId(1)).unwrap();
        assert_eq!(a.id(), SharedContextId(0));

        let err = pool.pop_free(ProcessId(1)).unwrap_err();
        assert!(matches!(err, StoreError::ResourceExhausted { capacity: 2, .. }));
        assert_eq!(pool.stats().in_use, 2);
    }

    #[test]
    fn test_put_frees_dma_buffers_on_last_reference() {
        let pool = ContextPool::new(1);
        let segments = SegmentManager::new();
        let shared = pool.pop_free(ProcessId(10)).unwrap();
        pool.attach_server(shared.id(), ProcessId(20)).unwrap();
        shared.add_dma_buffer(segments.create_zeroed(32));

        assert!(!pool.put(&shared, false, &segments).unwrap());
        assert_eq!(segments.live_count(), 1);
        assert!(pool.put(&shared, true, &segments).unwrap());
        assert_eq!(segments.live_count(), 0);
        assert_eq!(pool.stats().free, 1);

        assert!(pool
            .put(&shared, false, &segments)
            .unwrap_err()
            .is_protocol_violation());
    }

    #[test]
    fn test_attach_requires_live_unserved_context() {
        let pool = ContextPool::new(1);
        assert!(pool.attach_server(SharedContextId(0), ProcessId(2)).is_err());

        let shared = pool.pop_free(ProcessId(1)).unwrap();
        pool.attach_server(shared.id(), ProcessId(2)).unwrap();
        assert!(pool.attach_server(shared.id(), ProcessId(3)).is_err());
        assert!(pool.attach_server(SharedContextId(99), ProcessId(3)).is_err());
    }

    #[test]
    fn test_master_is_never_free() {
        let pool = ContextPool::new(3);
        assert_eq!(pool.master().refcnt(), 1);
        assert_eq!(pool.master().id(), SharedContextId(3));
        assert_eq!(pool.stats().free, 3);
    }

    #[test]
    fn test_async_task_accounting() {
        let pool = ContextPool::new(1);
        let shared = pool.pop_free(ProcessId(1)).unwrap();
        shared.add_async_task();
        shared.add_async_task();
        assert_eq!(shared.complete_async_tasks(1).unwrap(), 1);
        assert!(shared.complete_async_tasks(5).is_err());
    }
}
