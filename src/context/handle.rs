//! Process-local context handles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::link::SocketFd;
use super::shared::{SharedContext, SharedContextId};
use super::tracker::{MemExtra, NodePool, ResourceClass, ResourceTracker, TrackedResource};
use crate::gpu::{DevicePtr, ProgramId};
use crate::metrics::StoreMetrics;
use crate::process::ResourceScopeId;

/// A reference-counted handle on a context, shared within one process.
pub type ContextHandle = Arc<GpuContext>;

/// One process's view of a [`SharedContext`].
///
/// The reference count is explicit: `Arc` only keeps the memory alive,
/// teardown happens when [`refcnt`](Self::refcnt) drops to zero.
#[derive(Debug)]
pub struct GpuContext {
    shared: Arc<SharedContext>,
    socket: Option<SocketFd>,
    device: Option<usize>,
    scope: ResourceScopeId,
    pub(crate) refcnt: AtomicU32,
    pub(crate) bucket: usize,
    tracker: ResourceTracker,
    nodes: Arc<NodePool>,
    metrics: StoreMetrics,
}

impl GpuContext {
    pub(crate) fn new(
        shared: Arc<SharedContext>,
        socket: Option<SocketFd>,
        device: Option<usize>,
        scope: ResourceScopeId,
        bucket: usize,
        nodes: Arc<NodePool>,
        metrics: StoreMetrics,
    ) -> Self {
        Self {
            shared,
            socket,
            device,
            scope,
            refcnt: AtomicU32::new(1),
            bucket,
            tracker: ResourceTracker::new(),
            nodes,
            metrics,
        }
    }

    pub fn shared(&self) -> &Arc<SharedContext> {
        &self.shared
    }

    pub fn shared_id(&self) -> SharedContextId {
        self.shared.id()
    }

    pub fn socket(&self) -> Option<SocketFd> {
        self.socket
    }

    /// GPU device this context is bound to, if any.
    pub fn device(&self) -> Option<usize> {
        self.device
    }

    pub fn scope(&self) -> ResourceScopeId {
        self.scope
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub(crate) fn nodes(&self) -> &NodePool {
        &self.nodes
    }

    pub fn tracked_resources(&self) -> usize {
        self.tracker.len()
    }

    pub fn track_gpu_memory(&self, ptr: DevicePtr, extra: MemExtra) -> bool {
        self.tracker
            .track(&self.nodes, TrackedResource::GpuMemory { ptr, extra })
    }

    pub fn untrack_gpu_memory(&self, ptr: DevicePtr) -> Option<MemExtra> {
        match self.untrack(ResourceClass::GpuMemory, ptr)? {
            TrackedResource::GpuMemory { extra, .. } => Some(extra),
            _ => None,
        }
    }

    pub fn track_program(&self, program: ProgramId) -> bool {
        self.tracker
            .track(&self.nodes, TrackedResource::GpuProgram(program))
    }

    pub fn untrack_program(&self, program: ProgramId) -> bool {
        self.untrack(ResourceClass::GpuProgram, program).is_some()
    }

    pub fn track_iomap(&self, ptr: DevicePtr, device: usize) -> bool {
        self.tracker
            .track(&self.nodes, TrackedResource::IoMapMemory { ptr, device })
    }

    /// Returns the device the mapping was opened on.
    pub fn untrack_iomap(&self, ptr: DevicePtr) -> Option<usize> {
        match self.untrack(ResourceClass::IoMapMemory, ptr)? {
            TrackedResource::IoMapMemory { device, .. } => Some(device),
            _ => None,
        }
    }

    fn untrack(&self, class: ResourceClass, key: u64) -> Option<TrackedResource> {
        let found = self.tracker.untrack(&self.nodes, class, key);
        if found.is_none() {
            self.metrics.protocol_violations.inc();
        }
        found
    }
}
