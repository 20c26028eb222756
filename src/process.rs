//! Per-process state.
//!
//! Every cooperating process (a client worker or a GPU server) builds one
//! [`ProcessState`] over the same [`SharedRegion`]. It owns everything that
//! is only meaningful inside that process: the active context table, the
//! tracker node free list and the chunk mapping cache.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::context::{ContextHandle, GpuContext, NodePool, ServerLink, ACTIVE_CONTEXT_NSLOTS};
use crate::gpu::GpuDriver;
use crate::shmem::{Mapping, SharedRegion};

/// Identity of a cooperating OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

/// What kind of process this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// A host worker that runs queries.
    Client,
    /// A process executing GPU tasks on behalf of clients.
    GpuServer { device: usize, multithreaded: bool },
}

impl ProcessRole {
    pub fn is_server(&self) -> bool {
        matches!(self, ProcessRole::GpuServer { .. })
    }
}

/// The host's resource scope (transaction, portal, ...) owning contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceScopeId(pub u64);

pub struct ProcessState {
    pid: ProcessId,
    role: ProcessRole,
    region: Arc<SharedRegion>,
    driver: Arc<dyn GpuDriver>,
    link: Option<Arc<dyn ServerLink>>,
    scope: Mutex<ResourceScopeId>,
    pub(crate) active: Mutex<Vec<Vec<ContextHandle>>>,
    pub(crate) nodes: Arc<NodePool>,
    /// Chunk slot index -> attached segment.
    pub(crate) chunk_maps: Mutex<Vec<Option<Mapping>>>,
    master: ContextHandle,
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("pid", &self.pid)
            .field("role", &self.role)
            .field("scope", &*self.scope.lock())
            .finish_non_exhaustive()
    }
}

impl ProcessState {
    /// `link` is required for clients that request connected contexts.
    pub fn new(
        pid: ProcessId,
        role: ProcessRole,
        region: Arc<SharedRegion>,
        driver: Arc<dyn GpuDriver>,
        link: Option<Arc<dyn ServerLink>>,
    ) -> Self {
        let nodes = Arc::new(NodePool::new(region.config().pool.max_tracked_resources));
        let master = Arc::new(GpuContext::new(
            Arc::clone(region.contexts().master()),
            None,
            None,
            ResourceScopeId::default(),
            0,
            Arc::clone(&nodes),
            region.metrics().clone(),
        ));
        let nslots = region.chunks().capacity();

        debug!(pid = pid.0, role = ?role, "Initialized process state");
        Self {
            pid,
            role,
            region,
            driver,
            link,
            scope: Mutex::new(ResourceScopeId::default()),
            active: Mutex::new((0..ACTIVE_CONTEXT_NSLOTS).map(|_| Vec::new()).collect()),
            nodes,
            chunk_maps: Mutex::new(vec![None; nslots]),
            master,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role.is_server()
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn driver(&self) -> &dyn GpuDriver {
        self.driver.as_ref()
    }

    pub(crate) fn link(&self) -> Option<&Arc<dyn ServerLink>> {
        self.link.as_ref()
    }

    /// Make `scope` the owner of contexts acquired from now on.
    pub fn set_resource_scope(&self, scope: ResourceScopeId) {
        *self.scope.lock() = scope;
    }

    pub fn resource_scope(&self) -> ResourceScopeId {
        *self.scope.lock()
    }

    /// The permanent context backed by the master shared slot.
    pub fn master_context(&self) -> &ContextHandle {
        &self.master
    }

    /// Tracker nodes currently in use by this process.
    pub fn tracker_nodes_in_use(&self) -> usize {
        self.nodes.live()
    }

    /// Number of contexts in the active table.
    pub fn active_contexts(&self) -> usize {
        self.active.lock().iter().map(Vec::len).sum()
    }

    /// Number of chunk segments attached in this process.
    pub fn mapped_chunks(&self) -> usize {
        self.chunk_maps.lock().iter().filter(|m| m.is_some()).count()
    }
}
