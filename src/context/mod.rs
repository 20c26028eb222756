//! GPU context pool.
//!
//! - [`shared`]: context descriptors in the shared region and their free list
//! - [`handle`]: process-local handles wrapping a shared context
//! - [`tracker`]: per-handle registry of GPU resources, for leak cleanup
//! - [`link`]: the connection to the GPU-serving process
//! - [`pool`]: acquire, attach, retain, release and the cleanup hooks

pub mod handle;
pub mod link;
pub mod pool;
pub mod shared;
pub mod tracker;

pub use handle::{ContextHandle, GpuContext};
pub use link::{LoopbackLink, Poller, ServerLink, SocketFd};
pub use shared::{ContextPool, PoolStats, SharedContext, SharedContextId};
pub use tracker::{MemExtra, NodePool, ResourceClass, ResourceTracker, TrackedResource};

/// Number of buckets of the per-process active context table.
pub const ACTIVE_CONTEXT_NSLOTS: usize = 768;
