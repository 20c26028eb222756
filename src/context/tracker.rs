//! Per-context resource tracker.
//!
//! Every device allocation, compiled program and I/O-mapped region acquired
//! on behalf of a context is recorded here until it is released, so that
//! context teardown can free whatever is left and report it as a leak.
//! Records are hashed by class and identifying payload into a fixed number
//! of buckets; the bucket array is guarded by a lock private to the context.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHasher;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::gpu::{DevicePtr, GpuDriver, ProgramId};

/// Number of hash buckets per context.
pub const RESTRACK_HASHSIZE: usize = 53;

/// Kind of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResourceClass {
    GpuMemory = 2,
    GpuProgram = 3,
    IoMapMemory = 4,
}

/// Allocator-side metadata kept with a device memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemExtra {
    /// Owning device, or `None` for managed memory.
    pub device: Option<usize>,
}

/// A single tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedResource {
    GpuMemory { ptr: DevicePtr, extra: MemExtra },
    GpuProgram(ProgramId),
    IoMapMemory { ptr: DevicePtr, device: usize },
}

impl TrackedResource {
    pub fn class(&self) -> ResourceClass {
        match self {
            TrackedResource::GpuMemory { .. } => ResourceClass::GpuMemory,
            TrackedResource::GpuProgram(_) => ResourceClass::GpuProgram,
            TrackedResource::IoMapMemory { .. } => ResourceClass::IoMapMemory,
        }
    }

    /// The identifying payload that is hashed and matched on untrack.
    pub fn key(&self) -> u64 {
        match *self {
            TrackedResource::GpuMemory { ptr, .. } => ptr,
            TrackedResource::GpuProgram(id) => id,
            TrackedResource::IoMapMemory { ptr, .. } => ptr,
        }
    }
}

/// Fixed-key hash of class and payload; selects the bucket.
pub fn resource_hash(class: ResourceClass, key: u64) -> u32 {
    let mut hasher = AHasher::default();
    class.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish() as u32
}

#[derive(Debug, Default)]
pub struct TrackerNode {
    hash: u32,
    resource: Option<TrackedResource>,
}

/// Process-wide supply of tracker nodes with a recycling free list.
#[derive(Debug)]
pub struct NodePool {
    free: Mutex<Vec<Box<TrackerNode>>>,
    live: AtomicUsize,
    limit: usize,
}

impl NodePool {
    /// `limit` bounds the number of nodes handed out at once.
    pub fn new(limit: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            limit,
        }
    }

    fn alloc(&self) -> Option<Box<TrackerNode>> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()?;
        Some(self.free.lock().pop().unwrap_or_default())
    }

    fn recycle(&self, mut node: Box<TrackerNode>) {
        *node = TrackerNode::default();
        self.free.lock().push(node);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Nodes currently holding a resource.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Nodes parked on the free list.
    pub fn recycled(&self) -> usize {
        self.free.lock().len()
    }
}

/// Outcome of a teardown sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub released: usize,
    pub leaked: usize,
}

/// Hashed registry of the resources held by one context.
#[derive(Debug)]
pub struct ResourceTracker {
    buckets: Mutex<Vec<Vec<Box<TrackerNode>>>>,
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new((0..RESTRACK_HASHSIZE).map(|_| Vec::new()).collect()),
        }
    }

    /// Bucket index of a resource.
    pub fn bucket_of(class: ResourceClass, key: u64) -> usize {
        resource_hash(class, key) as usize % RESTRACK_HASHSIZE
    }

    /// Record a resource. Returns `false` only when no node can be allocated.
    pub fn track(&self, pool: &NodePool, resource: TrackedResource) -> bool {
        let Some(mut node) = pool.alloc() else {
            return false;
        };
        let hash = resource_hash(resource.class(), resource.key());
        node.hash = hash;
        node.resource = Some(resource);

        self.buckets.lock()[hash as usize % RESTRACK_HASHSIZE].push(node);
        debug!(class = ?resource.class(), key = resource.key(), "Tracked resource");
        true
    }

    /// Remove a resource record. A missing record means a double release;
    /// it is reported and the buckets are left untouched.
    pub fn untrack(
        &self,
        pool: &NodePool,
        class: ResourceClass,
        key: u64,
    ) -> Option<TrackedResource> {
        let hash = resource_hash(class, key);
        let node = {
            let mut buckets = self.buckets.lock();
            let bucket = &mut buckets[hash as usize % RESTRACK_HASHSIZE];
            bucket
                .iter()
                .position(|n| {
                    n.hash == hash
                        && n.resource
                            .is_some_and(|r| r.class() == class && r.key() == key)
                })
                .map(|pos| bucket.remove(pos))
        };

        match node {
            Some(node) => {
                let resource = node.resource;
                pool.recycle(node);
                resource
            }
            None => {
                warn!(class = ?class, key = format_args!("{key:#x}"), "Bug? resource was not tracked");
                None
            }
        }
    }

    /// Release every remaining resource through `driver`.
    ///
    /// During a normal exit each leftover is reported as a probable leak;
    /// during an abnormal exit nothing is reported.
    pub fn release_all(
        &self,
        pool: &NodePool,
        driver: &dyn GpuDriver,
        normal_exit: bool,
    ) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();
        let drained: Vec<Box<TrackerNode>> = {
            let mut buckets = self.buckets.lock();
            buckets.iter_mut().flat_map(std::mem::take).collect()
        };

        for node in drained {
            if let Some(resource) = node.resource {
                if normal_exit {
                    summary.leaked += 1;
                }
                match resource {
                    TrackedResource::GpuMemory { ptr, .. } => {
                        if normal_exit {
                            warn!(ptr = format_args!("{ptr:#x}"), "GPU memory likely leaked");
                        }
                        if let Err(e) = driver.mem_free(ptr) {
                            warn!(ptr = format_args!("{ptr:#x}"), error = %e, "failed to free GPU memory");
                        }
                    }
                    TrackedResource::GpuProgram(id) => {
                        if normal_exit {
                            warn!(program = id, "GPU program likely leaked");
                        }
                        if let Err(e) = driver.put_program(id) {
                            warn!(program = id, error = %e, "failed to release GPU program");
                        }
                    }
                    TrackedResource::IoMapMemory { ptr, .. } => {
                        if normal_exit {
                            warn!(ptr = format_args!("{ptr:#x}"), "I/O mapped memory likely leaked");
                        }
                        if let Err(e) = driver.ipc_close(ptr) {
                            warn!(ptr = format_args!("{ptr:#x}"), error = %e, "failed to unmap I/O mapped memory");
                        }
                    }
                }
                summary.released += 1;
            }
            pool.recycle(node);
        }
        summary
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records in one bucket.
    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets.lock()[bucket].len()
    }
}
