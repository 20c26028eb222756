//! Integration tests for the shared GPU context pool.

use std::sync::Arc;

use proptest::prelude::*;

use gpustore::config::Config;
use gpustore::context::{ContextHandle, LoopbackLink, MemExtra};
use gpustore::gpu::device::simulated_devices;
use gpustore::gpu::{GpuDriver, SimulatedDriver};
use gpustore::process::{ProcessId, ProcessRole, ProcessState, ResourceScopeId};
use gpustore::shmem::SharedRegion;
use gpustore::StoreError;

struct Harness {
    region: Arc<SharedRegion>,
    driver: Arc<SimulatedDriver>,
    link: Arc<LoopbackLink>,
}

impl Harness {
    fn new(capacity: usize) -> Self {
        let mut config = Config::default();
        config.pool.max_connections = capacity;
        config.pool.max_worker_processes = 0;
        config.pool.headroom = 0;
        let driver = Arc::new(SimulatedDriver::new(&simulated_devices(&config.devices)));
        let region = SharedRegion::create(&config).unwrap();
        Self {
            region,
            driver,
            link: Arc::new(LoopbackLink::new()),
        }
    }

    fn client(&self, pid: u32) -> ProcessState {
        ProcessState::new(
            ProcessId(pid),
            ProcessRole::Client,
            Arc::clone(&self.region),
            self.driver.clone(),
            Some(self.link.clone()),
        )
    }

    fn server(&self, pid: u32, device: usize) -> ProcessState {
        ProcessState::new(
            ProcessId(pid),
            ProcessRole::GpuServer {
                device,
                multithreaded: false,
            },
            Arc::clone(&self.region),
            self.driver.clone(),
            Some(self.link.clone()),
        )
    }
}

#[test]
fn test_pool_exhaustion_and_recovery() {
    let h = Harness::new(3);
    let proc = h.client(10);

    let mut held = Vec::new();
    for scope in 0..3 {
        proc.set_resource_scope(ResourceScopeId(scope));
        held.push(proc.acquire_context(false).unwrap());
    }

    proc.set_resource_scope(ResourceScopeId(99));
    let err = proc.acquire_context(false).unwrap_err();
    assert!(matches!(
        err,
        StoreError::ResourceExhausted { capacity: 3, .. }
    ));
    // The first three are untouched.
    for ctx in &held {
        assert_eq!(ctx.refcnt(), 1);
        assert_eq!(ctx.shared().refcnt(), 1);
    }

    proc.release(&held.remove(0)).unwrap();
    let fourth = proc.acquire_context(false).unwrap();
    assert_eq!(fourth.scope(), ResourceScopeId(99));
    assert_eq!(h.region.contexts().stats().free, 0);
}

#[test]
fn test_capacity_is_shared_between_processes() {
    let h = Harness::new(2);
    let a = h.client(1);
    let b = h.client(2);

    let ctx_a = a.acquire_context(false).unwrap();
    let _ctx_b = b.acquire_context(false).unwrap();
    a.set_resource_scope(ResourceScopeId(5));
    assert!(a.acquire_context(false).is_err());

    a.release(&ctx_a).unwrap();
    assert!(a.acquire_context(false).is_ok());
}

#[test]
fn test_track_then_untrack_leaves_tracker_unchanged() {
    let h = Harness::new(2);
    let proc = h.client(1);
    let ctx = proc.acquire_context_on(0, false).unwrap();
    let ptr = h.driver.mem_alloc(0, 1024).unwrap();

    let before = ctx.tracked_resources();
    assert!(ctx.track_gpu_memory(ptr, MemExtra { device: Some(0) }));
    assert_eq!(ctx.tracked_resources(), before + 1);
    assert_eq!(
        ctx.untrack_gpu_memory(ptr),
        Some(MemExtra { device: Some(0) })
    );
    assert_eq!(ctx.tracked_resources(), before);

    // Untracking something never tracked is only a diagnostic.
    assert_eq!(ctx.untrack_gpu_memory(ptr), None);
    assert!(!ctx.untrack_program(42));
    assert_eq!(ctx.tracked_resources(), before);
    assert_eq!(h.region.metrics().protocol_violations.get(), 2);

    h.driver.mem_free(ptr).unwrap();
    proc.release(&ctx).unwrap();
    assert_eq!(h.region.metrics().leaked_resources.get(), 0);
}

#[test]
fn test_client_and_server_share_one_context() {
    let h = Harness::new(2);
    let client = h.client(1);
    let server = h.server(2, 0);

    let ctx = client.acquire_context(true).unwrap();
    let (socket, shared_id) = h.link.accept().unwrap();
    let served = server
        .attach_to_context(socket, shared_id, h.link.as_ref())
        .unwrap();
    assert!(h.link.is_registered(socket));
    assert_eq!(ctx.shared().refcnt(), 2);

    // The server holds device memory on behalf of the client's work.
    let ptr = h.driver.mem_alloc(0, 4096).unwrap();
    assert!(served.track_gpu_memory(ptr, MemExtra { device: Some(0) }));

    client.release(&ctx).unwrap();
    assert_eq!(h.region.contexts().stats().in_use, 1);

    server.release(&served).unwrap();
    assert_eq!(h.region.contexts().stats().in_use, 0);
    assert_eq!(h.driver.stats().device_allocations, 0);
    assert!(!h.link.is_open(socket));
}

#[test]
fn test_scope_abort_releases_contexts_and_resources() {
    let h = Harness::new(4);
    let proc = h.client(1);
    proc.set_resource_scope(ResourceScopeId(3));

    let ctx = proc.acquire_context_on(1, false).unwrap();
    let ptr = h.driver.mem_alloc(1, 2048).unwrap();
    assert!(ctx.track_gpu_memory(ptr, MemExtra { device: Some(1) }));
    proc.alloc_dma_buffer(&ctx, 8192);
    drop(ctx);

    assert_eq!(proc.on_resource_scope_end(false), 1);
    assert_eq!(proc.active_contexts(), 0);
    assert_eq!(h.driver.stats().device_allocations, 0);
    assert_eq!(h.region.contexts().stats().in_use, 0);
    // An abort does not report leaks.
    assert_eq!(h.region.metrics().leaked_resources.get(), 0);
}

#[test]
fn test_process_exit_returns_every_slot() {
    let h = Harness::new(4);
    let proc = h.client(1);
    for scope in 0..3 {
        proc.set_resource_scope(ResourceScopeId(scope));
        let ctx = proc.acquire_context(scope % 2 == 0).unwrap();
        proc.retain(&ctx);
    }
    assert_eq!(h.region.contexts().stats().in_use, 3);

    assert_eq!(proc.on_process_exit().unwrap(), 3);
    assert_eq!(h.region.contexts().stats().in_use, 0);
    assert_eq!(h.link.open_connections(), 0);
    assert_eq!(h.region.metrics().contexts_in_use.get(), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(u64),
    Retain(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..3).prop_map(Op::Acquire),
        any::<usize>().prop_map(Op::Retain),
        any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn test_refcount_reaches_zero_exactly_once(ops in prop::collection::vec(op(), 1..60)) {
        let h = Harness::new(4);
        let proc = h.client(1);
        let baseline = h.region.segments().live_count();
        let mut held: Vec<ContextHandle> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(scope) => {
                    proc.set_resource_scope(ResourceScopeId(scope));
                    let ctx = proc.acquire_context(false).unwrap();
                    if ctx.refcnt() == 1 {
                        proc.alloc_dma_buffer(&ctx, 64);
                    }
                    held.push(ctx);
                }
                Op::Retain(i) if !held.is_empty() => {
                    let ctx = proc.retain(&held[i % held.len()]);
                    held.push(ctx);
                }
                Op::Release(i) if !held.is_empty() => {
                    let ctx = held.swap_remove(i % held.len());
                    proc.release(&ctx).unwrap();
                }
                _ => {}
            }

            // Every live context counts exactly the handles held on it.
            for ctx in &held {
                let holders = held.iter().filter(|c| Arc::ptr_eq(c, ctx)).count();
                prop_assert_eq!(ctx.refcnt() as usize, holders);
            }
            let mut distinct: Vec<&ContextHandle> = Vec::new();
            for ctx in &held {
                if !distinct.iter().any(|d| Arc::ptr_eq(d, ctx)) {
                    distinct.push(ctx);
                }
            }
            prop_assert_eq!(h.region.contexts().stats().in_use, distinct.len());
            prop_assert_eq!(h.region.segments().live_count(), baseline + distinct.len());
        }

        for ctx in held.drain(..) {
            proc.release(&ctx).unwrap();
        }
        prop_assert_eq!(h.region.contexts().stats().in_use, 0);
        prop_assert_eq!(h.region.segments().live_count(), baseline);
        prop_assert_eq!(proc.active_contexts(), 0);
    }
}
