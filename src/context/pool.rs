//! Context acquisition, release and the cleanup hooks.
//!
//! Clients keep all their contexts in bucket 0 of the active table and find
//! reusable ones by resource scope. GPU servers spread contexts over the
//! buckets by socket so completions can be dispatched by descriptor.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::handle::{ContextHandle, GpuContext};
use super::link::{Poller, SocketFd};
use super::shared::{SharedContext, SharedContextId, TERMINATION_DISCARD, TERMINATION_SYNC};
use super::ACTIVE_CONTEXT_NSLOTS;
use crate::error::{Result, StoreError};
use crate::gpu::DeviceError;
use crate::process::{ProcessRole, ProcessState};
use crate::shmem::SegmentHandle;

/// Returns an acquired shared slot to the pool unless disarmed.
struct PendingShared<'a> {
    process: &'a ProcessState,
    shared: Option<Arc<SharedContext>>,
}

impl<'a> PendingShared<'a> {
    fn new(process: &'a ProcessState, shared: Arc<SharedContext>) -> Self {
        Self {
            process,
            shared: Some(shared),
        }
    }

    fn id(&self) -> Option<SharedContextId> {
        self.shared.as_ref().map(|s| s.id())
    }

    fn disarm(mut self) -> Option<Arc<SharedContext>> {
        self.shared.take()
    }
}

impl Drop for PendingShared<'_> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            debug!(shared = shared.id().0, "Returning shared context after failed acquire");
            if let Err(e) = self.process.put_shared(&shared) {
                self.process.report_violation(&e);
            }
        }
    }
}

fn socket_bucket(socket: SocketFd) -> usize {
    socket.0.rem_euclid(ACTIVE_CONTEXT_NSLOTS as i32) as usize
}

impl ProcessState {
    /// Get a context for the current resource scope, not bound to a device.
    pub fn acquire_context(&self, with_connection: bool) -> Result<ContextHandle> {
        self.acquire(None, with_connection)
    }

    /// Get a context bound to GPU `device`.
    pub fn acquire_context_on(&self, device: usize, with_connection: bool) -> Result<ContextHandle> {
        if device >= self.driver().device_count() {
            return Err(DeviceError::DeviceNotInitialized(device).into());
        }
        self.acquire(Some(device), with_connection)
    }

    fn acquire(&self, device: Option<usize>, with_connection: bool) -> Result<ContextHandle> {
        if self.is_server() {
            return Err(StoreError::ProtocolViolation(
                "GPU server tried to acquire a client context".to_string(),
            ));
        }
        let scope = self.resource_scope();

        {
            let active = self.active.lock();
            let reusable = active[0].iter().find(|ctx| {
                ctx.scope() == scope
                    && ctx.socket().is_some() == with_connection
                    && ctx.device() == device
            });
            if let Some(ctx) = reusable {
                ctx.refcnt.fetch_add(1, Ordering::AcqRel);
                return Ok(Arc::clone(ctx));
            }
        }

        let link = match (with_connection, self.link()) {
            (false, _) => None,
            (true, Some(link)) => Some(Arc::clone(link)),
            (true, None) => {
                return Err(StoreError::NotSupported(
                    "no GPU server link is configured".to_string(),
                ))
            }
        };

        let shared = self.region().contexts().pop_free(self.pid())?;
        self.region().metrics().contexts_in_use.inc();
        let pending = PendingShared::new(self, shared);

        let socket = match (&link, pending.id()) {
            (Some(link), Some(id)) => Some(link.open_connection(id)?),
            _ => None,
        };
        let shared = pending.disarm().ok_or_else(|| {
            StoreError::ProtocolViolation("shared context vanished during acquire".to_string())
        })?;

        let ctx = Arc::new(GpuContext::new(
            shared,
            socket,
            device,
            scope,
            0,
            Arc::clone(&self.nodes),
            self.region().metrics().clone(),
        ));
        self.active.lock()[0].insert(0, Arc::clone(&ctx));

        debug!(
            pid = self.pid().0,
            shared = ctx.shared_id().0,
            device = ?device,
            socket = ?socket,
            "Acquired GPU context"
        );
        Ok(ctx)
    }

    /// Bind this GPU server to a context a client created.
    pub fn attach_to_context(
        &self,
        socket: SocketFd,
        shared_id: SharedContextId,
        poller: &dyn Poller,
    ) -> Result<ContextHandle> {
        let ProcessRole::GpuServer { device, .. } = self.role() else {
            let err = StoreError::ProtocolViolation(
                "backend tried to attach a GPU context".to_string(),
            );
            self.report_violation(&err);
            return Err(err);
        };

        let shared = self
            .region()
            .contexts()
            .attach_server(shared_id, self.pid())
            .inspect_err(|_| self.region().metrics().protocol_violations.inc())?;
        if let Err(e) = poller.register(socket) {
            if let Err(undo) = self.put_shared(&shared) {
                self.report_violation(&undo);
            }
            return Err(e);
        }

        let bucket = socket_bucket(socket);
        let ctx = Arc::new(GpuContext::new(
            shared,
            Some(socket),
            Some(device),
            self.resource_scope(),
            bucket,
            Arc::clone(&self.nodes),
            self.region().metrics().clone(),
        ));
        self.active.lock()[bucket].insert(0, Arc::clone(&ctx));

        debug!(pid = self.pid().0, shared = shared_id.0, socket = socket.0, "Attached GPU context");
        Ok(ctx)
    }

    /// Take another reference on `ctx`.
    pub fn retain(&self, ctx: &ContextHandle) -> ContextHandle {
        let prev = ctx.refcnt.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain on a released GPU context");
        Arc::clone(ctx)
    }

    /// Drop one reference; the last one tears the context down.
    pub fn release(&self, ctx: &ContextHandle) -> Result<()> {
        if Arc::ptr_eq(ctx, self.master_context()) {
            return Err(StoreError::ProtocolViolation(
                "the master GPU context cannot be released".to_string(),
            ));
        }
        let prev = ctx
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| {
                let err = StoreError::ProtocolViolation(format!(
                    "GPU context {} released with zero references",
                    ctx.shared_id().0
                ));
                self.report_violation(&err);
                err
            })?;
        if prev > 1 {
            return Ok(());
        }

        self.unlink(ctx);
        self.teardown(ctx, true)
    }

    /// Find the context bound to `socket` and take a reference on it.
    pub fn context_by_socket(&self, socket: SocketFd) -> Result<Option<ContextHandle>> {
        if !self.is_server() {
            return Err(StoreError::ProtocolViolation(
                "context lookup by socket on a backend".to_string(),
            ));
        }
        let active = self.active.lock();
        Ok(active[socket_bucket(socket)]
            .iter()
            .find(|ctx| ctx.socket() == Some(socket))
            .map(|ctx| {
                ctx.refcnt.fetch_add(1, Ordering::AcqRel);
                Arc::clone(ctx)
            }))
    }

    /// Record one task handed to the GPU server over `ctx`'s connection.
    pub fn submit_async_task(&self, ctx: &GpuContext) -> Result<()> {
        if ctx.socket().is_none() {
            return Err(StoreError::NotSupported(
                "asynchronous tasks need a connected context".to_string(),
            ));
        }
        ctx.shared().add_async_task();
        Ok(())
    }

    /// Block until every task submitted over `ctx` has completed.
    ///
    /// The shared context is only locked to read and update the counter;
    /// the wait itself happens with no lock held.
    pub fn synchronize_outstanding_work(&self, ctx: &GpuContext) -> Result<()> {
        if self.is_server() {
            return Err(StoreError::ProtocolViolation(
                "GPU server tried to synchronize a context".to_string(),
            ));
        }
        let shared = ctx.shared();
        if shared.num_async_tasks() == 0 {
            return Ok(());
        }
        let (Some(socket), Some(link)) = (ctx.socket(), self.link()) else {
            return Err(StoreError::ProtocolViolation(format!(
                "shared context {} has outstanding tasks but no connection",
                shared.id().0
            )));
        };

        shared.set_in_termination(TERMINATION_SYNC);
        let result = loop {
            if shared.num_async_tasks() == 0 {
                break Ok(());
            }
            match link
                .recv_completions(socket)
                .and_then(|n| shared.complete_async_tasks(n))
            {
                Ok(remaining) => debug!(shared = shared.id().0, remaining, "Received task completions"),
                Err(e) => break Err(e),
            }
        };
        shared.set_in_termination(0);
        result
    }

    /// Allocate a DMA buffer segment owned by `ctx`'s shared context. It
    /// lives until that shared context is freed.
    pub fn alloc_dma_buffer(&self, ctx: &GpuContext, len: usize) -> SegmentHandle {
        ctx.shared().alloc_dma_buffer(self.region().segments(), len)
    }

    /// Release every context of the current resource scope once that scope
    /// ends. Returns the number of contexts released.
    pub fn on_resource_scope_end(&self, is_commit: bool) -> usize {
        let nbuckets = if self.is_server() { ACTIVE_CONTEXT_NSLOTS } else { 1 };
        let scope = self.resource_scope();
        let mut released = 0;

        for bucket in 0..nbuckets {
            let victims: Vec<ContextHandle> = {
                let mut active = self.active.lock();
                let (victims, kept) = std::mem::take(&mut active[bucket])
                    .into_iter()
                    .partition(|ctx| ctx.scope() == scope);
                active[bucket] = kept;
                victims
            };

            for ctx in victims {
                if is_commit {
                    warn!(shared = ctx.shared_id().0, refcnt = ctx.refcnt(), "GPU context reference leak");
                }
                ctx.shared().set_in_termination(TERMINATION_DISCARD);
                ctx.refcnt.store(0, Ordering::Release);
                if let Err(e) = self.teardown(&ctx, is_commit) {
                    self.report_violation(&e);
                }
                released += 1;
            }
        }
        released
    }

    /// Release every context regardless of reference counts.
    ///
    /// Only safe during terminal cleanup of a single-threaded process.
    pub fn force_release_all(&self) -> Result<usize> {
        if matches!(self.role(), ProcessRole::GpuServer { multithreaded: true, .. }) {
            return Err(StoreError::ProtocolViolation(
                "forced context release in a multi-threaded process".to_string(),
            ));
        }

        let mut released = 0;
        for bucket in 0..ACTIVE_CONTEXT_NSLOTS {
            loop {
                let Some(ctx) = self.active.lock()[bucket].pop() else {
                    break;
                };
                ctx.refcnt.store(0, Ordering::Release);
                if let Err(e) = self.teardown(&ctx, false) {
                    self.report_violation(&e);
                }
                warn!(pid = self.pid().0, shared = ctx.shared_id().0, "GPU context remained, cleaned up");
                released += 1;
            }
        }
        Ok(released)
    }

    /// Process-exit hook.
    pub fn on_process_exit(&self) -> Result<usize> {
        let released = self.force_release_all()?;
        self.chunk_maps.lock().iter_mut().for_each(|m| *m = None);
        info!(pid = self.pid().0, released, "Process exit cleanup done");
        Ok(released)
    }

    fn unlink(&self, ctx: &ContextHandle) {
        let mut active = self.active.lock();
        let bucket = &mut active[ctx.bucket];
        if let Some(pos) = bucket.iter().position(|c| Arc::ptr_eq(c, ctx)) {
            bucket.remove(pos);
        }
    }

    /// Close the connection, free tracked resources and drop the shared
    /// reference.
    fn teardown(&self, ctx: &GpuContext, normal_exit: bool) -> Result<()> {
        if let (Some(socket), Some(link)) = (ctx.socket(), self.link()) {
            if let Err(e) = link.close(socket) {
                warn!(socket = socket.0, error = %e, "Failed to close GPU server socket");
            }
        }

        let summary = ctx
            .tracker()
            .release_all(ctx.nodes(), self.driver(), normal_exit);
        if summary.leaked > 0 {
            self.region()
                .metrics()
                .leaked_resources
                .inc_by(summary.leaked as u64);
        }

        debug!(
            shared = ctx.shared_id().0,
            released = summary.released,
            "Released GPU context"
        );
        self.put_shared(ctx.shared())
    }

    pub(crate) fn put_shared(&self, shared: &SharedContext) -> Result<()> {
        let freed = self
            .region()
            .contexts()
            .put(shared, self.is_server(), self.region().segments())?;
        if freed {
            self.region().metrics().contexts_in_use.dec();
        }
        Ok(())
    }

    /// Count and log a broken invariant that callers cannot act on.
    pub(crate) fn report_violation(&self, err: &StoreError) {
        self.region().metrics().protocol_violations.inc();
        warn!(pid = self.pid().0, error = %err, "Bug? protocol violation");
    }
}
