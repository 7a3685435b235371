//! Execution context pool
//!
//! Contexts pair a connection-owning caller with an optional worker over
//! a shared, reference-counted descriptor living in a fixed slot arena.
//! The local half owns a transport handle and a resource tracker; the
//! shared half carries the cross-process refcount, the outstanding
//! async-task counter and the in-termination flag. Slots go back to the
//! free list only when the shared refcount reaches zero.
//!
//! Lifecycle: Unattached -> Active -> Draining (in-termination set)
//! -> Released (slot returned to the pool).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::restrack::ResourceTracker;
use crate::config::StoreConfig;
use crate::device::DeviceRuntime;
use crate::shmem::{SegmentHandle, SegmentRegistry};
use crate::{GpuStoreError, Result};

/// Index of a shared context slot
pub type SlotId = usize;

/// Resource scope of a caller (one per connection / worker session)
pub type ScopeId = u64;

// in_termination states
const TERM_NONE: u32 = 0;
const TERM_DRAINING: u32 = 1;
const TERM_DISCARDING: u32 = 2;

// ============================================================================
// Transport
// ============================================================================

/// Connection between the context owner and its worker
pub trait Transport: Send + Sync {
    /// Block until the peer reports one completed async task; an error
    /// means the peer disconnected.
    fn recv_completion(&self) -> Result<()>;
}

/// Opens transport connections for contexts acquired with one
pub trait TransportConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Transport>>;
}

// ============================================================================
// Shared descriptor
// ============================================================================

/// Mutable half of a shared context slot, guarded by the slot lock
struct SharedContext {
    refcnt: u32,
    owner: Option<ScopeId>,
    worker: Option<ScopeId>,
    num_async_tasks: u32,
    /// Bulk-transfer buffer segments freed when the refcount hits zero
    bulk_buffers: Vec<SegmentHandle>,
}

struct SharedSlot {
    state: Mutex<SharedContext>,
    in_termination: AtomicU32,
}

impl SharedSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SharedContext {
                refcnt: 0,
                owner: None,
                worker: None,
                num_async_tasks: 0,
                bulk_buffers: Vec::new(),
            }),
            in_termination: AtomicU32::new(TERM_NONE),
        }
    }
}

// ============================================================================
// Local context
// ============================================================================

/// Process-local half of an execution context
///
/// Reference-counted through the pool's `get`/`put`; dropping the last
/// local reference releases tracked resources and detaches from the
/// shared descriptor.
pub struct ExecutionContext {
    slot: SlotId,
    scope: ScopeId,
    worker_side: bool,
    refcnt: AtomicU32,
    transport: Option<Box<dyn Transport>>,
    tracker: Mutex<ResourceTracker>,
}

impl ExecutionContext {
    /// The shared slot this context is bound to
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// The owning resource scope
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Whether this is the worker-side attachment
    pub fn is_worker(&self) -> bool {
        self.worker_side
    }

    /// Whether a transport connection is open
    pub fn has_connection(&self) -> bool {
        self.transport.is_some()
    }

    /// Run `f` with this context's resource tracker
    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut ResourceTracker) -> R) -> R {
        f(&mut self.tracker.lock())
    }

    fn local_refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Take a reference only while the count is still positive
    ///
    /// A context at zero is mid-release: its tracker is being drained and
    /// its shared slot may already be freed, so it must not come back.
    fn try_get(&self) -> bool {
        let mut current = self.refcnt.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            match self.refcnt.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Fixed-capacity registry of execution contexts
///
/// One shared arena of descriptor slots plus a process-local index of
/// active local contexts. Structural changes (free list, active index)
/// happen under short locks, never across transport or device calls.
pub struct ContextPool {
    slots: Vec<SharedSlot>,
    free: Mutex<Vec<SlotId>>,
    active: Mutex<Vec<Arc<ExecutionContext>>>,
    segments: Arc<SegmentRegistry>,
    device: Arc<dyn DeviceRuntime>,
    connector: Option<Arc<dyn TransportConnector>>,
}

impl ContextPool {
    /// Build a pool with `config.max_contexts` slots
    pub fn new(
        config: &StoreConfig,
        device: Arc<dyn DeviceRuntime>,
        segments: Arc<SegmentRegistry>,
        connector: Option<Arc<dyn TransportConnector>>,
    ) -> Self {
        let capacity = config.max_contexts;
        Self {
            slots: (0..capacity).map(|_| SharedSlot::new()).collect(),
            // Pop from the back: slot 0 is handed out first
            free: Mutex::new((0..capacity).rev().collect()),
            active: Mutex::new(Vec::new()),
            segments,
            device,
            connector,
        }
    }

    /// Acquire a context for `scope`
    ///
    /// Reuses a context the caller already owns when its connection state
    /// matches `want_connection`; otherwise binds a fresh shared slot,
    /// opening a transport connection when asked to.
    pub fn acquire(&self, scope: ScopeId, want_connection: bool) -> Result<Arc<ExecutionContext>> {
        {
            let active = self.active.lock();
            for ctx in active.iter() {
                if ctx.scope == scope
                    && !ctx.worker_side
                    && ctx.has_connection() == want_connection
                    && ctx.try_get()
                {
                    // try_get skips a context whose last put is in
                    // flight; a fresh slot is bound below instead
                    return Ok(Arc::clone(ctx));
                }
            }
        }

        let slot = self.free.lock().pop().ok_or_else(|| {
            GpuStoreError::ResourceExhausted("no execution context slot available".into())
        })?;

        {
            let mut shared = self.slots[slot].state.lock();
            shared.refcnt = 1;
            shared.owner = Some(scope);
            shared.worker = None;
            shared.num_async_tasks = 0;
            self.slots[slot]
                .in_termination
                .store(TERM_NONE, Ordering::SeqCst);
        }

        let transport = if want_connection {
            let connector = self.connector.as_ref().ok_or_else(|| {
                GpuStoreError::Unsupported("pool has no transport connector".into())
            });
            match connector.and_then(|c| c.connect()) {
                Ok(t) => Some(t),
                Err(e) => {
                    // Unwind the slot binding before propagating
                    {
                        let mut shared = self.slots[slot].state.lock();
                        shared.refcnt = 0;
                        shared.owner = None;
                    }
                    self.free.lock().push(slot);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let ctx = Arc::new(ExecutionContext {
            slot,
            scope,
            worker_side: false,
            refcnt: AtomicU32::new(1),
            transport,
            tracker: Mutex::new(ResourceTracker::new()),
        });
        self.active.lock().push(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Attach the worker side to a shared descriptor already owned by a
    /// connection owner
    ///
    /// The descriptor must be live (refcnt > 0), have an owner, no worker
    /// yet and no async tasks outstanding; anything else is a consistency
    /// violation.
    pub fn attach(
        &self,
        scope: ScopeId,
        transport: Box<dyn Transport>,
        slot: SlotId,
    ) -> Result<Arc<ExecutionContext>> {
        {
            let mut shared = self.slots[slot].state.lock();
            if shared.refcnt == 0 {
                return Err(GpuStoreError::ConsistencyViolation(format!(
                    "attach to unowned context slot {}",
                    slot
                )));
            }
            if shared.owner.is_none() {
                return Err(GpuStoreError::ConsistencyViolation(format!(
                    "context slot {} has no owner",
                    slot
                )));
            }
            if shared.worker.is_some() {
                return Err(GpuStoreError::ConsistencyViolation(format!(
                    "context slot {} already has a worker",
                    slot
                )));
            }
            if shared.num_async_tasks != 0 {
                return Err(GpuStoreError::ConsistencyViolation(format!(
                    "context slot {} has async tasks before attach",
                    slot
                )));
            }
            shared.refcnt += 1;
            shared.worker = Some(scope);
        }

        let ctx = Arc::new(ExecutionContext {
            slot,
            scope,
            worker_side: true,
            refcnt: AtomicU32::new(1),
            transport: Some(transport),
            tracker: Mutex::new(ResourceTracker::new()),
        });
        self.active.lock().push(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Increment the local refcount
    pub fn get(&self, ctx: &Arc<ExecutionContext>) -> Arc<ExecutionContext> {
        let old = ctx.refcnt.fetch_add(1, Ordering::SeqCst);
        debug_assert!(old > 0);
        Arc::clone(ctx)
    }

    /// Drop one local reference
    ///
    /// The last reference removes the context from the active index,
    /// releases its tracked resources and detaches from the shared
    /// descriptor; the last shared reference frees bulk buffers and
    /// returns the slot.
    pub fn put(&self, ctx: &Arc<ExecutionContext>) -> Result<()> {
        let old = ctx.refcnt.fetch_sub(1, Ordering::SeqCst);
        if old == 0 {
            return Err(GpuStoreError::ConsistencyViolation(
                "put on context with zero refcount".into(),
            ));
        }
        if old > 1 {
            return Ok(());
        }

        {
            let mut active = self.active.lock();
            if let Some(pos) = active.iter().position(|c| Arc::ptr_eq(c, ctx)) {
                active.swap_remove(pos);
            }
        }
        ctx.tracker.lock().release_all(&*self.device, true);
        self.put_shared(ctx.slot, ctx.worker_side)
    }

    fn put_shared(&self, slot: SlotId, worker_side: bool) -> Result<()> {
        let bulk;
        {
            let mut shared = self.slots[slot].state.lock();
            if shared.refcnt == 0 {
                return Err(GpuStoreError::ConsistencyViolation(format!(
                    "shared refcount underflow on slot {}",
                    slot
                )));
            }
            if worker_side {
                shared.worker = None;
            } else {
                shared.owner = None;
            }
            shared.refcnt -= 1;
            if shared.refcnt > 0 {
                return Ok(());
            }
            debug_assert!(shared.owner.is_none() && shared.worker.is_none());
            bulk = std::mem::take(&mut shared.bulk_buffers);
        }
        // Bulk buffers are freed outside the slot lock
        for handle in bulk {
            self.segments.remove(handle);
        }
        self.free.lock().push(slot);
        Ok(())
    }

    /// Block the owner until the shared descriptor's async-task counter
    /// drains to zero
    ///
    /// Holds the in-termination flag during the drain so no new work is
    /// admitted; waits on the transport between checks. A transport error
    /// (peer disconnect) propagates with the flag left at draining.
    pub fn synchronize(&self, ctx: &Arc<ExecutionContext>) -> Result<()> {
        if ctx.worker_side {
            return Err(GpuStoreError::ConsistencyViolation(
                "synchronize called from the worker side".into(),
            ));
        }
        let slot = &self.slots[ctx.slot];
        loop {
            {
                let shared = slot.state.lock();
                if shared.num_async_tasks == 0 {
                    break;
                }
                slot.in_termination.store(TERM_DRAINING, Ordering::SeqCst);
            }
            let transport = ctx.transport.as_ref().ok_or_else(|| {
                GpuStoreError::ConsistencyViolation(
                    "synchronize on a context without a connection".into(),
                )
            })?;
            transport.recv_completion()?;
        }
        slot.in_termination.store(TERM_NONE, Ordering::SeqCst);
        Ok(())
    }

    /// Admit one async task on the slot; refused while termination is in
    /// progress.
    pub fn task_begun(&self, slot: SlotId) -> bool {
        if self.slots[slot].in_termination.load(Ordering::SeqCst) != TERM_NONE {
            return false;
        }
        self.slots[slot].state.lock().num_async_tasks += 1;
        true
    }

    /// Retire one async task on the slot
    pub fn task_done(&self, slot: SlotId) {
        let mut shared = self.slots[slot].state.lock();
        debug_assert!(shared.num_async_tasks > 0);
        shared.num_async_tasks = shared.num_async_tasks.saturating_sub(1);
    }

    /// Outstanding async tasks on the slot
    pub fn async_tasks(&self, slot: SlotId) -> u32 {
        self.slots[slot].state.lock().num_async_tasks
    }

    /// Record a bulk-transfer buffer owned by the shared descriptor
    pub fn add_bulk_buffer(&self, slot: SlotId, handle: SegmentHandle) {
        self.slots[slot].state.lock().bulk_buffers.push(handle);
    }

    /// Emergency, non-graceful teardown for process-exit paths
    ///
    /// Walks every locally active context regardless of refcount,
    /// discards pending work, releases resources without leak reports and
    /// forces the shared descriptors down.
    pub fn force_put_all(&self) {
        let drained: Vec<Arc<ExecutionContext>> = self.active.lock().drain(..).collect();
        for ctx in drained {
            log::warn!(
                "execution context on slot {} remained (refcnt={}), cleaning up",
                ctx.slot,
                ctx.local_refcnt()
            );
            self.slots[ctx.slot]
                .in_termination
                .store(TERM_DISCARDING, Ordering::SeqCst);
            ctx.tracker.lock().release_all(&*self.device, false);
            if let Err(e) = self.put_shared(ctx.slot, ctx.worker_side) {
                log::warn!("forced context release on slot {}: {}", ctx.slot, e);
            }
        }
    }

    /// Number of locally active contexts
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Number of free shared slots
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Shared refcount of a slot (test/monitoring aid)
    pub fn shared_refcnt(&self, slot: SlotId) -> u32 {
        self.slots[slot].state.lock().refcnt
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::restrack::TrackedResource;
    use crate::device::HostDevice;
    use std::io;
    use std::sync::mpsc;
    use std::thread;

    /// Test transport over an mpsc channel; one message per completion
    struct PipeTransport {
        rx: Mutex<mpsc::Receiver<()>>,
    }

    impl Transport for PipeTransport {
        fn recv_completion(&self) -> Result<()> {
            self.rx.lock().recv().map_err(|_| {
                GpuStoreError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer disconnected",
                ))
            })
        }
    }

    fn pipe() -> (mpsc::Sender<()>, Box<dyn Transport>) {
        let (tx, rx) = mpsc::channel();
        (tx, Box::new(PipeTransport { rx: Mutex::new(rx) }))
    }

    fn test_pool(capacity: usize) -> (ContextPool, Arc<HostDevice>) {
        let device = Arc::new(HostDevice::new());
        let segments = Arc::new(SegmentRegistry::new());
        let pool = ContextPool::new(
            &StoreConfig::default().max_contexts(capacity),
            device.clone(),
            segments,
            None,
        );
        (pool, device)
    }

    #[test]
    fn test_acquire_put_returns_slot() {
        let (pool, _) = test_pool(2);
        let ctx = pool.acquire(1, false).unwrap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.shared_refcnt(ctx.slot()), 1);

        pool.put(&ctx).unwrap();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.shared_refcnt(ctx.slot()), 0);
    }

    #[test]
    fn test_acquire_reuses_owned_context() {
        let (pool, _) = test_pool(2);
        let a = pool.acquire(1, false).unwrap();
        let b = pool.acquire(1, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.free_count(), 1);

        // Different scope gets its own slot
        let c = pool.acquire(2, false).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.free_count(), 0);

        pool.put(&a).unwrap();
        pool.put(&b).unwrap();
        pool.put(&c).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_exhaustion_then_recovery() {
        let (pool, _) = test_pool(2);
        let a = pool.acquire(1, false).unwrap();
        let b = pool.acquire(2, false).unwrap();

        match pool.acquire(3, false) {
            Err(GpuStoreError::ResourceExhausted(_)) => {}
            other => panic!("expected ResourceExhausted, got {:?}", other.map(|_| ())),
        }
        // Free list stays intact: release one, acquire succeeds
        pool.put(&b).unwrap();
        let c = pool.acquire(3, false).unwrap();
        assert_eq!(pool.free_count(), 0);

        pool.put(&a).unwrap();
        pool.put(&c).unwrap();
    }

    #[test]
    fn test_get_put_refcounts() {
        let (pool, _) = test_pool(1);
        let ctx = pool.acquire(1, false).unwrap();
        let again = pool.get(&ctx);
        pool.put(&again).unwrap();
        // Still held by the first reference
        assert_eq!(pool.active_count(), 1);
        pool.put(&ctx).unwrap();
        assert_eq!(pool.active_count(), 0);

        // Refcount never goes negative: an extra put is an error
        match pool.put(&ctx) {
            Err(GpuStoreError::ConsistencyViolation(_)) => {}
            other => panic!("expected ConsistencyViolation, got {:?}", other),
        }
    }

    #[test]
    fn test_acquire_skips_context_mid_release() {
        let (pool, _) = test_pool(2);
        let ctx = pool.acquire(1, false).unwrap();

        // A releasing put drops the count to zero before it prunes the
        // active index; an acquirer walking the index in that window
        // must bind a fresh slot, not resurrect the dying context.
        ctx.refcnt.store(0, Ordering::SeqCst);
        let fresh = pool.acquire(1, false).unwrap();
        assert!(!Arc::ptr_eq(&ctx, &fresh));
        assert_eq!(ctx.local_refcnt(), 0);
        assert_ne!(ctx.slot(), fresh.slot());

        pool.put(&fresh).unwrap();
    }

    #[test]
    fn test_attach_requires_live_owner() {
        let (pool, _) = test_pool(2);
        let (_tx, transport) = pipe();
        // Slot 0 was never acquired
        assert!(matches!(
            pool.attach(9, transport, 0),
            Err(GpuStoreError::ConsistencyViolation(_))
        ));

        let ctx = pool.acquire(1, false).unwrap();
        let (_tx, transport) = pipe();
        let worker = pool.attach(9, transport, ctx.slot()).unwrap();
        assert!(worker.is_worker());
        assert_eq!(pool.shared_refcnt(ctx.slot()), 2);

        // Second worker is refused
        let (_tx, transport) = pipe();
        assert!(matches!(
            pool.attach(10, transport, ctx.slot()),
            Err(GpuStoreError::ConsistencyViolation(_))
        ));

        // Owner releases; slot survives until the worker detaches
        pool.put(&ctx).unwrap();
        assert_eq!(pool.shared_refcnt(worker.slot()), 1);
        assert_eq!(pool.free_count(), 1);
        pool.put(&worker).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_synchronize_drains_tasks() {
        let device = Arc::new(HostDevice::new());
        let segments = Arc::new(SegmentRegistry::new());
        let pool = Arc::new(ContextPool::new(
            &StoreConfig::default().max_contexts(1),
            device,
            segments,
            None,
        ));

        // Build a connected owner context around a test pipe
        let (tx, transport) = pipe();
        let slot = pool.free.lock().pop().unwrap();
        {
            let mut shared = pool.slots[slot].state.lock();
            shared.refcnt = 1;
            shared.owner = Some(1);
        }
        let ctx = Arc::new(ExecutionContext {
            slot,
            scope: 1,
            worker_side: false,
            refcnt: AtomicU32::new(1),
            transport: Some(transport),
            tracker: Mutex::new(ResourceTracker::new()),
        });
        pool.active.lock().push(Arc::clone(&ctx));

        for _ in 0..3 {
            assert!(pool.task_begun(slot));
        }
        assert_eq!(pool.async_tasks(slot), 3);

        let worker_pool = Arc::clone(&pool);
        let worker = thread::spawn(move || {
            for _ in 0..3 {
                worker_pool.task_done(slot);
                tx.send(()).unwrap();
            }
            // Work is refused while the drain flag may be up; once the
            // counter is zero synchronize clears it.
        });

        pool.synchronize(&ctx).unwrap();
        worker.join().unwrap();
        assert_eq!(pool.async_tasks(slot), 0);
        // Flag cleared after the drain: new work admitted again
        assert!(pool.task_begun(slot));
        pool.task_done(slot);

        pool.put(&ctx).unwrap();
    }

    #[test]
    fn test_task_refused_while_draining() {
        let (pool, _) = test_pool(1);
        let ctx = pool.acquire(1, false).unwrap();
        let slot = ctx.slot();

        assert!(pool.task_begun(slot));
        pool.slots[slot]
            .in_termination
            .store(TERM_DRAINING, Ordering::SeqCst);
        assert!(!pool.task_begun(slot));
        pool.slots[slot]
            .in_termination
            .store(TERM_NONE, Ordering::SeqCst);
        pool.task_done(slot);
        pool.put(&ctx).unwrap();
    }

    #[test]
    fn test_force_put_all_releases_everything() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (pool, device) = test_pool(3);
        let a = pool.acquire(1, false).unwrap();
        let _a2 = pool.get(&a); // extra local reference is ignored by force
        let b = pool.acquire(2, false).unwrap();
        b.with_tracker(|t| {
            t.track(TrackedResource::DeviceMemory {
                ptr: 0x99,
                extra: 0,
            })
        });

        pool.force_put_all();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.free_count(), 3);
        // Abnormal teardown still frees tracked resources
        assert_eq!(device.freed_device_ptrs(), vec![0x99]);
    }

    #[test]
    fn test_put_releases_tracked_resources() {
        let (pool, device) = test_pool(1);
        let ctx = pool.acquire(1, false).unwrap();
        ctx.with_tracker(|t| {
            t.track(TrackedResource::IoMappedMemory { ptr: 0x42 });
        });
        pool.put(&ctx).unwrap();
        assert_eq!(device.freed_iomap_ptrs(), vec![0x42]);
    }

    #[test]
    fn test_bulk_buffers_freed_on_last_put() {
        let device = Arc::new(HostDevice::new());
        let segments = Arc::new(SegmentRegistry::new());
        let pool = ContextPool::new(
            &StoreConfig::default().max_contexts(1),
            device,
            segments.clone(),
            None,
        );

        let ctx = pool.acquire(1, false).unwrap();
        let handle = segments.create_with(&[0u8; 64]).unwrap();
        pool.add_bulk_buffer(ctx.slot(), handle);
        assert_eq!(segments.segment_count(), 1);

        pool.put(&ctx).unwrap();
        // Last shared reference dropped the bulk buffer with it
        assert_eq!(segments.segment_count(), 0);
        assert!(segments.attach(handle).is_err());
    }

    #[test]
    fn test_capacity_never_exceeded_concurrently() {
        let (pool, _) = test_pool(4);
        let pool = Arc::new(pool);
        let mut handles = Vec::new();
        for scope in 0..16u64 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    if let Ok(ctx) = pool.acquire(scope, false) {
                        assert!(pool.active_count() <= 4);
                        pool.put(&ctx).unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.active_count(), 0);
    }
}
