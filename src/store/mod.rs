//! GPU-resident columnar chunk store
//!
//! One immutable chunk per (database, table) at any snapshot: writes
//! materialize a whole chunk, deletes stamp it dead, and reads resolve
//! the visible chunk through the MVCC predicate in [`visibility`]. The
//! reclaimer in [`reclaim`] runs on transaction end and frees chunks no
//! live snapshot can still see.
//!
//! Device work (mirror upload, preserved-memory release) always happens
//! outside the descriptor lock; the lock covers shared-state transitions
//! only.

pub mod chunk;
pub mod reclaim;
pub mod visibility;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub use chunk::{ChunkRef, TableKey, CHUNK_HASH_NSLOTS};

use crate::config::StoreConfig;
use crate::device::{DeviceMemHandle, DeviceRuntime, DeviceScope};
use crate::encode::{encode_chunk, ChunkImage, ColumnDef, Value};
use crate::shmem::{ChunkMapping, SegmentHandle, SegmentRegistry};
use crate::txn::{xid_is_valid, Txn, TxnOracle, INVALID_XID};
use crate::{GpuStoreError, Result};

use chunk::{ChunkSlot, StoreState};
use visibility::satisfies_visibility;

/// Columnar chunk store with snapshot-isolation semantics
pub struct ChunkStore {
    state: Mutex<StoreState>,
    /// Nonzero while any chunk may need end-of-transaction attention
    has_warm_chunks: AtomicU32,
    /// Per-slot local segment attachments
    mappings: Mutex<Vec<ChunkMapping>>,
    segments: Arc<SegmentRegistry>,
    device: Arc<dyn DeviceRuntime>,
    oracle: Arc<TxnOracle>,
}

impl ChunkStore {
    pub fn new(
        config: &StoreConfig,
        device: Arc<dyn DeviceRuntime>,
        segments: Arc<SegmentRegistry>,
        oracle: Arc<TxnOracle>,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            state: Mutex::new(StoreState::new(config.max_chunks)),
            has_warm_chunks: AtomicU32::new(0),
            mappings: Mutex::new(
                (0..config.max_chunks).map(|_| ChunkMapping::default()).collect(),
            ),
            segments,
            device,
            oracle,
        });
        store.attach_to_oracle();
        store
    }

    /// Register the reclaimer on the oracle's end-of-transaction hook
    ///
    /// Held weakly so a dropped store does not keep itself alive through
    /// the oracle.
    fn attach_to_oracle(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.oracle.register_end_hook(move |xid, is_commit| {
            if let Some(store) = weak.upgrade() {
                store.on_transaction_end(xid, is_commit);
            }
        });
    }

    /// Resolve the slot of the chunk visible to `txn`, if any
    ///
    /// At most one chunk per key may be visible to a snapshot; more than
    /// one means shared state was corrupted and the request aborts.
    fn visible_slot(&self, state: &mut StoreState, txn: &Txn, key: &TableKey) -> Result<Option<ChunkSlot>> {
        let snapshot = txn.snapshot();
        let mut visible = None;
        for slot in state.candidates(key) {
            if satisfies_visibility(&mut state.chunks[slot], txn.xid(), &snapshot, &self.oracle) {
                if visible.is_some() {
                    return Err(GpuStoreError::ConsistencyViolation(format!(
                        "multiple visible chunks for table {}/{}",
                        key.db_id, key.table_id
                    )));
                }
                visible = Some(slot);
            }
        }
        Ok(visible)
    }

    /// SELECT-style lookup of the visible chunk
    pub fn lookup(&self, txn: &Txn, key: &TableKey) -> Result<Option<ChunkRef>> {
        let mut state = self.state.lock();
        Ok(self
            .visible_slot(&mut state, txn, key)?
            .map(|slot| ChunkRef::from_descriptor(slot, &state.chunks[slot])))
    }

    /// Materialize `rows` as the table's chunk
    ///
    /// The store holds at most one visible chunk per table; writing over
    /// an existing visible chunk is refused (delete first). A device
    /// mirror is uploaded when `device_index` is given; every partially
    /// acquired device resource is returned on failure.
    pub fn write(
        &self,
        txn: &Txn,
        key: &TableKey,
        schema: &[ColumnDef],
        rows: &[Vec<Value>],
        device_index: Option<u32>,
    ) -> Result<ChunkRef> {
        // Cheap early check; raced writers are caught again under the
        // lock before linking.
        {
            let mut state = self.state.lock();
            if self.visible_slot(&mut state, txn, key)?.is_some() {
                return Err(GpuStoreError::Unsupported(format!(
                    "table {}/{} already has a visible chunk",
                    key.db_id, key.table_id
                )));
            }
        }

        let image = encode_chunk(schema, rows)?;
        let nitems = rows.len() as u64;
        let length = image.len() as u64;
        let segment = self.segments.create_with(&image)?;

        let mem_handle = match device_index {
            Some(dev) => match self.upload_mirror(dev, &image) {
                Ok(handle) => handle,
                Err(e) => {
                    self.segments.remove(segment);
                    return Err(e);
                }
            },
            None => DeviceMemHandle::zeroed(),
        };

        let slot = {
            let mut state = self.state.lock();
            // Re-check: another writer may have linked a chunk while the
            // image was being uploaded.
            let raced = self.visible_slot(&mut state, txn, key)?.is_some();
            let popped = if raced {
                None
            } else {
                match state.pop_free() {
                    Ok(slot) => Some(slot),
                    Err(e) => {
                        drop(state);
                        self.discard_unlinked(device_index, mem_handle, segment);
                        return Err(e);
                    }
                }
            };
            match popped {
                Some(slot) => {
                    let chunk = &mut state.chunks[slot];
                    chunk.hash = key.hash();
                    chunk.key = *key;
                    chunk.xmin = txn.xid();
                    chunk.xmax = INVALID_XID;
                    chunk.cid = txn.current_command();
                    chunk.xmin_committed = false;
                    chunk.xmax_committed = false;
                    chunk.nitems = nitems;
                    chunk.length = length;
                    chunk.device_index = device_index;
                    chunk.mem_handle = mem_handle;
                    chunk.segment = segment;
                    state.link(slot);
                    // Raised under the lock so a concurrent reclaim pass
                    // cannot clear it between link and store
                    self.has_warm_chunks.store(1, Ordering::SeqCst);
                    slot
                }
                None => {
                    drop(state);
                    self.discard_unlinked(device_index, mem_handle, segment);
                    return Err(GpuStoreError::Unsupported(format!(
                        "table {}/{} already has a visible chunk",
                        key.db_id, key.table_id
                    )));
                }
            }
        };

        // Attach the local mapping outside the descriptor lock
        self.mappings.lock()[slot].map(&self.segments, segment)?;

        let state = self.state.lock();
        Ok(ChunkRef::from_descriptor(slot, &state.chunks[slot]))
    }

    /// Allocate a preserved device allocation and copy the image into it
    fn upload_mirror(&self, device_index: u32, image: &[u8]) -> Result<DeviceMemHandle> {
        let handle = self.device.alloc_preserved(device_index, image.len() as u64)?;
        let upload = (|| {
            let _scope = DeviceScope::enter(&*self.device, device_index)?;
            let ptr = self.device.open_mem_handle(handle)?;
            let copied = self.device.copy_host_to_device(ptr, image);
            let closed = self.device.close_mem_handle(ptr);
            copied.and(closed)
        })();
        if let Err(e) = upload {
            if let Err(free_err) = self.device.free_preserved(device_index, handle) {
                log::warn!("failed to unwind device mirror: {}", free_err);
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Drop resources of a chunk that never got linked
    fn discard_unlinked(
        &self,
        device_index: Option<u32>,
        mem_handle: DeviceMemHandle,
        segment: SegmentHandle,
    ) {
        if let Some(dev) = device_index {
            if let Err(e) = self.device.free_preserved(dev, mem_handle) {
                log::warn!("failed to free device mirror: {}", e);
            }
        }
        self.segments.remove(segment);
    }

    /// Stamp the visible chunk deleted; returns the number of rows removed
    ///
    /// Row-level predicates are not supported: a delete always covers the
    /// whole chunk. Deleting from a table with no visible chunk removes
    /// zero rows.
    pub fn delete(&self, txn: &Txn, key: &TableKey) -> Result<u64> {
        let mut state = self.state.lock();
        let slot = match self.visible_slot(&mut state, txn, key)? {
            Some(slot) => slot,
            None => return Ok(0),
        };
        let chunk = &mut state.chunks[slot];
        if xid_is_valid(chunk.xmax) {
            // Visible with a live deleter stamp means a concurrent delete
            // of the same chunk; only one may proceed.
            return Err(GpuStoreError::ConsistencyViolation(format!(
                "chunk of table {}/{} is already being deleted by {}",
                key.db_id, key.table_id, chunk.xmax
            )));
        }
        chunk.xmax = txn.xid();
        chunk.cid = txn.current_command();
        chunk.xmax_committed = false;
        let nitems = chunk.nitems;
        self.has_warm_chunks.store(1, Ordering::SeqCst);
        drop(state);
        // Scans of older snapshots re-attach on demand
        self.mappings.lock()[slot].detach();
        Ok(nitems)
    }

    /// Decode the visible chunk back into rows
    pub fn scan(&self, txn: &Txn, key: &TableKey) -> Result<Vec<Vec<Value>>> {
        let chunk = match self.lookup(txn, key)? {
            Some(chunk) => chunk,
            None => return Ok(Vec::new()),
        };
        let seg = self.mappings.lock()[chunk.slot].map(&self.segments, chunk.segment)?;
        let image = ChunkImage::parse(seg.as_slice())?;
        image.to_rows()
    }

    /// Export the visible chunk's device mirror for peer import
    ///
    /// Only chunks pinned on a device can be exported; a host-only chunk
    /// has no handle to give out.
    pub fn export(&self, txn: &Txn, key: &TableKey) -> Result<ChunkRef> {
        let chunk = self.lookup(txn, key)?.ok_or_else(|| {
            GpuStoreError::NotFound(format!(
                "no visible chunk for table {}/{}",
                key.db_id, key.table_id
            ))
        })?;
        if !chunk.has_device_mirror() {
            return Err(GpuStoreError::Unsupported(format!(
                "chunk of table {}/{} is not pinned on a device",
                key.db_id, key.table_id
            )));
        }
        Ok(chunk)
    }

    /// Stamp every chunk of a dropped table deleted, visibility aside
    ///
    /// Runs from the table-drop path: chunks of other transactions are
    /// stamped too, and the reclaimer collects them once the dropping
    /// transaction commits.
    pub fn mark_dropped(&self, txn: &Txn, key: &TableKey) -> Result<()> {
        let mut state = self.state.lock();
        let mut stamped = false;
        for slot in state.candidates(key) {
            let chunk = &mut state.chunks[slot];
            if !xid_is_valid(chunk.xmax) {
                chunk.xmax = txn.xid();
                chunk.cid = txn.current_command();
                chunk.xmax_committed = false;
                stamped = true;
            }
        }
        if stamped {
            self.has_warm_chunks.store(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Number of linked chunk descriptors (any visibility)
    pub fn chunk_count(&self) -> usize {
        self.state.lock().linked_slots().len()
    }

    /// Number of free descriptor slots
    pub fn free_count(&self) -> usize {
        self.state.lock().free_count()
    }

    /// Whether end-of-transaction work may be pending
    pub fn has_warm_chunks(&self) -> bool {
        self.has_warm_chunks.load(Ordering::SeqCst) != 0
    }
}

// ============================================================================
// Tests
// ============================================================================
