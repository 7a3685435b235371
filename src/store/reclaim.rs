//! End-of-transaction chunk reclamation
//!
//! Runs from the oracle's end hook on every commit and abort. Stamps of
//! the ending transaction are resolved into hint flags (or cleared on
//! abort), then every linked chunk is judged against the oldest xid any
//! live snapshot can still observe: dead beyond that horizon is
//! released, alive beyond it is frozen, anything still in reach stays
//! warm for a later pass. The whole walk is skipped while no chunk is
//! warm.

use std::sync::atomic::Ordering;

use crate::device::DeviceMemHandle;
use crate::shmem::SegmentHandle;
use crate::txn::{xid_is_normal, xid_is_valid, xid_precedes, TxnId, FROZEN_XID, INVALID_XID};

use super::chunk::ChunkSlot;
use super::ChunkStore;

/// Resources of a released chunk, freed after the descriptor lock drops
struct Released {
    slot: ChunkSlot,
    device_index: Option<u32>,
    mem_handle: DeviceMemHandle,
    segment: SegmentHandle,
}

impl ChunkStore {
    /// Resolve the ending transaction's stamps and reclaim what no live
    /// snapshot can still see
    pub(crate) fn on_transaction_end(&self, xid: TxnId, is_commit: bool) {
        if self.has_warm_chunks.load(Ordering::SeqCst) == 0 {
            return;
        }
        let oldest = self.oracle.oldest_active_xid();

        let mut released = Vec::new();
        let mut warm_remained = false;
        {
            let mut state = self.state.lock();
            for slot in state.linked_slots() {
                let chunk = &mut state.chunks[slot];

                if chunk.xmax == xid {
                    if is_commit {
                        chunk.xmax_committed = true;
                    } else {
                        chunk.xmax = INVALID_XID;
                    }
                }
                if chunk.xmin == xid {
                    if is_commit {
                        chunk.xmin_committed = true;
                    } else {
                        // Aborted insert: nobody can ever see this chunk
                        released.push(Released {
                            slot,
                            device_index: chunk.device_index,
                            mem_handle: chunk.mem_handle,
                            segment: chunk.segment,
                        });
                        state.unlink(slot);
                        state.push_free(slot);
                        continue;
                    }
                }

                let chunk = &state.chunks[slot];
                if xid_is_valid(chunk.xmax) {
                    if !chunk.xmax_committed || !xid_precedes(chunk.xmax, oldest) {
                        // Deleter unresolved or still visible somewhere
                        warm_remained = true;
                        continue;
                    }
                    released.push(Released {
                        slot,
                        device_index: chunk.device_index,
                        mem_handle: chunk.mem_handle,
                        segment: chunk.segment,
                    });
                    state.unlink(slot);
                    state.push_free(slot);
                } else if xid_is_normal(chunk.xmin) {
                    if !chunk.xmin_committed || !xid_precedes(chunk.xmin, oldest) {
                        warm_remained = true;
                        continue;
                    }
                    // Committed before every reachable snapshot: freeze
                    state.chunks[slot].xmin = FROZEN_XID;
                } else if !xid_is_valid(chunk.xmin) {
                    // Insert already invalidated by an earlier pass
                    released.push(Released {
                        slot,
                        device_index: chunk.device_index,
                        mem_handle: chunk.mem_handle,
                        segment: chunk.segment,
                    });
                    state.unlink(slot);
                    state.push_free(slot);
                }
                // Frozen xmin with no deleter: nothing to do
            }

            // Cleared under the lock: a writer linking a new chunk holds
            // the same lock when it raises the flag, so the raise cannot
            // be lost to a concurrent pass that saw the arena empty
            if !warm_remained {
                self.has_warm_chunks.store(0, Ordering::SeqCst);
            }
        }

        // Device and segment teardown happens outside the lock
        for dead in released {
            self.mappings.lock()[dead.slot].detach();
            if let Some(dev) = dead.device_index {
                if let Err(e) = self.device.free_preserved(dev, dead.mem_handle) {
                    log::warn!("failed to free reclaimed device mirror: {}", e);
                }
            }
            self.segments.remove(dead.segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::StoreConfig;
    use crate::device::HostDevice;
    use crate::encode::{ColumnDef, ColumnType, Value};
    use crate::shmem::SegmentRegistry;
    use crate::store::{ChunkStore, TableKey};
    use crate::txn::TxnOracle;

    fn schema() -> Vec<ColumnDef> {
        vec![ColumnDef::new("v", ColumnType::Int32)]
    }

    fn rows(n: i32) -> Vec<Vec<Value>> {
        (0..n).map(|i| vec![Value::Int32(i)]).collect()
    }

    struct Fixture {
        store: Arc<ChunkStore>,
        oracle: Arc<TxnOracle>,
        device: Arc<HostDevice>,
        segments: Arc<SegmentRegistry>,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(HostDevice::new());
        let segments = Arc::new(SegmentRegistry::new());
        let oracle = TxnOracle::new();
        let store = ChunkStore::new(
            &StoreConfig::default().max_chunks(8),
            device.clone(),
            segments.clone(),
            oracle.clone(),
        );
        Fixture {
            store,
            oracle,
            device,
            segments,
        }
    }

    #[test]
    fn test_aborted_write_released_immediately() {
        let f = fixture();
        let key = TableKey::new(1, 1);

        let txn = f.oracle.begin();
        f.store
            .write(&txn, &key, &schema(), &rows(3), Some(0))
            .unwrap();
        assert_eq!(f.segments.segment_count(), 1);
        assert_eq!(f.device.preserved_count(), 1);

        txn.abort();
        assert_eq!(f.store.chunk_count(), 0);
        assert_eq!(f.store.free_count(), 8);
        assert_eq!(f.segments.segment_count(), 0);
        // The device mirror was handed back too
        assert_eq!(f.device.preserved_count(), 0);
    }

    #[test]
    fn test_committed_write_frozen_once_unreachable() {
        let f = fixture();
        let key = TableKey::new(1, 1);

        let txn = f.oracle.begin();
        f.store.write(&txn, &key, &schema(), &rows(2), None).unwrap();
        txn.commit();

        // No snapshot can reach back before the commit: frozen in place
        let reader = f.oracle.begin();
        let chunk = f.store.lookup(&reader, &key).unwrap().unwrap();
        assert_eq!(chunk.nitems, 2);
        reader.commit();
        assert_eq!(f.store.chunk_count(), 1);
        assert!(!f.store.has_warm_chunks());
    }

    #[test]
    fn test_commit_with_old_reader_keeps_chunk_warm() {
        let f = fixture();
        let key = TableKey::new(1, 1);

        let reader = f.oracle.begin();
        let writer = f.oracle.begin();
        f.store
            .write(&writer, &key, &schema(), &rows(1), None)
            .unwrap();
        writer.commit();

        // The old reader's snapshot still excludes the writer, so the
        // chunk may not be frozen yet
        assert!(f.store.lookup(&reader, &key).unwrap().is_none());
        assert!(f.store.has_warm_chunks());

        // Once the reader ends, the next pass freezes it
        reader.commit();
        let late = f.oracle.begin();
        assert!(f.store.lookup(&late, &key).unwrap().is_some());
        late.commit();
        assert!(!f.store.has_warm_chunks());
    }

    #[test]
    fn test_committed_delete_released_past_horizon() {
        let f = fixture();
        let key = TableKey::new(1, 1);

        let writer = f.oracle.begin();
        f.store
            .write(&writer, &key, &schema(), &rows(4), Some(0))
            .unwrap();
        writer.commit();
        assert_eq!(f.device.preserved_count(), 1);

        let deleter = f.oracle.begin();
        assert_eq!(f.store.delete(&deleter, &key).unwrap(), 4);
        // Still linked: the delete has not committed
        assert_eq!(f.store.chunk_count(), 1);

        deleter.commit();
        // No snapshot can see it anymore: fully released
        assert_eq!(f.store.chunk_count(), 0);
        assert_eq!(f.segments.segment_count(), 0);
        assert_eq!(f.device.preserved_count(), 0);
    }

    #[test]
    fn test_aborted_delete_keeps_chunk() {
        let f = fixture();
        let key = TableKey::new(1, 1);

        let writer = f.oracle.begin();
        f.store.write(&writer, &key, &schema(), &rows(4), None).unwrap();
        writer.commit();

        let deleter = f.oracle.begin();
        f.store.delete(&deleter, &key).unwrap();
        deleter.abort();

        // The delete stamp was cleared; everyone still sees the chunk
        let reader = f.oracle.begin();
        let chunk = f.store.lookup(&reader, &key).unwrap().unwrap();
        assert_eq!(chunk.nitems, 4);
        reader.commit();
        assert_eq!(f.store.chunk_count(), 1);
    }

    #[test]
    fn test_delete_held_back_by_old_snapshot() {
        let f = fixture();
        let key = TableKey::new(1, 1);

        let writer = f.oracle.begin();
        f.store.write(&writer, &key, &schema(), &rows(2), None).unwrap();
        writer.commit();

        // Reader's snapshot predates the delete
        let reader = f.oracle.begin();
        let deleter = f.oracle.begin();
        f.store.delete(&deleter, &key).unwrap();
        deleter.commit();

        // The chunk must survive while the reader can still scan it
        assert_eq!(f.store.chunk_count(), 1);
        assert_eq!(f.store.scan(&reader, &key).unwrap().len(), 2);

        reader.commit();
        // Horizon advanced past the deleter on the reader's own end
        assert_eq!(f.store.chunk_count(), 0);
        assert_eq!(f.segments.segment_count(), 0);
    }

    #[test]
    fn test_four_transaction_interleaving() {
        let f = fixture();
        let key_a = TableKey::new(1, 1);
        let key_b = TableKey::new(1, 2);

        // t1 writes A and commits; t2 writes B and aborts; t3 deletes A
        // while t4 reads; t3 commits before t4 ends.
        let t1 = f.oracle.begin();
        f.store.write(&t1, &key_a, &schema(), &rows(5), None).unwrap();
        t1.commit();

        let t2 = f.oracle.begin();
        f.store.write(&t2, &key_b, &schema(), &rows(3), None).unwrap();

        let t3 = f.oracle.begin();
        let t4 = t3.oracle().begin();

        t2.abort();
        assert!(f.store.lookup(&t4, &key_b).unwrap().is_none());
        // B's descriptor was reclaimed on the abort
        assert_eq!(f.store.chunk_count(), 1);

        f.store.delete(&t3, &key_a).unwrap();
        t3.commit();

        // t4 predates t3: A is still visible and still resident
        assert_eq!(f.store.scan(&t4, &key_a).unwrap().len(), 5);
        assert_eq!(f.store.chunk_count(), 1);

        t4.commit();
        assert_eq!(f.store.chunk_count(), 0);
        assert_eq!(f.segments.segment_count(), 0);
        assert!(!f.store.has_warm_chunks());
    }

    #[test]
    fn test_concurrent_aborts_never_strand_chunks() {
        use std::thread;

        let device = Arc::new(HostDevice::new());
        let segments = Arc::new(SegmentRegistry::new());
        let oracle = TxnOracle::new();
        let store = ChunkStore::new(
            &StoreConfig::default().max_chunks(64),
            device,
            segments.clone(),
            oracle.clone(),
        );

        // Writers that abort race against committing churn; if a raised
        // warm flag is ever lost to a concurrent pass, an aborted chunk
        // stays linked forever.
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let store = Arc::clone(&store);
            let oracle = Arc::clone(&oracle);
            handles.push(thread::spawn(move || {
                for i in 0..25 {
                    let txn = oracle.begin();
                    store
                        .write(&txn, &TableKey::new(t, i), &schema(), &rows(1), None)
                        .unwrap();
                    txn.abort();
                }
            }));
        }
        for _ in 0..4 {
            let oracle = Arc::clone(&oracle);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    oracle.begin().commit();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.chunk_count(), 0);
        assert_eq!(store.free_count(), 64);
        assert_eq!(segments.segment_count(), 0);
        assert!(!store.has_warm_chunks());
    }

    #[test]
    fn test_pass_skipped_without_warm_chunks() {
        let f = fixture();
        // Commits with nothing warm never touch the arena
        let t = f.oracle.begin();
        t.commit();
        assert!(!f.store.has_warm_chunks());
        assert_eq!(f.store.free_count(), 8);
    }

    #[test]
    fn test_frozen_stamp_survives_reclaim_passes() {
        let f = fixture();
        let key = TableKey::new(1, 1);

        let writer = f.oracle.begin();
        f.store.write(&writer, &key, &schema(), &rows(1), None).unwrap();
        writer.commit();

        // A few unrelated transactions come and go
        for _ in 0..3 {
            let t = f.oracle.begin();
            t.commit();
        }

        let reader = f.oracle.begin();
        let chunk = f.store.lookup(&reader, &key).unwrap().unwrap();
        assert_eq!(chunk.nitems, 1);
        reader.commit();
        // Exactly one descriptor, never re-released
        assert_eq!(f.store.chunk_count(), 1);
    }
}
