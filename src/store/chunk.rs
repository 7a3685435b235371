//! Chunk descriptors and the shared descriptor arena
//!
//! Descriptors live in a fixed array carved out at start-up. Free slots
//! sit on an explicit free list; live slots hang off a crc32-bucketed
//! hash table keyed by (database, table). The arena never grows.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::device::DeviceMemHandle;
use crate::shmem::{SegmentHandle, INVALID_SEGMENT};
use crate::txn::{CommandId, TxnId, INVALID_XID};
use crate::{GpuStoreError, Result};

/// Number of buckets in the chunk hash table
pub const CHUNK_HASH_NSLOTS: usize = 97;

/// Index of a chunk descriptor slot
pub type ChunkSlot = usize;

/// Identity of a table's chunk within the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub db_id: u32,
    pub table_id: u32,
}

impl TableKey {
    pub fn new(db_id: u32, table_id: u32) -> Self {
        Self { db_id, table_id }
    }

    /// crc32 over the identity pair, little-endian field order
    pub fn hash(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.db_id.to_le_bytes());
        hasher.update(&self.table_id.to_le_bytes());
        hasher.finalize()
    }

    pub fn bucket(&self) -> usize {
        self.hash() as usize % CHUNK_HASH_NSLOTS
    }
}

/// One materialized chunk: MVCC stamps plus host/device placement
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub hash: u32,
    pub key: TableKey,
    /// Transaction that created the chunk
    pub xmin: TxnId,
    /// Transaction that deleted the chunk, or INVALID_XID
    pub xmax: TxnId,
    /// Command id of the stamping operation; insert and delete share it,
    /// a chunk is never inserted and deleted by different commands of the
    /// same transaction without the delete overwriting it
    pub cid: CommandId,
    pub xmin_committed: bool,
    pub xmax_committed: bool,
    /// Row count of the encoded image
    pub nitems: u64,
    /// Byte length of the encoded image
    pub length: u64,
    /// Device holding the mirror, when one was materialized
    pub device_index: Option<u32>,
    /// Preserved device allocation the mirror lives in
    pub mem_handle: DeviceMemHandle,
    /// Host shared-memory segment with the encoded image
    pub segment: SegmentHandle,
}

impl ChunkDescriptor {
    pub(crate) fn vacant() -> Self {
        Self {
            hash: 0,
            key: TableKey::new(0, 0),
            xmin: INVALID_XID,
            xmax: INVALID_XID,
            cid: 0,
            xmin_committed: false,
            xmax_committed: false,
            nitems: 0,
            length: 0,
            device_index: None,
            mem_handle: DeviceMemHandle::zeroed(),
            segment: INVALID_SEGMENT,
        }
    }

    /// Whether a device mirror is attached
    pub fn has_device_mirror(&self) -> bool {
        self.device_index.is_some()
    }
}

/// Read-only view of a chunk handed out by lookups
#[derive(Debug, Clone)]
pub struct ChunkRef {
    pub slot: ChunkSlot,
    pub key: TableKey,
    pub nitems: u64,
    pub length: u64,
    pub device_index: Option<u32>,
    pub mem_handle: DeviceMemHandle,
    pub segment: SegmentHandle,
}

impl ChunkRef {
    /// Whether a device mirror is attached
    pub fn has_device_mirror(&self) -> bool {
        self.device_index.is_some()
    }

    pub(crate) fn from_descriptor(slot: ChunkSlot, chunk: &ChunkDescriptor) -> Self {
        Self {
            slot,
            key: chunk.key,
            nitems: chunk.nitems,
            length: chunk.length,
            device_index: chunk.device_index,
            mem_handle: chunk.mem_handle,
            segment: chunk.segment,
        }
    }
}

/// Descriptor arena plus hash table, guarded by the store lock
pub(crate) struct StoreState {
    pub chunks: Vec<ChunkDescriptor>,
    /// Free descriptor slots, popped from the back
    free: Vec<ChunkSlot>,
    /// Hash buckets of linked slot indices
    buckets: Vec<Vec<ChunkSlot>>,
}

impl StoreState {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: (0..max_chunks).map(|_| ChunkDescriptor::vacant()).collect(),
            free: (0..max_chunks).rev().collect(),
            buckets: vec![Vec::new(); CHUNK_HASH_NSLOTS],
        }
    }

    /// Pop a free descriptor slot
    pub fn pop_free(&mut self) -> Result<ChunkSlot> {
        self.free.pop().ok_or_else(|| {
            GpuStoreError::ResourceExhausted("out of shared chunk descriptors".into())
        })
    }

    /// Link a slot into its key's hash bucket
    pub fn link(&mut self, slot: ChunkSlot) {
        let bucket = self.chunks[slot].key.bucket();
        self.buckets[bucket].push(slot);
    }

    /// Unlink a slot from its bucket
    pub fn unlink(&mut self, slot: ChunkSlot) {
        let bucket = self.chunks[slot].key.bucket();
        self.buckets[bucket].retain(|&s| s != slot);
    }

    /// Reset a slot and return it to the free list
    pub fn push_free(&mut self, slot: ChunkSlot) {
        self.chunks[slot] = ChunkDescriptor::vacant();
        self.free.push(slot);
    }

    /// Slots in `key`'s bucket whose hash and key match
    pub fn candidates(&self, key: &TableKey) -> Vec<ChunkSlot> {
        let hash = key.hash();
        self.buckets[key.bucket()]
            .iter()
            .copied()
            .filter(|&s| self.chunks[s].hash == hash && self.chunks[s].key == *key)
            .collect()
    }

    /// Every linked slot, all buckets
    pub fn linked_slots(&self) -> Vec<ChunkSlot> {
        self.buckets.iter().flatten().copied().collect()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
