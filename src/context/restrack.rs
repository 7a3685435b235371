//! Per-context resource tracker
//!
//! Every native resource acquired on behalf of an execution context gets
//! exactly one entry here until it is explicitly released. Entries are
//! keyed by a crc32 of (class tag, identity bytes) and bucketed; bucket
//! collisions fall back to exact (class, identity) comparison. Teardown
//! drains every bucket through the per-class destructor, which is how
//! the pool guarantees leak-free release even on error paths: anything
//! still tracked at normal exit is reported as a leak.

use crc32fast::Hasher;

use crate::device::{DevicePtr, DeviceRuntime, ProgramId};

/// Number of hash buckets per tracker
const RESTRACK_NSLOTS: usize = 53;

// Class tags folded into the identity hash
const CLASS_DEVICE_MEMORY: u8 = 2;
const CLASS_PROGRAM: u8 = 3;
const CLASS_IOMAP_MEMORY: u8 = 4;

// ============================================================================
// Tracked Resource
// ============================================================================

/// One tracked native resource
///
/// A closed sum: adding a class means adding a destructor arm in
/// [`ResourceTracker::release_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedResource {
    /// Ordinary device memory; `extra` is allocator bookkeeping returned
    /// verbatim on untrack.
    DeviceMemory { ptr: DevicePtr, extra: u64 },
    /// A compiled device program reference
    Program { id: ProgramId },
    /// I/O-mapped memory
    IoMappedMemory { ptr: DevicePtr },
}

impl TrackedResource {
    fn class_tag(&self) -> u8 {
        match self {
            TrackedResource::DeviceMemory { .. } => CLASS_DEVICE_MEMORY,
            TrackedResource::Program { .. } => CLASS_PROGRAM,
            TrackedResource::IoMappedMemory { .. } => CLASS_IOMAP_MEMORY,
        }
    }

    fn identity(&self) -> u64 {
        match self {
            TrackedResource::DeviceMemory { ptr, .. } => *ptr,
            TrackedResource::Program { id } => *id,
            TrackedResource::IoMappedMemory { ptr } => *ptr,
        }
    }

    /// Stable identity hash over (class, identity)
    fn crc(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&[self.class_tag()]);
        hasher.update(&self.identity().to_le_bytes());
        hasher.finalize()
    }

    /// Same class and identity; `extra` is payload, not identity
    fn same_identity(&self, other: &TrackedResource) -> bool {
        self.class_tag() == other.class_tag() && self.identity() == other.identity()
    }
}

// ============================================================================
// Resource Tracker
// ============================================================================

struct Entry {
    crc: u32,
    resource: TrackedResource,
}

/// Hash table of tracked resources for one execution context
///
/// Not internally locked; the owning context guards it with its own
/// per-context lock.
pub struct ResourceTracker {
    buckets: Vec<Vec<Entry>>,
    entries: usize,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            buckets: (0..RESTRACK_NSLOTS).map(|_| Vec::new()).collect(),
            entries: 0,
        }
    }

    /// Track a resource, returning its identity-hash token
    pub fn track(&mut self, resource: TrackedResource) -> u32 {
        let crc = resource.crc();
        self.buckets[crc as usize % RESTRACK_NSLOTS].push(Entry { crc, resource });
        self.entries += 1;
        crc
    }

    fn untrack(&mut self, probe: &TrackedResource) -> Option<TrackedResource> {
        let crc = probe.crc();
        let bucket = &mut self.buckets[crc as usize % RESTRACK_NSLOTS];
        let pos = bucket
            .iter()
            .position(|e| e.crc == crc && e.resource.same_identity(probe))?;
        self.entries -= 1;
        Some(bucket.swap_remove(pos).resource)
    }

    /// Stop tracking device memory, returning its `extra` bookkeeping.
    /// Missing entries are non-fatal, logged.
    pub fn untrack_device_memory(&mut self, ptr: DevicePtr) -> Option<u64> {
        match self.untrack(&TrackedResource::DeviceMemory { ptr, extra: 0 }) {
            Some(TrackedResource::DeviceMemory { extra, .. }) => Some(extra),
            _ => {
                log::warn!("Bug? device memory {:#x} was not tracked", ptr);
                None
            }
        }
    }

    /// Stop tracking a program reference
    pub fn untrack_program(&mut self, id: ProgramId) -> bool {
        if self.untrack(&TrackedResource::Program { id }).is_some() {
            true
        } else {
            log::warn!("Bug? device program {} was not tracked", id);
            false
        }
    }

    /// Stop tracking I/O-mapped memory
    pub fn untrack_iomap(&mut self, ptr: DevicePtr) -> bool {
        if self
            .untrack(&TrackedResource::IoMappedMemory { ptr })
            .is_some()
        {
            true
        } else {
            log::warn!("Bug? I/O mapped memory {:#x} was not tracked", ptr);
            false
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Drain every bucket, destroying each resource by class
    ///
    /// On a normal exit, remaining entries are leaks and get reported;
    /// abnormal teardown frees silently, the caller is already unwinding.
    /// Device-memory frees are skipped when the device context is gone:
    /// the allocation died with it.
    pub fn release_all(&mut self, device: &dyn DeviceRuntime, normal_exit: bool) {
        for bucket in &mut self.buckets {
            for entry in bucket.drain(..) {
                self.entries -= 1;
                match entry.resource {
                    TrackedResource::DeviceMemory { ptr, extra } => {
                        if normal_exit {
                            log::warn!("device memory {:#x} likely leaked", ptr);
                        }
                        if device.is_torn_down() {
                            continue;
                        }
                        if let Err(e) = device.free_device_memory(ptr, extra) {
                            log::warn!("failed to free device memory {:#x}: {}", ptr, e);
                        }
                    }
                    TrackedResource::Program { id } => {
                        if normal_exit {
                            log::warn!("device program {} likely leaked", id);
                        }
                        device.put_program(id);
                    }
                    TrackedResource::IoMappedMemory { ptr } => {
                        if normal_exit {
                            log::warn!("I/O mapped memory {:#x} likely leaked", ptr);
                        }
                        if let Err(e) = device.free_iomap(ptr) {
                            log::warn!("failed to free I/O mapped memory {:#x}: {}", ptr, e);
                        }
                    }
                }
            }
        }
    }
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    #[test]
    fn test_track_untrack_returns_extra() {
        let mut tracker = ResourceTracker::new();
        tracker.track(TrackedResource::DeviceMemory {
            ptr: 0x1000,
            extra: 42,
        });
        tracker.track(TrackedResource::Program { id: 7 });
        assert_eq!(tracker.len(), 2);

        assert_eq!(tracker.untrack_device_memory(0x1000), Some(42));
        assert!(tracker.untrack_program(7));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_untrack_missing_is_nonfatal() {
        let mut tracker = ResourceTracker::new();
        assert_eq!(tracker.untrack_device_memory(0xdead), None);
        assert!(!tracker.untrack_program(99));
        assert!(!tracker.untrack_iomap(0xbeef));
    }

    #[test]
    fn test_same_identity_different_class() {
        let mut tracker = ResourceTracker::new();
        // Same numeric identity under two classes must not collide
        tracker.track(TrackedResource::DeviceMemory {
            ptr: 0x2000,
            extra: 1,
        });
        tracker.track(TrackedResource::IoMappedMemory { ptr: 0x2000 });

        assert_eq!(tracker.untrack_device_memory(0x2000), Some(1));
        assert!(tracker.untrack_iomap(0x2000));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_release_all_dispatches_destructors() {
        let device = HostDevice::new();
        let mut tracker = ResourceTracker::new();
        tracker.track(TrackedResource::DeviceMemory {
            ptr: 0x10,
            extra: 0,
        });
        tracker.track(TrackedResource::Program { id: 3 });
        tracker.track(TrackedResource::IoMappedMemory { ptr: 0x20 });

        tracker.release_all(&device, true);
        assert!(tracker.is_empty());
        assert_eq!(device.freed_device_ptrs(), vec![0x10]);
        assert_eq!(device.program_puts(), vec![3]);
        assert_eq!(device.freed_iomap_ptrs(), vec![0x20]);
    }

    #[test]
    fn test_release_all_skips_device_memory_after_teardown() {
        let device = HostDevice::new();
        device.tear_down();

        let mut tracker = ResourceTracker::new();
        tracker.track(TrackedResource::DeviceMemory {
            ptr: 0x10,
            extra: 0,
        });
        tracker.track(TrackedResource::IoMappedMemory { ptr: 0x20 });

        tracker.release_all(&device, false);
        assert!(tracker.is_empty());
        // Ordinary device memory died with the context; iomap still freed
        assert!(device.freed_device_ptrs().is_empty());
        assert_eq!(device.freed_iomap_ptrs(), vec![0x20]);
    }

    #[test]
    fn test_many_entries_across_buckets() {
        let mut tracker = ResourceTracker::new();
        for i in 0..500u64 {
            tracker.track(TrackedResource::DeviceMemory {
                ptr: 0x1000 + i,
                extra: i,
            });
        }
        assert_eq!(tracker.len(), 500);
        for i in 0..500u64 {
            assert_eq!(tracker.untrack_device_memory(0x1000 + i), Some(i));
        }
        assert!(tracker.is_empty());
    }
}
