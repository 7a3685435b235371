//! Shared-segment registry
//!
//! Chunk images live in anonymous memory mappings published under small
//! integer handles, so chunk descriptors in the shared arena carry a
//! `SegmentHandle` instead of a raw cross-process pointer. Processes
//! attach a handle to get a mapped view and cache the attachment in a
//! [`ChunkMapping`]; the mapping is re-attached whenever the handle
//! stored in the descriptor changes.

use std::sync::Arc;

use ahash::AHashMap;
use memmap2::MmapMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{GpuStoreError, Result};

/// Handle naming one registered segment
pub type SegmentHandle = u32;

/// Handle value meaning "no segment"
pub const INVALID_SEGMENT: SegmentHandle = u32::MAX;

// ============================================================================
// Segment
// ============================================================================

/// One mapped shared segment holding an immutable chunk image
///
/// The image is written once at creation; afterwards the segment is only
/// read. Lifetime is reference-counted: the registry holds one reference
/// until the segment is removed, attachments hold the rest.
pub struct Segment {
    handle: SegmentHandle,
    map: MmapMut,
}

impl Segment {
    /// This segment's registry handle
    pub fn handle(&self) -> SegmentHandle {
        self.handle
    }

    /// Mapped length in bytes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }
}

// ============================================================================
// Registry
// ============================================================================

struct RegistryState {
    next_handle: SegmentHandle,
    segments: AHashMap<SegmentHandle, Arc<Segment>>,
}

/// Process-wide table of live shared segments
pub struct SegmentRegistry {
    state: Mutex<RegistryState>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_handle: 0,
                segments: AHashMap::new(),
            }),
        }
    }

    /// Create a segment sized and filled from `image`, returning its handle
    pub fn create_with(&self, image: &[u8]) -> Result<SegmentHandle> {
        let mut map = MmapMut::map_anon(image.len())?;
        map[..].copy_from_slice(image);

        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1);
        state.segments.insert(handle, Arc::new(Segment { handle, map }));
        Ok(handle)
    }

    /// Attach an existing segment; fails once the segment was removed
    pub fn attach(&self, handle: SegmentHandle) -> Result<Arc<Segment>> {
        self.state
            .lock()
            .segments
            .get(&handle)
            .cloned()
            .ok_or_else(|| GpuStoreError::NotFound(format!("shared segment {}", handle)))
    }

    /// Unpublish a segment; memory is reclaimed when the last attachment
    /// drops. Removing an unknown handle is non-fatal, logged.
    pub fn remove(&self, handle: SegmentHandle) {
        if self.state.lock().segments.remove(&handle).is_none() {
            log::warn!("Bug? shared segment {} was not registered", handle);
        }
    }

    /// Number of currently published segments
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }
}

/// Process-wide registry shared by stores and pools that do not carry
/// their own
pub fn global_registry() -> Arc<SegmentRegistry> {
    static GLOBAL: Lazy<Arc<SegmentRegistry>> = Lazy::new(|| Arc::new(SegmentRegistry::new()));
    Arc::clone(&GLOBAL)
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Per-process mapping cache
// ============================================================================

/// Cached attachment of one chunk's segment
///
/// Process-local and rebuilt on demand: when the descriptor's handle no
/// longer matches the cached attachment, the stale mapping is dropped and
/// the new segment attached.
#[derive(Default)]
pub struct ChunkMapping {
    seg: Option<Arc<Segment>>,
}

impl ChunkMapping {
    /// Get the mapped segment for `handle`, re-attaching if stale
    pub fn map(&mut self, registry: &SegmentRegistry, handle: SegmentHandle) -> Result<Arc<Segment>> {
        if let Some(seg) = &self.seg {
            if seg.handle() == handle {
                return Ok(Arc::clone(seg));
            }
        }
        let seg = registry.attach(handle)?;
        self.seg = Some(Arc::clone(&seg));
        Ok(seg)
    }

    /// Drop the cached attachment
    pub fn detach(&mut self) {
        self.seg = None;
    }

    pub fn is_mapped(&self) -> bool {
        self.seg.is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_attach_roundtrip() {
        let registry = SegmentRegistry::new();
        let handle = registry.create_with(&[7u8; 32]).unwrap();
        let seg = registry.attach(handle).unwrap();
        assert_eq!(seg.len(), 32);
        assert!(seg.as_slice().iter().all(|b| *b == 7));
    }

    #[test]
    fn test_attach_after_remove_fails() {
        let registry = SegmentRegistry::new();
        let handle = registry.create_with(&[0u8; 8]).unwrap();
        let held = registry.attach(handle).unwrap();

        registry.remove(handle);
        assert!(registry.attach(handle).is_err());
        // Existing attachment stays valid until dropped
        assert_eq!(held.len(), 8);
    }

    #[test]
    fn test_global_registry_is_shared() {
        // Both call sites see the same process-wide registry
        let handle = global_registry().create_with(&[9u8; 16]).unwrap();
        let seg = global_registry().attach(handle).unwrap();
        assert_eq!(seg.as_slice(), &[9u8; 16]);
        global_registry().remove(handle);
        assert!(global_registry().attach(handle).is_err());
    }

    #[test]
    fn test_mapping_cache_remaps_on_handle_change() {
        let registry = SegmentRegistry::new();
        let h1 = registry.create_with(&[1u8; 4]).unwrap();
        let h2 = registry.create_with(&[2u8; 4]).unwrap();

        let mut mapping = ChunkMapping::default();
        let s1 = mapping.map(&registry, h1).unwrap();
        assert_eq!(s1.as_slice(), &[1, 1, 1, 1]);

        // Same handle: cached attachment is reused
        let s1b = mapping.map(&registry, h1).unwrap();
        assert!(Arc::ptr_eq(&s1, &s1b));

        // Different handle: remapped
        let s2 = mapping.map(&registry, h2).unwrap();
        assert_eq!(s2.as_slice(), &[2, 2, 2, 2]);

        mapping.detach();
        assert!(!mapping.is_mapped());
    }
}
