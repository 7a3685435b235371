//! Device execution collaborator
//!
//! The store never talks to an accelerator directly; it goes through the
//! [`DeviceRuntime`] trait: memory allocate/free, host->device copies and
//! inter-process memory-handle export/import, each fallible. Device work
//! follows a push/pop "current device" discipline so a mid-sequence
//! failure unwinds without corrupting device state; [`DeviceScope`] is
//! the RAII form of that discipline.
//!
//! [`HostDevice`] is a process-memory implementation used by tests and
//! CPU-only deployments; a CUDA-backed implementation plugs in behind the
//! same trait.

use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::{GpuStoreError, Result};

/// Raw device memory address
pub type DevicePtr = u64;

/// Identifier of a compiled device program
pub type ProgramId = u64;

/// Size of an exportable memory handle in bytes (CUDA IPC handle size)
pub const MEM_HANDLE_LEN: usize = 64;

/// Opaque device-memory handle for cross-process import
///
/// Valid only while the owning allocation exists; the bytes are meaningful
/// to the device runtime alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemHandle(pub [u8; MEM_HANDLE_LEN]);

impl DeviceMemHandle {
    /// The all-zero handle used by unpinned chunks
    pub fn zeroed() -> Self {
        Self([0u8; MEM_HANDLE_LEN])
    }

    /// Whether this is the unpinned placeholder handle
    pub fn is_zeroed(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

// ============================================================================
// Runtime trait
// ============================================================================

/// Fallible device operations the chunk store depends on
///
/// Every failure aborts the enclosing store operation; the caller frees
/// whatever was partially acquired before propagating the error.
pub trait DeviceRuntime: Send + Sync {
    /// Allocate device memory that outlives the calling process and
    /// return its exportable handle.
    fn alloc_preserved(&self, device: u32, len: u64) -> Result<DeviceMemHandle>;

    /// Free a preserved allocation by its handle.
    fn free_preserved(&self, device: u32, handle: DeviceMemHandle) -> Result<()>;

    /// Map a preserved allocation into the current process.
    fn open_mem_handle(&self, handle: DeviceMemHandle) -> Result<DevicePtr>;

    /// Unmap a previously opened handle.
    fn close_mem_handle(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy host bytes into device memory.
    fn copy_host_to_device(&self, ptr: DevicePtr, src: &[u8]) -> Result<()>;

    /// Free ordinary (non-preserved) device memory tracked by a context.
    fn free_device_memory(&self, ptr: DevicePtr, extra: u64) -> Result<()>;

    /// Free I/O-mapped memory tracked by a context.
    fn free_iomap(&self, ptr: DevicePtr) -> Result<()>;

    /// Drop one reference on a compiled device program.
    fn put_program(&self, program: ProgramId);

    /// Make `device` current for the calling thread.
    fn push_current(&self, device: u32) -> Result<()>;

    /// Restore the previously current device.
    fn pop_current(&self);

    /// True once the device context is gone; tracked device memory is
    /// then already released and must not be freed again.
    fn is_torn_down(&self) -> bool;
}

/// RAII wrapper around the push/pop current-device discipline
pub struct DeviceScope<'a> {
    runtime: &'a dyn DeviceRuntime,
}

impl<'a> DeviceScope<'a> {
    /// Push `device` as current; popped when the scope drops, including
    /// on the error path of the enclosing operation.
    pub fn enter(runtime: &'a dyn DeviceRuntime, device: u32) -> Result<Self> {
        runtime.push_current(device)?;
        Ok(Self { runtime })
    }
}

impl Drop for DeviceScope<'_> {
    fn drop(&mut self) {
        self.runtime.pop_current();
    }
}

// ============================================================================
// Host-memory implementation
// ============================================================================

struct PreservedAlloc {
    device: u32,
    bytes: Vec<u8>,
    open_count: u32,
}

struct HostDeviceState {
    next_id: u64,
    preserved: AHashMap<u64, PreservedAlloc>,
    push_depth: u32,
    program_puts: Vec<ProgramId>,
    freed_device_ptrs: Vec<DevicePtr>,
    freed_iomap_ptrs: Vec<DevicePtr>,
}

/// Process-memory stand-in for an accelerator runtime
///
/// Preserved allocations live in a table keyed by an id encoded into the
/// first bytes of the exported handle. Failure injection flags let tests
/// exercise the unwind paths of multi-step acquisitions.
pub struct HostDevice {
    state: Mutex<HostDeviceState>,
    torn_down: AtomicBool,
    fail_next_alloc: AtomicBool,
    fail_next_copy: AtomicBool,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostDeviceState {
                next_id: 1,
                preserved: AHashMap::new(),
                push_depth: 0,
                program_puts: Vec::new(),
                freed_device_ptrs: Vec::new(),
                freed_iomap_ptrs: Vec::new(),
            }),
            torn_down: AtomicBool::new(false),
            fail_next_alloc: AtomicBool::new(false),
            fail_next_copy: AtomicBool::new(false),
        }
    }

    /// Fail the next `alloc_preserved` call
    pub fn inject_alloc_failure(&self) {
        self.fail_next_alloc.store(true, Ordering::SeqCst);
    }

    /// Fail the next `copy_host_to_device` call
    pub fn inject_copy_failure(&self) {
        self.fail_next_copy.store(true, Ordering::SeqCst);
    }

    /// Simulate loss of the device context
    pub fn tear_down(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }

    /// Number of preserved allocations still alive
    pub fn preserved_count(&self) -> usize {
        self.state.lock().preserved.len()
    }

    /// Number of open handle mappings across all allocations
    pub fn open_handle_count(&self) -> u32 {
        self.state.lock().preserved.values().map(|a| a.open_count).sum()
    }

    /// Current push/pop nesting depth (0 when balanced)
    pub fn push_depth(&self) -> u32 {
        self.state.lock().push_depth
    }

    /// Contents of a preserved allocation, for mirror verification
    pub fn preserved_bytes(&self, handle: DeviceMemHandle) -> Option<Vec<u8>> {
        let id = decode_handle(handle)?;
        self.state.lock().preserved.get(&id).map(|a| a.bytes.clone())
    }

    /// Program ids released through `put_program`
    pub fn program_puts(&self) -> Vec<ProgramId> {
        self.state.lock().program_puts.clone()
    }

    /// Device pointers released through `free_device_memory`
    pub fn freed_device_ptrs(&self) -> Vec<DevicePtr> {
        self.state.lock().freed_device_ptrs.clone()
    }

    /// Device pointers released through `free_iomap`
    pub fn freed_iomap_ptrs(&self) -> Vec<DevicePtr> {
        self.state.lock().freed_iomap_ptrs.clone()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

const HANDLE_MAGIC: &[u8; 4] = b"HDEV";

fn encode_handle(id: u64) -> DeviceMemHandle {
    let mut bytes = [0u8; MEM_HANDLE_LEN];
    bytes[..4].copy_from_slice(HANDLE_MAGIC);
    bytes[4..12].copy_from_slice(&id.to_le_bytes());
    DeviceMemHandle(bytes)
}

fn decode_handle(handle: DeviceMemHandle) -> Option<u64> {
    if &handle.0[..4] != HANDLE_MAGIC {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&handle.0[4..12]);
    Some(u64::from_le_bytes(id))
}

impl DeviceRuntime for HostDevice {
    fn alloc_preserved(&self, device: u32, len: u64) -> Result<DeviceMemHandle> {
        if self.fail_next_alloc.swap(false, Ordering::SeqCst) {
            return Err(GpuStoreError::DeviceOperationFailed(
                "injected alloc_preserved failure".into(),
            ));
        }
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.preserved.insert(
            id,
            PreservedAlloc {
                device,
                bytes: vec![0u8; len as usize],
                open_count: 0,
            },
        );
        Ok(encode_handle(id))
    }

    fn free_preserved(&self, device: u32, handle: DeviceMemHandle) -> Result<()> {
        let id = decode_handle(handle).ok_or_else(|| {
            GpuStoreError::DeviceOperationFailed("malformed memory handle".into())
        })?;
        let mut state = self.state.lock();
        match state.preserved.remove(&id) {
            Some(alloc) if alloc.device == device => Ok(()),
            Some(_) => Err(GpuStoreError::DeviceOperationFailed(format!(
                "preserved allocation {} freed on wrong device {}",
                id, device
            ))),
            None => Err(GpuStoreError::DeviceOperationFailed(format!(
                "preserved allocation {} already freed",
                id
            ))),
        }
    }

    fn open_mem_handle(&self, handle: DeviceMemHandle) -> Result<DevicePtr> {
        let id = decode_handle(handle).ok_or_else(|| {
            GpuStoreError::DeviceOperationFailed("malformed memory handle".into())
        })?;
        let mut state = self.state.lock();
        let alloc = state.preserved.get_mut(&id).ok_or_else(|| {
            GpuStoreError::DeviceOperationFailed(format!("no preserved allocation {}", id))
        })?;
        alloc.open_count += 1;
        Ok(id)
    }

    fn close_mem_handle(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        let alloc = state.preserved.get_mut(&ptr).ok_or_else(|| {
            GpuStoreError::DeviceOperationFailed(format!("close of unmapped pointer {}", ptr))
        })?;
        if alloc.open_count == 0 {
            return Err(GpuStoreError::DeviceOperationFailed(format!(
                "pointer {} not open",
                ptr
            )));
        }
        alloc.open_count -= 1;
        Ok(())
    }

    fn copy_host_to_device(&self, ptr: DevicePtr, src: &[u8]) -> Result<()> {
        if self.fail_next_copy.swap(false, Ordering::SeqCst) {
            return Err(GpuStoreError::DeviceOperationFailed(
                "injected copy failure".into(),
            ));
        }
        let mut state = self.state.lock();
        let alloc = state.preserved.get_mut(&ptr).ok_or_else(|| {
            GpuStoreError::DeviceOperationFailed(format!("copy to unmapped pointer {}", ptr))
        })?;
        if src.len() > alloc.bytes.len() {
            return Err(GpuStoreError::DeviceOperationFailed(format!(
                "copy of {} bytes into {}-byte allocation",
                src.len(),
                alloc.bytes.len()
            )));
        }
        alloc.bytes[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn free_device_memory(&self, ptr: DevicePtr, _extra: u64) -> Result<()> {
        self.state.lock().freed_device_ptrs.push(ptr);
        Ok(())
    }

    fn free_iomap(&self, ptr: DevicePtr) -> Result<()> {
        self.state.lock().freed_iomap_ptrs.push(ptr);
        Ok(())
    }

    fn put_program(&self, program: ProgramId) {
        self.state.lock().program_puts.push(program);
    }

    fn push_current(&self, _device: u32) -> Result<()> {
        self.state.lock().push_depth += 1;
        Ok(())
    }

    fn pop_current(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.push_depth > 0);
        state.push_depth = state.push_depth.saturating_sub(1);
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================
