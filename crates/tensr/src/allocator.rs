//! Device-aware byte allocators and the process-wide factory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::device::{Device, DeviceType};
use crate::error::{Error, Result};

/// Polymorphic byte allocator bound to a single device.
///
/// Implementations hand out raw buffers that callers wrap in
/// [`OwnedPtr`](crate::storage::OwnedPtr) handles; `deallocate` must accept
/// exactly the addresses `allocate` produced, and must be safe on null.
pub trait Allocator: Send + Sync {
    /// Returns an aligned buffer of `size_bytes` bytes.
    fn allocate(&self, size_bytes: usize) -> Result<*mut u8>;

    /// Releases a buffer previously returned by this allocator. No-op on null.
    fn deallocate(&self, ptr: *mut u8);

    /// The device whose memory this allocator manages.
    fn device(&self) -> Device;
}

/// CPU allocator wrapping `malloc`/`free`.
///
/// Tracks the number of live allocations so tests can assert exactly-once
/// release. For zero-size requests `malloc` may legally return null; the
/// storage core never asks for zero bytes, and a null result for a zero-size
/// request is reported as success here.
pub struct CpuAllocator {
    live_allocations: AtomicUsize,
}

impl CpuAllocator {
    pub fn new() -> Self {
        CpuAllocator {
            live_allocations: AtomicUsize::new(0),
        }
    }

    /// Number of buffers handed out and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Relaxed)
    }
}

impl Default for CpuAllocator {
    fn default() -> Self {
        CpuAllocator::new()
    }
}

impl Allocator for CpuAllocator {
    fn allocate(&self, size_bytes: usize) -> Result<*mut u8> {
        let ptr = unsafe { libc::malloc(size_bytes) } as *mut u8;
        if ptr.is_null() && size_bytes > 0 {
            return Err(Error::AllocationFailure {
                size_bytes,
                device: self.device(),
            });
        }
        if !ptr.is_null() {
            self.live_allocations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ptr)
    }

    fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);
        unsafe { libc::free(ptr as *mut libc::c_void) }
    }

    fn device(&self) -> Device {
        Device::cpu()
    }
}

static CPU_ALLOCATOR: OnceCell<Arc<CpuAllocator>> = OnceCell::new();

/// Shared handle to the process-wide CPU allocator, created on first use.
pub fn cpu_allocator() -> Arc<CpuAllocator> {
    Arc::clone(CPU_ALLOCATOR.get_or_init(|| Arc::new(CpuAllocator::new())))
}

/// Returns the allocator serving `device`.
///
/// CPU requests share one process-wide allocator. CUDA has no allocator yet
/// and fails with [`Error::UnsupportedDevice`].
pub fn allocator_for(device: Device) -> Result<Arc<dyn Allocator>> {
    match device.device_type() {
        DeviceType::Cpu => {
            let allocator: Arc<dyn Allocator> = cpu_allocator();
            Ok(allocator)
        }
        DeviceType::Cuda => Err(Error::UnsupportedDevice(device)),
        DeviceType::Invalid => Err(Error::InvalidDevice(device.to_string())),
    }
}
