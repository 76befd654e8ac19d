//! Byte storage bound to a device-aware allocator, with copy-on-write
//! sharing.
//!
//! A [`Storage`] owns one contiguous buffer through an [`OwnedPtr`] handle.
//! [`cow`] turns that single-owner handle into a reference-counted shared one
//! and back again; see the module docs there for the sharing protocol.

pub mod cow;
mod owned_ptr;

pub use owned_ptr::{Deleter, OwnedPtr};

use std::ptr;
use std::sync::Arc;

use crate::allocator::{allocator_for, Allocator};
use crate::device::Device;
use crate::error::{Error, Result};

/// Sized byte buffer living on one device, allocated through its allocator.
pub struct Storage {
    ptr: OwnedPtr,
    size_bytes: usize,
    device: Device,
    allocator: Arc<dyn Allocator>,
}

impl Storage {
    /// Allocates `size_bytes` bytes on `device`.
    ///
    /// Size zero produces a storage with no buffer; the allocator is still
    /// resolved so a later [`resize`](Storage::resize) can allocate.
    pub fn new(size_bytes: usize, device: Device) -> Result<Self> {
        let allocator = allocator_for(device)?;
        let ptr = if size_bytes > 0 {
            let data = allocator.allocate(size_bytes)?;
            allocator_owned_ptr(data, &allocator, device)
        } else {
            OwnedPtr::null(device)
        };
        Ok(Storage {
            ptr,
            size_bytes,
            device,
            allocator,
        })
    }

    /// Wraps an externally-owned buffer without taking ownership of it.
    ///
    /// The installed deleter is a no-op; whoever produced `data` remains
    /// responsible for freeing it after the storage (and every lazy clone of
    /// it) is gone.
    pub fn from_external(data: *mut u8, size_bytes: usize, device: Device) -> Result<Self> {
        if data.is_null() {
            return Err(Error::InvalidArgument(
                "external storage requires a non-null buffer".into(),
            ));
        }
        let allocator = allocator_for(device)?;
        let deleter: Deleter = Arc::new(|_: &mut OwnedPtr| {});
        Ok(Storage {
            ptr: OwnedPtr::new(data, ptr::null_mut(), Some(deleter), device),
            size_bytes,
            device,
            allocator,
        })
    }

    /// A storage with size zero and no buffer.
    pub fn uninit(device: Device) -> Result<Self> {
        Storage::new(0, device)
    }

    pub(crate) fn from_parts(
        ptr: OwnedPtr,
        size_bytes: usize,
        device: Device,
        allocator: Arc<dyn Allocator>,
    ) -> Self {
        Storage {
            ptr,
            size_bytes,
            device,
            allocator,
        }
    }

    /// Raw address of the payload; null when the storage holds no buffer.
    pub fn data(&self) -> *mut u8 {
        self.ptr.data()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.allocator)
    }

    pub fn ptr(&self) -> &OwnedPtr {
        &self.ptr
    }

    pub fn ptr_mut(&mut self) -> &mut OwnedPtr {
        &mut self.ptr
    }

    /// Replaces the owning handle; the previous handle drops normally.
    pub fn set_ptr(&mut self, new_ptr: OwnedPtr) {
        self.ptr = new_ptr;
    }

    /// Throws away the current buffer and allocates `new_size_bytes` fresh.
    ///
    /// Contents are not preserved. Equal sizes are a no-op. Shared
    /// copy-on-write storage refuses to resize: the handle's deleter no
    /// longer matches the allocator, so callers must materialize first.
    pub fn resize(&mut self, new_size_bytes: usize) -> Result<()> {
        if new_size_bytes == self.size_bytes {
            return Ok(());
        }
        if self.is_cow() {
            return Err(Error::CowState(
                "cannot resize shared copy-on-write storage; materialize first".into(),
            ));
        }
        let new_ptr = if new_size_bytes > 0 {
            let data = self.allocator.allocate(new_size_bytes)?;
            allocator_owned_ptr(data, &self.allocator, self.device)
        } else {
            OwnedPtr::null(self.device)
        };
        self.ptr = new_ptr;
        self.size_bytes = new_size_bytes;
        Ok(())
    }

    /// Produces a sibling storage sharing this buffer; see [`cow::lazy_clone`].
    pub fn lazy_clone(&mut self) -> Result<Storage> {
        cow::lazy_clone(self)
    }

    /// Collapses copy-on-write sharing for this holder; see [`cow::materialize`].
    pub fn materialize(&mut self) -> Result<()> {
        cow::materialize(self)
    }

    /// True while the storage participates in copy-on-write sharing.
    pub fn is_cow(&self) -> bool {
        cow::is_cow(&self.ptr)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("data", &self.ptr.data())
            .field("size_bytes", &self.size_bytes)
            .field("device", &self.device)
            .field("is_cow", &self.is_cow())
            .finish()
    }
}

/// Wraps an allocator-owned buffer in a handle whose deleter routes the
/// payload back to the allocator that produced it.
pub(crate) fn allocator_owned_ptr(
    data: *mut u8,
    allocator: &Arc<dyn Allocator>,
    device: Device,
) -> OwnedPtr {
    let allocator = Arc::clone(allocator);
    let deleter: Deleter = Arc::new(move |p: &mut OwnedPtr| allocator.deallocate(p.data()));
    OwnedPtr::new(data, ptr::null_mut(), Some(deleter), device)
}
