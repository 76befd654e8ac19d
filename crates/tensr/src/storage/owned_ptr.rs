//! Move-only owning handle for raw device buffers.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use crate::device::Device;

/// Callable invoked exactly once when an [`OwnedPtr`] drops.
///
/// The deleter receives the enclosing handle so it can decide whether `data`
/// or `ctx` is the owning address.
pub type Deleter = Arc<dyn Fn(&mut OwnedPtr) + Send + Sync>;

/// Single-owner RAII handle around a raw buffer address.
///
/// Carries the payload address, an opaque context for the deleter (which may
/// be null, equal to `data`, or point at a wrapper such as a COW context),
/// the deleter itself, the device the payload lives on, and an integer
/// deleter identity used to recognize specially-tagged deleters.
///
/// Invariant: a non-null `data` always has a deleter; dropping the handle
/// runs the deleter exactly once and then clears every field.
pub struct OwnedPtr {
    data: *mut u8,
    ctx: *mut u8,
    deleter: Option<Deleter>,
    device: Device,
    deleter_id: usize,
}

// The handle owns its pointers exclusively; moving it between threads moves
// the single owner. Shared access from several threads is not allowed, so
// only `Send` is implemented.
unsafe impl Send for OwnedPtr {}

impl OwnedPtr {
    /// Identity value meaning "no tagged deleter".
    pub const NO_DELETER_ID: usize = 0;

    /// An empty handle owning nothing on `device`.
    pub fn null(device: Device) -> Self {
        OwnedPtr {
            data: ptr::null_mut(),
            ctx: ptr::null_mut(),
            deleter: None,
            device,
            deleter_id: Self::NO_DELETER_ID,
        }
    }

    /// Builds a handle over `data` with an untagged deleter.
    pub fn new(data: *mut u8, ctx: *mut u8, deleter: Option<Deleter>, device: Device) -> Self {
        Self::with_deleter_id(data, ctx, deleter, device, Self::NO_DELETER_ID)
    }

    /// Builds a handle whose deleter carries an explicit identity tag.
    pub fn with_deleter_id(
        data: *mut u8,
        ctx: *mut u8,
        deleter: Option<Deleter>,
        device: Device,
        deleter_id: usize,
    ) -> Self {
        debug_assert!(
            data.is_null() || deleter.is_some(),
            "an owning handle over a live buffer requires a deleter"
        );
        OwnedPtr {
            data,
            ctx,
            deleter,
            device,
            deleter_id,
        }
    }

    pub fn data(&self) -> *mut u8 {
        self.data
    }

    pub fn context(&self) -> *mut u8 {
        self.ctx
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn deleter(&self) -> Option<&Deleter> {
        self.deleter.as_ref()
    }

    pub fn deleter_id(&self) -> usize {
        self.deleter_id
    }

    /// True when the handle owns no payload.
    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    pub fn set_context(&mut self, ctx: *mut u8) {
        self.ctx = ctx;
    }

    pub fn set_deleter(&mut self, deleter: Option<Deleter>) {
        self.deleter = deleter;
    }

    pub fn set_deleter_id(&mut self, deleter_id: usize) {
        self.deleter_id = deleter_id;
    }

    /// Detaches and returns `ctx` without running the deleter.
    ///
    /// The caller assumes ownership of whatever the context referenced; the
    /// deleter stays in place and will still run against `data` on drop.
    pub fn release_context(&mut self) -> *mut u8 {
        std::mem::replace(&mut self.ctx, ptr::null_mut())
    }

    /// Detaches `ctx` together with the deleter.
    ///
    /// Used when the context is being reparented under a new deleter: the
    /// handle keeps its `data` address but no longer owns anything.
    pub fn move_context(&mut self) -> (*mut u8, Option<Deleter>) {
        self.deleter_id = Self::NO_DELETER_ID;
        (
            std::mem::replace(&mut self.ctx, ptr::null_mut()),
            self.deleter.take(),
        )
    }
}

impl Drop for OwnedPtr {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            if !self.data.is_null() {
                deleter(self);
            }
        }
        self.data = ptr::null_mut();
        self.ctx = ptr::null_mut();
        self.deleter_id = Self::NO_DELETER_ID;
    }
}

impl fmt::Debug for OwnedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedPtr")
            .field("data", &self.data)
            .field("ctx", &self.ctx)
            .field("device", &self.device)
            .field("deleter_id", &self.deleter_id)
            .field("has_deleter", &self.deleter.is_some())
            .finish()
    }
}
