//! Copy-on-write sharing for [`Storage`] buffers.
//!
//! `lazy_clone` converts a storage's single-owner handle into a shared one:
//! the handle's original context and deleter are captured inside a
//! heap-allocated [`CowContext`], and every sibling handle points at the same
//! payload and the same context. The context's refcount equals the number of
//! live COW-tagged handles; the holder that drives it to zero runs the
//! captured original deleter exactly once and destroys the context.
//!
//! `materialize` breaks a holder out of the sharing relationship, either by
//! unwrapping the context in place (sole holder) or by copying the bytes
//! into a private allocator-owned buffer (still shared).
//!
//! Locking discipline: increments are relaxed and decrements acq-rel, so the
//! final decrement observes every prior holder's release. A holder whose
//! handle is still live keeps the refcount above zero, which is what makes
//! reading through the context safe without a lock; the reader-writer lock
//! serializes the terminal state transition against refcount observers and
//! the byte-copy window of a still-shared materialization. A handle that has
//! already given up its count never touches the context again.

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};

use super::owned_ptr::{Deleter, OwnedPtr};
use super::{allocator_owned_ptr, Storage};

const STATE_ACTIVE: u8 = 0;
const STATE_PENDING_DELETE: u8 = 1;
const STATE_DELETED: u8 = 2;

/// Reference-counted record shared by every COW-tagged handle of one buffer.
///
/// Owns the captured original context and deleter of the handle that was
/// first lazily cloned; the payload is owned collectively through it.
pub struct CowContext {
    original_ctx: *mut u8,
    original_deleter: Option<Deleter>,
    refcount: AtomicI64,
    state: AtomicU8,
    lock: RwLock<()>,
}

// The raw context pointer is only ever handed back to the captured deleter;
// the bookkeeping itself is atomics plus a lock.
unsafe impl Send for CowContext {}
unsafe impl Sync for CowContext {}

impl CowContext {
    fn new(original_ctx: *mut u8, original_deleter: Option<Deleter>) -> Self {
        CowContext {
            original_ctx,
            original_deleter,
            refcount: AtomicI64::new(0),
            state: AtomicU8::new(STATE_ACTIVE),
            lock: RwLock::new(()),
        }
    }

    /// Current number of live handles sharing this context.
    pub fn reference_count(&self) -> i64 {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.refcount.load(Ordering::Acquire)
    }

    /// True until the terminal teardown transition has begun.
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ACTIVE
    }

    pub fn original_ctx(&self) -> *mut u8 {
        self.original_ctx
    }

    pub(crate) fn original_deleter(&self) -> Option<Deleter> {
        self.original_deleter.clone()
    }

    fn increment_refcount(&self, count: i64) {
        self.refcount.fetch_add(count, Ordering::Relaxed);
    }

    /// Gives up one holder's share and returns the remaining count.
    ///
    /// The transition to zero happens under the write lock so that no
    /// refcount observer or in-flight byte copy can straddle the teardown.
    fn decrement_refcount(&self) -> i64 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "copy-on-write refcount underflow");
        if prev == 1 {
            let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
            self.state.store(STATE_PENDING_DELETE, Ordering::Release);
        }
        prev - 1
    }
}

impl Drop for CowContext {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.refcount.load(Ordering::Relaxed),
            0,
            "copy-on-write context destroyed with live holders"
        );
        self.state.store(STATE_DELETED, Ordering::Release);
    }
}

/// Deleter installed on every COW-tagged handle.
///
/// Decrements the shared context; the holder that reaches zero runs the
/// captured original deleter once against a synthesized plain handle and
/// then destroys the context. A malformed handle is a no-op.
fn cow_deleter(ptr: &mut OwnedPtr) {
    let ctx_raw = ptr.context() as *mut CowContext;
    if ctx_raw.is_null() {
        debug_assert!(ptr.data().is_null(), "cow handle dropped without a context");
        return;
    }
    let remaining = unsafe { (*ctx_raw).decrement_refcount() };
    if remaining > 0 {
        return;
    }
    let context = unsafe { Box::from_raw(ctx_raw) };
    if let Some(original_deleter) = context.original_deleter() {
        let plain = OwnedPtr::new(
            ptr.data(),
            context.original_ctx(),
            Some(original_deleter),
            ptr.device(),
        );
        drop(plain);
    }
}

/// Stable per-process identity of the COW deleter.
fn cow_deleter_identity() -> usize {
    cow_deleter as fn(&mut OwnedPtr) as usize
}

fn cow_deleter_fn() -> Deleter {
    Arc::new(cow_deleter)
}

/// True iff `ptr` carries the COW deleter.
pub fn is_cow(ptr: &OwnedPtr) -> bool {
    ptr.deleter_id() != OwnedPtr::NO_DELETER_ID && ptr.deleter_id() == cow_deleter_identity()
}

/// Borrows the context behind a COW-tagged handle.
fn context_of(ptr: &OwnedPtr) -> Result<&CowContext> {
    let raw = ptr.context() as *const CowContext;
    if raw.is_null() {
        return Err(Error::CowState(
            "copy-on-write handle carries no context".into(),
        ));
    }
    Ok(unsafe { &*raw })
}

/// Builds a sibling handle sharing `src`'s payload through `ctx`.
///
/// Increments the context. Fails when the context has already begun
/// teardown.
pub fn make_cow_ptr(src: &OwnedPtr, ctx: &CowContext) -> Result<OwnedPtr> {
    if !ctx.is_active() {
        return Err(Error::CowState(
            "cannot share through an inactive copy-on-write context".into(),
        ));
    }
    ctx.increment_refcount(1);
    Ok(OwnedPtr::with_deleter_id(
        src.data(),
        ctx as *const CowContext as *mut u8,
        Some(cow_deleter_fn()),
        src.device(),
        cow_deleter_identity(),
    ))
}

/// Duplicates an already COW-tagged handle, incrementing its context.
pub fn copy_cow_ptr(src: &OwnedPtr) -> Result<OwnedPtr> {
    if !is_cow(src) {
        return Err(Error::InvalidArgument(
            "copy_cow_ptr requires a copy-on-write handle".into(),
        ));
    }
    make_cow_ptr(src, context_of(src)?)
}

/// Observes the refcount of a storage's context, if it has one.
pub fn reference_count(storage: &Storage) -> Option<i64> {
    if !is_cow(storage.ptr()) {
        return None;
    }
    context_of(storage.ptr()).ok().map(CowContext::reference_count)
}

/// Produces a storage sharing `storage`'s buffer, deferring the copy.
///
/// A non-COW source is rewritten in place: its handle's context and deleter
/// move into a fresh [`CowContext`] with a count of two (source plus clone),
/// and both handles are retagged with the COW deleter. An already-shared
/// source simply gains one more holder.
pub fn lazy_clone(storage: &mut Storage) -> Result<Storage> {
    if storage.ptr().is_null() || storage.size_bytes() == 0 {
        return Err(Error::InvalidArgument(
            "cannot lazily clone a storage without a buffer".into(),
        ));
    }
    let device = storage.device();
    let size_bytes = storage.size_bytes();
    let allocator = storage.allocator();

    let new_ptr = if !is_cow(storage.ptr()) {
        let data = storage.ptr().data();
        let (original_ctx, original_deleter) = storage.ptr_mut().move_context();
        let context = Box::new(CowContext::new(original_ctx, original_deleter));
        context.increment_refcount(2);
        let ctx_raw = Box::into_raw(context);

        let handle = storage.ptr_mut();
        handle.set_context(ctx_raw as *mut u8);
        handle.set_deleter(Some(cow_deleter_fn()));
        handle.set_deleter_id(cow_deleter_identity());

        OwnedPtr::with_deleter_id(
            data,
            ctx_raw as *mut u8,
            Some(cow_deleter_fn()),
            device,
            cow_deleter_identity(),
        )
    } else {
        copy_cow_ptr(storage.ptr())?
    };

    Ok(Storage::from_parts(new_ptr, size_bytes, device, allocator))
}

/// Breaks `storage` out of copy-on-write sharing.
///
/// No-op on a non-COW storage (the buffer pointer is preserved bitwise).
/// The sole holder unwraps the context in place and keeps its buffer; a
/// still-shared holder copies the bytes into a private allocator-owned
/// buffer and lets its old handle's drop perform the single decrement it
/// owes. On allocation failure the storage is left untouched.
pub fn materialize(storage: &mut Storage) -> Result<()> {
    if !is_cow(storage.ptr()) {
        return Ok(());
    }
    let ctx_raw = storage.ptr().context() as *mut CowContext;
    if ctx_raw.is_null() {
        return Err(Error::CowState(
            "copy-on-write handle carries no context".into(),
        ));
    }
    let device = storage.device();
    let data = storage.ptr().data();

    // Our live handle keeps the count above zero, so the context cannot be
    // torn down underneath us in either branch.
    let ctx = unsafe { &*ctx_raw };
    if ctx.reference_count() == 1 {
        // Sole holder: take back ownership without touching the bytes.
        let remaining = ctx.decrement_refcount();
        debug_assert_eq!(remaining, 0, "sole holder raced an impossible sharer");
        let original_ctx = ctx.original_ctx();
        let original_deleter: Deleter = ctx
            .original_deleter()
            .unwrap_or_else(|| Arc::new(|_: &mut OwnedPtr| {}));
        // The old handle already paid its decrement; disarm it before the
        // replacement drops it.
        storage.ptr_mut().move_context();
        storage.set_ptr(OwnedPtr::new(
            data,
            original_ctx,
            Some(original_deleter),
            device,
        ));
        drop(unsafe { Box::from_raw(ctx_raw) });
        return Ok(());
    }

    // Still shared: snapshot the bytes under the read lock, then hand our
    // share back by dropping the old handle.
    let allocator = storage.allocator();
    let size_bytes = storage.size_bytes();
    let new_data = {
        let _guard = ctx.lock.read().unwrap_or_else(PoisonError::into_inner);
        let new_data = allocator.allocate(size_bytes)?;
        unsafe { ptr::copy_nonoverlapping(data as *const u8, new_data, size_bytes) };
        new_data
    };
    storage.set_ptr(allocator_owned_ptr(new_data, &allocator, device));
    Ok(())
}
