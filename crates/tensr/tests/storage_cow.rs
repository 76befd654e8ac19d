use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tensr::storage::Deleter;
use tensr::{cow, Device, Error, OwnedPtr, Storage};

fn cpu() -> Device {
    Device::cpu()
}

fn new_storage(size_bytes: usize) -> Storage {
    Storage::new(size_bytes, cpu()).expect("cpu storage")
}

fn fill(storage: &Storage, value: u8) {
    unsafe { std::ptr::write_bytes(storage.data(), value, storage.size_bytes()) };
}

fn byte_at(storage: &Storage, index: usize) -> u8 {
    assert!(index < storage.size_bytes());
    unsafe { *storage.data().add(index) }
}

fn bytes_equal(a: &Storage, b: &Storage) -> bool {
    assert_eq!(a.size_bytes(), b.size_bytes());
    let lhs = unsafe { std::slice::from_raw_parts(a.data(), a.size_bytes()) };
    let rhs = unsafe { std::slice::from_raw_parts(b.data(), b.size_bytes()) };
    lhs == rhs
}

#[test]
fn explicit_materialize() {
    let mut original = new_storage(1000);
    fill(&original, 1);

    let mut clone = original.lazy_clone().expect("lazy clone");
    assert_eq!(byte_at(&clone, 0), 1);

    // Writes through a still-shared clone are visible everywhere.
    fill(&clone, 2);
    assert_eq!(byte_at(&original, 0), 2, "data not shared before materialization");

    clone.materialize().expect("materialize clone");
    fill(&clone, 3);

    assert_eq!(byte_at(&original, 0), 2, "original changed after materialization");
    assert_eq!(byte_at(&clone, 0), 3, "clone not updated after materialization");
}

#[test]
fn shared_modifications_three_way() {
    let mut original = new_storage(1000);
    fill(&original, 1);

    let clone1 = original.lazy_clone().expect("clone1");
    let mut clone2 = original.lazy_clone().expect("clone2");

    fill(&clone1, 2);
    assert_eq!(byte_at(&original, 0), 2);
    assert_eq!(byte_at(&clone2, 0), 2);

    clone2.materialize().expect("materialize clone2");
    fill(&clone2, 3);

    assert_eq!(byte_at(&clone2, 0), 3, "clone2 not independent after materialization");
    assert_eq!(byte_at(&original, 0), 2, "original lost data sharing");
    assert_eq!(byte_at(&clone1, 0), 2, "clone1 lost data sharing");
}

#[test]
fn refcount_drops_after_materialize() {
    let mut original = new_storage(1000);
    let mut clone1 = original.lazy_clone().expect("clone1");
    let _clone2 = original.lazy_clone().expect("clone2");

    let initial = cow::reference_count(&original).expect("shared context");
    assert_eq!(initial, 3);

    clone1.materialize().expect("materialize clone1");
    assert_eq!(cow::reference_count(&original), Some(initial - 1));
    assert!(!clone1.is_cow());
}

#[test]
fn data_identical_in_shared_state() {
    let mut original = new_storage(1000);
    for i in 0..original.size_bytes() {
        unsafe { *original.data().add(i) = (i % 256) as u8 };
    }

    let clone = original.lazy_clone().expect("clone");
    assert_eq!(clone.data(), original.data(), "shared storages alias one buffer");
    assert!(bytes_equal(&clone, &original));

    unsafe { *clone.data() = 0xFF };
    assert_eq!(byte_at(&original, 0), 0xFF, "modifications visible without materialization");
}

#[test]
fn clone_chain_with_middle_materialize() {
    let mut original = new_storage(1000);
    fill(&original, 1);
    let mut clone1 = original.lazy_clone().expect("clone1");
    let mut clone2 = clone1.lazy_clone().expect("clone2");
    let clone3 = clone2.lazy_clone().expect("clone3");

    assert_eq!(cow::reference_count(&original), Some(4));

    clone2.materialize().expect("materialize clone2");
    fill(&clone2, 2);

    assert_eq!(byte_at(&original, 0), byte_at(&clone1, 0));
    assert_eq!(byte_at(&original, 0), byte_at(&clone3, 0));
    assert_eq!(byte_at(&clone2, 0), 2);
    assert_eq!(cow::reference_count(&original), Some(3));
}

#[test]
fn scope_cleanup_restores_refcount() {
    let mut original = new_storage(1000);
    let _clone1 = original.lazy_clone().expect("clone1");

    let baseline = cow::reference_count(&original).expect("shared context");
    {
        let _clone2 = original.lazy_clone().expect("clone2");
        assert_eq!(cow::reference_count(&original), Some(baseline + 1));
    }
    assert_eq!(cow::reference_count(&original), Some(baseline));
}

#[test]
fn repeated_materialize_keeps_buffer() {
    let mut original = new_storage(1000);
    let mut clone = original.lazy_clone().expect("clone");

    clone.materialize().expect("first materialize");
    let first_data = clone.data();

    clone.materialize().expect("second materialize");
    assert_eq!(clone.data(), first_data, "redundant materialization copied data");
}

#[test]
fn materialize_without_sharing_is_noop() {
    let mut storage = new_storage(64);
    let data = storage.data();
    assert!(!storage.is_cow());
    storage.materialize().expect("materialize");
    assert_eq!(storage.data(), data);
    assert!(!storage.is_cow());
}

#[test]
fn clone_after_materialize_shares_again() {
    let mut original = new_storage(1000);
    let mut clone1 = original.lazy_clone().expect("clone1");

    clone1.materialize().expect("materialize clone1");
    assert!(!clone1.is_cow());

    let clone2 = clone1.lazy_clone().expect("clone2");
    assert!(clone1.is_cow() && clone2.is_cow());
    fill(&clone2, 2);
    assert_eq!(byte_at(&clone1, 0), 2, "materialized storage did not convert back");
}

#[test]
fn last_holder_materialize_takes_ownership() {
    let mut original = new_storage(256);
    fill(&original, 7);
    let data = original.data();

    {
        let _clone = original.lazy_clone().expect("clone");
    }
    // The clone is gone; this storage is the sole holder.
    assert!(original.is_cow());
    assert_eq!(cow::reference_count(&original), Some(1));

    original.materialize().expect("materialize");
    assert!(!original.is_cow());
    assert_eq!(original.data(), data, "sole holder should keep its buffer");
    assert_eq!(byte_at(&original, 0), 7);
}

#[test]
fn lazy_clone_of_empty_storage_fails() {
    let mut storage = Storage::uninit(cpu()).expect("uninit storage");
    match storage.lazy_clone() {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[test]
fn resize_rejected_while_shared() {
    let mut original = new_storage(128);
    let _clone = original.lazy_clone().expect("clone");

    match original.resize(256) {
        Err(Error::CowState(_)) => {}
        other => panic!("expected CowState, got {other:?}"),
    }
    assert_eq!(original.size_bytes(), 128);

    original.materialize().expect("materialize");
    original.resize(256).expect("resize after materialize");
    assert_eq!(original.size_bytes(), 256);
}

#[test]
fn resize_same_size_keeps_buffer() {
    let mut storage = new_storage(64);
    let data = storage.data();
    storage.resize(64).expect("resize");
    assert_eq!(storage.data(), data);
}

#[test]
fn resize_discards_contents() {
    let mut storage = new_storage(64);
    fill(&storage, 9);
    storage.resize(128).expect("grow");
    assert_eq!(storage.size_bytes(), 128);
    storage.resize(0).expect("shrink to empty");
    assert!(storage.data().is_null());
}

#[test]
fn external_buffer_is_shared_not_owned() {
    let mut backing = vec![5u8; 512];
    let mut wrapped =
        Storage::from_external(backing.as_mut_ptr(), backing.len(), cpu()).expect("wrap");

    {
        let clone = wrapped.lazy_clone().expect("clone");
        assert_eq!(byte_at(&clone, 0), 5);
        fill(&clone, 6);
    }
    drop(wrapped);

    // Every COW holder is gone; the caller still owns the buffer.
    assert_eq!(backing[0], 6);
    assert_eq!(backing[511], 6);
}

#[test]
fn external_null_buffer_rejected() {
    match Storage::from_external(std::ptr::null_mut(), 16, cpu()) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[test]
fn copy_cow_ptr_requires_cow_handle() {
    let storage = new_storage(32);
    match cow::copy_cow_ptr(storage.ptr()) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[test]
fn reference_count_is_none_without_sharing() {
    let storage = new_storage(32);
    assert_eq!(cow::reference_count(&storage), None);
}

#[test]
fn owned_ptr_deleter_runs_exactly_once() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let deleter: Deleter = Arc::new(move |_: &mut OwnedPtr| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut backing = vec![1u8; 8];
    let ptr = OwnedPtr::new(backing.as_mut_ptr(), std::ptr::null_mut(), Some(deleter), cpu());
    assert!(!ptr.is_null());
    drop(ptr);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn owned_ptr_move_context_disarms_deleter() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let deleter: Deleter = Arc::new(move |_: &mut OwnedPtr| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut backing = vec![1u8; 8];
    let mut ptr =
        OwnedPtr::new(backing.as_mut_ptr(), std::ptr::null_mut(), Some(deleter), cpu());
    let (ctx, taken) = ptr.move_context();
    assert!(ctx.is_null());
    assert!(taken.is_some());
    drop(ptr);
    assert_eq!(invocations.load(Ordering::SeqCst), 0, "disarmed handle must not delete");
}

#[test]
fn null_owned_ptr_drop_is_noop() {
    let ptr = OwnedPtr::null(cpu());
    assert!(ptr.is_null());
    drop(ptr);
}

#[test]
fn shared_teardown_across_threads() {
    let mut original = new_storage(4096);
    fill(&original, 0xAB);

    let mut handles = Vec::new();
    for i in 0..8 {
        let mut clone = original.lazy_clone().expect("clone");
        handles.push(std::thread::spawn(move || {
            if i % 2 == 0 {
                clone.materialize().expect("materialize in thread");
                fill(&clone, i as u8);
                assert_eq!(byte_at(&clone, 0), i as u8);
            }
            // Odd clones just drop while still shared.
        }));
    }
    for handle in handles {
        handle.join().expect("worker");
    }

    // Only the original's share remains.
    assert_eq!(cow::reference_count(&original), Some(1));
    assert_eq!(byte_at(&original, 0), 0xAB);

    original.materialize().expect("final materialize");
    assert!(!original.is_cow());
    assert_eq!(byte_at(&original, 0), 0xAB);
}
