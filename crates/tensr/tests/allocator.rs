//! Allocation accounting lives in its own binary, as a single test, so
//! nothing else touches the process-wide CPU allocator while the counters
//! are being asserted.

use tensr::{allocator_for, cpu_allocator, Allocator, Device, Storage};

#[test]
fn live_allocation_accounting() {
    let allocator = cpu_allocator();
    let baseline = allocator.live_allocations();

    // Raw allocate/deallocate round trip.
    let ptr = allocator.allocate(4096).expect("allocate");
    assert!(!ptr.is_null());
    assert_eq!(allocator.live_allocations(), baseline + 1);
    allocator.deallocate(ptr);
    assert_eq!(allocator.live_allocations(), baseline);

    // Null release is a no-op.
    allocator.deallocate(std::ptr::null_mut());
    assert_eq!(allocator.live_allocations(), baseline);

    // Storage sharing allocates only when ownership actually diverges.
    {
        let mut original = Storage::new(1024, Device::cpu()).expect("storage");
        assert_eq!(allocator.live_allocations(), baseline + 1);

        let mut clone = original.lazy_clone().expect("clone");
        assert_eq!(allocator.live_allocations(), baseline + 1);

        clone.materialize().expect("materialize");
        assert_eq!(allocator.live_allocations(), baseline + 2);

        original.materialize().expect("sole-holder materialize");
        assert_eq!(allocator.live_allocations(), baseline + 2);
    }
    assert_eq!(allocator.live_allocations(), baseline);

    // The factory hands out the same process-wide CPU allocator.
    let a = allocator_for(Device::cpu()).expect("cpu allocator");
    assert!(a.device().is_cpu());
}
