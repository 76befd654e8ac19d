pub mod allocator;
pub mod device;
pub mod error;
pub mod scalar;
pub mod storage;
pub mod tensor;

pub use allocator::{allocator_for, cpu_allocator, Allocator, CpuAllocator};
pub use device::{Device, DeviceType};
pub use error::{Error, Result};
pub use scalar::{Scalar, ScalarType};
pub use storage::cow;
pub use storage::{OwnedPtr, Storage};
pub use tensor::{Shape, Tensor};
