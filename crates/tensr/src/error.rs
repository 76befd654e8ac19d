//! Failure kinds surfaced by the storage core.

use thiserror::Error;

use crate::device::Device;

/// Errors raised by devices, allocators, storages, and the COW protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// The allocator could not produce a buffer of the requested size.
    #[error("allocation of {size_bytes} bytes failed on {device}")]
    AllocationFailure { size_bytes: usize, device: Device },

    /// No allocator exists for the requested device.
    #[error("no allocator available for device {0}")]
    UnsupportedDevice(Device),

    /// The device string or (type, index) combination is not valid.
    #[error("invalid device: {0}")]
    InvalidDevice(String),

    /// A caller-supplied argument violated an operation's contract.
    #[error("{0}")]
    InvalidArgument(String),

    /// A copy-on-write context was observed outside its active lifecycle.
    #[error("copy-on-write state violation: {0}")]
    CowState(String),
}

pub type Result<T> = std::result::Result<T, Error>;
