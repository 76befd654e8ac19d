//! Device tags identifying where a buffer lives.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Kind of device backing a buffer.
///
/// `Invalid` is the sentinel carried by default-constructed devices; it never
/// names real memory and is rejected by the allocator factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Cuda,
    Invalid,
}

/// Returns the lowercase display name for a device type.
pub fn device_type_name(device_type: DeviceType) -> &'static str {
    match device_type {
        DeviceType::Cpu => "cpu",
        DeviceType::Cuda => "cuda",
        DeviceType::Invalid => "invalid",
    }
}

/// Reports whether the device type names a real backend.
pub fn is_valid_device_type(device_type: DeviceType) -> bool {
    matches!(device_type, DeviceType::Cpu | DeviceType::Cuda)
}

/// A (type, index) pair locating a buffer. Index `-1` means "unspecified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    device_type: DeviceType,
    index: i32,
}

impl Device {
    /// Builds a device, validating the (type, index) combination.
    ///
    /// CPU devices accept only index `-1` or `0`; CUDA devices accept `-1`
    /// (unspecified) or any non-negative ordinal.
    pub fn new(device_type: DeviceType, index: i32) -> Result<Self> {
        if !is_valid_device_type(device_type) {
            return Err(Error::InvalidDevice(format!(
                "device type {} cannot be constructed",
                device_type_name(device_type)
            )));
        }
        if device_type == DeviceType::Cpu && index != -1 && index != 0 {
            return Err(Error::InvalidDevice(format!(
                "cpu device index must be -1 or 0, got {index}"
            )));
        }
        if index < -1 {
            return Err(Error::InvalidDevice(format!(
                "device index must be -1 or non-negative, got {index}"
            )));
        }
        Ok(Device { device_type, index })
    }

    /// The process-local CPU device with an unspecified index.
    pub fn cpu() -> Self {
        Device {
            device_type: DeviceType::Cpu,
            index: -1,
        }
    }

    /// A CUDA device pinned to the given ordinal.
    pub fn cuda(index: i32) -> Result<Self> {
        Device::new(DeviceType::Cuda, index)
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    /// True when the device carries an explicit ordinal.
    pub fn has_index(&self) -> bool {
        self.index != -1
    }

    pub fn is_cpu(&self) -> bool {
        self.device_type == DeviceType::Cpu
    }

    pub fn is_cuda(&self) -> bool {
        self.device_type == DeviceType::Cuda
    }
}

impl Default for Device {
    fn default() -> Self {
        Device {
            device_type: DeviceType::Invalid,
            index: -1,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", device_type_name(self.device_type))?;
        if self.has_index() {
            write!(f, ":{}", self.index)?;
        }
        Ok(())
    }
}

impl FromStr for Device {
    type Err = Error;

    /// Parses `cpu`, `cuda`, or either with an explicit `:N` ordinal.
    fn from_str(s: &str) -> Result<Self> {
        let (name, ordinal) = match s.split_once(':') {
            Some((name, ordinal)) => (name, Some(ordinal)),
            None => (s, None),
        };
        let device_type = match name {
            "cpu" => DeviceType::Cpu,
            "cuda" => DeviceType::Cuda,
            _ => return Err(Error::InvalidDevice(format!("unrecognized device {s:?}"))),
        };
        let index = match ordinal {
            None if device_type == DeviceType::Cpu => 0,
            None => -1,
            Some(ordinal) => {
                let index = ordinal
                    .parse::<i32>()
                    .map_err(|_| Error::InvalidDevice(format!("bad device ordinal in {s:?}")))?;
                if index < 0 {
                    return Err(Error::InvalidDevice(format!(
                        "device ordinal must be non-negative in {s:?}"
                    )));
                }
                index
            }
        };
        Device::new(device_type, index)
    }
}
