//! Small shared value types.

use std::fmt;

use serde::Serialize;

/// GPU virtual address.
pub type GpuAddress = u64;

/// Monotonic submission counter of a command-stream receiver.
pub type TaskCount = u64;

/// Identity of a root device or one of its sub-devices (tiles).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceId {
    pub root_device_index: u32,
    pub sub_device_index: Option<u32>,
}

impl DeviceId {
    pub const fn root(root_device_index: u32) -> Self {
        Self {
            root_device_index,
            sub_device_index: None,
        }
    }

    pub const fn sub(root_device_index: u32, sub_device_index: u32) -> Self {
        Self {
            root_device_index,
            sub_device_index: Some(sub_device_index),
        }
    }

    #[inline]
    pub fn is_sub_device(&self) -> bool {
        self.sub_device_index.is_some()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_device_index {
            Some(sub) => write!(f, "{}.{}", self.root_device_index, sub),
            None => write!(f, "{}", self.root_device_index),
        }
    }
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
