#![doc = include_str!("../README.md")]

pub mod clock;
pub mod csr;
pub mod memory;
pub mod platform;

pub use clock::SimClock;
pub use csr::{SimCsr, SimDeviceMemory};
pub use memory::SimMemoryManager;
pub use platform::{SimPlatform, SimPlatformBuilder};
