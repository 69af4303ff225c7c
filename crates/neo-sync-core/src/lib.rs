#![doc = include_str!("../README.md")]

pub mod config;
pub mod csr;
pub mod device;
pub mod error;
pub mod handle;
pub mod memory;
pub mod types;

pub use config::SyncConfig;
pub use error::{ErrorKind, Result, SyncError};
