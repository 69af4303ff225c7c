#![doc = include_str!("../README.md")]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod counter;
pub mod driver;
pub mod event;
pub mod ipc;
pub mod pool;
mod pool_cache;
pub mod sync;
pub mod timestamps;

pub use counter::{CounterBasedEventDesc, InOrderExecInfo};
pub use driver::{Context, DeviceHandle, DriverHandle, EventHandle, EventPoolHandle};
pub use event::{Event, EventDesc, EventScope, PrintfHandler};
pub use ipc::{IpcEventPoolHandle, IpcPoolDescriptor};
pub use pool::{EventPool, EventPoolDesc, EventPoolFlags, PoolGeometry};
pub use timestamps::KernelTimestampsExt;

/// Lock, recovering the data of a poisoned mutex.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
