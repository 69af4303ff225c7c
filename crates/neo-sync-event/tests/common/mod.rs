#![allow(dead_code)]

use std::sync::Arc;

use neo_sync_core::SyncConfig;
use neo_sync_core::memory::Allocation;
use neo_sync_event::{
    Context, DriverHandle, Event, EventDesc, EventPool, EventPoolDesc, EventPoolFlags, EventScope,
};
use neo_sync_sim::{SimPlatform, SimPlatformBuilder};

pub struct Harness {
    pub platform: SimPlatform,
    pub driver: Arc<DriverHandle>,
    pub context: Arc<Context>,
}

impl Harness {
    pub fn new(builder: SimPlatformBuilder) -> Self {
        Self::with_config(builder, SyncConfig::default())
    }

    pub fn with_config(builder: SimPlatformBuilder, config: SyncConfig) -> Self {
        let platform = builder.build().expect("build platform");
        let driver = DriverHandle::new(
            platform.root_devices().to_vec(),
            platform.memory_manager(),
            Arc::new(config),
        )
        .expect("create driver");
        let context = Context::new(&driver, &[]).expect("create context");
        Self {
            platform,
            driver,
            context,
        }
    }

    /// Pool over every device of the driver.
    pub fn pool(&self, count: u32, flags: EventPoolFlags) -> Arc<EventPool> {
        let handle = self
            .context
            .create_event_pool(&[], &EventPoolDesc { count, flags })
            .expect("create event pool");
        self.context.event_pool(handle).expect("resolve event pool")
    }

    pub fn event(&self, pool: &Arc<EventPool>, index: u32) -> Arc<Event> {
        pool.create_event(&host_desc(index)).expect("create event")
    }
}

pub fn host_desc(index: u32) -> EventDesc {
    EventDesc {
        index,
        signal_scope: EventScope::HOST,
        wait_scope: EventScope::HOST,
    }
}

pub fn host_visible() -> EventPoolFlags {
    EventPoolFlags::HOST_VISIBLE
}

pub fn timestamp_pool() -> EventPoolFlags {
    EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP
}

/// Byte offset of `event` inside `allocation`, recovered from its GPU address.
pub fn event_offset(event: &Event, allocation: &Allocation) -> usize {
    (event.gpu_address(event.device()) - allocation.gpu_address) as usize
}

/// Encode one 32-bit timestamp packet.
pub fn packet32(context_start: u32, global_start: u32, context_end: u32, global_end: u32) -> Vec<u8> {
    [context_start, global_start, context_end, global_end]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}
