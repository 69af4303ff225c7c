//! Builder for a simulated multi-device platform.

use std::collections::HashMap;
use std::sync::Arc;

use neo_sync_core::Result;
use neo_sync_core::csr::{CommandStreamReceiver, CsrBackend};
use neo_sync_core::device::{Device, DeviceCaps, DeviceClock};
use neo_sync_core::memory::MemoryManager;
use neo_sync_core::types::DeviceId;
use tracing::debug;

use crate::clock::SimClock;
use crate::csr::{SimCsr, SimDeviceMemory};
use crate::memory::SimMemoryManager;

pub struct SimPlatformBuilder {
    root_devices: u32,
    sub_devices: u32,
    engines_per_device: u32,
    backend: CsrBackend,
    caps: DeviceCaps,
    budgets: HashMap<u32, usize>,
    manual_clock_start_ns: Option<u64>,
    gpu_offset_ticks: u64,
    memory: Option<Arc<SimMemoryManager>>,
}

impl Default for SimPlatformBuilder {
    fn default() -> Self {
        Self {
            root_devices: 1,
            sub_devices: 0,
            engines_per_device: 1,
            backend: CsrBackend::Hardware,
            caps: DeviceCaps::default(),
            budgets: HashMap::new(),
            manual_clock_start_ns: None,
            gpu_offset_ticks: 0,
            memory: None,
        }
    }
}

impl SimPlatformBuilder {
    pub fn root_devices(mut self, count: u32) -> Self {
        self.root_devices = count.max(1);
        self
    }

    /// Tiles per root device. Zero means no sub-devices.
    pub fn sub_devices(mut self, count: u32) -> Self {
        self.sub_devices = count;
        self
    }

    pub fn engines_per_device(mut self, count: u32) -> Self {
        self.engines_per_device = count.max(1);
        self
    }

    pub fn backend(mut self, backend: CsrBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn memory_budget(mut self, root_device_index: u32, bytes: usize) -> Self {
        self.budgets.insert(root_device_index, bytes);
        self
    }

    /// Use deterministic clocks starting at `start_ns`.
    pub fn manual_clock(mut self, start_ns: u64) -> Self {
        self.manual_clock_start_ns = Some(start_ns);
        self
    }

    pub fn gpu_clock_offset(mut self, ticks: u64) -> Self {
        self.gpu_offset_ticks = ticks;
        self
    }

    /// Share an existing memory manager, e.g. to model a second process
    /// importing IPC handles.
    pub fn shared_memory(mut self, memory: Arc<SimMemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn build(self) -> Result<SimPlatform> {
        let memory = self
            .memory
            .clone()
            .unwrap_or_else(|| Arc::new(SimMemoryManager::with_budgets(self.budgets.clone())));
        let device_memory = SimDeviceMemory::new();
        let mut csrs = Vec::new();
        let mut clocks = Vec::new();
        let mut devices = Vec::new();

        for root in 0..self.root_devices {
            let clock = Arc::new(self.make_clock());
            let mut subs = Vec::new();
            for tile in 0..self.sub_devices {
                let id = DeviceId::sub(root, tile);
                let caps = DeviceCaps {
                    implicit_scaling: false,
                    ..self.caps.clone()
                };
                let engines = self.make_engines(id, &device_memory, &mut csrs);
                subs.push(Arc::new(Device::new(
                    id,
                    caps,
                    engines,
                    clock.clone() as Arc<dyn DeviceClock>,
                )?));
            }
            let id = DeviceId::root(root);
            let engines = self.make_engines(id, &device_memory, &mut csrs);
            let device = Device::new(
                id,
                self.caps.clone(),
                engines,
                clock.clone() as Arc<dyn DeviceClock>,
            )?
            .with_sub_devices(subs);
            devices.push(Arc::new(device));
            clocks.push(clock);
        }

        debug!(
            roots = self.root_devices,
            tiles = self.sub_devices,
            backend = self.backend.as_str(),
            receivers = csrs.len(),
            "Built simulated platform"
        );
        Ok(SimPlatform {
            memory,
            device_memory,
            devices,
            csrs,
            clocks,
        })
    }

    fn make_clock(&self) -> SimClock {
        let clock = match self.manual_clock_start_ns {
            Some(start) => SimClock::manual(
                start,
                self.caps.timer_resolution_ns,
                self.caps.kernel_timestamp_valid_bits,
            ),
            None => SimClock::real_time(
                self.caps.timer_resolution_ns,
                self.caps.kernel_timestamp_valid_bits,
            ),
        };
        clock.with_gpu_offset(self.gpu_offset_ticks)
    }

    fn make_engines(
        &self,
        owner: DeviceId,
        device_memory: &Arc<SimDeviceMemory>,
        csrs: &mut Vec<Arc<SimCsr>>,
    ) -> Vec<Arc<dyn CommandStreamReceiver>> {
        (0..self.engines_per_device)
            .map(|_| {
                let csr = SimCsr::new(csrs.len() as u32, owner, self.backend, device_memory.clone());
                csrs.push(csr.clone());
                csr as Arc<dyn CommandStreamReceiver>
            })
            .collect()
    }
}

/// Devices, receivers and allocator of one simulated platform.
pub struct SimPlatform {
    pub memory: Arc<SimMemoryManager>,
    pub device_memory: Arc<SimDeviceMemory>,
    devices: Vec<Arc<Device>>,
    csrs: Vec<Arc<SimCsr>>,
    clocks: Vec<Arc<SimClock>>,
}

impl SimPlatform {
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder::default()
    }

    /// Root devices, sub-devices reachable through `Device::sub_devices`.
    pub fn root_devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn memory_manager(&self) -> Arc<dyn MemoryManager> {
        self.memory.clone()
    }

    pub fn csrs(&self) -> &[Arc<SimCsr>] {
        &self.csrs
    }

    /// Engine `engine` of device `owner`.
    pub fn csr(&self, owner: DeviceId, engine: usize) -> Option<Arc<SimCsr>> {
        self.csrs
            .iter()
            .filter(|csr| csr.owner() == owner)
            .nth(engine)
            .cloned()
    }

    pub fn clock(&self, root_device_index: u32) -> Option<&Arc<SimClock>> {
        self.clocks.get(root_device_index as usize)
    }
}
