mod common;

use std::sync::Arc;

use common::{Harness, host_visible, timestamp_pool};
use neo_sync_core::device::DeviceCaps;
use neo_sync_core::{ErrorKind, SyncConfig, SyncError};
use neo_sync_event::{EventPoolFlags, IpcEventPoolHandle, IpcPoolDescriptor};
use neo_sync_sim::{SimMemoryManager, SimPlatform, SimPlatformBuilder};

fn ipc_flags() -> EventPoolFlags {
    timestamp_pool() | EventPoolFlags::IPC
}

/// A second "process" importing through the exporter's memory manager.
fn importer(memory: &Arc<SimMemoryManager>, builder: SimPlatformBuilder) -> Harness {
    Harness::new(builder.shared_memory(memory.clone()))
}

#[test]
fn imported_pool_matches_exporter_and_keeps_signaled_state() {
    let exporter = Harness::new(SimPlatform::builder());
    let pool = exporter.pool(4, ipc_flags());
    let signaled = exporter.event(&pool, 2);
    signaled.host_signal(false).expect("host signal");
    let handle = pool.ipc_handle().expect("export");

    let importer = importer(&exporter.platform.memory, SimPlatform::builder());
    let pool_handle = importer
        .context
        .open_ipc_event_pool(&handle)
        .expect("import");
    let imported = importer.context.event_pool(pool_handle).expect("resolve");

    assert!(imported.is_imported_ipc_pool());
    assert!(!pool.is_imported_ipc_pool());
    assert_eq!(imported.event_size(), pool.event_size());
    assert_eq!(imported.num_events(), pool.num_events());
    assert_eq!(imported.flags().is_timestamp(), pool.flags().is_timestamp());
    assert_eq!(
        imported.flags().contains(EventPoolFlags::HOST_VISIBLE),
        pool.flags().contains(EventPoolFlags::HOST_VISIBLE)
    );

    let same_slot = importer.event(&imported, 2);
    same_slot.query_status().expect("exporter's signal is preserved");
}

#[test]
fn packet_geometry_mismatch_is_rejected_with_both_values() {
    let exporter = Harness::new(SimPlatform::builder());
    let pool = exporter.pool(2, ipc_flags());
    let handle = pool.ipc_handle().expect("export");

    let caps = DeviceCaps {
        max_event_packets: 32,
        ..DeviceCaps::default()
    };
    let importer = importer(&exporter.platform.memory, SimPlatform::builder().caps(caps));
    let err = importer
        .context
        .open_ipc_event_pool(&handle)
        .expect_err("16 vs 32 packets");
    assert!(
        matches!(err, SyncError::IpcPacketMismatch { descriptor: 16, local: 32 }),
        "{err}"
    );
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let message = err.to_string();
    assert!(message.contains("16") && message.contains("32"), "{message}");
    assert_eq!(importer.driver.ipc_import_refcount(decode(&handle).handle), 0);
}

#[test]
fn event_size_mismatch_is_rejected() {
    let exporter = Harness::new(SimPlatform::builder());
    let pool = exporter.pool(2, ipc_flags());
    let handle = pool.ipc_handle().expect("export");

    let caps = DeviceCaps {
        event_alignment: 512,
        ..DeviceCaps::default()
    };
    let importer = importer(&exporter.platform.memory, SimPlatform::builder().caps(caps));
    let err = importer
        .context
        .open_ipc_event_pool(&handle)
        .expect_err("256 vs 512 bytes");
    assert!(
        matches!(err, SyncError::IpcEventSizeMismatch { descriptor: 256, local: 512 }),
        "{err}"
    );
}

fn decode(handle: &IpcEventPoolHandle) -> IpcPoolDescriptor {
    IpcPoolDescriptor::decode(handle).expect("valid descriptor")
}

#[test]
fn descriptor_carries_pool_geometry() {
    let exporter = Harness::new(SimPlatform::builder());
    let pool = exporter.pool(3, host_visible() | EventPoolFlags::IPC);
    let descriptor = decode(&pool.ipc_handle().expect("export"));

    assert_eq!(descriptor.num_events, 3);
    assert_eq!(descriptor.event_size, 256);
    assert_eq!(descriptor.max_event_packets, 16);
    assert_eq!(descriptor.num_devices, 1);
    assert_eq!(descriptor.root_device_index, 0);
    assert!(descriptor.host_visible);
    assert!(!descriptor.device_pool);
    assert!(!descriptor.timestamp);
    assert!(!descriptor.implicit_scaling);

    let again = decode(&pool.ipc_handle().expect("export twice"));
    assert_eq!(again.handle, descriptor.handle);
}

#[test]
fn repeated_imports_share_one_refcounted_allocation() {
    let exporter = Harness::new(SimPlatform::builder());
    let pool = exporter.pool(2, ipc_flags());
    let handle = pool.ipc_handle().expect("export");
    let shareable = decode(&handle).handle;

    let importer = importer(&exporter.platform.memory, SimPlatform::builder());
    let first = importer
        .context
        .event_pool(importer.context.open_ipc_event_pool(&handle).expect("import 1"))
        .expect("resolve");
    let second = importer
        .context
        .event_pool(importer.context.open_ipc_event_pool(&handle).expect("import 2"))
        .expect("resolve");
    let imported = first.allocation_for(0).expect("imported");
    assert_eq!(imported.id, second.allocation_for(0).expect("imported").id);
    assert_eq!(importer.driver.ipc_import_refcount(shareable), 2);

    first.close_ipc_handle().expect("close first");
    first.close_ipc_handle().expect("close is idempotent");
    assert_eq!(importer.driver.ipc_import_refcount(shareable), 1);
    assert!(first.allocation_for(0).is_none());
    assert_eq!(
        first
            .create_event(&common::host_desc(0))
            .expect_err("closed pool")
            .kind(),
        ErrorKind::InvalidArgument
    );
    assert!(exporter.platform.memory.is_live(imported.id));

    second.close_ipc_handle().expect("close second");
    assert_eq!(importer.driver.ipc_import_refcount(shareable), 0);
    assert!(!exporter.platform.memory.is_live(imported.id));
    assert_eq!(exporter.platform.memory.free_count(imported.id), 1);

    // The exporter's own allocation is untouched.
    assert!(pool.allocation_for(0).is_some());
    assert!(exporter.platform.memory.is_live(pool.allocation_for(0).expect("owned").id));
}

#[test]
fn import_on_multi_root_context_creates_one_shadow_per_extra_root() {
    let exporter = Harness::new(SimPlatform::builder());
    let pool = exporter.pool(2, ipc_flags());
    let handle = pool.ipc_handle().expect("export");

    let importer = importer(
        &exporter.platform.memory,
        SimPlatform::builder().root_devices(2),
    );
    let imported = importer
        .context
        .event_pool(importer.context.open_ipc_event_pool(&handle).expect("import"))
        .expect("resolve");
    let root = imported.allocation_for(0).expect("import");
    let shadow = imported.allocation_for(1).expect("shadow");
    assert_ne!(root.id, shadow.id);
    assert!(root.shares_storage_with(&shadow));

    let event = importer.event(&imported, 0);
    imported.close_ipc_handle().expect("close");
    assert!(exporter.platform.memory.is_live(shadow.id), "event keeps memory alive");
    drop(event);
    assert_eq!(exporter.platform.memory.free_count(shadow.id), 1);
    assert_eq!(exporter.platform.memory.free_count(root.id), 1);
}

#[test]
fn export_needs_ipc_flag_and_single_device_or_scaling() {
    let h = Harness::new(SimPlatform::builder());
    let plain = h.pool(1, host_visible());
    assert_eq!(
        plain.ipc_handle().expect_err("no IPC flag").kind(),
        ErrorKind::Unsupported
    );

    let h = Harness::new(SimPlatform::builder().root_devices(2));
    let multi = h.pool(1, host_visible() | EventPoolFlags::IPC);
    assert_eq!(
        multi.ipc_handle().expect_err("two devices").kind(),
        ErrorKind::Unsupported
    );

    let caps = DeviceCaps {
        implicit_scaling: true,
        ..DeviceCaps::default()
    };
    let h = Harness::new(SimPlatform::builder().root_devices(2).caps(caps));
    let scaled = h.pool(1, host_visible() | EventPoolFlags::IPC);
    let descriptor = decode(&scaled.ipc_handle().expect("implicit scaling"));
    assert!(descriptor.implicit_scaling);
    assert_eq!(descriptor.num_devices, 2);
}

#[test]
fn shareable_handle_failure_is_out_of_host_memory() {
    let h = Harness::new(SimPlatform::builder());
    let pool = h.pool(1, host_visible() | EventPoolFlags::IPC);
    h.platform.memory.set_fail_shareable(true);
    assert_eq!(
        pool.ipc_handle().expect_err("allocator refuses").kind(),
        ErrorKind::OutOfHostMemory
    );
}

#[test]
fn close_on_exported_pool_is_invalid() {
    let h = Harness::new(SimPlatform::builder());
    let pool = h.pool(1, host_visible() | EventPoolFlags::IPC);
    assert_eq!(
        pool.close_ipc_handle().expect_err("not imported").kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn tampered_version_and_unknown_handle_are_rejected() {
    let exporter = Harness::new(SimPlatform::builder());
    let pool = exporter.pool(1, ipc_flags());
    let mut handle = pool.ipc_handle().expect("export");
    handle.data[37] = 2;
    let err = exporter
        .context
        .open_ipc_event_pool(&handle)
        .expect_err("future version");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let other = Harness::with_config(SimPlatform::builder(), SyncConfig::default());
    let handle = pool.ipc_handle().expect("export");
    let err = other
        .context
        .open_ipc_event_pool(&handle)
        .expect_err("handle unknown to this memory manager");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
