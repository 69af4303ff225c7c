mod common;

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use common::{Harness, event_offset, host_visible};
use neo_sync_core::csr::{CommandStreamReceiver, CsrBackend};
use neo_sync_core::types::DeviceId;
use neo_sync_core::{ErrorKind, SyncConfig, SyncError};
use neo_sync_event::EventPoolDesc;
use neo_sync_sim::SimPlatform;
use neo_sync_timestamp::STATE_SIGNALED;

fn tbx() -> neo_sync_sim::SimPlatformBuilder {
    SimPlatform::builder().backend(CsrBackend::Tbx)
}

#[test]
fn zero_timeout_is_a_single_query() {
    let h = Harness::new(SimPlatform::builder());
    let event = h.event(&h.pool(1, host_visible()), 0);
    let start = Instant::now();
    assert_eq!(
        event.host_synchronize(0).expect_err("pending").kind(),
        ErrorKind::NotReady
    );
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn timeout_is_a_lower_bound() {
    let h = Harness::new(SimPlatform::builder());
    let event = h.event(&h.pool(1, host_visible()), 0);
    for timeout in [Duration::from_millis(1), Duration::from_millis(15)] {
        let start = Instant::now();
        let err = event
            .host_synchronize(timeout.as_nanos() as u64)
            .expect_err("never completes");
        assert!(matches!(err, SyncError::NotReady), "{err}");
        assert!(start.elapsed() >= timeout, "returned early for {timeout:?}");
    }
    assert!(!event.is_completed());
}

#[test]
fn timeout_override_replaces_caller_timeout() {
    let config = SyncConfig {
        host_synchronize_timeout_override_ns: Some(3_000_000),
        ..SyncConfig::default()
    };
    let h = Harness::with_config(SimPlatform::builder(), config);
    let event = h.event(&h.pool(1, host_visible()), 0);
    let start = Instant::now();
    assert!(event.host_synchronize(u64::MAX).is_err());
    assert!(start.elapsed() >= Duration::from_millis(3));
}

#[test]
fn near_unbounded_timeout_still_observes_completion() {
    let h = Harness::new(SimPlatform::builder());
    let event = h.event(&h.pool(1, host_visible()), 0);
    let signaler = {
        let event = event.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            event.host_signal(false)
        })
    };
    event
        .host_synchronize(u64::MAX - 1)
        .expect("completes before any deadline");
    signaler.join().expect("signal thread").expect("host signal");
}

#[test]
fn wait_observes_completion_from_another_thread() {
    let h = Harness::new(tbx());
    let pool = h.pool(1, host_visible());
    let event = h.event(&pool, 0);
    let allocation = pool.allocation_for(0).expect("root 0");
    let offset = event_offset(&event, &allocation);
    let csr = h.platform.csr(DeviceId::root(0), 0).expect("engine");
    event.add_csr(csr.clone());

    let gpu = {
        let csr = csr.clone();
        let allocation = allocation.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            csr.execute_write(&allocation, offset, &STATE_SIGNALED.to_le_bytes())
                .expect("gpu write");
        })
    };
    event.host_synchronize(u64::MAX).expect("completes");
    gpu.join().expect("gpu thread");
    assert!(csr.stats().downloads.load(Ordering::Relaxed) >= 1);
}

#[test]
fn non_coherent_backend_needs_download_before_read() {
    let h = Harness::new(tbx());
    let pool = h.pool(1, host_visible());
    let event = h.event(&pool, 0);
    let allocation = pool.allocation_for(0).expect("root 0");
    let offset = event_offset(&event, &allocation);
    let csr = h.platform.csr(DeviceId::root(0), 0).expect("engine");

    csr.execute_write(&allocation, offset, &STATE_SIGNALED.to_le_bytes())
        .expect("gpu write");
    assert_ne!(
        allocation.storage().snapshot(offset, 4).expect("readable"),
        STATE_SIGNALED.to_le_bytes().to_vec(),
        "device write is invisible until downloaded"
    );

    event.query_status().expect("download makes it visible");
    assert_eq!(csr.stats().downloads.load(Ordering::Relaxed), 1);
    event.query_status().expect("cached");
    assert_eq!(csr.stats().downloads.load(Ordering::Relaxed), 1);
}

#[test]
fn host_writes_are_uploaded_to_the_device_view() {
    let h = Harness::new(tbx());
    let pool = h.pool(1, host_visible());
    let event = h.event(&pool, 0);
    let allocation = pool.allocation_for(0).expect("root 0");
    let offset = event_offset(&event, &allocation);

    event.host_signal(false).expect("host signal");
    let device_view = h
        .platform
        .device_memory
        .read(&allocation, offset, 4)
        .expect("readable");
    assert_eq!(device_view, STATE_SIGNALED.to_le_bytes().to_vec());

    event.reset().expect("reset");
    let device_view = h
        .platform
        .device_memory
        .read(&allocation, offset, 4)
        .expect("readable");
    assert_eq!(device_view, vec![0xFF; 4]);
}

#[test]
fn redundant_downloads_are_skipped_until_new_work() {
    let h = Harness::new(tbx());
    let pool = h.pool(1, host_visible());
    let event = h.event(&pool, 0);
    let allocation = pool.allocation_for(0).expect("root 0");
    let offset = event_offset(&event, &allocation);
    let csr = h.platform.csr(DeviceId::root(0), 0).expect("engine");
    let downloads = || csr.stats().downloads.load(Ordering::Relaxed);

    assert!(event.query_status().is_err());
    assert!(event.query_status().is_err());
    assert!(event.query_status().is_err());
    assert_eq!(downloads(), 1);

    // Submitted but not retired: download every time.
    let task = csr.submit(&allocation);
    assert_eq!(csr.task_count_for(&allocation), task);
    assert!(event.query_status().is_err());
    assert!(event.query_status().is_err());
    assert_eq!(downloads(), 3);

    csr.gpu_write(&allocation, offset, &STATE_SIGNALED.to_le_bytes())
        .expect("gpu write");
    csr.retire_all();
    event.query_status().expect("new work observed");
    assert_eq!(downloads(), 4);
}

#[test]
fn redundant_download_skip_can_be_disabled() {
    let config = SyncConfig {
        skip_redundant_downloads: false,
        ..SyncConfig::default()
    };
    let h = Harness::with_config(tbx(), config);
    let event = h.event(&h.pool(1, host_visible()), 0);
    let csr = h.platform.csr(DeviceId::root(0), 0).expect("engine");
    for _ in 0..3 {
        assert!(event.query_status().is_err());
    }
    assert_eq!(csr.stats().downloads.load(Ordering::Relaxed), 3);
}

#[test]
fn download_goes_to_every_recorded_receiver() {
    let h = Harness::new(tbx().engines_per_device(3));
    let event = h.event(&h.pool(1, host_visible()), 0);
    let engines: Vec<_> = (0..3)
        .map(|i| h.platform.csr(DeviceId::root(0), i).expect("engine"))
        .collect();
    event.add_csr(engines[1].clone());
    event.add_csr(engines[2].clone());

    assert!(event.query_status().is_err());
    assert_eq!(engines[0].stats().downloads.load(Ordering::Relaxed), 0);
    assert_eq!(engines[1].stats().downloads.load(Ordering::Relaxed), 1);
    assert_eq!(engines[2].stats().downloads.load(Ordering::Relaxed), 1);
}

#[test]
fn cross_device_download_blocks_same_device_does_not() {
    let h = Harness::new(tbx().sub_devices(2));
    let root = h.driver.device_handles()[0];
    let tiles = h.driver.sub_device_handles(root).expect("tiles");
    let pool_handle = h
        .context
        .create_event_pool(&[tiles[0]], &EventPoolDesc { count: 2, flags: host_visible() })
        .expect("pool on tile 0");
    let pool = h.context.event_pool(pool_handle).expect("resolve");

    let own = h.platform.csr(DeviceId::sub(0, 0), 0).expect("tile 0 engine");
    let other = h.platform.csr(DeviceId::sub(0, 1), 0).expect("tile 1 engine");

    let local = h.event(&pool, 0);
    local.add_csr(own.clone());
    assert!(local.query_status().is_err());
    assert_eq!(own.stats().downloads.load(Ordering::Relaxed), 1);
    assert_eq!(own.stats().blocking_downloads.load(Ordering::Relaxed), 0);

    let remote = h.event(&pool, 1);
    remote.add_csr(other.clone());
    assert!(remote.query_status().is_err());
    assert_eq!(other.stats().downloads.load(Ordering::Relaxed), 1);
    assert_eq!(other.stats().blocking_downloads.load(Ordering::Relaxed), 1);
}

#[test]
fn hang_ends_wait_with_device_lost() {
    let config = SyncConfig {
        gpu_hang_check_period_us: 100,
        ..SyncConfig::default()
    };
    let h = Harness::with_config(SimPlatform::builder(), config);
    let event = h.event(&h.pool(1, host_visible()), 0);
    let csr = h.platform.csr(DeviceId::root(0), 0).expect("engine");
    csr.inject_hang();

    let start = Instant::now();
    let err = event.host_synchronize(u64::MAX).expect_err("hang");
    assert!(matches!(err, SyncError::DeviceLost { csr_id } if csr_id == csr.id()), "{err}");
    assert_eq!(err.kind(), ErrorKind::DeviceLost);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn hang_wins_over_timeout() {
    let h = Harness::new(SimPlatform::builder());
    let event = h.event(&h.pool(1, host_visible()), 0);
    h.platform
        .csr(DeviceId::root(0), 0)
        .expect("engine")
        .inject_hang();
    // Default period is far longer than the timeout; the final check still runs.
    let err = event.host_synchronize(1_000_000).expect_err("hang");
    assert_eq!(err.kind(), ErrorKind::DeviceLost);
}

#[test]
fn forced_recheck_reports_hang_after_completion() {
    let config = SyncConfig {
        force_status_recheck_on_success: true,
        ..SyncConfig::default()
    };
    let h = Harness::with_config(SimPlatform::builder(), config);
    let event = h.event(&h.pool(1, host_visible()), 0);
    event.host_signal(false).expect("host signal");
    h.platform
        .csr(DeviceId::root(0), 0)
        .expect("engine")
        .inject_hang();

    let err = event.host_synchronize(u64::MAX).expect_err("hang wins");
    assert_eq!(err.kind(), ErrorKind::DeviceLost);
}

#[test]
fn completed_event_without_recheck_ignores_later_hang() {
    let h = Harness::new(SimPlatform::builder());
    let event = h.event(&h.pool(1, host_visible()), 0);
    event.host_signal(false).expect("host signal");
    h.platform
        .csr(DeviceId::root(0), 0)
        .expect("engine")
        .inject_hang();
    event.host_synchronize(u64::MAX).expect("already complete");
    assert!(event.check_gpu_hang().is_err());
}

#[test]
fn concurrent_waiters_all_observe_completion() {
    let h = Harness::new(SimPlatform::builder());
    let event = h.event(&h.pool(1, host_visible()), 0);

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let event = event.clone();
            thread::spawn(move || event.host_synchronize(u64::MAX))
        })
        .collect();
    thread::sleep(Duration::from_millis(2));
    event.host_signal(false).expect("host signal");
    for waiter in waiters {
        waiter.join().expect("waiter thread").expect("completed");
    }
}
