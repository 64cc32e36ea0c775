//! Device-failure behaviour: poisoning, silent drops and close errors.

mod test_utils;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rstest::*;

use riffle_worker::{DiskStatus, DistributedFs, MemoryFs, WriteError};
use test_utils::{Harness, filled, push_all, test_config};

#[rstest]
fn device_error_poisons_writer_and_close_raises() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let fs = Arc::new(MemoryFs::new());
    let writer = harness
        .dfs_writer(Arc::clone(&fs) as Arc<dyn DistributedFs>, "/dfs/s5", None, &config)
        .expect("open writer");

    // A first flush lands before the device goes bad: the second write
    // crosses the buffer threshold and pushes the first one out.
    push_all(&writer, &[filled(600, b'd'), filled(600, b'd')]).expect("write");
    let deadline = Instant::now() + Duration::from_secs(2);
    while writer.bytes_flushed() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(writer.bytes_flushed(), 600);

    let mount = harness.flusher.mount().to_path_buf();
    harness.monitor.report_error(&mount, DiskStatus::Failed);

    // Poisoned writes are discarded without an error.
    push_all(&writer, &[filled(10, b'x')]).expect("poisoned write is silent");

    let err = writer.close().expect_err("close fails after device error");
    match &err {
        WriteError::Device { mount: m, status } => {
            assert_eq!(m, &mount.display().to_string());
            assert_eq!(*status, DiskStatus::Failed);
        }
        other => panic!("expected device error, got {other:?}"),
    }
    assert!(err.to_string().contains(&mount.display().to_string()));

    // No success marker or index may be published for a lost file.
    assert!(!fs.exists(Path::new("/dfs/s5.success")).expect("exists"));
    assert!(!fs.exists(Path::new("/dfs/s5.index")).expect("exists"));
    assert!(writer.storage_info().is_none());
}

#[rstest]
fn device_error_unregisters_the_observer() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let writer = harness.local_writer("obs", &config).expect("open writer");
    assert_eq!(harness.monitor.observer_count(), 1);

    harness
        .monitor
        .report_error(harness.flusher.mount(), DiskStatus::IoHang);
    assert_eq!(harness.monitor.observer_count(), 0);

    // Healthy and high-usage reports never poison anyone.
    let other = harness.local_writer("obs2", &config).expect("open writer");
    harness.monitor.report_healthy(harness.flusher.mount());
    harness
        .monitor
        .report_high_usage(harness.flusher.mount());
    push_all(&other, &[filled(8, b'h')]).expect("write");
    assert_eq!(other.close().expect("close"), 8);

    drop(writer);
}

#[rstest]
fn close_unregisters_and_errors_on_other_mounts_do_not_reach_us() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let writer = harness.local_writer("elsewhere", &config).expect("open writer");

    harness
        .monitor
        .report_error(Path::new("/mnt/unrelated"), DiskStatus::Failed);
    push_all(&writer, &[filled(8, b'u')]).expect("write");
    assert_eq!(writer.close().expect("close"), 8);
    assert_eq!(harness.monitor.observer_count(), 0);
}
