//! Teardown behaviour: artefact cleanup, idempotence and the destroy hook.

mod test_utils;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rstest::*;

use riffle_worker::{DistributedFs, MemoryFs, MountedFs, WriteError};
use test_utils::{Harness, filled, push_all, test_config};

#[rstest]
fn destroy_removes_local_artefacts() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let writer = harness.local_writer("victim", &config).expect("open writer");

    push_all(&writer, &[filled(64, b'v')]).expect("write");
    writer.destroy();

    assert!(!harness.dir.path().join("victim").exists());
    assert_eq!(harness.flusher.available_buffers(), harness.pool_size);
    assert_eq!(harness.monitor.observer_count(), 0);
}

#[rstest]
fn destroy_removes_dfs_artefacts_even_after_close() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let fs = Arc::new(MemoryFs::new());
    let writer = harness
        .dfs_writer(Arc::clone(&fs) as Arc<dyn DistributedFs>, "/dfs/gone", None, &config)
        .expect("open writer");

    push_all(&writer, &[filled(64, b'g')]).expect("write");
    writer.close().expect("close");
    assert!(fs.exists(Path::new("/dfs/gone.success")).expect("exists"));
    assert!(fs.exists(Path::new("/dfs/gone.index")).expect("exists"));

    writer.destroy();
    assert!(fs.paths().is_empty(), "all artefacts deleted: {:?}", fs.paths());
}

#[rstest]
fn destroy_is_idempotent_and_terminalises_the_writer() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let writer = harness.local_writer("twice", &config).expect("open writer");

    let hook_runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&hook_runs);
    writer.set_destroy_hook(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    writer.destroy();
    writer.destroy();

    assert_eq!(hook_runs.load(Ordering::SeqCst), 1, "hook is one-shot");
    assert_eq!(writer.write(filled(1, b'x')), Err(WriteError::AlreadyClosed));
    assert_eq!(writer.close(), Err(WriteError::AlreadyClosed));
    assert!(writer.storage_info().is_none());
}

#[rstest]
fn replication_race_loser_deletes_its_copy() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let fs = Arc::new(MemoryFs::new());
    // The peer finished first and left its success marker behind.
    fs.create(Path::new("/dfs/peer.success")).expect("create peer marker");

    let writer = harness
        .dfs_writer(
            Arc::clone(&fs) as Arc<dyn DistributedFs>,
            "/dfs/loser",
            Some("/dfs/peer.success".into()),
            &config,
        )
        .expect("open writer");
    push_all(&writer, &[filled(64, b'l')]).expect("write");

    let bytes = writer.close().expect("close still succeeds");
    assert_eq!(bytes, 64);
    assert!(!fs.exists(Path::new("/dfs/loser")).expect("exists"), "data deleted");
    assert!(!fs.exists(Path::new("/dfs/loser.success")).expect("exists"));
    assert!(!fs.exists(Path::new("/dfs/loser.index")).expect("exists"));
    assert!(writer.storage_info().is_none(), "no storage info for a deleted file");
}

#[rstest]
fn mounted_fs_round_trips_through_real_files() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let fs = Arc::new(MountedFs::default());
    let data_path = harness.dir.path().join("mounted");
    let data_path_str = data_path.to_str().expect("utf8 path").to_string();

    let writer = harness
        .dfs_writer(Arc::clone(&fs) as Arc<dyn DistributedFs>, &data_path_str, None, &config)
        .expect("open writer");
    push_all(&writer, &[filled(32, b'm')]).expect("write");
    writer.close().expect("close");

    assert_eq!(std::fs::read(&data_path).expect("data"), vec![b'm'; 32]);
    let index = std::fs::read(harness.dir.path().join("mounted.index")).expect("index");
    let offsets = riffle_worker::decode_chunk_index(index.as_slice()).expect("decode");
    assert_eq!(offsets, vec![32]);

    writer.destroy();
    assert!(!data_path.exists());
    assert!(!harness.dir.path().join("mounted.success").exists());
    assert!(!harness.dir.path().join("mounted.index").exists());
}

#[rstest]
fn winning_dfs_close_publishes_marker_and_index() {
    let harness = Harness::with_buffer_size(1024);
    let config = test_config(1024, 4096);
    let fs = Arc::new(MemoryFs::new());
    let writer = harness
        .dfs_writer(
            Arc::clone(&fs) as Arc<dyn DistributedFs>,
            "/dfs/winner",
            Some("/dfs/peer2.success".into()),
            &config,
        )
        .expect("open writer");
    push_all(&writer, &[filled(64, b'w')]).expect("write");
    writer.close().expect("close");

    assert_eq!(fs.read(Path::new("/dfs/winner")).expect("data"), vec![b'w'; 64]);
    assert_eq!(
        fs.read(Path::new("/dfs/winner.success")).expect("marker"),
        Vec::<u8>::new()
    );
    let index = fs.read(Path::new("/dfs/winner.index")).expect("index");
    let offsets = riffle_worker::decode_chunk_index(index.as_slice()).expect("decode");
    assert_eq!(offsets, vec![64]);
    assert!(writer.storage_info().is_some());
}
