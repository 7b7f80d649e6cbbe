use spark_streamer::{LayerConfig, RequestStatus, test_stubs::MemoryFileSystem};

use super::support::{Harness, pattern, single, stat};

#[test]
fn flush_between_reads_reopens_transparently() {
    let data = pattern(4096);
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("a.bin", data.clone()));

    let (_, first) = harness.submit(|request| {
        request.create_read("a.bin", 0, 1024);
    });
    harness.run();
    assert_eq!(harness.fs.live_handle_count(), 1);

    // 第二个读取停在已准备队列中，刷新在它之前执行。
    harness.handle.suspend_processing();
    let (_, second) = harness.submit(|request| {
        request.create_read("a.bin", 1024, 1024);
    });
    let (_, flush) = harness.submit(|request| {
        request.create_flush("a.bin");
    });
    harness.run();
    assert_eq!(single(&flush).status, RequestStatus::Completed);
    assert_eq!(harness.fs.live_handle_count(), 0);
    assert!(second.lock().is_empty());

    harness.handle.resume_processing();
    harness.run();

    assert_eq!(single(&first).data().map(|b| &b[..]), Some(&data[..1024]));
    assert_eq!(
        single(&second).data().map(|b| &b[..]),
        Some(&data[1024..2048])
    );
    assert_eq!(harness.fs.open_count(), 2);
    assert_eq!(harness.fs.live_handle_count(), 1);
}

#[test]
fn flush_all_closes_every_handle() {
    let mut harness = Harness::new(
        MemoryFileSystem::new()
            .with_file("a.bin", pattern(16))
            .with_file("b.bin", pattern(16)),
    );
    for path in ["a.bin", "b.bin"] {
        harness.submit(|request| {
            request.create_read(path, 0, 16);
        });
    }
    harness.run();
    assert_eq!(harness.fs.live_handle_count(), 2);

    let (_, flush) = harness.submit(|request| {
        request.create_flush_all();
    });
    harness.run();
    assert_eq!(single(&flush).status, RequestStatus::Completed);
    assert_eq!(harness.fs.live_handle_count(), 0);
}

#[test]
fn lru_eviction_and_transparent_reopen() {
    let files = ["a.bin", "b.bin", "c.bin"];
    let mut fs = MemoryFileSystem::new();
    for (index, path) in files.iter().enumerate() {
        fs = fs.with_file(*path, vec![index as u8; 32]);
    }
    let mut harness = Harness::with_stack(
        fs,
        vec![LayerConfig::StorageDrive {
            max_file_handles: 2,
            max_concurrent_requests: 1,
        }],
    );

    // a, b 打开；c 淘汰 a；再次读 a 时淘汰 b 并重新打开 a。
    let mut results = Vec::new();
    for path in ["a.bin", "b.bin", "c.bin", "a.bin"] {
        let (_, done) = harness.submit(|request| {
            request.create_read(path, 0, 32);
        });
        harness.run();
        results.push((path, done));
        assert!(harness.fs.live_handle_count() <= 2);
    }

    for (path, done) in &results {
        let done = single(done);
        assert_eq!(done.status, RequestStatus::Completed);
        let expected = files.iter().position(|name| name == path).expect("known file") as u8;
        assert!(done.data().expect("data").iter().all(|byte| *byte == expected));
    }
    assert_eq!(harness.fs.open_count(), 4);

    let values = harness.statistics();
    assert_eq!(stat(&values, "storage_drive", "evictions"), 2);
    assert_eq!(stat(&values, "storage_drive", "open_handles"), 2);
    assert_eq!(stat(&values, "storage_drive", "max_file_handles"), 2);
}
