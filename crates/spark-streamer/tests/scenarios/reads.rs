use spark_streamer::{
    BatchEntry, FailureKind, RequestOutput, RequestStatus, StreamerConfig,
    test_stubs::MemoryFileSystem,
};

use super::support::{Harness, pattern, single, stat};

#[test]
fn reads_first_half_of_file() {
    let data = pattern(2048);
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("level/a.pak", data.clone()));

    let (id, done) = harness.submit(|request| {
        request.create_read("level/a.pak", 0, 1024);
    });
    harness.run();

    let done = single(&done);
    assert_eq!(done.id, id);
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.bytes_transferred(), 1024);
    assert_eq!(done.data().map(|bytes| &bytes[..]), Some(&data[..1024]));
    assert_eq!(harness.fs.read_count(), 1);
    assert_eq!(harness.scheduler.context().live_request_count(), 0);
}

#[test]
fn missing_file_fails_with_not_found() {
    let mut harness = Harness::new(MemoryFileSystem::new());
    let (_, done) = harness.submit(|request| {
        request.create_read("missing.bin", 0, 16);
    });
    harness.run();

    let done = single(&done);
    assert_eq!(done.status, RequestStatus::Failed);
    assert!(matches!(done.output, RequestOutput::None));
    let failure = done.failure.expect("failure detail");
    assert_eq!(failure.kind(), FailureKind::NotFound);
    assert!(failure.detail().contains("missing.bin"));
    assert_eq!(failure.kind().code(), "streamer.read.not_found");
}

#[test]
fn read_past_end_fails_with_short_read_and_no_data() {
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("small.bin", pattern(100)));

    let (_, past_end) = harness.submit(|request| {
        request.create_read("small.bin", 50, 100);
    });
    let (_, at_end) = harness.submit(|request| {
        request.create_read("small.bin", 100, 1);
    });
    let (_, empty) = harness.submit(|request| {
        request.create_read("small.bin", 100, 0);
    });
    harness.run();

    for done in [single(&past_end), single(&at_end)] {
        assert_eq!(done.status, RequestStatus::Failed);
        assert_eq!(done.bytes_transferred(), 0);
        assert_eq!(done.failure.map(|f| f.kind()), Some(FailureKind::ShortRead));
    }
    let empty = single(&empty);
    assert_eq!(empty.status, RequestStatus::Completed);
    assert_eq!(empty.bytes_transferred(), 0);
}

#[test]
fn batch_fills_one_buffer_per_entry() {
    let a = pattern(64);
    let b: Vec<u8> = pattern(64).into_iter().rev().collect();
    let mut harness = Harness::new(
        MemoryFileSystem::new()
            .with_file("a.bin", a.clone())
            .with_file("b.bin", b.clone()),
    );

    let (_, done) = harness.submit(|request| {
        request.create_read_batch(vec![
            BatchEntry::new("b.bin", 8, 8),
            BatchEntry::new("a.bin", 0, 16),
            BatchEntry::new("a.bin", 32, 4),
        ]);
    });
    harness.run();

    let done = single(&done);
    assert_eq!(done.status, RequestStatus::Completed);
    let RequestOutput::ReadBatch(parts) = done.output else {
        panic!("batch output expected");
    };
    assert_eq!(parts.len(), 3);
    assert_eq!(&parts[0][..], &b[8..16]);
    assert_eq!(&parts[1][..], &a[..16]);
    assert_eq!(&parts[2][..], &a[32..36]);
}

#[test]
fn batch_with_missing_entry_fails_as_a_whole() {
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("a.bin", pattern(64)));
    let (_, done) = harness.submit(|request| {
        request.create_read_batch(vec![
            BatchEntry::new("a.bin", 0, 16),
            BatchEntry::new("gone.bin", 0, 16),
        ]);
    });
    harness.run();

    let done = single(&done);
    assert_eq!(done.status, RequestStatus::Failed);
    assert!(matches!(done.output, RequestOutput::None));
    assert_eq!(done.failure.map(|f| f.kind()), Some(FailureKind::NotFound));
    assert_eq!(harness.scheduler.context().live_request_count(), 0);
}

#[test]
fn empty_batch_completes_immediately() {
    let mut harness = Harness::new(MemoryFileSystem::new());
    let (_, done) = harness.submit(|request| {
        request.create_read_batch(Vec::new());
    });
    harness.run();

    let done = single(&done);
    assert_eq!(done.status, RequestStatus::Completed);
    assert!(matches!(done.output, RequestOutput::ReadBatch(ref parts) if parts.is_empty()));
}

#[test]
fn exists_and_metadata_queries() {
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("here.bin", pattern(300)));

    let (_, here) = harness.submit(|request| {
        request.create_file_exists("here.bin");
    });
    let (_, gone) = harness.submit(|request| {
        request.create_file_exists("gone.bin");
    });
    let (_, size) = harness.submit(|request| {
        request.create_file_metadata("here.bin");
    });
    let (_, no_size) = harness.submit(|request| {
        request.create_file_metadata("gone.bin");
    });
    harness.run();

    assert!(matches!(single(&here).output, RequestOutput::Exists(true)));
    let gone = single(&gone);
    assert_eq!(gone.status, RequestStatus::Completed);
    assert!(matches!(gone.output, RequestOutput::Exists(false)));
    assert!(matches!(single(&size).output, RequestOutput::FileSize(300)));
    let no_size = single(&no_size);
    assert_eq!(no_size.status, RequestStatus::Failed);
    assert_eq!(no_size.failure.map(|f| f.kind()), Some(FailureKind::NotFound));
}

#[test]
fn splitter_stack_from_toml_reassembles_large_reads() {
    let config = StreamerConfig::from_toml_str(
        r#"
        thread_name = "scenario"

        [[stack]]
        layer = "read_splitter"
        max_read_size = 1000

        [[stack]]
        layer = "storage_drive"
        max_file_handles = 4
        max_concurrent_requests = 2
        "#,
    )
    .expect("parse");
    let data = pattern(4500);
    let mut harness = Harness::with_config(
        MemoryFileSystem::new().with_file("big.bin", data.clone()),
        &config,
    );

    let (_, done) = harness.submit(|request| {
        request.create_read("big.bin", 250, 4000);
    });
    harness.run();

    let done = single(&done);
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.data().map(|bytes| &bytes[..]), Some(&data[250..4250]));
    assert_eq!(harness.fs.read_count(), 4);
    assert_eq!(harness.fs.open_count(), 1);

    let values = harness.statistics();
    assert_eq!(stat(&values, "read_splitter", "split_requests"), 1);
    assert_eq!(stat(&values, "read_splitter", "splits_created"), 4);
    assert_eq!(stat(&values, "storage_drive", "reads"), 4);
}

#[test]
fn caller_buffer_receives_read_data() {
    let data = pattern(512);
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("buf.bin", data.clone()));
    let (_, done) = harness.submit(|request| {
        request
            .create_read("buf.bin", 128, 256)
            .with_buffer(bytes::BytesMut::with_capacity(256));
    });
    harness.run();

    let done = single(&done);
    assert_eq!(done.data().map(|bytes| &bytes[..]), Some(&data[128..384]));
}
