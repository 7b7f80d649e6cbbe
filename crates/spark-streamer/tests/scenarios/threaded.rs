use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use spark_streamer::{
    ContextHandle, FailureKind, OsFileSystem, RequestStatus, Streamer, StreamerConfig,
    test_stubs::MemoryFileSystem,
};

use super::support::pattern;

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn producers_on_many_threads_each_get_one_callback() {
    let data = pattern(8192);
    let fs = MemoryFileSystem::new().with_file("shared.bin", data.clone());
    let streamer = Streamer::start(StreamerConfig::default(), fs.shared()).expect("start");
    let (tx, rx) = mpsc::channel();

    let producers: Vec<_> = (0..4_u64)
        .map(|producer| {
            let handle = streamer.handle();
            let tx = tx.clone();
            thread::spawn(move || {
                for chunk in 0..8_u64 {
                    let offset = (producer * 8 + chunk) * 256;
                    let tx = tx.clone();
                    let mut request = handle.get_new_external_request().expect("allocate");
                    request
                        .create_read("shared.bin", offset, 256)
                        .set_completion_callback(move |done| {
                            let _ = tx.send((offset, done));
                        });
                    handle.queue_request(request).expect("queue");
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer thread");
    }
    drop(tx);

    let mut seen = Vec::new();
    for _ in 0..32 {
        let (offset, done) = rx.recv_timeout(WAIT).expect("callback");
        assert_eq!(done.status, RequestStatus::Completed);
        let start = offset as usize;
        assert_eq!(done.data().map(|b| &b[..]), Some(&data[start..start + 256]));
        seen.push(offset);
    }
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 32);

    let handle = streamer.handle();
    streamer.stop();
    assert_eq!(handle.outstanding_external_requests(), 0);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn callbacks_can_submit_follow_up_requests() {
    let fs = MemoryFileSystem::new()
        .with_file("index.bin", 4096_u64.to_le_bytes().to_vec())
        .with_file("payload.bin", pattern(4096));
    let streamer = Streamer::start(StreamerConfig::default(), fs.shared()).expect("start");
    let (tx, rx) = mpsc::channel();
    let handle: ContextHandle = streamer.handle();

    streamer
        .read("index.bin", 0, 8, move |done| {
            let Some(bytes) = done.data() else {
                return;
            };
            let mut raw = [0_u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            let size = u64::from_le_bytes(raw);

            let mut follow_up = handle.get_new_external_request().expect("allocate in callback");
            follow_up
                .create_read("payload.bin", 0, size)
                .set_completion_callback(move |done| {
                    let _ = tx.send(done);
                });
            handle.queue_request(follow_up).expect("queue from callback");
        })
        .expect("submit");

    let done = rx.recv_timeout(WAIT).expect("follow-up callback");
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.bytes_transferred(), 4096);
}

#[test]
fn os_filesystem_reads_and_reports_missing_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = pattern(3000);
    std::fs::write(dir.path().join("asset.bin"), &data).expect("write fixture");

    let streamer = Streamer::start(
        StreamerConfig::default(),
        Arc::new(OsFileSystem::with_root(dir.path())),
    )
    .expect("start");
    let (tx, rx) = mpsc::channel();

    let read_tx = tx.clone();
    streamer
        .read("asset.bin", 1000, 1500, move |done| {
            let _ = read_tx.send(("read", done));
        })
        .expect("submit read");
    let missing_tx = tx.clone();
    streamer
        .read("absent.bin", 0, 1, move |done| {
            let _ = missing_tx.send(("missing", done));
        })
        .expect("submit missing");
    streamer
        .file_metadata("asset.bin", move |done| {
            let _ = tx.send(("metadata", done));
        })
        .expect("submit metadata");

    for _ in 0..3 {
        let (kind, done) = rx.recv_timeout(WAIT).expect("callback");
        match kind {
            "read" => {
                assert_eq!(done.status, RequestStatus::Completed);
                assert_eq!(done.data().map(|b| &b[..]), Some(&data[1000..2500]));
            }
            "missing" => {
                assert_eq!(done.status, RequestStatus::Failed);
                assert_eq!(done.failure.map(|f| f.kind()), Some(FailureKind::NotFound));
            }
            _ => assert!(matches!(
                done.output,
                spark_streamer::RequestOutput::FileSize(3000)
            )),
        }
    }
}

#[test]
fn stop_drains_submitted_work() {
    let fs = MemoryFileSystem::new().with_file("a.bin", pattern(1024));
    let streamer = Streamer::start(StreamerConfig::default(), fs.shared()).expect("start");
    streamer.suspend_processing();

    let (tx, rx) = mpsc::channel();
    for chunk in 0..4_u64 {
        let tx = tx.clone();
        streamer
            .read("a.bin", chunk * 256, 256, move |done| {
                let _ = tx.send(done.status);
            })
            .expect("submit");
    }
    drop(tx);
    streamer.stop();

    let statuses: Vec<_> = rx.iter().collect();
    assert_eq!(statuses, vec![RequestStatus::Completed; 4]);
    assert_eq!(fs.live_handle_count(), 0);
}
