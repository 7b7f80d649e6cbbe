use std::sync::Arc;

use parking_lot::Mutex;
use spark_streamer::{
    BatchEntry, LayerConfig, Priority, RequestOutput, RequestStatus, test_stubs::MemoryFileSystem,
};

use super::support::{Harness, pattern, single, stat};

#[test]
fn cancel_before_execute_yields_one_canceled_callback() {
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("a.bin", pattern(256)));
    harness.handle.suspend_processing();

    let (target, read) = harness.submit(|request| {
        request.create_read("a.bin", 0, 256);
    });
    harness.run();
    assert!(read.lock().is_empty());

    let (_, cancel) = harness.submit(|request| {
        request.create_cancel(target);
    });
    harness.run();
    harness.handle.resume_processing();
    harness.run();

    let read = single(&read);
    assert_eq!(read.status, RequestStatus::Canceled);
    assert_eq!(read.bytes_transferred(), 0);
    assert!(read.failure.is_none());
    assert_eq!(single(&cancel).status, RequestStatus::Completed);
    assert_eq!(harness.fs.read_count(), 0);
    assert_eq!(harness.fs.open_count(), 0);
    assert_eq!(harness.scheduler.context().live_request_count(), 0);
}

#[test]
fn cancel_submitted_with_its_target_wins() {
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("a.bin", pattern(256)));
    let (target, read) = harness.submit(|request| {
        request.create_read_batch(vec![
            BatchEntry::new("a.bin", 0, 64),
            BatchEntry::new("a.bin", 64, 64),
        ]);
    });
    let (_, cancel) = harness.submit(|request| {
        request.create_cancel(target);
    });
    harness.run();

    assert_eq!(single(&read).status, RequestStatus::Canceled);
    assert_eq!(single(&cancel).status, RequestStatus::Completed);
    assert_eq!(harness.fs.read_count(), 0);
}

#[test]
fn cancel_of_finished_request_is_harmless() {
    let mut harness = Harness::new(MemoryFileSystem::new().with_file("a.bin", pattern(64)));
    let (target, read) = harness.submit(|request| {
        request.create_read("a.bin", 0, 64);
    });
    harness.run();
    assert_eq!(single(&read).status, RequestStatus::Completed);

    let (_, cancel) = harness.submit(|request| {
        request.create_cancel(target);
    });
    harness.run();
    assert_eq!(single(&cancel).status, RequestStatus::Completed);
    assert!(read.lock().is_empty(), "no second callback for the target");
}

#[test]
fn cancel_reaches_requests_already_queued_in_drive() {
    let mut harness = Harness::with_stack(
        MemoryFileSystem::new().with_file("a.bin", pattern(512)),
        vec![LayerConfig::StorageDrive {
            max_file_handles: 4,
            max_concurrent_requests: 4,
        }],
    );
    let (target, read) = harness.submit(|request| {
        request.create_read_batch(
            (0..4)
                .map(|index| BatchEntry::new("a.bin", index * 128, 128))
                .collect(),
        );
    });
    // 只推进一拍：四个子读取进入驱动队列，执行其中一个。
    harness.scheduler.run_once();
    let (_, cancel) = harness.submit(|request| {
        request.create_cancel(target);
    });
    harness.run();

    let read = single(&read);
    assert_eq!(read.status, RequestStatus::Canceled);
    assert!(matches!(read.output, RequestOutput::None));
    assert_eq!(single(&cancel).status, RequestStatus::Completed);
    assert_eq!(harness.fs.read_count(), 1);
}

#[test]
fn reschedule_promotes_waiting_request() {
    let mut harness = Harness::new(
        MemoryFileSystem::new()
            .with_file("a.bin", pattern(32))
            .with_file("b.bin", pattern(32))
            .with_file("c.bin", pattern(32)),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    harness.handle.suspend_processing();

    let mut ids = Vec::new();
    for path in ["a.bin", "b.bin", "c.bin"] {
        let sink = Arc::clone(&order);
        let mut request = harness.handle.get_new_external_request().expect("allocate");
        request
            .create_read(path, 0, 32)
            .set_completion_callback(move |_| sink.lock().push(path));
        ids.push(harness.handle.queue_request(request).expect("queue"));
    }
    harness.run();

    let (_, reschedule) = harness.submit(|request| {
        request.create_reschedule(ids[2], None, Priority::HIGHEST);
    });
    harness.run();
    assert_eq!(single(&reschedule).status, RequestStatus::Completed);

    harness.handle.resume_processing();
    harness.run();
    assert_eq!(*order.lock(), vec!["c.bin", "a.bin", "b.bin"]);

    let values = harness.statistics();
    assert_eq!(stat(&values, "scheduler", "rescheduled"), 1);
    // 三个读取、各自的内部子读取与重排请求本身。
    assert_eq!(stat(&values, "context", "completed"), 7);
    assert_eq!(stat(&values, "context", "canceled"), 0);
}

#[test]
fn custom_requests_complete_in_submission_order() {
    let mut harness = Harness::new(MemoryFileSystem::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 0_u32..3 {
        let sink = Arc::clone(&order);
        let mut request = harness.handle.get_new_external_request().expect("allocate");
        request
            .create_custom(Box::new(tag))
            .set_completion_callback(move |done| {
                if let RequestOutput::Custom(payload) = done.output
                    && let Ok(tag) = payload.downcast::<u32>()
                {
                    sink.lock().push(*tag);
                }
            });
        harness.handle.queue_request(request).expect("queue");
    }
    harness.run();
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}
