use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use echo_ft_protocol::{FailureReason, PollStatus, UploadStatus};
use echo_ft_receiver::{
    DownloadService, ListenerSlot, MemoryPartSource, ProcessOutcome, ReceiverConfig,
    UploadListener, UploadListenerBridge, UploadProcessor, UploadedFile, monitor,
};
use echo_ft_transfer::{DownloadTickets, InMemoryDownload, RenderState, TransferRegistry};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct ReleaseFlag(Arc<AtomicBool>);

impl Read for ReleaseFlag {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(0)
    }
}

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct AppListener {
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<(String, Vec<u8>)>>,
    canceled: AtomicBool,
    failed: Mutex<Vec<FailureReason>>,
}

impl UploadListener for AppListener {
    fn upload_started(&self, file_name: Option<&str>) {
        self.started
            .lock()
            .unwrap()
            .push(file_name.unwrap_or_default().to_string());
    }

    fn upload_canceled(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn upload_completed(&self, mut file: UploadedFile) {
        let mut data = Vec::new();
        file.data.read_to_end(&mut data).unwrap();
        self.completed
            .lock()
            .unwrap()
            .push((file.file_name.unwrap_or_default(), data));
    }

    fn upload_failed(&self, reason: FailureReason) {
        self.failed.lock().unwrap().push(reason);
    }
}

fn unthrottled_config(dir: &std::path::Path) -> ReceiverConfig {
    ReceiverConfig {
        bandwidth: 0,
        disk_cache_dir: Some(dir.to_path_buf()),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn individually_canceled_member_still_polls_complete() {
    let registry = TransferRegistry::new();
    let group = registry.create_group("pid-1");
    group.init(1000).unwrap();

    let a = group.create_transfer().unwrap();
    let b = group.create_transfer().unwrap();
    group.start(&a);
    group.start(&b);

    group.progress(&a, 400);
    group.complete(&a, Some(Box::new(Cursor::new(vec![1u8; 400]))), 400);

    group.progress(&b, 100);
    assert!(b.cancel());

    assert_eq!(group.progress_total(), 500);
    assert!(group.is_complete());
    assert!(!group.is_canceled());
    assert_eq!(
        monitor::process_request(&registry, Some("pid-1"), None),
        PollStatus::Complete
    );
}

#[test]
fn canceled_transfer_releases_late_completion() {
    let registry = TransferRegistry::new();
    let group = registry.create_group("pid-2");
    let t = group.create_transfer().unwrap();
    group.cancel();

    let released = Arc::new(AtomicBool::new(false));
    assert!(!group.complete(&t, Some(Box::new(ReleaseFlag(released.clone()))), 10));
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(t.status(), UploadStatus::Canceled);

    group.set_status(UploadStatus::ErrorIo);
    assert_eq!(t.status(), UploadStatus::Canceled);
    assert_eq!(
        monitor::process_request(&registry, Some("pid-2"), None),
        PollStatus::Canceled
    );
}

#[test]
fn processed_request_is_delivered_on_finish() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = TransferRegistry::new();
    let processor = UploadProcessor::new(unthrottled_config(tmp.path()));

    let app = Arc::new(AppListener::default());
    let slot = Arc::new(ListenerSlot::new());
    slot.set(app.clone()).unwrap();
    let bridge = UploadListenerBridge::new(slot);

    let group = registry.create_group("pid-3");
    bridge.attach(&group);
    let render = RenderState::new();
    let mut source = MemoryPartSource::new()
        .file("upload", "/tmp/notes.txt", Some("text/plain"), "some notes")
        .file("upload", "photo.jpg", Some("image/jpeg"), vec![0xAB; 64 * 1024]);

    let outcome = processor.process(&group, &mut source, Some(&render)).unwrap();
    assert_eq!(outcome, ProcessOutcome::Completed { files: 2 });
    assert_eq!(
        monitor::process_request(&registry, Some("pid-3"), None),
        PollStatus::Complete
    );
    assert_eq!(*app.started.lock().unwrap(), vec!["notes.txt", "photo.jpg"]);

    let report = monitor::progress_report(&render, 1, None).unwrap();
    assert_eq!(report.bytes_read, 10 + 64 * 1024);
    assert_eq!(report.percent_completed, 100.0);
    assert_eq!(report.estimated_time_left, 0);

    assert_eq!(bridge.finish(&registry, "pid-3"), 2);
    let completed = app.completed.lock().unwrap();
    assert_eq!(completed[0], ("notes.txt".to_string(), b"some notes".to_vec()));
    assert_eq!(completed[1].1.len(), 64 * 1024);

    assert_eq!(
        monitor::process_request(&registry, Some("pid-3"), None),
        PollStatus::UnknownId
    );
}

#[test]
fn oversize_request_notifies_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = TransferRegistry::new();
    let processor = UploadProcessor::new(ReceiverConfig {
        max_upload_size: 1024,
        ..unthrottled_config(tmp.path())
    });

    let app = Arc::new(AppListener::default());
    let slot = Arc::new(ListenerSlot::new());
    slot.set(app.clone()).unwrap();
    let group = registry.create_group("pid-4");
    UploadListenerBridge::new(slot).attach(&group);

    let mut source = MemoryPartSource::new().file("upload", "big.iso", None, vec![0u8; 4096]);
    let outcome = processor.process(&group, &mut source, None).unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Failed {
            reason: FailureReason::Oversize
        }
    );
    assert_eq!(*app.failed.lock().unwrap(), vec![FailureReason::Oversize]);
    assert!(app.started.lock().unwrap().is_empty());
    assert_eq!(
        monitor::process_request(&registry, Some("pid-4"), None),
        PollStatus::Complete
    );
}

#[test]
fn cancel_from_poller_stops_throttled_upload() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(TransferRegistry::new());
    let processor = Arc::new(UploadProcessor::new(ReceiverConfig {
        bandwidth: 200_000,
        ..unthrottled_config(tmp.path())
    }));

    let app = Arc::new(AppListener::default());
    let slot = Arc::new(ListenerSlot::new());
    slot.set(app.clone()).unwrap();
    let group = registry.create_group("pid-5");
    UploadListenerBridge::new(slot).attach(&group);

    let upload = {
        let processor = Arc::clone(&processor);
        let group = Arc::clone(&group);
        thread::spawn(move || {
            let mut source =
                MemoryPartSource::new().file("upload", "slow.bin", None, vec![5u8; 2_000_000]);
            processor.process(&group, &mut source, None).unwrap()
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match monitor::process_request(&registry, Some("pid-5"), None) {
            PollStatus::InProgress { transferred, total } if transferred > 0 => {
                assert_eq!(total, Some(2_000_000));
                break;
            }
            _ => {}
        }
        assert!(Instant::now() < deadline, "upload never reported progress");
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(
        monitor::process_request(&registry, Some("pid-5"), Some("cancel")),
        PollStatus::Canceled
    );

    let outcome = upload.join().unwrap();
    assert_eq!(outcome, ProcessOutcome::Canceled { files: 0 });
    assert!(app.canceled.load(Ordering::SeqCst));
    assert_eq!(group.transfers()[0].status(), UploadStatus::Canceled);
    assert!(group.progress_total() < 2_000_000);
    assert_eq!(processor.allocator().active_transfers(), 0);
}

#[test]
fn download_ticket_served_once() {
    let service = DownloadService::new(Arc::new(DownloadTickets::new()));
    let id = service.offer(Box::new(
        InMemoryDownload::new("col1,col2\n")
            .with_content_type("text/csv")
            .with_file_name("export.csv"),
    ));

    let mut body = Vec::new();
    let headers = service.serve(Some(&id), &mut body).unwrap();
    assert_eq!(headers.content_disposition, "attachment; filename=\"export.csv\"");
    assert_eq!(headers.content_length, Some(10));
    assert_eq!(body, b"col1,col2\n");

    assert!(service.serve(Some(&id), &mut Vec::new()).is_err());
}
