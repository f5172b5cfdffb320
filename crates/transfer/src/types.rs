use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use echo_ft_protocol::{ProgressReport, UploadStatus};

use crate::progress::ProgressTracker;

/// Readable handle to the stored contents of a completed upload.
pub type DataHandle = Box<dyn Read + Send>;

const IN_PROGRESS: u8 = 0;
const COMPLETE: u8 = 1;
const CANCELED: u8 = 2;
const ERROR_IO: u8 = 3;
const ERROR_OVERSIZE: u8 = 4;

fn encode(status: UploadStatus) -> u8 {
    match status {
        UploadStatus::InProgress => IN_PROGRESS,
        UploadStatus::Complete => COMPLETE,
        UploadStatus::Canceled => CANCELED,
        UploadStatus::ErrorIo => ERROR_IO,
        UploadStatus::ErrorOversize => ERROR_OVERSIZE,
    }
}

fn decode(raw: u8) -> UploadStatus {
    match raw {
        COMPLETE => UploadStatus::Complete,
        CANCELED => UploadStatus::Canceled,
        ERROR_IO => UploadStatus::ErrorIo,
        ERROR_OVERSIZE => UploadStatus::ErrorOversize,
        _ => UploadStatus::InProgress,
    }
}

#[derive(Debug, Default)]
struct TransferMeta {
    file_name: Option<String>,
    content_type: Option<String>,
}

/// One file moving through a [`TransferGroup`](crate::TransferGroup).
///
/// Status starts at `InProgress` and leaves it exactly once. Every other
/// status is terminal, so a late `complete` racing a cancel loses and has its
/// data handle dropped.
pub struct Transfer {
    index: usize,
    status: AtomicU8,
    progress: AtomicU64,
    /// Final size in bytes, `-1` until completed.
    size: AtomicI64,
    meta: RwLock<TransferMeta>,
    data: Mutex<Option<DataHandle>>,
    tracker: Mutex<Option<Arc<ProgressTracker>>>,
}

impl Transfer {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            status: AtomicU8::new(IN_PROGRESS),
            progress: AtomicU64::new(0),
            size: AtomicI64::new(-1),
            meta: RwLock::new(TransferMeta::default()),
            data: Mutex::new(None),
            tracker: Mutex::new(None),
        }
    }

    /// Position of this transfer within its group, in creation order.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> UploadStatus {
        decode(self.status.load(Ordering::Acquire))
    }

    pub fn is_in_progress(&self) -> bool {
        self.status() == UploadStatus::InProgress
    }

    /// Bytes received so far.
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Final size, known once the transfer completed.
    pub fn size(&self) -> Option<u64> {
        u64::try_from(self.size.load(Ordering::Acquire)).ok()
    }

    pub fn file_name(&self) -> Option<String> {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .file_name
            .clone()
    }

    pub fn content_type(&self) -> Option<String> {
        self.meta
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .content_type
            .clone()
    }

    /// Moves a transfer that is still in progress to `Canceled`.
    ///
    /// Returns `false` if it had already reached a terminal status. Does not
    /// touch the owning group's canceled flag.
    pub fn cancel(&self) -> bool {
        self.transition(UploadStatus::Canceled)
    }

    /// Takes the completed data out of the transfer.
    ///
    /// Only a `Complete` transfer yields data, and only once.
    pub fn take_data(&self) -> Option<DataHandle> {
        if self.status() != UploadStatus::Complete {
            return None;
        }
        self.lock_data().take()
    }

    /// Tracker attached by the upload pipeline, if any.
    pub fn progress_tracker(&self) -> Option<Arc<ProgressTracker>> {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rate and ETA figures from the attached tracker.
    pub fn progress_report(&self) -> Option<ProgressReport> {
        self.progress_tracker().map(|t| t.snapshot())
    }

    pub(crate) fn set_meta(&self, file_name: Option<String>, content_type: Option<String>) {
        let mut meta = self.meta.write().unwrap_or_else(PoisonError::into_inner);
        meta.file_name = file_name;
        meta.content_type = content_type;
    }

    pub(crate) fn set_tracker(&self, tracker: Arc<ProgressTracker>) {
        *self.tracker.lock().unwrap_or_else(PoisonError::into_inner) = Some(tracker);
    }

    /// Records progress. Ignored (and `false`) once terminal.
    ///
    /// Progress never moves backwards.
    pub(crate) fn set_progress(&self, bytes: u64) -> bool {
        if !self.is_in_progress() {
            return false;
        }
        self.progress.fetch_max(bytes, Ordering::AcqRel);
        true
    }

    /// Single transition out of `InProgress`.
    pub(crate) fn transition(&self, to: UploadStatus) -> bool {
        if to == UploadStatus::InProgress {
            return false;
        }
        self.status
            .compare_exchange(IN_PROGRESS, encode(to), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records the final size, then marks the transfer complete and stores
    /// its data.
    ///
    /// If another status won the race the handle is dropped here, which
    /// releases whatever it holds (temp files, buffers).
    pub(crate) fn complete(&self, size: u64, data: Option<DataHandle>) -> bool {
        let mut slot = self.lock_data();
        self.size
            .store(i64::try_from(size).unwrap_or(i64::MAX), Ordering::Release);
        if !self.transition(UploadStatus::Complete) {
            drop(data);
            return false;
        }
        *slot = data;
        true
    }

    fn lock_data(&self) -> MutexGuard<'_, Option<DataHandle>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("index", &self.index)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .field("size", &self.size())
            .field("file_name", &self.file_name())
            .finish()
    }
}
