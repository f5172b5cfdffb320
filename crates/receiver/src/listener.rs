//! Application-facing upload notifications.
//!
//! A group may have any number of [`ProcessListener`]s, but the application
//! registers at most one [`UploadListener`] per upload component. The
//! [`UploadListenerBridge`] adapts the former to the latter.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use echo_ft_protocol::{FailureReason, ProgressReport, UploadStatus};
use echo_ft_transfer::{
    DataHandle, GroupEvent, ListenerId, ProcessListener, Transfer, TransferGroup,
    TransferRegistry,
};
use tracing::{debug, info};

use crate::ReceiverError;

/// A completed upload handed to the application.
pub struct UploadedFile {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size: u64,
    pub data: DataHandle,
}

impl fmt::Debug for UploadedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Receives the lifecycle of uploads from one component.
pub trait UploadListener: Send + Sync {
    fn upload_started(&self, _file_name: Option<&str>) {}
    fn upload_progressed(&self, _report: &ProgressReport) {}
    fn upload_canceled(&self) {}
    fn upload_completed(&self, file: UploadedFile);
    fn upload_failed(&self, _reason: FailureReason) {}
}

/// Holds the single [`UploadListener`] of a component.
#[derive(Default)]
pub struct ListenerSlot {
    listener: Mutex<Option<Arc<dyn UploadListener>>>,
}

impl ListenerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the listener. Fails if one is already installed.
    pub fn set(&self, listener: Arc<dyn UploadListener>) -> Result<(), ReceiverError> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(ReceiverError::ListenerAlreadySet);
        }
        *slot = Some(listener);
        Ok(())
    }

    /// Removes and returns the installed listener.
    pub fn clear(&self) -> Option<Arc<dyn UploadListener>> {
        self.lock().take()
    }

    pub fn get(&self) -> Option<Arc<dyn UploadListener>> {
        self.lock().clone()
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn UploadListener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Forwards group events to the listener in a [`ListenerSlot`].
///
/// Completed files are not forwarded as they finish; the application
/// collects them all at once through [`finish`](Self::finish) when the
/// client reports the submission done.
#[derive(Debug, Clone)]
pub struct UploadListenerBridge {
    slot: Arc<ListenerSlot>,
}

impl UploadListenerBridge {
    pub fn new(slot: Arc<ListenerSlot>) -> Self {
        Self { slot }
    }

    /// Registers a copy of this bridge on `group`.
    pub fn attach(&self, group: &TransferGroup) -> ListenerId {
        group.add_listener(Arc::new(self.clone()))
    }

    /// Delivers every completed file of the group, then removes and disposes
    /// the group. Returns the number of files delivered; `0` for an unknown
    /// id.
    pub fn finish(&self, registry: &TransferRegistry, group_id: &str) -> usize {
        let Some(group) = registry.get_group(group_id) else {
            debug!(group = %group_id, "finish for unknown upload group");
            return 0;
        };

        let listener = self.slot.get();
        let mut delivered = 0;
        for transfer in group.transfers().iter() {
            if transfer.status() != UploadStatus::Complete {
                continue;
            }
            let Some(data) = transfer.take_data() else {
                continue;
            };
            if let Some(listener) = &listener {
                listener.upload_completed(uploaded_file(transfer, data));
                delivered += 1;
            }
        }

        registry.remove_group(group_id);
        info!(group = %group_id, delivered, "upload group finished");
        delivered
    }
}

fn uploaded_file(transfer: &Transfer, data: DataHandle) -> UploadedFile {
    UploadedFile {
        file_name: transfer.file_name(),
        content_type: transfer.content_type(),
        size: transfer.size().unwrap_or(0),
        data,
    }
}

/// Report for a transfer without an attached tracker: raw counts only.
fn basic_report(group: &TransferGroup, transfer: &Transfer) -> ProgressReport {
    let content_length = group.size().map_or(-1, |s| s as i64);
    let bytes_read = transfer.progress() as i64;
    let percent_completed = match content_length {
        -1 => -1.0,
        0 => 100.0,
        total => bytes_read as f64 / total as f64 * 100.0,
    };
    ProgressReport {
        bytes_read,
        content_length,
        percent_completed,
        transfer_rate: -1,
        estimated_time_left: -1,
    }
}

impl ProcessListener for UploadListenerBridge {
    fn upload_started(&self, event: &GroupEvent<'_>) {
        if let (Some(listener), Some(transfer)) = (self.slot.get(), event.transfer) {
            listener.upload_started(transfer.file_name().as_deref());
        }
    }

    fn upload_progressed(&self, event: &GroupEvent<'_>) {
        if let (Some(listener), Some(transfer)) = (self.slot.get(), event.transfer) {
            let report = transfer
                .progress_report()
                .unwrap_or_else(|| basic_report(event.group, transfer));
            listener.upload_progressed(&report);
        }
    }

    fn upload_canceled(&self, _event: &GroupEvent<'_>) {
        if let Some(listener) = self.slot.get() {
            listener.upload_canceled();
        }
    }

    fn upload_failed(&self, _event: &GroupEvent<'_>, reason: FailureReason) {
        if let Some(listener) = self.slot.get() {
            listener.upload_failed(reason);
        }
    }
}
