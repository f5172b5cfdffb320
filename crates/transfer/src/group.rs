//! A group of transfers submitted together, plus the listeners observing it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use echo_ft_protocol::{FailureReason, UploadStatus};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::progress::ProgressTracker;
use crate::types::{DataHandle, Transfer};

/// Notification passed to [`ProcessListener`] callbacks.
#[derive(Clone, Copy)]
pub struct GroupEvent<'a> {
    pub group: &'a TransferGroup,
    /// The transfer concerned; `None` for group-wide events such as cancel.
    pub transfer: Option<&'a Arc<Transfer>>,
}

/// Observer of a [`TransferGroup`].
///
/// Callbacks run outside of the group's lock, so they may call back into the
/// group. Events are delivered one at a time in the order they happened: on
/// the thread that caused them, or on whichever thread is already delivering
/// this group's events. A transfer that has ended gets no further progress
/// callbacks, even from an event queued before it ended.
pub trait ProcessListener: Send + Sync {
    fn upload_started(&self, _event: &GroupEvent<'_>) {}
    fn upload_progressed(&self, _event: &GroupEvent<'_>) {}
    fn upload_completed(&self, _event: &GroupEvent<'_>) {}
    fn upload_canceled(&self, _event: &GroupEvent<'_>) {}
    fn upload_failed(&self, _event: &GroupEvent<'_>, _reason: FailureReason) {}
}

/// Token returned by [`TransferGroup::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listeners = Vec<(ListenerId, Arc<dyn ProcessListener>)>;

enum Pending {
    Started(Arc<Transfer>),
    Progressed(Arc<Transfer>),
    Completed(Arc<Transfer>),
    Canceled,
    Failed(FailureReason),
}

#[derive(Default)]
struct Dispatch {
    queue: VecDeque<Pending>,
    running: bool,
}

#[derive(Default)]
struct GroupInner {
    declared_size: Option<u64>,
    transfers: Vec<Arc<Transfer>>,
    snapshot: Option<Arc<[Arc<Transfer>]>>,
    listeners: Listeners,
    next_listener: u64,
    disposed: bool,
}

/// Transfers belonging to one submission, identified by a caller-chosen id.
pub struct TransferGroup {
    id: String,
    inner: Mutex<GroupInner>,
    dispatch: Mutex<Dispatch>,
    canceled: AtomicBool,
}

impl TransferGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(GroupInner::default()),
            dispatch: Mutex::new(Dispatch::default()),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers a listener. Listeners are notified in registration order.
    pub fn add_listener(&self, listener: Arc<dyn ProcessListener>) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Removes a listener; returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    fn listeners(&self) -> Vec<Arc<dyn ProcessListener>> {
        self.lock().listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    /// Queues an event and delivers the queue unless another call is
    /// already doing so.
    fn notify(&self, pending: Pending) {
        {
            let mut dispatch = self.dispatch_lock();
            dispatch.queue.push_back(pending);
            if dispatch.running {
                return;
            }
            dispatch.running = true;
        }
        loop {
            let next = {
                let mut dispatch = self.dispatch_lock();
                match dispatch.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        dispatch.running = false;
                        return;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    fn deliver(&self, pending: &Pending) {
        let transfer = match pending {
            Pending::Started(t) | Pending::Progressed(t) | Pending::Completed(t) => Some(t),
            Pending::Canceled | Pending::Failed(_) => None,
        };
        let event = GroupEvent {
            group: self,
            transfer,
        };
        for listener in self.listeners() {
            match pending {
                Pending::Started(_) => listener.upload_started(&event),
                Pending::Progressed(t) => {
                    if !t.is_in_progress() {
                        return;
                    }
                    listener.upload_progressed(&event);
                }
                Pending::Completed(_) => listener.upload_completed(&event),
                Pending::Canceled => listener.upload_canceled(&event),
                Pending::Failed(reason) => listener.upload_failed(&event, *reason),
            }
        }
    }

    // ------------------------------------------------------------------
    // Transfer lifecycle
    // ------------------------------------------------------------------

    /// Appends a new in-progress transfer.
    pub fn create_transfer(&self) -> Result<Arc<Transfer>, TransferError> {
        let mut inner = self.lock();
        if inner.disposed {
            return Err(TransferError::GroupDisposed(self.id.clone()));
        }
        let transfer = Arc::new(Transfer::new(inner.transfers.len()));
        inner.transfers.push(Arc::clone(&transfer));
        inner.snapshot = None;
        debug!(group = %self.id, index = transfer.index(), "transfer created");
        Ok(transfer)
    }

    /// Sets file name and content type before any bytes move.
    pub fn configure(
        &self,
        transfer: &Transfer,
        content_type: Option<String>,
        file_name: Option<String>,
    ) {
        transfer.set_meta(file_name, content_type);
    }

    /// Attaches a progress tracker for rate/ETA reporting.
    pub fn track(&self, transfer: &Transfer, tracker: Arc<ProgressTracker>) {
        transfer.set_tracker(tracker);
    }

    pub fn start(&self, transfer: &Arc<Transfer>) {
        if !transfer.is_in_progress() {
            return;
        }
        debug!(
            group = %self.id,
            index = transfer.index(),
            file = ?transfer.file_name(),
            "upload started"
        );
        self.notify(Pending::Started(Arc::clone(transfer)));
    }

    /// Records progress and notifies listeners, unless the transfer has
    /// already reached a terminal status.
    pub fn progress(&self, transfer: &Arc<Transfer>, bytes_read: u64) {
        if transfer.set_progress(bytes_read) {
            self.notify(Pending::Progressed(Arc::clone(transfer)));
        }
    }

    /// Completes a transfer with its stored data.
    ///
    /// Returns `false` if the transfer had already ended; the data handle is
    /// dropped in that case and never reaches a listener.
    pub fn complete(&self, transfer: &Arc<Transfer>, data: Option<DataHandle>, size: u64) -> bool {
        if !transfer.complete(size, data) {
            debug!(
                group = %self.id,
                index = transfer.index(),
                status = ?transfer.status(),
                "late completion discarded"
            );
            return false;
        }
        debug!(group = %self.id, index = transfer.index(), size, "upload complete");
        self.notify(Pending::Completed(Arc::clone(transfer)));
        true
    }

    /// Cancels every in-progress transfer and the group itself.
    ///
    /// Does nothing on a disposed group.
    pub fn cancel(&self) {
        if self.is_disposed() {
            return;
        }
        self.canceled.store(true, Ordering::Release);
        let canceled = self
            .transfers()
            .iter()
            .filter(|t| t.cancel())
            .count();
        info!(group = %self.id, canceled, "upload group canceled");
        self.notify(Pending::Canceled);
    }

    /// Applies a terminal status to every transfer still in progress.
    ///
    /// Returns how many transfers changed. Error statuses also fire one
    /// `upload_failed` notification for the group.
    pub fn set_status(&self, status: UploadStatus) -> usize {
        if self.is_disposed() {
            return 0;
        }
        let changed = self
            .transfers()
            .iter()
            .filter(|t| t.transition(status))
            .count();

        if let Some(reason) = status.failure_reason() {
            if changed > 0 {
                warn!(group = %self.id, ?status, changed, "upload group failed");
                self.notify(Pending::Failed(reason));
            }
        }
        changed
    }

    // ------------------------------------------------------------------
    // Declared size
    // ------------------------------------------------------------------

    /// Sets the declared request size. Allowed once, and never on a disposed
    /// group.
    pub fn init(&self, size: i64) -> Result<(), TransferError> {
        let mut inner = self.lock();
        if inner.disposed {
            return Err(TransferError::GroupDisposed(self.id.clone()));
        }
        if inner.declared_size.is_some() {
            return Err(TransferError::AlreadyInitialized(self.id.clone()));
        }
        let size = u64::try_from(size).map_err(|_| TransferError::InvalidSize(size))?;
        inner.declared_size = Some(size);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().declared_size.is_some()
    }

    /// Declared request size, `None` until [`init`](Self::init).
    pub fn size(&self) -> Option<u64> {
        self.lock().declared_size
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Sum of member progress.
    pub fn progress_total(&self) -> u64 {
        self.transfers().iter().map(|t| t.progress()).sum()
    }

    /// `true` when no member is still in progress. An empty group is
    /// complete.
    pub fn is_complete(&self) -> bool {
        self.transfers().iter().all(|t| !t.is_in_progress())
    }

    /// Set only by [`cancel`](Self::cancel). Cancelling a single transfer
    /// leaves it untouched.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Point-in-time list of member transfers in creation order.
    pub fn transfers(&self) -> Arc<[Arc<Transfer>]> {
        let mut inner = self.lock();
        if let Some(snapshot) = &inner.snapshot {
            return Arc::clone(snapshot);
        }
        let snapshot: Arc<[Arc<Transfer>]> = inner.transfers.iter().cloned().collect();
        inner.snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub fn first_transfer(&self) -> Option<Arc<Transfer>> {
        self.transfer(0)
    }

    pub fn transfer(&self, index: usize) -> Option<Arc<Transfer>> {
        self.lock().transfers.get(index).cloned()
    }

    /// Clears all state. A disposed group refuses new transfers and
    /// initialization, and ignores cancel and bulk status changes.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        inner.declared_size = None;
        inner.transfers.clear();
        inner.snapshot = None;
        inner.listeners.clear();
        inner.disposed = true;
        debug!(group = %self.id, "upload group disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    fn lock(&self) -> MutexGuard<'_, GroupInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_lock(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TransferGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferGroup")
            .field("id", &self.id)
            .field("progress", &self.progress_total())
            .field("size", &self.size())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
