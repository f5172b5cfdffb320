use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::TransferError;
use crate::progress::ProgressTracker;

#[derive(Debug, Default)]
struct RenderInner {
    progress: HashMap<usize, Arc<ProgressTracker>>,
    max_upload_index: Option<usize>,
    ended: HashSet<usize>,
}

/// Per-group bookkeeping for the client-facing side: progress trackers keyed
/// by the caller's upload index, the highest index started so far, and the
/// set of indices that have finished.
#[derive(Debug, Default)]
pub struct RenderState {
    inner: RwLock<RenderInner>,
}

impl RenderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a progress tracker with an upload index.
    pub fn register_progress(
        &self,
        index: usize,
        tracker: Arc<ProgressTracker>,
    ) -> Result<(), TransferError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.progress.contains_key(&index) {
            return Err(TransferError::ProgressAlreadyRegistered(index));
        }
        inner.progress.insert(index, tracker);
        Ok(())
    }

    pub fn progress(&self, index: usize) -> Option<Arc<ProgressTracker>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .progress
            .get(&index)
            .cloned()
    }

    /// Records that the upload at `index` has started.
    pub fn upload_started(&self, index: usize) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.max_upload_index = Some(inner.max_upload_index.map_or(index, |m| m.max(index)));
    }

    /// Highest upload index started so far, `None` before the first.
    pub fn max_upload_index(&self) -> Option<usize> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .max_upload_index
    }

    /// Marks the upload at `index` as finished, whatever the outcome.
    pub fn upload_ended(&self, index: usize) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .ended
            .insert(index);
    }

    pub fn is_upload_ended(&self, index: usize) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ended
            .contains(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_progress_registration_rejected() {
        let state = RenderState::new();
        let first = Arc::new(ProgressTracker::new(10));
        state.register_progress(0, first.clone()).unwrap();

        let err = state
            .register_progress(0, Arc::new(ProgressTracker::new(20)))
            .unwrap_err();
        assert!(matches!(err, TransferError::ProgressAlreadyRegistered(0)));
        assert!(Arc::ptr_eq(&state.progress(0).unwrap(), &first));
        assert!(state.progress(1).is_none());
    }

    #[test]
    fn max_upload_index_tracks_highest_started() {
        let state = RenderState::new();
        assert_eq!(state.max_upload_index(), None);
        state.upload_started(2);
        state.upload_started(0);
        assert_eq!(state.max_upload_index(), Some(2));
        state.upload_started(5);
        assert_eq!(state.max_upload_index(), Some(5));
    }

    #[test]
    fn ended_indices() {
        let state = RenderState::new();
        assert!(!state.is_upload_ended(1));
        state.upload_ended(1);
        assert!(state.is_upload_ended(1));
        assert!(!state.is_upload_ended(0));
    }
}
