use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::group::TransferGroup;

/// Session-scoped store of upload groups keyed by id.
///
/// Each session owns one registry; nothing here is process-global.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    groups: RwLock<HashMap<String, Arc<TransferGroup>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the group for `id`, creating it on first reference.
    pub fn create_group(&self, id: &str) -> Arc<TransferGroup> {
        if let Some(group) = self.get_group(id) {
            return group;
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(groups.entry(id.to_string()).or_insert_with(|| {
            debug!(group = %id, "upload group created");
            Arc::new(TransferGroup::new(id))
        }))
    }

    pub fn get_group(&self, id: &str) -> Option<Arc<TransferGroup>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Removes and disposes the group. Returns `false` if the id was unknown.
    pub fn remove_group(&self, id: &str) -> bool {
        let removed = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(group) => {
                group.dispose();
                true
            }
            None => false,
        }
    }

    /// Ids of all live groups.
    pub fn group_ids(&self) -> Vec<String> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Generates a fresh random group id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
