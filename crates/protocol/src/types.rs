use serde::{Deserialize, Serialize};

/// Current state of a single uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "error_io")]
    ErrorIo,
    #[serde(rename = "error_oversize")]
    ErrorOversize,
}

impl UploadStatus {
    /// Returns `true` for every status other than [`UploadStatus::InProgress`].
    pub fn is_terminal(self) -> bool {
        !matches!(self, UploadStatus::InProgress)
    }

    /// Maps an error status to the failure reason reported to listeners.
    pub fn failure_reason(self) -> Option<FailureReason> {
        match self {
            UploadStatus::ErrorIo => Some(FailureReason::Io),
            UploadStatus::ErrorOversize => Some(FailureReason::Oversize),
            _ => None,
        }
    }
}

/// Why an upload failed. User cancellation is not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Io,
    Oversize,
}

/// Point-in-time view of a single upload's progress.
///
/// Every derived field uses `-1` for "unknown", mirroring the values the
/// client-side progress bar expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub bytes_read: i64,
    pub content_length: i64,
    pub percent_completed: f64,
    pub transfer_rate: i64,
    pub estimated_time_left: i64,
}

impl ProgressReport {
    /// Returns `true` if the total size of the upload is known.
    pub fn has_content_length(&self) -> bool {
        self.content_length >= 0
    }
}
