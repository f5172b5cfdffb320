//! Wire types shared between the upload receiver and its clients.
//!
//! The polling endpoint, the per-upload progress service and the download
//! service all speak in terms of these types. They serialize to JSON with
//! camelCase field names.

pub mod monitor;
pub mod types;

// Re-export primary types for convenience.
pub use monitor::{MonitorCommand, PollStatus, ProtocolError};
pub use types::{FailureReason, ProgressReport, UploadStatus};
