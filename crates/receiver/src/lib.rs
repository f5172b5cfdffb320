//! Server side of the file transfer components.
//!
//! [`UploadProcessor`] reads multipart requests into transfer groups, the
//! [`monitor`] functions answer client polls, and [`DownloadService`] serves
//! single-use downloads. Groups and download tickets live in session-scoped
//! stores owned by the caller.

mod config;
mod download;
mod listener;
pub mod monitor;
mod multipart;
mod processor;
mod spool;

pub use config::{
    ConfigError, DEFAULT_BANDWIDTH, DEFAULT_DISK_CACHE_THRESHOLD, DEFAULT_MAX_UPLOAD_SIZE,
    DEFAULT_PROGRESS_INTERVAL_MS, NO_SIZE_LIMIT, ReceiverConfig,
};
pub use download::{
    DEFAULT_CONTENT_TYPE, DownloadError, DownloadHeaders, DownloadService, PreparedDownload,
};
pub use listener::{ListenerSlot, UploadListener, UploadListenerBridge, UploadedFile};
pub use multipart::{MemoryPartSource, Part, PartSource, base_file_name};
pub use processor::{ProcessOutcome, UploadProcessor};
pub use spool::SpooledItem;

/// Errors produced by the receiver crate.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] echo_ft_transfer::TransferError),

    #[error("upload of {size} bytes exceeds limit of {limit} bytes")]
    Oversize { size: u64, limit: u64 },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("an upload listener is already registered")]
    ListenerAlreadySet,
}
