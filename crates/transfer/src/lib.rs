//! Upload state tracking, progress estimation and bandwidth-throttled
//! stream copying.

mod bandwidth;
mod clock;
mod download;
mod group;
mod progress;
mod registry;
mod render;
mod types;

pub use bandwidth::{
    BUFFER_SIZE, BandwidthAllocator, CopyOutcome, CopyTracker, DEFAULT_BANDWIDTH,
    DEFAULT_INTERVAL, RETRY_DELAY,
};
pub use clock::{Clock, ManualClock, SystemClock, system_clock};
pub use download::{DownloadProvider, DownloadTicket, DownloadTickets, InMemoryDownload};
pub use group::{GroupEvent, ListenerId, ProcessListener, TransferGroup};
pub use progress::{MAX_SAMPLES, ProgressTracker, SAMPLE_BYTE_INTERVAL, SAMPLE_INTERVAL};
pub use registry::{TransferRegistry, generate_id};
pub use render::RenderState;
pub use types::{DataHandle, Transfer};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload group already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("invalid upload size: {0}")]
    InvalidSize(i64),

    #[error("invalid bandwidth: {0} bytes/s")]
    InvalidBandwidth(u64),

    #[error("upload group disposed: {0}")]
    GroupDisposed(String),

    #[error("progress already registered for upload index {0}")]
    ProgressAlreadyRegistered(usize),
}
