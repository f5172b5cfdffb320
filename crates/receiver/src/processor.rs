//! Turns a multipart upload request into transfers on a group.

use std::cell::Cell;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use echo_ft_protocol::{FailureReason, UploadStatus};
use echo_ft_transfer::{
    BandwidthAllocator, Clock, CopyTracker, GroupEvent, ProcessListener, ProgressTracker,
    RenderState, Transfer, TransferGroup, system_clock,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ReceiverError;
use crate::config::ReceiverConfig;
use crate::multipart::{PartSource, base_file_name};
use crate::spool::SpooledItem;

/// How processing of one request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Every part was read; `files` transfers completed.
    Completed { files: usize },
    /// The group was canceled while the request was being read.
    Canceled { files: usize },
    /// The request failed; every unfinished transfer carries the matching
    /// error status.
    Failed { reason: FailureReason },
}

/// Request body grew past the configured limit.
#[derive(Debug, thiserror::Error)]
#[error("request exceeds size limit of {limit} bytes")]
struct SizeLimitExceeded {
    limit: u64,
}

/// Reader that fails once the whole request has produced more than `limit`
/// bytes.
struct LimitedReader<'a, R: ?Sized> {
    inner: &'a mut R,
    consumed: &'a Cell<u64>,
    limit: Option<u64>,
}

impl<R: Read + ?Sized> Read for LimitedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let consumed = self.consumed.get() + n as u64;
        self.consumed.set(consumed);
        match self.limit {
            Some(limit) if consumed > limit => Err(io::Error::other(SizeLimitExceeded { limit })),
            _ => Ok(n),
        }
    }
}

fn as_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn as_size_limit(err: &io::Error) -> Option<u64> {
    err.get_ref()
        .and_then(|e| e.downcast_ref::<SizeLimitExceeded>())
        .map(|e| e.limit)
}

/// Aborts the running request when its group is canceled.
struct CancelWatcher {
    token: CancellationToken,
}

impl ProcessListener for CancelWatcher {
    fn upload_canceled(&self, _event: &GroupEvent<'_>) {
        self.token.cancel();
    }
}

/// Copy observer for one part: feeds the request's tracker on every buffer
/// and the group at most once per progress interval.
struct PartProgress<'a> {
    group: &'a TransferGroup,
    transfer: &'a Arc<Transfer>,
    tracker: &'a ProgressTracker,
    /// Bytes read from the whole request so far.
    consumed: &'a Cell<u64>,
    abort: &'a CancellationToken,
    clock: &'a dyn Clock,
    interval: Duration,
    next_report: Cell<Duration>,
}

impl CopyTracker for PartProgress<'_> {
    fn bytes_transferred(&self, total: u64) {
        self.tracker.observe_bytes_read(as_i64(self.consumed.get()));
        let now = self.clock.now();
        if now >= self.next_report.get() {
            self.group.progress(self.transfer, total);
            self.next_report.set(now + self.interval);
        }
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_cancelled() || !self.transfer.is_in_progress()
    }
}

/// Receives upload requests into transfer groups.
///
/// All processors built from the same allocator share one bandwidth budget.
#[derive(Debug)]
pub struct UploadProcessor {
    config: ReceiverConfig,
    allocator: Arc<BandwidthAllocator>,
    clock: Arc<dyn Clock>,
}

impl UploadProcessor {
    /// Creates a processor with its own allocator, throttled per
    /// `config.bandwidth`.
    pub fn new(config: ReceiverConfig) -> Self {
        let processor = Self::with_allocator(config, Arc::new(BandwidthAllocator::unthrottled()));
        processor.set_bandwidth(processor.config.bandwidth);
        processor
    }

    /// Creates a processor sharing an existing allocator. The allocator's
    /// settings are left as they are.
    pub fn with_allocator(config: ReceiverConfig, allocator: Arc<BandwidthAllocator>) -> Self {
        Self {
            config,
            allocator,
            clock: system_clock(),
        }
    }

    /// Replaces the clock used for progress pacing and rate sampling.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<BandwidthAllocator> {
        &self.allocator
    }

    /// Sets the global cap in bytes per second; `0` turns throttling off.
    pub fn set_bandwidth(&self, bytes_per_second: u64) {
        if bytes_per_second == 0 {
            self.allocator.set_throttling(false);
        } else {
            self.allocator.set_bandwidth(bytes_per_second);
            self.allocator.set_throttling(true);
        }
        debug!(bytes_per_second, "upload bandwidth set");
    }

    /// Current cap, `0` when throttling is off.
    pub fn bandwidth(&self) -> u64 {
        if self.allocator.is_throttling() {
            self.allocator.bandwidth()
        } else {
            0
        }
    }

    /// Reads every part of `source` into transfers on `group`.
    ///
    /// I/O and size-limit failures are reported through the outcome and the
    /// group's statuses, never as `Err`. `Err` means the group itself could
    /// not be used (e.g. it was disposed).
    ///
    /// Progress rate and ETA are tracked for the request as a whole. When
    /// `render` is given, the request's tracker is registered there under
    /// each file's position among the request's file parts.
    pub fn process(
        &self,
        group: &TransferGroup,
        source: &mut dyn PartSource,
        render: Option<&RenderState>,
    ) -> Result<ProcessOutcome, ReceiverError> {
        let abort = CancellationToken::new();
        let watcher = group.add_listener(Arc::new(CancelWatcher {
            token: abort.clone(),
        }));
        info!(
            group = %group.id(),
            declared = ?source.content_length(),
            "processing upload request"
        );

        let mut run = RequestRun {
            processor: self,
            group,
            render,
            abort: &abort,
            current: None,
            created: false,
            files: 0,
        };
        let result = run.read_parts(source);
        let current = run.current.take();
        let created = run.created;
        let files = run.files;
        group.remove_listener(watcher);

        let failure = match result {
            Ok(()) if abort.is_cancelled() || group.is_canceled() => {
                info!(group = %group.id(), files, "upload request canceled");
                return Ok(ProcessOutcome::Canceled { files });
            }
            Ok(()) => {
                info!(group = %group.id(), files, "upload request complete");
                return Ok(ProcessOutcome::Completed { files });
            }
            Err(ReceiverError::Oversize { size, limit }) => {
                warn!(group = %group.id(), size, limit, "upload request too large");
                UploadStatus::ErrorOversize
            }
            Err(ReceiverError::Io(e)) => match as_size_limit(&e) {
                Some(limit) => {
                    warn!(group = %group.id(), limit, "upload request exceeded size limit");
                    UploadStatus::ErrorOversize
                }
                None => {
                    warn!(group = %group.id(), error = %e, "upload request failed");
                    UploadStatus::ErrorIo
                }
            },
            Err(e) => return Err(e),
        };

        if let (Some(render), Some((index, _))) = (render, &current) {
            render.upload_ended(*index);
        }
        if !created {
            // Failed before any file part: give listeners a transfer carrying the status.
            group.create_transfer()?;
        }
        group.set_status(failure);

        let reason = failure
            .failure_reason()
            .unwrap_or(FailureReason::Io);
        Ok(ProcessOutcome::Failed { reason })
    }
}

/// State of one `process` call.
struct RequestRun<'a> {
    processor: &'a UploadProcessor,
    group: &'a TransferGroup,
    render: Option<&'a RenderState>,
    abort: &'a CancellationToken,
    /// File part being copied, with its upload index.
    current: Option<(usize, Arc<Transfer>)>,
    /// Whether any transfer was created for this request.
    created: bool,
    files: usize,
}

impl RequestRun<'_> {
    fn read_parts(&mut self, source: &mut dyn PartSource) -> Result<(), ReceiverError> {
        let config = &self.processor.config;
        let limit = config.upload_size_limit();
        let declared = source.content_length();

        if let Some(size) = declared {
            if !self.group.is_initialized() {
                if let Err(e) = self.group.init(as_i64(size)) {
                    debug!(group = %self.group.id(), error = %e, "declared size not recorded");
                }
            }
            if let Some(limit) = limit {
                if size > limit {
                    return Err(ReceiverError::Oversize { size, limit });
                }
            }
        }

        // One tracker per request: every file part reports the request's
        // byte count against its declared length.
        let tracker = Arc::new(ProgressTracker::with_clock(
            declared.map_or(-1, as_i64),
            Arc::clone(&self.processor.clock),
        ));
        let consumed = Cell::new(0u64);
        let mut upload_index = 0usize;

        while !self.abort.is_cancelled() {
            let Some(mut part) = source.next_part()? else {
                break;
            };
            let mut body = LimitedReader {
                inner: &mut part.body,
                consumed: &consumed,
                limit,
            };

            if part.file_name.is_none() {
                io::copy(&mut body, &mut io::sink())?;
                tracker.observe_bytes_read(as_i64(consumed.get()));
                continue;
            }

            let transfer = self.group.create_transfer()?;
            self.created = true;
            self.current = Some((upload_index, Arc::clone(&transfer)));
            let file_name = part.file_name.as_deref().map(|n| base_file_name(n).to_string());
            self.group
                .configure(&transfer, part.content_type.clone(), file_name);

            self.group.track(&transfer, Arc::clone(&tracker));
            if let Some(render) = self.render {
                render.upload_started(upload_index);
                if let Err(e) = render.register_progress(upload_index, Arc::clone(&tracker)) {
                    warn!(group = %self.group.id(), error = %e, "progress tracker not registered");
                }
            }

            self.group.start(&transfer);
            if transfer.is_in_progress() {
                self.copy_part(&transfer, &tracker, &consumed, &mut body)?;
            }

            if let Some(render) = self.render {
                render.upload_ended(upload_index);
            }
            self.current = None;
            upload_index += 1;
        }
        tracker.set_bytes_read(as_i64(consumed.get()));
        Ok(())
    }

    fn copy_part(
        &mut self,
        transfer: &Arc<Transfer>,
        tracker: &ProgressTracker,
        consumed: &Cell<u64>,
        body: &mut dyn Read,
    ) -> Result<(), ReceiverError> {
        let config = &self.processor.config;
        let mut item =
            SpooledItem::new(config.disk_cache_threshold(), config.disk_cache_location());
        let progress = PartProgress {
            group: self.group,
            transfer,
            tracker,
            consumed,
            abort: self.abort,
            clock: self.processor.clock.as_ref(),
            interval: config.progress_interval(),
            next_report: Cell::new(Duration::ZERO),
        };

        let outcome = self.processor.allocator.copy(&progress, body, &mut item)?;
        if outcome.is_aborted() {
            debug!(
                group = %self.group.id(),
                index = transfer.index(),
                bytes = outcome.bytes(),
                "upload aborted"
            );
            return Ok(());
        }

        tracker.set_bytes_read(as_i64(consumed.get()));
        self.group.progress(transfer, outcome.bytes());
        let (data, size) = item.finish()?;
        if self.group.complete(transfer, Some(data), size) {
            self.files += 1;
        }
        Ok(())
    }
}
