//! Polling endpoints: group status/cancel and per-upload progress.

use echo_ft_protocol::{MonitorCommand, PollStatus, ProgressReport};
use echo_ft_transfer::{RenderState, TransferGroup, TransferRegistry};
use tracing::{debug, warn};

use crate::listener::UploadListener;

/// Answers a monitor request for group `pid`, applying `command` first.
///
/// Unknown or missing ids report [`PollStatus::UnknownId`]; unknown commands
/// are ignored.
pub fn process_request(
    registry: &TransferRegistry,
    pid: Option<&str>,
    command: Option<&str>,
) -> PollStatus {
    let Some(group) = pid.and_then(|id| registry.get_group(id)) else {
        debug!(pid = ?pid, "poll for unknown upload group");
        return PollStatus::UnknownId;
    };

    if let Some(command) = command {
        match command.parse::<MonitorCommand>() {
            Ok(MonitorCommand::Cancel) => group.cancel(),
            Err(e) => warn!(group = %group.id(), error = %e, "ignoring monitor command"),
        }
    }

    poll_group(&group)
}

/// Current status of a group.
///
/// A group whose files were canceled one by one still reports `Complete`;
/// only a group-wide cancel reports `Canceled`.
pub fn poll_group(group: &TransferGroup) -> PollStatus {
    if group.is_canceled() {
        PollStatus::Canceled
    } else if group.is_complete() {
        PollStatus::Complete
    } else {
        PollStatus::InProgress {
            transferred: group.progress_total(),
            total: group.size(),
        }
    }
}

/// Progress of the upload at `index`.
///
/// Returns `None` until the upload has read any bytes. While the upload is
/// still running the listener, if any, is told about the report too.
pub fn progress_report(
    render: &RenderState,
    index: usize,
    listener: Option<&dyn UploadListener>,
) -> Option<ProgressReport> {
    let tracker = render.progress(index)?;
    if tracker.bytes_read() <= 0 {
        return None;
    }
    let report = tracker.snapshot();
    if !render.is_upload_ended(index) {
        if let Some(listener) = listener {
            listener.upload_progressed(&report);
        }
    }
    Some(report)
}
