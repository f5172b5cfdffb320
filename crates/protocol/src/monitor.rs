//! Polling and control messages for in-flight upload groups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced while decoding monitor requests.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown monitor command: {0}")]
    UnknownCommand(String),
}

/// Answer to a status poll for an upload group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    /// No group with the requested id exists (never created, or already
    /// cleaned up after completion).
    UnknownId,
    /// The whole group was canceled.
    Canceled,
    /// No file in the group is still in progress.
    Complete,
    /// At least one file is still moving. `total` is `None` until the
    /// declared request size is known.
    #[serde(rename_all = "camelCase")]
    InProgress {
        transferred: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },
}

/// Control command carried by a monitor request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorCommand {
    Cancel,
}

impl MonitorCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorCommand::Cancel => "cancel",
        }
    }
}

impl fmt::Display for MonitorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(MonitorCommand::Cancel),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}
