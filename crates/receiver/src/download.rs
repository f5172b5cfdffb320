//! Serves registered downloads, each at most once.

use std::io::{self, Write};
use std::sync::Arc;

use echo_ft_transfer::{DownloadProvider, DownloadTicket, DownloadTickets};
use tracing::{debug, warn};

/// Content type used when the provider does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors returned to a download request. All of them map to a client
/// error response except [`DownloadError::Io`].
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download id not specified")]
    MissingId,

    #[error("download id is not valid: {0}")]
    UnknownTicket(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    /// `true` if the request itself was at fault.
    pub fn is_bad_request(&self) -> bool {
        !matches!(self, DownloadError::Io(_))
    }
}

/// Response headers for a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadHeaders {
    pub content_disposition: String,
    /// Present only for a known, non-zero size.
    pub content_length: Option<u64>,
    pub content_type: String,
}

impl DownloadHeaders {
    pub fn for_provider(provider: &dyn DownloadProvider) -> Self {
        let content_disposition = match provider.file_name() {
            Some(name) => format!("attachment; filename=\"{}\"", name.replace('"', "\\\"")),
            None => "attachment".to_string(),
        };
        Self {
            content_disposition,
            content_length: provider.size().filter(|&s| s > 0),
            content_type: provider
                .content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
        }
    }

    /// Header name/value pairs in emission order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("Content-Type", self.content_type.clone()),
            ("Content-Disposition", self.content_disposition.clone()),
        ];
        if let Some(len) = self.content_length {
            pairs.push(("Content-Length", len.to_string()));
        }
        pairs
    }
}

/// A redeemed download: headers are ready, the body has not been written.
#[derive(Debug)]
pub struct PreparedDownload {
    pub headers: DownloadHeaders,
    ticket: DownloadTicket,
}

impl PreparedDownload {
    /// Streams the body, consuming the download.
    pub fn write_body(self, out: &mut dyn Write) -> Result<(), DownloadError> {
        let id = self.ticket.id().to_string();
        let mut provider = self.ticket.into_provider();
        provider.write_to(out).inspect_err(|e| {
            warn!(ticket = %id, error = %e, "download failed");
        })?;
        out.flush()?;
        debug!(ticket = %id, "download served");
        Ok(())
    }
}

/// Download endpoint backed by a session's ticket store.
#[derive(Debug, Clone)]
pub struct DownloadService {
    tickets: Arc<DownloadTickets>,
}

impl DownloadService {
    pub fn new(tickets: Arc<DownloadTickets>) -> Self {
        Self { tickets }
    }

    /// Registers a download and returns its id.
    pub fn offer(&self, provider: Box<dyn DownloadProvider>) -> String {
        self.tickets.issue(provider)
    }

    /// Redeems the ticket for `id` and computes the response headers.
    pub fn prepare(&self, id: Option<&str>) -> Result<PreparedDownload, DownloadError> {
        let id = id.ok_or(DownloadError::MissingId)?;
        let ticket = self
            .tickets
            .redeem(id)
            .ok_or_else(|| DownloadError::UnknownTicket(id.to_string()))?;
        Ok(PreparedDownload {
            headers: DownloadHeaders::for_provider(ticket.provider()),
            ticket,
        })
    }

    /// Redeems the ticket and writes the body to `out`.
    pub fn serve(
        &self,
        id: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<DownloadHeaders, DownloadError> {
        let prepared = self.prepare(id)?;
        let headers = prepared.headers.clone();
        prepared.write_body(out)?;
        Ok(headers)
    }
}
