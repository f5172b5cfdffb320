//! Single-use download tickets.
//!
//! A provider is registered once and handed out once: redeeming a ticket
//! removes it from the store and the ticket is consumed by value when served.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Source of a file offered for download.
pub trait DownloadProvider: Send {
    /// MIME type, `None` for the generic binary type.
    fn content_type(&self) -> Option<&str>;

    /// Name suggested to the client.
    fn file_name(&self) -> Option<&str> {
        None
    }

    /// Size in bytes, if known.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Streams the file contents.
    fn write_to(&mut self, out: &mut dyn Write) -> io::Result<()>;
}

/// A registered download, usable exactly once.
pub struct DownloadTicket {
    id: String,
    provider: Box<dyn DownloadProvider>,
}

impl DownloadTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> &dyn DownloadProvider {
        self.provider.as_ref()
    }

    /// Consumes the ticket, yielding its provider.
    pub fn into_provider(self) -> Box<dyn DownloadProvider> {
        self.provider
    }
}

impl fmt::Debug for DownloadTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTicket")
            .field("id", &self.id)
            .field("file_name", &self.provider.file_name())
            .finish()
    }
}

/// Session-scoped store of pending download tickets.
#[derive(Default)]
pub struct DownloadTickets {
    tickets: Mutex<HashMap<String, DownloadTicket>>,
}

impl DownloadTickets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider and returns the id under which it can be
    /// redeemed.
    pub fn issue(&self, provider: Box<dyn DownloadProvider>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        debug!(ticket = %id, file = ?provider.file_name(), "download ticket issued");
        self.lock().insert(
            id.clone(),
            DownloadTicket {
                id: id.clone(),
                provider,
            },
        );
        id
    }

    /// Removes and returns the ticket. A second redeem of the same id
    /// returns `None`.
    pub fn redeem(&self, id: &str) -> Option<DownloadTicket> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DownloadTicket>> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DownloadTickets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTickets")
            .field("pending", &self.len())
            .finish()
    }
}

/// Download served from a byte buffer.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDownload {
    data: Vec<u8>,
    content_type: Option<String>,
    file_name: Option<String>,
}

impl InMemoryDownload {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

impl DownloadProvider for InMemoryDownload {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn write_to(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(&self.data)
    }
}
