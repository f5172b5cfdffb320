//! Abstraction over a parsed multipart request.
//!
//! The receiver does not parse HTTP bodies itself. A [`PartSource`] hands out
//! parts one at a time, each with a reader over its body.

use std::collections::VecDeque;
use std::io::{self, Read};

/// One part of a multipart request.
pub struct Part<'a> {
    pub field_name: String,
    /// Client-supplied file name; `None` for plain form fields.
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub body: Box<dyn Read + 'a>,
}

impl Part<'_> {
    pub fn is_form_field(&self) -> bool {
        self.file_name.is_none()
    }
}

impl std::fmt::Debug for Part<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Part")
            .field("field_name", &self.field_name)
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Sequential access to the parts of one request.
pub trait PartSource {
    /// Declared length of the whole request body, if known.
    fn content_length(&self) -> Option<u64>;

    /// Next part, or `None` at the end of the request. Any unread body of
    /// the previous part is skipped.
    fn next_part(&mut self) -> io::Result<Option<Part<'_>>>;
}

/// Strips any directory component from a client-supplied file name.
///
/// Browsers on Windows may send the full local path, so both separators are
/// honoured.
pub fn base_file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

#[derive(Debug, Clone)]
struct BufferedPart {
    field_name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    body: Vec<u8>,
}

/// A [`PartSource`] over parts already held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPartSource {
    parts: VecDeque<BufferedPart>,
    body_total: u64,
    /// Explicit declared length; `None` means "sum of all bodies".
    declared: Option<Option<u64>>,
    current: Option<BufferedPart>,
}

impl MemoryPartSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file part.
    pub fn file(
        self,
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: Option<&str>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        self.push(BufferedPart {
            field_name: field_name.into(),
            file_name: Some(file_name.into()),
            content_type: content_type.map(str::to_string),
            body: body.into(),
        })
    }

    /// Adds a plain form field.
    pub fn field(self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.push(BufferedPart {
            field_name: name.into(),
            file_name: None,
            content_type: None,
            body: value.into(),
        })
    }

    /// Overrides the declared request length, `None` for unknown. By default
    /// it is the sum of all part bodies.
    pub fn with_content_length(mut self, content_length: Option<u64>) -> Self {
        self.declared = Some(content_length);
        self
    }

    fn push(mut self, part: BufferedPart) -> Self {
        self.body_total += part.body.len() as u64;
        self.parts.push_back(part);
        self
    }
}

impl PartSource for MemoryPartSource {
    fn content_length(&self) -> Option<u64> {
        self.declared.unwrap_or(Some(self.body_total))
    }

    fn next_part(&mut self) -> io::Result<Option<Part<'_>>> {
        self.current = self.parts.pop_front();
        Ok(self.current.as_ref().map(|p| Part {
            field_name: p.field_name.clone(),
            file_name: p.file_name.clone(),
            content_type: p.content_type.clone(),
            body: Box::new(p.body.as_slice()),
        }))
    }
}
