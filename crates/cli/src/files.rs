//! Local files as upload parts, and a directory as the upload sink.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use echo_ft_protocol::{FailureReason, ProgressReport};
use echo_ft_receiver::{Part, PartSource, UploadListener, UploadedFile, base_file_name};
use tracing::{debug, error, info, warn};

/// Presents a list of local files as the file parts of one request.
#[derive(Debug)]
pub struct FilePartSource {
    files: Vec<PathBuf>,
    next: usize,
    total: u64,
}

impl FilePartSource {
    /// Stats every file up front so the request has a declared length.
    pub fn new(files: Vec<PathBuf>) -> io::Result<Self> {
        let mut total = 0;
        for path in &files {
            total += fs::metadata(path)?.len();
        }
        Ok(Self {
            files,
            next: 0,
            total,
        })
    }
}

impl PartSource for FilePartSource {
    fn content_length(&self) -> Option<u64> {
        Some(self.total)
    }

    fn next_part(&mut self) -> io::Result<Option<Part<'_>>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let file = File::open(path)?;
        debug!(path = %path.display(), "opening upload part");
        Ok(Some(Part {
            field_name: "file".into(),
            file_name: Some(path.to_string_lossy().into_owned()),
            content_type: None,
            body: Box::new(file),
        }))
    }
}

/// Writes completed uploads into a directory.
#[derive(Debug)]
pub struct DirectoryWriter {
    dest: PathBuf,
    written: AtomicUsize,
    errors: AtomicUsize,
}

impl DirectoryWriter {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            written: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Acquire)
    }

    fn store(&self, name: &str, file: &mut UploadedFile) -> io::Result<PathBuf> {
        let target = target_path(&self.dest, name);
        let mut out = File::create(&target)?;
        io::copy(&mut file.data, &mut out)?;
        Ok(target)
    }
}

fn target_path(dest: &Path, name: &str) -> PathBuf {
    let name = base_file_name(name);
    dest.join(if name.is_empty() { "upload.bin" } else { name })
}

impl UploadListener for DirectoryWriter {
    fn upload_started(&self, file_name: Option<&str>) {
        info!(file = file_name.unwrap_or("?"), "upload started");
    }

    fn upload_progressed(&self, report: &ProgressReport) {
        debug!(
            bytes = report.bytes_read,
            rate = report.transfer_rate,
            eta = report.estimated_time_left,
            "upload progress"
        );
    }

    fn upload_canceled(&self) {
        warn!("upload canceled");
    }

    fn upload_completed(&self, mut file: UploadedFile) {
        let name = file.file_name.clone().unwrap_or_default();
        match self.store(&name, &mut file) {
            Ok(path) => {
                self.written.fetch_add(1, Ordering::AcqRel);
                info!(path = %path.display(), size = file.size, "upload stored");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::AcqRel);
                error!(file = %name, error = %e, "failed to store upload");
            }
        }
    }

    fn upload_failed(&self, reason: FailureReason) {
        error!(?reason, "upload failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    #[test]
    fn source_declares_total_and_yields_files() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("b.txt");
        fs::write(&a, "alpha").unwrap();
        fs::write(&b, "be").unwrap();

        let mut source = FilePartSource::new(vec![a.clone(), b]).unwrap();
        assert_eq!(source.content_length(), Some(7));

        {
            let mut part = source.next_part().unwrap().unwrap();
            assert_eq!(part.file_name.as_deref(), a.to_str());
            let mut body = String::new();
            part.body.read_to_string(&mut body).unwrap();
            assert_eq!(body, "alpha");
        }
        assert!(source.next_part().unwrap().is_some());
        assert!(source.next_part().unwrap().is_none());
    }

    #[test]
    fn missing_file_fails_up_front() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(FilePartSource::new(vec![tmp.path().join("missing")]).is_err());
    }

    #[test]
    fn writer_stores_under_base_name() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DirectoryWriter::new(tmp.path());
        writer.upload_completed(UploadedFile {
            file_name: Some("/elsewhere/c.txt".into()),
            content_type: None,
            size: 3,
            data: Box::new(Cursor::new(b"see".to_vec())),
        });

        assert_eq!(writer.written(), 1);
        assert_eq!(fs::read(tmp.path().join("c.txt")).unwrap(), b"see");
    }

    #[test]
    fn writer_counts_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = DirectoryWriter::new(tmp.path().join("no-such-dir"));
        writer.upload_completed(UploadedFile {
            file_name: Some("d.txt".into()),
            content_type: None,
            size: 1,
            data: Box::new(Cursor::new(b"d".to_vec())),
        });
        assert_eq!(writer.errors(), 1);
        assert_eq!(writer.written(), 0);
    }

    #[test]
    fn empty_name_gets_fallback() {
        assert_eq!(target_path(Path::new("/out"), "dir/"), Path::new("/out/upload.bin"));
    }
}
