use std::fs::File;
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use echo_ft_transfer::DataHandle;
use tracing::debug;

enum Spool {
    Memory(Vec<u8>),
    Disk(File),
}

/// Storage for one uploaded file: memory until the threshold is crossed,
/// then an anonymous temp file in the disk cache directory.
///
/// The temp file has no name on disk and disappears once the last handle to
/// it is dropped.
pub struct SpooledItem {
    threshold: usize,
    dir: PathBuf,
    spool: Spool,
    size: u64,
}

impl SpooledItem {
    pub fn new(threshold: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            threshold,
            dir: dir.into(),
            spool: Spool::Memory(Vec::new()),
            size: 0,
        }
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.spool, Spool::Memory(_))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Finalizes storage and returns a reader positioned at the start.
    pub fn finish(self) -> io::Result<(DataHandle, u64)> {
        let size = self.size;
        let handle: DataHandle = match self.spool {
            Spool::Memory(buf) => Box::new(Cursor::new(buf)),
            Spool::Disk(mut file) => {
                file.flush()?;
                file.seek(SeekFrom::Start(0))?;
                Box::new(file)
            }
        };
        Ok((handle, size))
    }

    fn spill(&mut self, pending: usize) -> io::Result<()> {
        let Spool::Memory(buf) = &self.spool else {
            return Ok(());
        };
        if buf.len() + pending <= self.threshold {
            return Ok(());
        }
        let mut file = tempfile::tempfile_in(&self.dir)?;
        file.write_all(buf)?;
        debug!(dir = %self.dir.display(), buffered = buf.len(), "spooling upload to disk");
        self.spool = Spool::Disk(file);
        Ok(())
    }
}

impl Write for SpooledItem {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.spill(data.len())?;
        let n = match &mut self.spool {
            Spool::Memory(buf) => {
                buf.extend_from_slice(data);
                data.len()
            }
            Spool::Disk(file) => file.write(data)?,
        };
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.spool {
            Spool::Memory(_) => Ok(()),
            Spool::Disk(file) => file.flush(),
        }
    }
}

impl std::fmt::Debug for SpooledItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpooledItem")
            .field("size", &self.size)
            .field("in_memory", &self.is_in_memory())
            .finish()
    }
}
