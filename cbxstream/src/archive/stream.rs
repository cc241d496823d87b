//! Page byte streams
//!
//! A [`PageStream`] is what the engine hands a consumer for one page: either
//! a shared in-memory buffer (small entries, possibly straight from the page
//! cache) or a spilled scratch file (large entries). A spilled stream owns
//! its file and removes it on drop, including the early-drop and error
//! paths, so abandoned reads never leave files behind.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

/// Readable byte stream for exactly one page image.
pub struct PageStream {
    inner: StreamKind,
}

enum StreamKind {
    Memory {
        data: Arc<Vec<u8>>,
        pos: usize,
    },
    Spilled {
        file: Option<File>,
        path: PathBuf,
        len: u64,
    },
}

impl PageStream {
    pub(crate) fn from_bytes(data: Vec<u8>) -> Self {
        Self::from_shared(Arc::new(data))
    }

    pub(crate) fn from_shared(data: Arc<Vec<u8>>) -> Self {
        Self {
            inner: StreamKind::Memory { data, pos: 0 },
        }
    }

    /// Wrap a freshly written scratch file. The file is deleted when the
    /// stream drops; on open failure the caller still owns the path.
    pub(crate) fn from_spill(path: PathBuf) -> io::Result<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            inner: StreamKind::Spilled {
                file: Some(file),
                path,
                len,
            },
        })
    }

    /// Total payload size in bytes, independent of read progress.
    pub fn len(&self) -> u64 {
        match &self.inner {
            StreamKind::Memory { data, .. } => data.len() as u64,
            StreamKind::Spilled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shared buffer backing an in-memory stream, if any. Used by the
    /// manager to insert small extractions into the page cache without a
    /// copy; spilled streams are never cached.
    pub(crate) fn shared_bytes(&self) -> Option<Arc<Vec<u8>>> {
        match &self.inner {
            StreamKind::Memory { data, .. } => Some(data.clone()),
            StreamKind::Spilled { .. } => None,
        }
    }

    /// Drain the stream into a vector. Convenience for consumers that want
    /// the whole page at once.
    pub fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for PageStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            StreamKind::Memory { data, pos } => {
                let remaining = &data[*pos..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *pos += n;
                Ok(n)
            }
            StreamKind::Spilled { file, .. } => match file {
                Some(file) => file.read(buf),
                None => Ok(0),
            },
        }
    }
}

impl Drop for PageStream {
    fn drop(&mut self) {
        if let StreamKind::Spilled { file, path, .. } = &mut self.inner {
            // Close the handle before unlinking; required on Windows.
            file.take();
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove spilled page file {:?}: {}", path, e);
            } else {
                tracing::debug!("Removed spilled page file {:?}", path);
            }
        }
    }
}
