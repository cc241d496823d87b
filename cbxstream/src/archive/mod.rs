//! Archive parsing
//!
//! One parser per opened archive. The streaming container (ZIP/CBZ) re-opens
//! its source per read; the random-access container (RAR/CBR) is staged to
//! scratch storage once and read from there. Both enumerate their image
//! entries a single time, sort them naturally, and serve pages by index off
//! that frozen list.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use crate::error::{CbxError, Result};
use crate::limiter::Limiter;
use crate::scratch::ScratchDir;

mod rar;
pub mod sort;
pub mod stream;
mod zip;

use stream::PageStream;

/// Entry extensions treated as pages.
const IMAGE_EXTENSIONS: &[&str] = &["bmp", "gif", "jpe", "jpeg", "jpg", "png", "webp"];

pub(crate) fn is_image_entry(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|s| s.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Archive container kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    Rar,
}

impl ArchiveType {
    /// Detect archive type from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "zip" | "cbz" | "epub" => Some(Self::Zip),
            "rar" | "cbr" => Some(Self::Rar),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "ZIP",
            Self::Rar => "RAR",
        }
    }
}

/// Stable key for one archive instance.
///
/// Location plus size plus mtime: two different files, or the same file
/// after it changed on disk, never share an identity, so caches keyed by it
/// never alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub modified_ms: u64,
}

impl ArchiveIdentity {
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified_ms,
        })
    }
}

impl fmt::Display for ArchiveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            self.path.display(),
            self.size,
            self.modified_ms
        )
    }
}

/// Per-entry description recorded once during enumeration.
#[derive(Debug, Clone)]
pub struct PageMetadata {
    /// Normalized entry path inside the archive.
    pub name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Compressed size in bytes; 0 when the container does not report one.
    pub compressed_size: u64,
    /// Whether extraction spills to a scratch file instead of memory.
    pub is_large: bool,
}

/// State shared by every parser a manager constructs.
pub(crate) struct ParserShared {
    pub scratch: Arc<ScratchDir>,
    pub extract_limiter: Arc<Limiter>,
    pub large_page_threshold: u64,
    pub max_entry_size: u64,
}

/// One opened archive.
///
/// Page indices refer to the naturally sorted image-entry list, frozen after
/// the first enumeration. All methods degrade rather than fail: a parser
/// whose enumeration failed reports zero pages, and a page that cannot be
/// extracted yields `None` rather than an error.
#[async_trait]
pub trait Archive: Send + Sync {
    fn archive_type(&self) -> ArchiveType;

    /// Number of image pages. Enumerates on first call, memoized afterward.
    async fn page_count(&self) -> usize;

    /// Sorted page names; index positions are stable for the parser's life.
    async fn page_names(&self) -> Vec<String>;

    async fn page_metadata(&self, index: usize) -> Option<PageMetadata>;

    /// Uncompressed page size; 0 when out of range or unknown.
    async fn page_size(&self, index: usize) -> u64;

    /// Extract one page. `None` for out-of-range indices and extraction
    /// failures (logged, never thrown).
    async fn page_stream(&self, index: usize) -> Option<PageStream>;

    /// Stream the cover page, chosen by [`sort::select_cover`].
    async fn cover_stream(&self) -> Option<PageStream> {
        let names = self.page_names().await;
        let cover = sort::select_cover(&names)?.to_string();
        let index = names.iter().position(|name| *name == cover)?;
        self.page_stream(index).await
    }

    /// Release staged files and handles. Idempotent.
    async fn close(&self);
}

/// Open the parser matching `path`'s extension.
pub(crate) async fn open_archive(
    path: &Path,
    shared: Arc<ParserShared>,
) -> Result<Arc<dyn Archive>> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or(CbxError::InvalidPath)?;

    let archive_type = ArchiveType::from_extension(extension)
        .ok_or_else(|| CbxError::Unsupported(extension.to_string()))?;

    match archive_type {
        ArchiveType::Zip => {
            let path = path.to_path_buf();
            let parser = tokio::task::spawn_blocking(move || zip::ZipArchive::open(&path, shared))
                .await
                .map_err(|e| CbxError::Archive(format!("Archive open task failed: {}", e)))??;
            Ok(Arc::new(parser) as Arc<dyn Archive>)
        }
        ArchiveType::Rar => {
            let parser = rar::RarArchive::open(path, shared).await?;
            Ok(Arc::new(parser) as Arc<dyn Archive>)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_extension_filter() {
        assert!(is_image_entry("page1.jpg"));
        assert!(is_image_entry("PAGE2.PNG"));
        assert!(is_image_entry("art/03.webp"));
        assert!(is_image_entry("scan.JPEG"));
        assert!(!is_image_entry("readme.txt"));
        assert!(!is_image_entry("thumbs.db"));
        assert!(!is_image_entry("noextension"));
    }

    #[test]
    fn archive_type_detection() {
        assert_eq!(ArchiveType::from_extension("cbz"), Some(ArchiveType::Zip));
        assert_eq!(ArchiveType::from_extension("ZIP"), Some(ArchiveType::Zip));
        assert_eq!(ArchiveType::from_extension("cbr"), Some(ArchiveType::Rar));
        assert_eq!(ArchiveType::from_extension("Rar"), Some(ArchiveType::Rar));
        assert_eq!(ArchiveType::from_extension("7z"), None);
        assert_eq!(ArchiveType::from_extension("txt"), None);
    }

    #[test]
    fn identity_distinguishes_changed_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("comic.cbz");
        std::fs::write(&path, b"first").unwrap();
        let before = ArchiveIdentity::from_path(&path).unwrap();
        std::fs::write(&path, b"second contents").unwrap();
        let after = ArchiveIdentity::from_path(&path).unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn cover_stream_uses_selector() {
        let parser = testing::MemoryArchive::new(vec![
            ("001.jpg", b"first".as_slice()),
            ("Cover.jpg", b"the cover".as_slice()),
        ]);
        let stream = parser.cover_stream().await.unwrap();
        assert_eq!(stream.read_to_vec().unwrap(), b"the cover");
    }
}
