//! ZIP/CBZ parser
//!
//! The streaming-container variant: holds nothing but the source path and
//! the memoized page list, and re-opens the file for every read. The central
//! directory makes the per-read lookup cheap, so there is no staged copy and
//! `close()` has no resources to release.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;
use zip::ZipArchive as ZipReader;

use super::sort::natural_cmp;
use super::stream::PageStream;
use super::{is_image_entry, Archive, ArchiveType, PageMetadata, ParserShared};
use crate::error::{CbxError, Result};

pub(crate) struct ZipArchive {
    path: PathBuf,
    shared: Arc<ParserShared>,
    pages: OnceCell<Arc<Vec<PageMetadata>>>,
    closed: AtomicBool,
}

impl ZipArchive {
    /// Open and validate the container. Cheap: reads the central directory
    /// once and keeps no handle.
    pub(crate) fn open(path: &Path, shared: Arc<ParserShared>) -> Result<Self> {
        tracing::debug!("Opening ZIP archive: {:?}", path);

        let file = File::open(path)
            .map_err(|e| CbxError::Archive(format!("Failed to open ZIP file: {}", e)))?;
        ZipReader::new(BufReader::new(file))
            .map_err(|e| CbxError::Archive(format!("Invalid ZIP archive: {}", e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            shared,
            pages: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn pages(&self) -> Arc<Vec<PageMetadata>> {
        self.pages
            .get_or_init(|| {
                let path = self.path.clone();
                let threshold = self.shared.large_page_threshold;
                async move {
                    let scanned = path.clone();
                    match tokio::task::spawn_blocking(move || enumerate_pages(&scanned, threshold))
                        .await
                    {
                        Ok(Ok(pages)) => {
                            tracing::debug!("ZIP {:?}: {} pages", path, pages.len());
                            Arc::new(pages)
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("ZIP enumeration failed for {:?}: {}", path, e);
                            Arc::new(Vec::new())
                        }
                        Err(e) => {
                            tracing::warn!("ZIP enumeration task failed for {:?}: {}", path, e);
                            Arc::new(Vec::new())
                        }
                    }
                }
            })
            .await
            .clone()
    }
}

#[async_trait::async_trait]
impl Archive for ZipArchive {
    fn archive_type(&self) -> ArchiveType {
        ArchiveType::Zip
    }

    async fn page_count(&self) -> usize {
        self.pages().await.len()
    }

    async fn page_names(&self) -> Vec<String> {
        self.pages().await.iter().map(|p| p.name.clone()).collect()
    }

    async fn page_metadata(&self, index: usize) -> Option<PageMetadata> {
        self.pages().await.get(index).cloned()
    }

    async fn page_size(&self, index: usize) -> u64 {
        self.pages().await.get(index).map(|p| p.size).unwrap_or(0)
    }

    async fn page_stream(&self, index: usize) -> Option<PageStream> {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!("Page stream requested on closed ZIP parser");
            return None;
        }

        let pages = self.pages().await;
        let page = pages.get(index)?.clone();
        if page.size > self.shared.max_entry_size {
            tracing::warn!(
                "Entry too large: {} is {} bytes (max {})",
                page.name,
                page.size,
                self.shared.max_entry_size
            );
            return None;
        }

        let permit = self.shared.extract_limiter.acquire().await;
        let path = self.path.clone();
        let spill = page
            .is_large
            .then(|| self.shared.scratch.unique_path("page"));

        let result = tokio::task::spawn_blocking(move || {
            // Hold the permit for the whole blocking extraction.
            let _permit = permit;
            extract_entry(&path, &page.name, spill.as_deref())
        })
        .await;

        match result {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                tracing::warn!("ZIP extraction failed for page {}: {}", index, e);
                None
            }
            Err(e) => {
                tracing::warn!("ZIP extraction task failed for page {}: {}", index, e);
                None
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn enumerate_pages(path: &Path, large_threshold: u64) -> Result<Vec<PageMetadata>> {
    let file = File::open(path)?;
    let mut archive = ZipReader::new(BufReader::new(file))
        .map_err(|e| CbxError::Archive(format!("Invalid ZIP archive: {}", e)))?;

    let mut pages = Vec::new();
    for i in 0..archive.len() {
        let entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable ZIP entry {}: {}", i, e);
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let name = decode_entry_name(entry.name_raw(), entry.name());
        if !is_image_entry(&name) {
            continue;
        }
        pages.push(PageMetadata {
            name,
            size: entry.size(),
            compressed_size: entry.compressed_size(),
            is_large: entry.size() >= large_threshold,
        });
    }

    pages.sort_by(|a, b| natural_cmp(&a.name, &b.name));
    Ok(pages)
}

/// Normalize an entry name's text encoding.
///
/// Names flagged as UTF-8 (or that happen to be valid UTF-8) pass through.
/// Legacy archives commonly carry Shift_JIS names; when those bytes decode
/// cleanly we prefer that reading over the container library's CP437
/// fallback.
fn decode_entry_name(raw: &[u8], fallback: &str) -> String {
    if let Ok(name) = std::str::from_utf8(raw) {
        return name.to_string();
    }
    let (decoded, _, had_errors) = encoding_rs::SHIFT_JIS.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }
    fallback.to_string()
}

fn extract_entry(path: &Path, name: &str, spill: Option<&Path>) -> Result<PageStream> {
    let file = File::open(path)?;
    let mut archive = ZipReader::new(BufReader::new(file))
        .map_err(|e| CbxError::Archive(format!("Invalid ZIP archive: {}", e)))?;

    // Entries are recorded under their repaired names, which the container
    // library's own name index does not know; resolve by index instead.
    let index = locate_entry(&mut archive, name)?;
    let mut entry = archive
        .by_index(index)
        .map_err(|e| CbxError::Archive(format!("Entry not found: {}", e)))?;

    match spill {
        Some(dest) => match write_spill(&mut entry, dest) {
            Ok(()) => PageStream::from_spill(dest.to_path_buf()).map_err(|e| {
                let _ = std::fs::remove_file(dest);
                CbxError::from(e)
            }),
            Err(e) => {
                let _ = std::fs::remove_file(dest);
                Err(e)
            }
        },
        None => {
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut buffer)
                .map_err(|e| CbxError::Archive(format!("Failed to extract entry: {}", e)))?;
            Ok(PageStream::from_bytes(buffer))
        }
    }
}

/// Find the index whose repaired name matches `name`, the inverse of the
/// normalization applied during enumeration.
fn locate_entry(archive: &mut ZipReader<BufReader<File>>, name: &str) -> Result<usize> {
    for i in 0..archive.len() {
        let entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if decode_entry_name(entry.name_raw(), entry.name()) == name {
            return Ok(i);
        }
    }
    Err(CbxError::Archive(format!("Entry not found: {}", name)))
}

fn write_spill(entry: &mut impl Read, dest: &Path) -> Result<()> {
    let mut out = File::create(dest)?;
    io::copy(entry, &mut out)
        .map_err(|e| CbxError::Archive(format!("Failed to extract entry: {}", e)))?;
    out.sync_all()?;
    Ok(())
}
