//! RAR/CBR parser
//!
//! The random-access-container variant. RAR entries cannot be seeked to by
//! name without walking the archive, and the source may be slow storage, so
//! the whole container is staged into scratch storage once before any entry
//! access. Staging is the expensive one-time cost the parser cache
//! amortizes; the staged copy is removed on `close()` and, as a backstop,
//! when the parser drops.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use unrar::Archive as UnrarArchive;

use super::sort::natural_cmp;
use super::stream::PageStream;
use super::{is_image_entry, Archive, ArchiveType, PageMetadata, ParserShared};
use crate::error::{CbxError, Result};
use crate::scratch::ScratchDir;

/// Copy granularity for the staging loop.
const STAGE_CHUNK_SIZE: usize = 1024 * 1024;

pub(crate) struct RarArchive {
    /// Path of the staged copy; `None` once closed.
    staged: Mutex<Option<PathBuf>>,
    shared: Arc<ParserShared>,
    pages: OnceCell<Arc<Vec<PageMetadata>>>,
}

/// Staged file that removes itself unless ownership is taken. Covers the
/// window between staging finishing on the blocking pool and the opener
/// still being around to receive it (the open may have timed out).
struct StagedFile {
    path: Option<PathBuf>,
}

impl StagedFile {
    fn into_path(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove unclaimed staged file {:?}: {}", path, e);
            }
        }
    }
}

impl RarArchive {
    /// Stage the archive and validate it. Fatal on failure: a RAR parser
    /// without a staged copy cannot serve anything.
    pub(crate) async fn open(path: &Path, shared: Arc<ParserShared>) -> Result<Self> {
        tracing::debug!("Opening RAR archive: {:?}", path);

        let source = path.to_path_buf();
        let dest = shared.scratch.unique_path("stage");
        let scratch = shared.scratch.clone();
        let staged = tokio::task::spawn_blocking(move || stage_archive(&source, &dest, &scratch))
            .await
            .map_err(|e| CbxError::Archive(format!("Staging task failed: {}", e)))??;

        Ok(Self {
            staged: Mutex::new(Some(staged.into_path())),
            shared,
            pages: OnceCell::new(),
        })
    }

    fn staged_path(&self) -> Option<PathBuf> {
        self.staged.lock().clone()
    }

    async fn pages(&self) -> Arc<Vec<PageMetadata>> {
        self.pages
            .get_or_init(|| {
                let staged = self.staged_path();
                let threshold = self.shared.large_page_threshold;
                async move {
                    let Some(staged) = staged else {
                        return Arc::new(Vec::new());
                    };
                    let scanned = staged.clone();
                    match tokio::task::spawn_blocking(move || {
                        enumerate_pages(&scanned, threshold)
                    })
                    .await
                    {
                        Ok(Ok(pages)) => {
                            tracing::debug!("RAR {:?}: {} pages", staged, pages.len());
                            Arc::new(pages)
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("RAR enumeration failed for {:?}: {}", staged, e);
                            Arc::new(Vec::new())
                        }
                        Err(e) => {
                            tracing::warn!("RAR enumeration task failed for {:?}: {}", staged, e);
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
impl Archive for RarArchive {
    fn archive_type(&self) -> ArchiveType {
        ArchiveType::Rar
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
        let Some(staged) = self.staged_path() else {
            tracing::debug!("Page stream requested on closed RAR parser");
            return None;
        };

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
        let spill = page
            .is_large
            .then(|| self.shared.scratch.unique_path("page"));

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            extract_entry(&staged, &page.name, spill.as_deref())
        })
        .await;

        match result {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                tracing::warn!("RAR extraction failed for page {}: {}", index, e);
                None
            }
            Err(e) => {
                tracing::warn!("RAR extraction task failed for page {}: {}", index, e);
                None
            }
        }
    }

    async fn close(&self) {
        let staged = self.staged.lock().take();
        if let Some(path) = staged {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed staged RAR file {:?}", path),
                Err(e) => tracing::warn!("Failed to remove staged RAR file {:?}: {}", path, e),
            }
        }
    }
}

impl Drop for RarArchive {
    fn drop(&mut self) {
        if let Some(path) = self.staged.lock().take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove staged RAR file {:?}: {}", path, e);
            }
        }
    }
}

/// Copy the source into scratch storage in fixed-size chunks, then validate
/// the copy by listing it. Checks free scratch space up front: staging plus
/// later spills must fit, so twice the source size is required.
fn stage_archive(source: &Path, dest: &Path, scratch: &ScratchDir) -> Result<StagedFile> {
    let source_size = std::fs::metadata(source)?.len();
    let needed = source_size.saturating_mul(2);
    if let Some(available) = scratch.available_space() {
        if available < needed {
            tracing::warn!(
                "Refusing to stage {:?}: {} bytes needed, {} available",
                source,
                needed,
                available
            );
            return Err(CbxError::ResourceExhausted { needed, available });
        }
    }

    let mut reader = File::open(source)?;
    if let Err(e) = copy_into(&mut reader, dest) {
        let _ = std::fs::remove_file(dest);
        return Err(e);
    }

    if let Err(e) = UnrarArchive::new(dest).open_for_listing() {
        let _ = std::fs::remove_file(dest);
        let message = format!("{:?}", e);
        if message.contains("Password") || message.contains("password") {
            tracing::info!("Skipping password-protected RAR archive: {:?}", source);
            return Err(CbxError::Archive(
                "Password-protected RAR archive (not supported)".to_string(),
            ));
        }
        return Err(CbxError::Archive(format!("Invalid RAR data: {:?}", e)));
    }

    tracing::debug!("Staged {} bytes from {:?} to {:?}", source_size, source, dest);
    Ok(StagedFile {
        path: Some(dest.to_path_buf()),
    })
}

fn copy_into(reader: &mut impl Read, dest: &Path) -> Result<()> {
    let mut out = File::create(dest)?;
    let mut buffer = vec![0u8; STAGE_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])?;
    }
    out.sync_all()?;
    Ok(())
}

fn enumerate_pages(staged: &Path, large_threshold: u64) -> Result<Vec<PageMetadata>> {
    let archive = UnrarArchive::new(staged)
        .open_for_listing()
        .map_err(|e| CbxError::Archive(format!("Failed to open RAR for listing: {:?}", e)))?;

    let mut pages = Vec::new();
    for entry_result in archive {
        let entry =
            entry_result.map_err(|e| CbxError::Archive(format!("RAR entry error: {:?}", e)))?;
        if entry.is_directory() {
            continue;
        }
        let name = entry.filename.to_string_lossy().into_owned();
        if !is_image_entry(&name) {
            continue;
        }
        pages.push(PageMetadata {
            name,
            size: entry.unpacked_size,
            compressed_size: 0,
            is_large: entry.unpacked_size >= large_threshold,
        });
    }

    pages.sort_by(|a, b| natural_cmp(&a.name, &b.name));
    Ok(pages)
}

/// Walk the processing cursor until the target entry, then read it to memory
/// or extract it to a spill file.
fn extract_entry(staged: &Path, name: &str, spill: Option<&Path>) -> Result<PageStream> {
    let mut archive = UnrarArchive::new(staged)
        .open_for_processing()
        .map_err(|e| CbxError::Archive(format!("Failed to open RAR for processing: {:?}", e)))?;

    loop {
        match archive.read_header() {
            Ok(Some(header)) => {
                let current = header.entry().filename.to_string_lossy().into_owned();
                if current == name {
                    return match spill {
                        Some(dest) => match header.extract_to(dest) {
                            Ok(_) => PageStream::from_spill(dest.to_path_buf()).map_err(|e| {
                                let _ = std::fs::remove_file(dest);
                                CbxError::from(e)
                            }),
                            Err(e) => {
                                let _ = std::fs::remove_file(dest);
                                Err(CbxError::Archive(format!(
                                    "Failed to extract RAR entry: {:?}",
                                    e
                                )))
                            }
                        },
                        None => {
                            let (data, _) = header.read().map_err(|e| {
                                CbxError::Archive(format!("Failed to extract RAR entry: {:?}", e))
                            })?;
                            Ok(PageStream::from_bytes(data))
                        }
                    };
                }
                archive = header
                    .skip()
                    .map_err(|e| CbxError::Archive(format!("Failed to skip RAR entry: {:?}", e)))?;
            }
            Ok(None) => break,
            Err(e) => {
                return Err(CbxError::Archive(format!(
                    "Failed to read RAR header: {:?}",
                    e
                )))
            }
        }
    }

    Err(CbxError::Archive(format!("Entry not found in RAR: {}", name)))
}
