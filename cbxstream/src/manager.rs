//! Archive manager façade
//!
//! One manager instance owns every shared structure in the engine: the
//! parser cache, the page cache, the two concurrency limiters, the preload
//! scheduler and the periodic cache sweep. Construct it once at application
//! start, inject it into consumers, and call [`ArchiveManager::cleanup`]
//! exactly once at shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::archive::stream::PageStream;
use crate::archive::{open_archive, Archive, ArchiveIdentity, PageMetadata, ParserShared};
use crate::cache::{PageCache, PageKey, ParserCache};
use crate::config::EngineConfig;
use crate::error::{CbxError, Result};
use crate::limiter::Limiter;
use crate::preload::{smart_order, PreloadKind, Preloader};
use crate::scratch::ScratchDir;

/// One batch of a paged listing.
#[derive(Debug, Clone)]
pub struct PageBatch {
    pub pages: Vec<PageMetadata>,
    pub start_index: usize,
    pub total_pages: usize,
}

/// Read-only snapshot of engine counters.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    /// Parsers that finished initialization and are serving pages.
    pub active_parsers: usize,
    /// Identities tracked by the parser cache, pending and failed included.
    pub cached_parsers: usize,
    pub cached_pages: usize,
    pub page_hits: u64,
    pub page_misses: u64,
    pub hit_ratio: f64,
}

pub struct ArchiveManager {
    config: EngineConfig,
    shared: Arc<ParserShared>,
    init_limiter: Arc<Limiter>,
    parsers: ParserCache,
    pages: Arc<PageCache>,
    preloader: Preloader,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl ArchiveManager {
    /// Set up the engine: create the scratch directory, sweep files a prior
    /// crash may have orphaned there, and start the periodic cache sweep.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let scratch = Arc::new(ScratchDir::create(config.scratch_dir.clone())?);
        let removed = scratch.sweep_orphans();
        if removed > 0 {
            tracing::info!("Removed {} orphaned scratch files", removed);
        }

        let pages = Arc::new(PageCache::new(
            config.page_cache_ttl,
            config.page_cache_max_entries,
            config.cacheable_page_max_bytes,
        ));
        let shared = Arc::new(ParserShared {
            scratch,
            extract_limiter: Arc::new(Limiter::new(config.max_concurrent_extractions)),
            large_page_threshold: config.large_page_threshold,
            max_entry_size: config.max_entry_size,
        });

        let sweep_task = tokio::spawn(sweep_loop(pages.clone(), config.sweep_interval));

        Ok(Self {
            init_limiter: Arc::new(Limiter::new(config.max_concurrent_parsers)),
            config,
            shared,
            parsers: ParserCache::new(),
            pages,
            preloader: Preloader::new(),
            sweep_task: Mutex::new(Some(sweep_task)),
        })
    }

    /// The live parser for `path`, opening (and for RAR, staging) the
    /// archive if this is its first access. Initialization failures are
    /// terminal for the identity: every caller, now and later, gets the
    /// same error until [`ArchiveManager::evict_parser`] clears it.
    pub async fn get_parser(&self, path: &Path) -> Result<Arc<dyn Archive>> {
        let identity = ArchiveIdentity::from_path(path)?;
        self.parser_for(&identity).await
    }

    async fn parser_for(&self, identity: &ArchiveIdentity) -> Result<Arc<dyn Archive>> {
        let shared = self.shared.clone();
        let init_limiter = self.init_limiter.clone();
        let init_timeout = self.config.init_timeout;
        let path = identity.path.clone();

        self.parsers
            .get_or_create(identity, || async move {
                let _permit = init_limiter.acquire().await;
                match tokio::time::timeout(init_timeout, open_archive(&path, shared)).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!("Archive initialization timed out: {:?}", path);
                        Err(CbxError::InitTimeout(init_timeout))
                    }
                }
            })
            .await
    }

    /// Stream one page's bytes, cache-first. `None` means the page is
    /// unavailable (bad index, failed extraction, failed parser), never a
    /// fatal condition. Every call re-centers the smart preload on `index`.
    pub async fn get_page_stream(&self, path: &Path, index: usize) -> Option<PageStream> {
        let identity = match ArchiveIdentity::from_path(path) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("Cannot identify archive {:?}: {}", path, e);
                return None;
            }
        };
        let key = PageKey {
            identity: identity.clone(),
            index,
        };

        if let Some(bytes) = self.pages.get(&key) {
            tracing::debug!("Page cache hit for page {} of {}", index, identity);
            if let Some(parser) = self.parsers.get_ready(&identity) {
                self.schedule_smart(&identity, parser, index).await;
            }
            return Some(PageStream::from_shared(bytes));
        }

        let parser = match self.parser_for(&identity).await {
            Ok(parser) => parser,
            Err(e) => {
                tracing::warn!("Parser unavailable for {}: {}", identity, e);
                return None;
            }
        };

        let stream = parser.page_stream(index).await?;
        if let Some(bytes) = stream.shared_bytes() {
            self.pages.put(key, bytes);
        }
        self.schedule_smart(&identity, parser, index).await;
        Some(stream)
    }

    /// Lazily page through an archive's metadata in batches of `batch_size`
    /// pages, starting at `start_index`. Each yielded batch triggers a batch
    /// preload for its range. The sequence is finite and single-pass; call
    /// again with a new start index to restart.
    pub fn load_page_range(
        &self,
        path: &Path,
        batch_size: usize,
        start_index: usize,
    ) -> impl Stream<Item = PageBatch> + '_ {
        let path = path.to_path_buf();
        stream! {
            let identity = match ArchiveIdentity::from_path(&path) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!("Cannot identify archive {:?}: {}", path, e);
                    return;
                }
            };
            let parser = match self.parser_for(&identity).await {
                Ok(parser) => parser,
                Err(e) => {
                    tracing::warn!("Parser unavailable for {}: {}", identity, e);
                    return;
                }
            };

            let total = parser.page_count().await;
            let batch_size = batch_size.max(1);
            let mut start = start_index;
            while start < total {
                let end = (start + batch_size).min(total);
                let mut pages = Vec::with_capacity(end - start);
                for index in start..end {
                    if let Some(meta) = parser.page_metadata(index).await {
                        pages.push(meta);
                    }
                }
                self.preloader.schedule(
                    identity.clone(),
                    PreloadKind::Batch { start },
                    parser.clone(),
                    self.pages.clone(),
                    (start..end).collect(),
                    self.config.batch_preload_delay,
                );
                yield PageBatch {
                    pages,
                    start_index: start,
                    total_pages: total,
                };
                start = end;
            }
        }
    }

    /// Close and forget every cached state for `path`, stale generations
    /// included. The next access opens the archive fresh; this is also how
    /// an identity stuck on a fatal initialization error becomes retryable.
    pub async fn evict_parser(&self, path: &Path) {
        for (identity, parser) in self.parsers.remove_matching(path) {
            self.preloader.cancel_for(&identity);
            self.pages.remove_archive(&identity);
            if let Some(parser) = parser {
                parser.close().await;
            }
            tracing::debug!("Evicted archive {}", identity);
        }
    }

    /// Counter snapshot; safe to call concurrently with everything else.
    pub fn performance_stats(&self) -> EngineStats {
        let (cached_parsers, active_parsers) = self.parsers.counts();
        let page_hits = self.pages.hits();
        let page_misses = self.pages.misses();
        let lookups = page_hits + page_misses;
        EngineStats {
            active_parsers,
            cached_parsers,
            cached_pages: self.pages.len(),
            page_hits,
            page_misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                page_hits as f64 / lookups as f64
            },
        }
    }

    /// Shut the engine down: cancel preloads, stop the sweep, close every
    /// parser, release every cached page. Call exactly once at shutdown.
    pub async fn cleanup(&self) {
        tracing::info!("Shutting down archive manager");
        self.preloader.cancel_all();
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
        for parser in self.parsers.drain() {
            parser.close().await;
        }
        self.pages.clear();
    }

    async fn schedule_smart(
        &self,
        identity: &ArchiveIdentity,
        parser: Arc<dyn Archive>,
        center: usize,
    ) {
        let total = parser.page_count().await;
        let order = smart_order(center, self.config.preload_radius, total);
        if order.is_empty() {
            return;
        }
        self.preloader.schedule(
            identity.clone(),
            PreloadKind::Smart,
            parser,
            self.pages.clone(),
            order,
            self.config.smart_preload_delay,
        );
    }
}

async fn sweep_loop(pages: Arc<PageCache>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let (expired, evicted) = pages.sweep();
        if expired + evicted > 0 {
            tracing::debug!(
                "Page cache sweep: {} expired, {} evicted, {} remain",
                expired,
                evicted,
                pages.len()
            );
        }
    }
}
