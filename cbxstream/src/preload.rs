//! Preload scheduling
//!
//! Speculative background extraction of pages the reader is about to want.
//! Batch preload warms a contiguous range as a page listing is consumed;
//! smart preload warms the neighborhood of the current page, forward pages
//! first since readers predominantly advance. Only the newest task per
//! (archive, policy) matters: scheduling replaces and aborts the previous
//! one, and abort lands between extractions, never mid-extraction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::archive::{Archive, ArchiveIdentity};
use crate::cache::{PageCache, PageKey};

/// Preload policy, part of the task key. Batch tasks carry their range's
/// start so consuming a listing batch by batch stacks up preloads instead
/// of each batch cancelling the previous one; only re-requesting the same
/// range replaces a batch task. Smart tasks are one-per-archive: only the
/// newest cursor position matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PreloadKind {
    Batch { start: usize },
    Smart,
}

pub(crate) struct Preloader {
    tasks: Mutex<HashMap<(ArchiveIdentity, PreloadKind), JoinHandle<()>>>,
}

impl Preloader {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start a preload over `indices`, cancelling any prior task for the
    /// same (archive, policy) key.
    pub fn schedule(
        &self,
        identity: ArchiveIdentity,
        kind: PreloadKind,
        parser: Arc<dyn Archive>,
        cache: Arc<PageCache>,
        indices: Vec<usize>,
        delay: Duration,
    ) {
        if indices.is_empty() {
            return;
        }
        let key = (identity.clone(), kind);
        let handle = tokio::spawn(preload_worker(identity, parser, cache, indices, delay));

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        if let Some(previous) = tasks.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel outstanding tasks for one archive, both policies.
    pub fn cancel_for(&self, identity: &ArchiveIdentity) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(task_identity, _), task| {
            if task_identity == identity {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    /// Cancel everything. Abort is cooperative: a task mid-extraction lets
    /// that one extraction finish on the blocking pool, then stops.
    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub fn active_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }
}

/// Extraction order for a smart preload around `current`: forward pages out
/// to the radius, then backward pages.
pub(crate) fn smart_order(current: usize, radius: usize, total: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(radius * 2);
    for offset in 1..=radius {
        let index = current + offset;
        if index < total {
            order.push(index);
        }
    }
    for offset in 1..=radius {
        if let Some(index) = current.checked_sub(offset) {
            order.push(index);
        }
    }
    order
}

async fn preload_worker(
    identity: ArchiveIdentity,
    parser: Arc<dyn Archive>,
    cache: Arc<PageCache>,
    indices: Vec<usize>,
    delay: Duration,
) {
    for index in indices {
        let key = PageKey {
            identity: identity.clone(),
            index,
        };
        if cache.contains(&key) {
            continue;
        }
        // Pause between extractions so preloads never starve foreground
        // reads; also the cooperative cancellation point.
        tokio::time::sleep(delay).await;

        match parser.page_stream(index).await {
            Some(stream) => {
                if let Some(bytes) = stream.shared_bytes() {
                    cache.put(key, bytes);
                }
                // Spilled streams drop here and delete their scratch file;
                // only in-memory payloads are worth keeping warm.
            }
            None => {
                tracing::debug!("Preload skipped page {} of {}", index, identity);
            }
        }
    }
}
