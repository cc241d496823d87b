//! Page and parser caches
//!
//! The page cache holds recently extracted page payloads under a TTL so a
//! reader flipping back and forth never re-extracts a page it just saw. The
//! parser cache holds live parsers per archive identity so a container is
//! opened (and, for RAR, staged) once per reading session. Both are the only
//! shared mutable structures in the engine; all mutation goes through their
//! internal locks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::archive::{Archive, ArchiveIdentity};
use crate::error::Result;

/// Cache key for one extracted page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PageKey {
    pub identity: ArchiveIdentity,
    pub index: usize,
}

struct CachedPage {
    data: Arc<Vec<u8>>,
    inserted_at: Instant,
}

/// TTL-bounded store of extracted page payloads.
///
/// Payloads are shared out as `Arc` clones, so bytes a consumer is still
/// reading stay valid regardless of expiry or eviction. A racing `put` on
/// the same key replaces the prior entry; the old payload is released when
/// its last reader drops it.
pub(crate) struct PageCache {
    entries: Mutex<HashMap<PageKey, CachedPage>>,
    ttl: Duration,
    max_entries: usize,
    max_page_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageCache {
    pub fn new(ttl: Duration, max_entries: usize, max_page_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
            max_page_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a page. An entry whose TTL has elapsed counts as a miss and
    /// is removed on the spot.
    pub fn get(&self, key: &PageKey) -> Option<Arc<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(page) if page.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(page.data.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Presence check that does not touch the hit/miss counters. Used by
    /// preload tasks to skip pages that are already warm.
    pub fn contains(&self, key: &PageKey) -> bool {
        let entries = self.entries.lock();
        entries
            .get(key)
            .is_some_and(|page| page.inserted_at.elapsed() < self.ttl)
    }

    /// Insert a payload. Oversized payloads are rejected so a handful of
    /// huge pages cannot blow the cache's memory footprint.
    pub fn put(&self, key: PageKey, data: Arc<Vec<u8>>) {
        if data.len() as u64 > self.max_page_bytes {
            tracing::debug!(
                "Not caching page {} of {}: {} bytes exceeds cache ceiling",
                key.index,
                key.identity,
                data.len()
            );
            return;
        }
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            CachedPage {
                data,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries, then evict oldest-first down to the entry cap.
    /// Returns (expired, evicted) for logging.
    pub fn sweep(&self) -> (usize, usize) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, page| page.inserted_at.elapsed() < self.ttl);
        let expired = before - entries.len();

        let mut evicted = 0;
        while entries.len() > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, page)| page.inserted_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        (expired, evicted)
    }

    /// Drop every page belonging to one archive.
    pub fn remove_archive(&self, identity: &ArchiveIdentity) {
        let mut entries = self.entries.lock();
        entries.retain(|key, _| key.identity != *identity);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// One archive identity's lifecycle slot.
///
/// An empty cell in the map is `Initializing`; `Ok` is `Ready`; `Err` is
/// `Closed` with the stored fatal error. Everyone racing on the same
/// identity awaits the same cell and observes the same terminal value;
/// nothing retries until the identity is evicted.
type ParserSlot = Arc<OnceCell<Result<Arc<dyn Archive>>>>;

/// Identity-keyed store of live parsers. No TTL: archives are revisited
/// across a whole reading session, so parsers live until explicit cleanup
/// or eviction.
pub(crate) struct ParserCache {
    parsers: Mutex<HashMap<ArchiveIdentity, ParserSlot>>,
}

impl ParserCache {
    pub fn new() -> Self {
        Self {
            parsers: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached parser for `identity`, constructing it via
    /// `factory` exactly once across all concurrent callers.
    pub async fn get_or_create<F, Fut>(
        &self,
        identity: &ArchiveIdentity,
        factory: F,
    ) -> Result<Arc<dyn Archive>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Archive>>>,
    {
        let slot = {
            let mut parsers = self.parsers.lock();
            parsers
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        slot.get_or_init(|| async move { factory().await })
            .await
            .clone()
    }

    /// The ready parser for `identity`, if initialization has completed
    /// successfully.
    pub fn get_ready(&self, identity: &ArchiveIdentity) -> Option<Arc<dyn Archive>> {
        let parsers = self.parsers.lock();
        parsers
            .get(identity)
            .and_then(|slot| slot.get())
            .and_then(|result| result.as_ref().ok().cloned())
    }

    /// Remove one identity, returning its parser (if ready) for closing.
    /// A removed identity starts fresh on the next open.
    pub fn remove(&self, identity: &ArchiveIdentity) -> Option<Arc<dyn Archive>> {
        let slot = self.parsers.lock().remove(identity)?;
        slot.get().and_then(|result| result.as_ref().ok().cloned())
    }

    /// Remove every identity sharing `path` (a file that changed on disk
    /// leaves its stale identity behind; eviction clears both generations).
    pub fn remove_matching(
        &self,
        path: &std::path::Path,
    ) -> Vec<(ArchiveIdentity, Option<Arc<dyn Archive>>)> {
        let mut parsers = self.parsers.lock();
        let keys: Vec<ArchiveIdentity> = parsers
            .keys()
            .filter(|identity| identity.path == path)
            .cloned()
            .collect();
        keys.into_iter()
            .map(|identity| {
                let parser = parsers
                    .remove(&identity)
                    .and_then(|slot| slot.get().and_then(|r| r.as_ref().ok().cloned()));
                (identity, parser)
            })
            .collect()
    }

    /// Remove everything, returning the ready parsers for closing.
    pub fn drain(&self) -> Vec<Arc<dyn Archive>> {
        let mut parsers = self.parsers.lock();
        parsers
            .drain()
            .filter_map(|(_, slot)| slot.get().and_then(|r| r.as_ref().ok().cloned()))
            .collect()
    }

    /// (total slots, ready parsers).
    pub fn counts(&self) -> (usize, usize) {
        let parsers = self.parsers.lock();
        let cached = parsers.len();
        let ready = parsers
            .values()
            .filter(|slot| slot.get().is_some_and(|r| r.is_ok()))
            .count();
        (cached, ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::testing::MemoryArchive;
    use crate::error::CbxError;
    use std::path::PathBuf;

    fn identity(tag: u64) -> ArchiveIdentity {
        ArchiveIdentity {
            path: PathBuf::from(format!("/comics/{}.cbz", tag)),
            size: tag,
            modified_ms: tag,
        }
    }

    fn key(tag: u64, index: usize) -> PageKey {
        PageKey {
            identity: identity(tag),
            index,
        }
    }

    fn payload(bytes: &[u8]) -> Arc<Vec<u8>> {
        Arc::new(bytes.to_vec())
    }

    #[test]
    fn get_counts_hits_and_misses() {
        let cache = PageCache::new(Duration::from_secs(60), 10, 1024);
        assert!(cache.get(&key(1, 0)).is_none());
        cache.put(key(1, 0), payload(b"page"));
        assert_eq!(cache.get(&key(1, 0)).unwrap().as_slice(), b"page");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn expired_entries_read_as_misses_and_vanish() {
        let cache = PageCache::new(Duration::from_millis(30), 10, 1024);
        cache.put(key(1, 0), payload(b"page"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&key(1, 0)).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn contains_does_not_disturb_counters() {
        let cache = PageCache::new(Duration::from_secs(60), 10, 1024);
        cache.put(key(1, 0), payload(b"page"));
        assert!(cache.contains(&key(1, 0)));
        assert!(!cache.contains(&key(1, 1)));
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn oversized_payloads_are_not_cached() {
        let cache = PageCache::new(Duration::from_secs(60), 10, 4);
        cache.put(key(1, 0), payload(b"too large"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn last_put_wins() {
        let cache = PageCache::new(Duration::from_secs(60), 10, 1024);
        cache.put(key(1, 0), payload(b"first"));
        cache.put(key(1, 0), payload(b"second"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key(1, 0)).unwrap().as_slice(), b"second");
    }

    #[test]
    fn sweep_expires_then_evicts_oldest() {
        let cache = PageCache::new(Duration::from_secs(60), 2, 1024);
        cache.put(key(1, 0), payload(b"oldest"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put(key(1, 1), payload(b"middle"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put(key(1, 2), payload(b"newest"));

        let (expired, evicted) = cache.sweep();
        assert_eq!(expired, 0);
        assert_eq!(evicted, 1);
        assert!(!cache.contains(&key(1, 0)));
        assert!(cache.contains(&key(1, 1)));
        assert!(cache.contains(&key(1, 2)));
    }

    #[test]
    fn remove_archive_only_touches_that_identity() {
        let cache = PageCache::new(Duration::from_secs(60), 10, 1024);
        cache.put(key(1, 0), payload(b"a"));
        cache.put(key(2, 0), payload(b"b"));
        cache.remove_archive(&identity(1));
        assert!(!cache.contains(&key(1, 0)));
        assert!(cache.contains(&key(2, 0)));
    }

    fn memory_parser() -> Arc<dyn Archive> {
        Arc::new(MemoryArchive::new(vec![("1.jpg", b"one".as_slice())]))
    }

    #[tokio::test]
    async fn factory_runs_once_per_identity() {
        let cache = ParserCache::new();
        let id = identity(1);

        let first = cache
            .get_or_create(&id, || async { Ok(memory_parser()) })
            .await
            .unwrap();
        let second = cache
            .get_or_create(&id, || async {
                panic!("factory must not run for a cached identity")
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.counts(), (1, 1));
    }

    #[tokio::test]
    async fn failed_initialization_is_terminal_until_evicted() {
        let cache = ParserCache::new();
        let id = identity(1);

        let failed = cache
            .get_or_create(&id, || async {
                Err(CbxError::Archive("staging failed".to_string()))
            })
            .await;
        assert!(failed.is_err());

        // Later callers observe the stored error without re-running a factory.
        let replay = cache
            .get_or_create(&id, || async {
                panic!("failed identity must not retry automatically")
            })
            .await;
        assert!(matches!(replay, Err(CbxError::Archive(_))));
        assert_eq!(cache.counts(), (1, 0));

        // Eviction clears the terminal state and the identity opens fresh.
        assert!(cache.remove(&id).is_none());
        let retried = cache
            .get_or_create(&id, || async { Ok(memory_parser()) })
            .await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn drain_returns_ready_parsers() {
        let cache = ParserCache::new();
        for tag in 0..3 {
            cache
                .get_or_create(&identity(tag), || async { Ok(memory_parser()) })
                .await
                .unwrap();
        }
        let drained = cache.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(cache.counts(), (0, 0));
    }
}
