//! Engine configuration
//!
//! Every tunable the engine exposes to embedders. Thresholds such as the
//! large-page spill point and the cache TTL are deliberately configuration,
//! not contract; the defaults here match a typical reading session.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration surface for [`crate::ArchiveManager`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many archive open/staging operations may run at once.
    pub max_concurrent_parsers: usize,
    /// How many page extractions may run at once.
    pub max_concurrent_extractions: usize,
    /// Pages prefetched in each direction around the current page.
    pub preload_radius: usize,
    /// Upper bound on cached page entries after a sweep.
    pub page_cache_max_entries: usize,
    /// How long a cached page stays valid.
    pub page_cache_ttl: Duration,
    /// Pages larger than this are never inserted into the page cache.
    pub cacheable_page_max_bytes: u64,
    /// Pages at or above this size are spilled to a scratch file instead of
    /// being buffered in memory.
    pub large_page_threshold: u64,
    /// Hard per-entry ceiling; anything larger is refused outright.
    pub max_entry_size: u64,
    /// Bounded wait for archive initialization, staging included.
    pub init_timeout: Duration,
    /// Interval of the background page-cache sweep.
    pub sweep_interval: Duration,
    /// Pause between extractions of a batch preload.
    pub batch_preload_delay: Duration,
    /// Pause between extractions of a smart preload.
    pub smart_preload_delay: Duration,
    /// Directory for staged archives and spilled pages. Swept at manager
    /// startup; nothing in it survives a session by design. Managers must
    /// not share a scratch directory.
    pub scratch_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_parsers: 3,
            max_concurrent_extractions: 2,
            preload_radius: 2,
            page_cache_max_entries: 20,
            page_cache_ttl: Duration::from_secs(5 * 60),
            cacheable_page_max_bytes: 5 * 1024 * 1024,
            large_page_threshold: 8 * 1024 * 1024,
            max_entry_size: 32 * 1024 * 1024,
            init_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            batch_preload_delay: Duration::from_millis(100),
            smart_preload_delay: Duration::from_millis(200),
            scratch_dir: std::env::temp_dir().join("cbxstream"),
        }
    }
}
