//! End-to-end engine tests over real ZIP fixtures.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;
use zip::write::{FileOptions, ZipWriter};

use cbxstream::{ArchiveManager, CbxError, EngineConfig};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Create a test ZIP archive on disk.
fn create_test_zip(path: &Path, files: &[(&str, &[u8])]) {
    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(std::io::Cursor::new(&mut buffer));
        let options = FileOptions::default();
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }
    std::fs::write(path, buffer).unwrap();
}

fn quiet_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        scratch_dir: dir.path().join("scratch"),
        // Preloading off by default so cache counters stay deterministic;
        // tests that exercise it opt back in.
        preload_radius: 0,
        ..EngineConfig::default()
    }
}

fn scratch_file_count(config: &EngineConfig) -> usize {
    match std::fs::read_dir(&config.scratch_dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

fn fixture(dir: &TempDir, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.path().join(name);
    create_test_zip(&path, files);
    path
}

#[tokio::test]
async fn page_names_sort_naturally_and_stay_stable() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(
        &dir,
        "comic.cbz",
        &[
            ("3.jpg", b"three"),
            ("1.jpg", b"one"),
            ("10.jpg", b"ten"),
            ("2.jpg", b"two"),
        ],
    );
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();

    let parser = manager.get_parser(&path).await.unwrap();
    let names = parser.page_names().await;
    assert_eq!(names, vec!["1.jpg", "2.jpg", "3.jpg", "10.jpg"]);
    assert_eq!(parser.page_names().await, names);
    assert_eq!(parser.page_count().await, 4);

    manager.cleanup().await;
}

#[tokio::test]
async fn streams_carry_exactly_page_size_bytes() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(
        &dir,
        "comic.cbz",
        &[("1.jpg", b"first page"), ("2.jpg", b"the second page")],
    );
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();
    let parser = manager.get_parser(&path).await.unwrap();

    for index in 0..parser.page_count().await {
        let expected = parser.page_size(index).await;
        assert!(expected > 0);
        let stream = manager.get_page_stream(&path, index).await.unwrap();
        assert_eq!(stream.len(), expected);
        let bytes = stream.read_to_vec().unwrap();
        assert_eq!(bytes.len() as u64, expected);
    }

    manager.cleanup().await;
}

#[tokio::test]
async fn out_of_range_indices_yield_none_without_cache_pollution() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(
        &dir,
        "comic.cbz",
        &[("1.jpg", b"a"), ("2.jpg", b"b"), ("3.jpg", b"c")],
    );
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();

    let before = manager.performance_stats().cached_pages;
    assert!(manager.get_page_stream(&path, 5).await.is_none());
    assert_eq!(manager.performance_stats().cached_pages, before);

    let parser = manager.get_parser(&path).await.unwrap();
    assert_eq!(parser.page_size(5).await, 0);
    assert!(parser.page_stream(usize::MAX).await.is_none());

    manager.cleanup().await;
}

#[tokio::test]
async fn second_read_within_ttl_is_a_byte_identical_cache_hit() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(&dir, "comic.cbz", &[("1.jpg", b"cached page bytes")]);
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();

    let first = manager.get_page_stream(&path, 0).await.unwrap();
    let first_bytes = first.read_to_vec().unwrap();
    let stats = manager.performance_stats();
    assert_eq!(stats.page_hits, 0);
    assert_eq!(stats.page_misses, 1);
    assert_eq!(stats.cached_pages, 1);

    let second = manager.get_page_stream(&path, 0).await.unwrap();
    let second_bytes = second.read_to_vec().unwrap();
    let stats = manager.performance_stats();
    assert_eq!(stats.page_hits, 1);
    assert_eq!(stats.page_misses, 1);
    assert!(stats.hit_ratio > 0.49 && stats.hit_ratio < 0.51);
    assert_eq!(first_bytes, second_bytes);

    manager.cleanup().await;
}

#[tokio::test]
async fn expired_pages_miss_and_reextract() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(&dir, "comic.cbz", &[("1.jpg", b"short lived")]);
    let config = EngineConfig {
        page_cache_ttl: Duration::from_millis(50),
        ..quiet_config(&dir)
    };
    let manager = ArchiveManager::new(config).unwrap();

    let first = manager.get_page_stream(&path, 0).await.unwrap();
    let first_bytes = first.read_to_vec().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let second = manager.get_page_stream(&path, 0).await.unwrap();
    let stats = manager.performance_stats();
    assert_eq!(stats.page_hits, 0);
    assert_eq!(stats.page_misses, 2);
    assert_eq!(second.read_to_vec().unwrap(), first_bytes);

    manager.cleanup().await;
}

#[tokio::test]
async fn smart_preload_warms_the_neighborhood() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(
        &dir,
        "comic.cbz",
        &[
            ("1.jpg", b"p0"),
            ("2.jpg", b"p1"),
            ("3.jpg", b"p2"),
            ("4.jpg", b"p3"),
            ("5.jpg", b"p4"),
            ("6.jpg", b"p5"),
        ],
    );
    let config = EngineConfig {
        preload_radius: 2,
        smart_preload_delay: Duration::from_millis(10),
        ..quiet_config(&dir)
    };
    let manager = ArchiveManager::new(config).unwrap();

    manager.get_page_stream(&path, 2).await.unwrap();

    // Page 2 plus its neighborhood [3, 4, 1, 0] should land in the cache.
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.performance_stats().cached_pages < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("preload never filled the neighborhood");

    // A preloaded neighbor now reads as a pure cache hit.
    let misses_before = manager.performance_stats().page_misses;
    let stream = manager.get_page_stream(&path, 3).await.unwrap();
    assert_eq!(stream.read_to_vec().unwrap(), b"p3");
    let stats = manager.performance_stats();
    assert_eq!(stats.page_misses, misses_before);
    assert!(stats.page_hits >= 1);

    manager.cleanup().await;
}

#[tokio::test]
async fn cover_selection_prefers_named_covers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();

    let named = fixture(
        &dir,
        "named.cbz",
        &[("001.jpg", b"page one"), ("Cover.jpg", b"the cover art")],
    );
    let parser = manager.get_parser(&named).await.unwrap();
    let cover = parser.cover_stream().await.unwrap();
    assert_eq!(cover.read_to_vec().unwrap(), b"the cover art");

    // Without a cover-named entry the naturally first page wins.
    let plain = fixture(
        &dir,
        "plain.cbz",
        &[
            ("3.jpg", b"three"),
            ("1.jpg", b"one"),
            ("10.jpg", b"ten"),
            ("2.jpg", b"two"),
        ],
    );
    let parser = manager.get_parser(&plain).await.unwrap();
    let cover = parser.cover_stream().await.unwrap();
    assert_eq!(cover.read_to_vec().unwrap(), b"one");

    manager.cleanup().await;
}

#[tokio::test]
async fn page_range_batches_are_finite_and_restartable() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(
        &dir,
        "comic.cbz",
        &[
            ("1.jpg", b"a"),
            ("2.jpg", b"b"),
            ("3.jpg", b"c"),
            ("4.jpg", b"d"),
            ("5.jpg", b"e"),
        ],
    );
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();

    let batches: Vec<_> = manager.load_page_range(&path, 2, 0).collect().await;
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].start_index, 0);
    assert_eq!(batches[0].pages.len(), 2);
    assert_eq!(batches[0].pages[0].name, "1.jpg");
    assert_eq!(batches[1].start_index, 2);
    assert_eq!(batches[2].start_index, 4);
    assert_eq!(batches[2].pages.len(), 1);
    assert!(batches.iter().all(|b| b.total_pages == 5));

    // Restart from a new cursor position.
    let restarted: Vec<_> = manager.load_page_range(&path, 2, 3).collect().await;
    assert_eq!(restarted.len(), 1);
    assert_eq!(restarted[0].start_index, 3);
    assert_eq!(restarted[0].pages.len(), 2);
    assert_eq!(restarted[0].pages[0].name, "4.jpg");

    // Past-the-end cursors terminate immediately.
    let empty: Vec<_> = manager.load_page_range(&path, 2, 9).collect().await;
    assert!(empty.is_empty());

    manager.cleanup().await;
}

#[tokio::test]
async fn cleanup_leaves_no_scratch_files_or_parsers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let big = vec![0x5Au8; 8192];
    let path = fixture(&dir, "comic.cbz", &[("1.jpg", &big), ("2.jpg", b"small")]);
    let config = EngineConfig {
        // Force the first page through the spill path.
        large_page_threshold: 1024,
        ..quiet_config(&dir)
    };
    let snapshot = config.clone();
    let manager = ArchiveManager::new(config).unwrap();

    let spilled = manager.get_page_stream(&path, 0).await.unwrap();
    assert_eq!(spilled.read_to_vec().unwrap(), big);
    manager.get_page_stream(&path, 1).await.unwrap();

    manager.cleanup().await;
    let stats = manager.performance_stats();
    assert_eq!(stats.cached_parsers, 0);
    assert_eq!(stats.active_parsers, 0);
    assert_eq!(stats.cached_pages, 0);
    assert_eq!(scratch_file_count(&snapshot), 0);
}

#[tokio::test]
async fn corrupt_archives_fail_terminally_until_evicted() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.cbz");
    std::fs::write(&path, b"this is not a zip archive").unwrap();
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();

    let first = manager.get_parser(&path).await;
    assert!(matches!(first, Err(CbxError::Archive(_))));

    // The identity is now terminal; later callers see the stored error.
    let replay = manager.get_parser(&path).await;
    assert!(matches!(replay, Err(CbxError::Archive(_))));
    assert!(manager.get_page_stream(&path, 0).await.is_none());
    assert_eq!(manager.performance_stats().active_parsers, 0);

    manager.evict_parser(&path).await;
    assert_eq!(manager.performance_stats().cached_parsers, 0);

    manager.cleanup().await;
}

#[tokio::test]
async fn enumeration_skips_non_image_entries() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = fixture(
        &dir,
        "mixed.cbz",
        &[
            ("ComicInfo.xml", b"<ComicInfo/>"),
            ("credits.txt", b"thanks"),
            ("01.png", b"page"),
            ("02.webp", b"page"),
        ],
    );
    let manager = ArchiveManager::new(quiet_config(&dir)).unwrap();

    let parser = manager.get_parser(&path).await.unwrap();
    assert_eq!(parser.page_names().await, vec!["01.png", "02.webp"]);

    manager.cleanup().await;
}
