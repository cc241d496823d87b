//! cbxstream - archive-backed page streaming engine for comic book archives
//!
//! Provides random-access, paginated byte streams over ZIP/CBZ and RAR/CBR
//! containers holding ordered image pages. Extraction concurrency is
//! bounded, extracted pages sit in a time-bounded cache, and pages around
//! the current read position are prefetched in the background, so a
//! page-by-page consumer rarely waits on container latency.
//!
//! The engine never decodes pixels: a page is a byte stream containing
//! exactly one image file, and turning it into something displayable is the
//! caller's concern. Likewise it persists nothing; the only files it writes
//! are self-cleaning scratch files (staged archives, spilled large pages).
//!
//! Entry point is [`ArchiveManager`]: construct one per process inside a
//! tokio runtime, share it by reference, and call
//! [`ArchiveManager::cleanup`] at shutdown.

pub mod archive;
mod cache;
mod config;
mod error;
mod limiter;
mod manager;
mod preload;
mod scratch;

pub use archive::stream::PageStream;
pub use archive::{Archive, ArchiveIdentity, ArchiveType, PageMetadata};
pub use config::EngineConfig;
pub use error::{CbxError, Result};
pub use manager::{ArchiveManager, EngineStats, PageBatch};
