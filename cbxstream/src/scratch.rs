//! Scratch directory ownership
//!
//! All transient files the engine creates (staged archives, spilled large
//! pages) live in one scratch directory under unique names. The directory is
//! swept at manager startup so files orphaned by a prior crash do not
//! accumulate; nothing in it is meant to survive a session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::Disks;

use crate::error::Result;

/// Prefix for every file the engine writes into scratch storage.
const SCRATCH_PREFIX: &str = "cbx-";

static NEXT_SCRATCH_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn create(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build a unique path for a new scratch file. The name embeds the
    /// process id, a timestamp and a per-process counter, matching what a
    /// crash leaves behind so [`ScratchDir::sweep_orphans`] can find it.
    pub fn unique_path(&self, kind: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = NEXT_SCRATCH_ID.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}{}-{}-{}-{}.tmp",
            SCRATCH_PREFIX,
            kind,
            std::process::id(),
            timestamp,
            seq
        ))
    }

    /// Remove files left over from prior sessions. Only files carrying the
    /// engine's own prefix are touched.
    pub fn sweep_orphans(&self) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to read scratch directory {:?}: {}", self.root, e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SCRATCH_PREFIX));
            if !is_ours || !path.is_file() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove orphaned scratch file {:?}: {}", path, e),
            }
        }
        removed
    }

    /// Free space on the filesystem holding the scratch directory, or `None`
    /// when the platform cannot report it (treated as "enough" by callers).
    pub fn available_space(&self) -> Option<u64> {
        let root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}
