/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The scratch directory an analysis works in.
//!
//! All temp files, the mapped tables, and the persisted artifacts of one
//! analysis live in a single directory. A `dirty.lck` sentinel is created
//! before persisted artifacts are mutated and removed after a successful
//! writeback, so a restart can tell a clean cache from a half-written one
//! and rebuild instead of trusting stale state.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

const DIRTY_MARKER: &str = "dirty.lck";

struct Inner {
    root: PathBuf,
    /// Present when the directory is ours to delete on drop.
    _temp: Option<TempDir>,
}

/// Handle to the cache directory of one analysis. Cheap to clone.
#[derive(Clone)]
pub struct CacheDirectory {
    inner: Arc<Inner>,
}

impl CacheDirectory {
    /// Creates a self-deleting temporary cache directory; artifacts in it
    /// never outlive the process.
    pub fn temporary() -> Result<Self> {
        let temp = tempfile::tempdir().context("Cannot create temporary cache directory")?;
        Ok(Self {
            inner: Arc::new(Inner {
                root: temp.path().to_path_buf(),
                _temp: Some(temp),
            }),
        })
    }

    /// Opens (creating if needed) a persistent cache directory at `path`.
    pub fn at(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Cannot create cache directory {}", root.display()))?;
        Ok(Self {
            inner: Arc::new(Inner { root, _temp: None }),
        })
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    /// Whether cached artifacts are auto-deleted on process exit.
    pub fn is_temporary(&self) -> bool {
        self.inner._temp.is_some()
    }

    /// Creates a uniquely named writable temp file in the directory. The
    /// file is unlinked when the returned handle is dropped.
    pub fn create_temp_file(&self, prefix: &str, suffix: &str) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.inner.root)
            .with_context(|| {
                format!(
                    "Cannot create temp file {}*{} in {}",
                    prefix,
                    suffix,
                    self.inner.root.display()
                )
            })
    }

    /// Resolves the path of a persisted artifact by logical name.
    pub fn cache_file(&self, logical_name: &str) -> PathBuf {
        self.inner.root.join(logical_name)
    }

    /// Creates or removes the `dirty.lck` sentinel.
    pub fn set_dirty(&self, dirty: bool) -> Result<()> {
        let marker = self.cache_file(DIRTY_MARKER);
        if dirty {
            std::fs::File::create(&marker)
                .with_context(|| format!("Cannot create dirty marker {}", marker.display()))?;
        } else if marker.exists() {
            std::fs::remove_file(&marker)
                .with_context(|| format!("Cannot remove dirty marker {}", marker.display()))?;
        }
        Ok(())
    }

    /// Whether the dirty sentinel is present (unclean shutdown).
    pub fn is_dirty(&self) -> bool {
        self.cache_file(DIRTY_MARKER).exists()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dirty_marker() -> Result<()> {
        let dir = CacheDirectory::temporary()?;
        assert!(!dir.is_dirty());
        dir.set_dirty(true)?;
        assert!(dir.is_dirty());
        dir.set_dirty(false)?;
        assert!(!dir.is_dirty());
        // Removing an absent marker is fine.
        dir.set_dirty(false)?;
        Ok(())
    }

    #[test]
    fn test_temp_file_released_on_drop() -> Result<()> {
        let dir = CacheDirectory::temporary()?;
        let file = dir.create_temp_file("frontier", ".bin")?;
        let path = file.path().to_path_buf();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
        Ok(())
    }
}
