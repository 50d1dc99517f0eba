/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Thin wrappers over [`mmap_rs`] for the fixed-record side tables.
//!
//! [`MmapBackend`] maps an existing file read-only; [`MmapMutBackend`] sizes
//! a file and maps it read-write. Both expose the mapping as a byte slice;
//! the record structures on top do their own fixed-offset field access.

use anyhow::{Context, Result};
use mmap_rs::{Mmap, MmapFlags, MmapMut};
use std::path::Path;

/// A read-only memory-mapped file.
pub struct MmapBackend {
    mmap: Mmap,
    len: usize,
}

impl MmapBackend {
    /// Maps `path` read-only.
    pub fn load(path: impl AsRef<Path>, flags: MmapFlags) -> Result<Self> {
        let path = path.as_ref();
        let len = path
            .metadata()
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len() as usize;
        let file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open {} for mapping", path.display()))?;
        let mmap = unsafe {
            mmap_rs::MmapOptions::new(len.max(1))
                .with_context(|| format!("Cannot initialize mmap of size {}", len))?
                .with_flags(flags)
                .with_file(&file, 0)
                .map()
                .with_context(|| format!("Cannot mmap {} (size {})", path.display(), len))?
        };
        Ok(Self { mmap, len })
    }

    /// The mapped bytes.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr(), self.len) }
    }

    /// The mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A read-write memory-mapped file, created at a given size.
pub struct MmapMutBackend {
    mmap: MmapMut,
    len: usize,
}

impl MmapMutBackend {
    /// Sizes `path` to `len` bytes (zero-filling new space) and maps it
    /// read-write.
    pub fn create(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Cannot open {} for mutable mapping", path.display()))?;
        file.set_len(len as u64)
            .with_context(|| format!("Cannot size {} to {} bytes", path.display(), len))?;
        let mmap = unsafe {
            mmap_rs::MmapOptions::new(len.max(1))
                .with_context(|| format!("Cannot initialize mmap of size {}", len))?
                .with_flags(MmapFlags::SHARED)
                .with_file(&file, 0)
                .map_mut()
                .with_context(|| format!("Cannot mutably mmap {} (size {})", path.display(), len))?
        };
        Ok(Self { mmap, len })
    }

    /// Maps an existing file read-write without resizing it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let len = path
            .as_ref()
            .metadata()
            .with_context(|| format!("Cannot stat {}", path.as_ref().display()))?
            .len() as usize;
        Self::create(path, len)
    }

    /// The mapped bytes.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr(), self.len) }
    }

    /// The mapped bytes, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr(), self.len) }
    }

    /// The mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flushes the whole mapping to its backing file.
    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush(0..self.len)
            .context("Cannot flush mapped table")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_create_write_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backend.bin");
        let mut backend = MmapMutBackend::create(&path, 64)?;
        backend.bytes_mut()[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        backend.sync()?;
        drop(backend);
        let reloaded = MmapBackend::load(&path, MmapFlags::empty())?;
        assert_eq!(reloaded.len(), 64);
        assert_eq!(&reloaded.bytes()[..4], &0xDEAD_BEEFu32.to_le_bytes());
        Ok(())
    }
}
