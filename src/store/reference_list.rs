/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Disk-backed store of per-object incoming-reference lists.
//!
//! A list is a chain of 16-byte blocks, each holding three object-index
//! slots terminated by 0 plus a link to the next block. Growth inverts the
//! chain: when a head block fills up, a fresh block becomes the new head
//! and links to the old one, so iteration yields the most recent group
//! first and preserves insertion order within a group. Block 0 is reserved
//! as the null list.
//!
//! Recently written blocks live in a bounded LRU whose dirty entries are
//! pinned; when the cache needs room, the dirty set is written back in
//! sorted, coalesced runs. [`flush`](ReferenceList::flush) performs a final
//! writeback and converts the store to a read-only mapping for the
//! remaining lookups.

use crate::store::CacheDirectory;
use crate::utils::{BoundedLRUCache, MmapBackend};
use crate::Error;
use anyhow::{bail, Context, Result};
use mmap_rs::MmapFlags;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Value slots per block.
const BLOCK_SLOTS: usize = 3;
/// Bytes per block: three slots plus the next-block link.
const BLOCK_BYTES: usize = 16;
/// Hard ceiling on the block index space.
const MAX_BLOCKS: u32 = 1 << 29;

type Block = [u32; 4];

fn decode(bytes: &[u8]) -> Block {
    let mut block = [0u32; 4];
    for (i, slot) in block.iter_mut().enumerate() {
        *slot = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    }
    block
}

fn encode(block: &Block, bytes: &mut [u8]) {
    for (i, slot) in block.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&slot.to_le_bytes());
    }
}

enum ListBacking {
    Temp(NamedTempFile),
    Persisted,
}

/// The block store of incoming-reference lists.
pub struct ReferenceList {
    backing: ListBacking,
    path: PathBuf,
    file: File,
    /// Blocks allocated so far, the reserved block 0 included.
    blocks_len: u32,
    cache: BoundedLRUCache<u32, Block>,
    dirty: HashSet<u32>,
    frozen: Option<MmapBackend>,
}

impl ReferenceList {
    /// Creates an empty store in `dir` with a block cache of
    /// `cache_capacity` entries.
    pub fn create(dir: &CacheDirectory, cache_capacity: usize) -> Result<Self> {
        let temp = dir.create_temp_file("references", ".list")?;
        let path = temp.path().to_path_buf();
        let file = temp
            .as_file()
            .try_clone()
            .context("Cannot clone reference list handle")?;
        Ok(Self {
            backing: ListBacking::Temp(temp),
            path,
            file,
            blocks_len: 1,
            cache: BoundedLRUCache::new(cache_capacity),
            dirty: HashSet::new(),
            frozen: None,
        })
    }

    /// Reopens a persisted store read-only.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("Cannot open reference list {}", path.display()))?;
        let len = file.metadata()?.len();
        let blocks_len = (len / BLOCK_BYTES as u64) as u32;
        let frozen = if blocks_len > 1 {
            Some(MmapBackend::load(&path, MmapFlags::RANDOM_ACCESS)?)
        } else {
            None
        };
        Ok(Self {
            backing: ListBacking::Persisted,
            path,
            file,
            blocks_len: blocks_len.max(1),
            cache: BoundedLRUCache::new(16),
            dirty: HashSet::new(),
            frozen,
        })
    }

    /// Number of allocated blocks, the reserved block 0 included.
    pub fn blocks_len(&self) -> u32 {
        self.blocks_len
    }

    fn alloc(&mut self) -> Result<u32> {
        if self.blocks_len >= MAX_BLOCKS {
            return Err(Error::CapacityExhausted("reference list blocks").into());
        }
        let index = self.blocks_len;
        self.blocks_len += 1;
        Ok(index)
    }

    fn read_block(&mut self, index: u32) -> Result<Block> {
        if let Some(mapped) = &self.frozen {
            let base = index as usize * BLOCK_BYTES;
            return Ok(decode(&mapped.bytes()[base..base + BLOCK_BYTES]));
        }
        if let Some(block) = self.cache.get(&index) {
            return Ok(*block);
        }
        // Not cached: the block was evicted, so it has been written back.
        let mut bytes = [0u8; BLOCK_BYTES];
        self.file
            .seek(SeekFrom::Start(index as u64 * BLOCK_BYTES as u64))?;
        self.file.read_exact(&mut bytes)?;
        let block = decode(&bytes);
        self.make_room()?;
        self.cache.push(index, block);
        Ok(block)
    }

    fn write_block(&mut self, index: u32, block: Block) -> Result<()> {
        if self.frozen.is_some() {
            bail!("write on a frozen reference list");
        }
        if !self.cache.contains(&index) {
            self.make_room()?;
        }
        self.cache.push(index, block);
        self.dirty.insert(index);
        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        if !self.cache.is_full() {
            return Ok(());
        }
        let dirty = &self.dirty;
        if self.cache.pop_lru_where(|index| !dirty.contains(index)).is_none() {
            // Every entry is pinned; write them back and retry.
            self.write_back()?;
            self.cache.pop_lru_where(|_| true);
        }
        Ok(())
    }

    /// Writes all dirty blocks back to the file in sorted, coalesced runs.
    fn write_back(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let mut indices: Vec<u32> = self.dirty.drain().collect();
        indices.sort_unstable();
        let mut run_start = indices[0];
        let mut run = Vec::with_capacity(indices.len() * BLOCK_BYTES);
        let mut previous = None;
        for index in indices {
            if let Some(previous) = previous {
                if index != previous + 1 {
                    self.file
                        .seek(SeekFrom::Start(run_start as u64 * BLOCK_BYTES as u64))?;
                    self.file.write_all(&run)?;
                    run.clear();
                    run_start = index;
                }
            }
            let block = self
                .cache
                .get(&index)
                .copied()
                .expect("dirty block missing from cache");
            let mut bytes = [0u8; BLOCK_BYTES];
            encode(&block, &mut bytes);
            run.extend_from_slice(&bytes);
            previous = Some(index);
        }
        self.file
            .seek(SeekFrom::Start(run_start as u64 * BLOCK_BYTES as u64))?;
        self.file.write_all(&run)?;
        Ok(())
    }

    /// Final writeback; further lookups are served from a read-only
    /// mapping and writes are refused.
    pub fn flush(&mut self) -> Result<()> {
        if self.frozen.is_some() {
            return Ok(());
        }
        self.write_back()?;
        self.file.flush()?;
        self.cache.clear();
        if self.blocks_len > 1 {
            self.frozen = Some(MmapBackend::load(&self.path, MmapFlags::RANDOM_ACCESS)?);
        }
        Ok(())
    }

    /// Allocates a new list initialized with two values; returns its block
    /// index.
    pub fn append_first(&mut self, first: u32, second: u32) -> Result<u32> {
        let index = self.alloc()?;
        self.write_block(index, [first, second, 0, 0])?;
        Ok(index)
    }

    /// Appends `value` to the list headed at `head`.
    ///
    /// Returns the (possibly new) head block index, and whether the value
    /// was actually added: a value already present in the head block is
    /// skipped. A full head block is displaced by a fresh block holding
    /// `value` and linking to the old chain.
    pub fn append(&mut self, head: u32, value: u32) -> Result<(u32, bool)> {
        let mut block = self.read_block(head)?;
        for slot in 0..BLOCK_SLOTS {
            if block[slot] == value {
                return Ok((head, false));
            }
            if block[slot] == 0 {
                block[slot] = value;
                self.write_block(head, block)?;
                return Ok((head, true));
            }
        }
        let new_head = self.alloc()?;
        self.write_block(new_head, [value, 0, 0, head])?;
        Ok((new_head, true))
    }

    /// Swaps `value`, if present anywhere in the chain, with the first slot
    /// of the head block; used to install a specific first element.
    pub fn swap_to_front(&mut self, head: u32, value: u32) -> Result<()> {
        let mut current = head;
        while current != 0 {
            let block = self.read_block(current)?;
            for slot in 0..BLOCK_SLOTS {
                if block[slot] == 0 {
                    break;
                }
                if block[slot] == value {
                    if current == head && slot == 0 {
                        return Ok(());
                    }
                    let mut head_block = self.read_block(head)?;
                    let front = head_block[0];
                    if current == head {
                        let mut block = block;
                        block[slot] = front;
                        block[0] = value;
                        self.write_block(head, block)?;
                    } else {
                        head_block[0] = value;
                        self.write_block(head, head_block)?;
                        let mut block = block;
                        block[slot] = front;
                        self.write_block(current, block)?;
                    }
                    return Ok(());
                }
            }
            current = block[BLOCK_SLOTS];
        }
        Ok(())
    }

    /// The first value of the list headed at `head`.
    pub fn first(&mut self, head: u32) -> Result<u32> {
        Ok(self.read_block(head)?[0])
    }

    /// All values of the list headed at `head`: most recent group first,
    /// insertion order within a group.
    pub fn values(&mut self, head: u32) -> Result<Vec<u32>> {
        let mut values = Vec::new();
        let mut current = head;
        while current != 0 {
            let block = self.read_block(current)?;
            for slot in 0..BLOCK_SLOTS {
                if block[slot] == 0 {
                    break;
                }
                values.push(block[slot]);
            }
            // Links always point to older blocks, so the walk terminates.
            debug_assert!(block[BLOCK_SLOTS] < current);
            current = block[BLOCK_SLOTS];
        }
        Ok(values)
    }

    /// Writes everything back and renames the backing file to `path`,
    /// turning the store into a persisted artifact.
    pub fn persist(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.write_back()?;
        self.file.flush()?;
        match std::mem::replace(&mut self.backing, ListBacking::Persisted) {
            ListBacking::Temp(temp) => {
                temp.persist(&path).map_err(|e| e.error).with_context(|| {
                    format!("Cannot persist reference list to {}", path.display())
                })?;
            }
            ListBacking::Persisted => {}
        }
        self.path = path;
        Ok(())
    }
}
