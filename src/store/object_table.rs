/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Fixed-record side-table holding the per-object analysis state.
//!
//! One record per heap object on a memory-mapped file, located by open
//! hashing on the 64-bit object identifier; a [`DenseIntMap`] maps the
//! dense object index to its bucket for the index-keyed accessors the
//! engines use. Records are fixed width, sized by the dump's pointer
//! width:
//!
//! ```text
//! object id | file offset | instance index | flags | ref ptr | root ptr | retained
//!   id       id             4                1       4         4          id
//! ```
//!
//! `ref ptr` is overloaded: with [`ObjectFlags::HAS_REF_LIST`] clear it is
//! the object index of the single incoming reference (or 0), otherwise a
//! block index into the [`ReferenceList`](crate::store::ReferenceList).
//! The table grows by rehashing into a fresh mapping at parse time only;
//! afterwards fields mutate in place.

use crate::heap::{IdSize, ObjectId, ObjectIndex};
use crate::store::CacheDirectory;
use crate::utils::{DenseIntMap, MmapMutBackend};
use crate::Error;
use anyhow::{Context, Result};
use bitflags::bitflags;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

bitflags! {
    /// The flag byte of an object record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u8 {
        /// Set iff the object has at least two distinct incoming
        /// references, making the ref pointer a reference-list block index.
        const HAS_REF_LIST = 1 << 0;
        /// Set once the nearest-root traversal has reached the object.
        const HAS_GC_ROOT = 1 << 1;
        /// The object has exactly one incoming reference chain from its
        /// nearest root.
        const IS_TREE = 1 << 2;
        /// First reached beyond the deep-level threshold.
        const IS_DEEP = 1 << 3;
    }
}

enum TableBacking {
    Temp(NamedTempFile),
    Persisted(PathBuf),
}

/// The per-object record table on a memory-mapped file.
pub struct ObjectTable {
    backend: MmapMutBackend,
    backing: TableBacking,
    dir: CacheDirectory,
    id_size: IdSize,
    record_size: usize,
    /// Bucket count; always a power of two.
    capacity: u64,
    /// Number of live records; the next object index is `len + 1`.
    len: u32,
    index_to_bucket: DenseIntMap,
}

// Field offsets past the two leading id-sized fields.
const OFF_INDEX: usize = 0;
const OFF_FLAGS: usize = 4;
const OFF_REF: usize = 5;
const OFF_ROOT: usize = 9;
const OFF_RETAINED: usize = 13;

const MIN_CAPACITY: u64 = 1024;

impl ObjectTable {
    /// Creates an empty table in `dir` sized for roughly `capacity_hint`
    /// objects before the first rehash.
    pub fn create(dir: &CacheDirectory, id_size: IdSize, capacity_hint: u32) -> Result<Self> {
        let capacity = (capacity_hint as u64 * 2).max(MIN_CAPACITY).next_power_of_two();
        let record_size = 3 * id_size.bytes() + 13;
        let file = dir.create_temp_file("objects", ".table")?;
        let backend = MmapMutBackend::create(file.path(), (capacity * record_size as u64) as usize)
            .context("Cannot map object table")?;
        Ok(Self {
            backend,
            backing: TableBacking::Temp(file),
            dir: dir.clone(),
            id_size,
            record_size,
            capacity,
            len: 0,
            index_to_bucket: DenseIntMap::with_capacity(capacity_hint.max(1024) as usize),
        })
    }

    /// Maps a previously persisted table and rebuilds the index→bucket map
    /// from the record bytes.
    pub fn load(dir: &CacheDirectory, path: impl AsRef<Path>, id_size: IdSize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backend = MmapMutBackend::load(&path)
            .with_context(|| format!("Cannot map object table {}", path.display()))?;
        let record_size = 3 * id_size.bytes() + 13;
        let capacity = (backend.len() / record_size) as u64;
        if !capacity.is_power_of_two() {
            return Err(Error::MalformedDump(format!(
                "object table {} has non-power-of-two capacity {}",
                path.display(),
                capacity
            ))
            .into());
        }
        let mut table = Self {
            backend,
            backing: TableBacking::Persisted(path),
            dir: dir.clone(),
            id_size,
            record_size,
            capacity,
            len: 0,
            index_to_bucket: DenseIntMap::with_capacity(1024),
        };
        for bucket in 0..table.capacity {
            if table.id_at(bucket) != 0 {
                let index = table.get_u32(table.record_offset(bucket) + 2 * id_size.bytes() + OFF_INDEX);
                table.index_to_bucket.put(index, bucket as u32);
                table.len = table.len.max(index);
            }
        }
        Ok(table)
    }

    /// The number of records; object indices run in `1..=len()`.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The dump's pointer width.
    pub fn id_size(&self) -> IdSize {
        self.id_size
    }

    fn record_offset(&self, bucket: u64) -> usize {
        bucket as usize * self.record_size
    }

    fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.backend.bytes()[offset..offset + 4].try_into().unwrap())
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.backend.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get_sized(&self, offset: usize) -> u64 {
        match self.id_size {
            IdSize::Four => self.get_u32(offset) as u64,
            IdSize::Eight => {
                u64::from_le_bytes(self.backend.bytes()[offset..offset + 8].try_into().unwrap())
            }
        }
    }

    fn put_sized(&mut self, offset: usize, value: u64) {
        match self.id_size {
            IdSize::Four => {
                // Saturate rather than wrap on the compact layout.
                let value = value.min(u32::MAX as u64) as u32;
                self.put_u32(offset, value);
            }
            IdSize::Eight => {
                self.backend.bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes())
            }
        }
    }

    fn id_at(&self, bucket: u64) -> ObjectId {
        self.get_sized(self.record_offset(bucket))
    }

    fn hash_bucket(&self, object_id: ObjectId) -> u64 {
        object_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) & (self.capacity - 1)
    }

    /// Finds the bucket of `object_id`, or the empty bucket where it would
    /// be inserted.
    fn probe(&self, object_id: ObjectId) -> u64 {
        let mut bucket = self.hash_bucket(object_id);
        loop {
            let found = self.id_at(bucket);
            if found == object_id || found == 0 {
                return bucket;
            }
            bucket = (bucket + 1) & (self.capacity - 1);
        }
    }

    /// Inserts a new object, assigning the next dense index.
    pub fn insert(&mut self, object_id: ObjectId, file_offset: u64) -> Result<ObjectIndex> {
        if object_id == 0 {
            return Err(Error::MalformedDump("object id 0 in dump".into()).into());
        }
        if self.id_size == IdSize::Four && object_id > u32::MAX as u64 {
            return Err(Error::MalformedDump(format!(
                "object id {:#x} does not fit the dump's 32-bit pointers",
                object_id
            ))
            .into());
        }
        if self.len == u32::MAX - 1 {
            return Err(Error::CapacityExhausted("object index space").into());
        }
        if (self.len as u64 + 1) * 4 > self.capacity * 3 {
            self.grow()?;
        }
        let bucket = self.probe(object_id);
        if self.id_at(bucket) != 0 {
            return Err(Error::MalformedDump(format!(
                "duplicate object id {:#x}",
                object_id
            ))
            .into());
        }
        let index = self.len + 1;
        self.len = index;
        let base = self.record_offset(bucket);
        let id_bytes = self.id_size.bytes();
        self.put_sized(base, object_id);
        self.put_sized(base + id_bytes, file_offset);
        self.put_u32(base + 2 * id_bytes + OFF_INDEX, index);
        self.index_to_bucket.put(index, bucket as u32);
        Ok(index)
    }

    fn grow(&mut self) -> Result<()> {
        let new_capacity = self.capacity * 2;
        let file = self.dir.create_temp_file("objects", ".table")?;
        let new_backend = MmapMutBackend::create(
            file.path(),
            (new_capacity * self.record_size as u64) as usize,
        )
        .context("Cannot map grown object table")?;
        let old_backend = std::mem::replace(&mut self.backend, new_backend);
        let old_capacity = std::mem::replace(&mut self.capacity, new_capacity);
        self.backing = TableBacking::Temp(file);
        let mask = new_capacity - 1;
        for old_bucket in 0..old_capacity {
            let old_base = old_bucket as usize * self.record_size;
            let record = &old_backend.bytes()[old_base..old_base + self.record_size];
            let object_id = match self.id_size {
                IdSize::Four => u32::from_le_bytes(record[..4].try_into().unwrap()) as u64,
                IdSize::Eight => u64::from_le_bytes(record[..8].try_into().unwrap()),
            };
            if object_id == 0 {
                continue;
            }
            let mut bucket = object_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) & mask;
            while self.id_at(bucket) != 0 {
                bucket = (bucket + 1) & mask;
            }
            let base = self.record_offset(bucket);
            self.backend.bytes_mut()[base..base + self.record_size].copy_from_slice(record);
            let index =
                u32::from_le_bytes(record[2 * self.id_size.bytes()..][..4].try_into().unwrap());
            self.index_to_bucket.put(index, bucket as u32);
        }
        Ok(())
    }

    /// Resolves the dense index of `object_id`, if present.
    pub fn index_of_id(&self, object_id: ObjectId) -> Option<ObjectIndex> {
        if object_id == 0 || self.len == 0 {
            return None;
        }
        let bucket = self.probe(object_id);
        if self.id_at(bucket) == 0 {
            return None;
        }
        Some(self.get_u32(self.record_offset(bucket) + 2 * self.id_size.bytes() + OFF_INDEX))
    }

    fn bucket_of(&self, index: ObjectIndex) -> usize {
        let bucket = self
            .index_to_bucket
            .get(index)
            .unwrap_or_else(|| panic!("unknown object index {}", index));
        self.record_offset(bucket as u64)
    }

    /// The dump identifier of the object at `index`.
    ///
    /// Like all index-keyed accessors, panics if `index` is not a live
    /// object index.
    pub fn object_id(&self, index: ObjectIndex) -> ObjectId {
        self.get_sized(self.bucket_of(index))
    }

    /// The dump file offset of the object at `index`.
    pub fn file_offset(&self, index: ObjectIndex) -> u64 {
        self.get_sized(self.bucket_of(index) + self.id_size.bytes())
    }

    /// The flag byte of the object at `index`.
    pub fn flags(&self, index: ObjectIndex) -> ObjectFlags {
        let offset = self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_FLAGS;
        ObjectFlags::from_bits_retain(self.backend.bytes()[offset])
    }

    /// Sets the given flag bits.
    pub fn set_flags(&mut self, index: ObjectIndex, flags: ObjectFlags) {
        let offset = self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_FLAGS;
        self.backend.bytes_mut()[offset] |= flags.bits();
    }

    /// Clears the given flag bits.
    pub fn clear_flags(&mut self, index: ObjectIndex, flags: ObjectFlags) {
        let offset = self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_FLAGS;
        self.backend.bytes_mut()[offset] &= !flags.bits();
    }

    /// The overloaded reference pointer (single parent index, or list head
    /// with [`ObjectFlags::HAS_REF_LIST`] set).
    pub fn ref_pointer(&self, index: ObjectIndex) -> u32 {
        self.get_u32(self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_REF)
    }

    /// Sets the reference pointer.
    pub fn set_ref_pointer(&mut self, index: ObjectIndex, value: u32) {
        let offset = self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_REF;
        self.put_u32(offset, value);
    }

    /// The nearest-root pointer; holds the immediate dominator after the
    /// dominator pass.
    pub fn root_pointer(&self, index: ObjectIndex) -> u32 {
        self.get_u32(self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_ROOT)
    }

    /// Sets the nearest-root pointer.
    pub fn set_root_pointer(&mut self, index: ObjectIndex, value: u32) {
        let offset = self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_ROOT;
        self.put_u32(offset, value);
    }

    /// The retained size of the object at `index`.
    pub fn retained_size(&self, index: ObjectIndex) -> u64 {
        self.get_sized(self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_RETAINED)
    }

    /// Sets the retained size. On 32-bit dumps the stored value saturates
    /// at `u32::MAX`.
    pub fn set_retained_size(&mut self, index: ObjectIndex, value: u64) {
        let offset = self.bucket_of(index) + 2 * self.id_size.bytes() + OFF_RETAINED;
        self.put_sized(offset, value);
    }

    /// Adds `delta` to the retained size.
    pub fn add_retained_size(&mut self, index: ObjectIndex, delta: u64) {
        let retained = self.retained_size(index).saturating_add(delta);
        self.set_retained_size(index, retained);
    }

    /// The raw record bytes of the object at `index`, for round-trip
    /// verification.
    pub fn record_bytes(&self, index: ObjectIndex) -> &[u8] {
        let base = self.bucket_of(index);
        &self.backend.bytes()[base..base + self.record_size]
    }

    /// Flushes the mapping and renames the backing file to `path`, turning
    /// the table into a persisted artifact.
    pub fn persist(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.backend.sync()?;
        match std::mem::replace(&mut self.backing, TableBacking::Persisted(path.clone())) {
            TableBacking::Temp(file) => {
                file.persist(&path)
                    .map_err(|e| e.error)
                    .with_context(|| format!("Cannot persist object table to {}", path.display()))?;
            }
            TableBacking::Persisted(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(hint: u32) -> (CacheDirectory, ObjectTable) {
        let dir = CacheDirectory::temporary().unwrap();
        let table = ObjectTable::create(&dir, IdSize::Eight, hint).unwrap();
        (dir, table)
    }

    #[test]
    fn test_insert_and_fields() -> Result<()> {
        let (_dir, mut table) = table(16);
        let a = table.insert(0xAAAA, 1600)?;
        let b = table.insert(0xBBBB, 3200)?;
        assert_eq!((a, b), (1, 2));
        assert_eq!(table.object_id(a), 0xAAAA);
        assert_eq!(table.file_offset(b), 3200);
        table.set_flags(a, ObjectFlags::HAS_GC_ROOT | ObjectFlags::IS_TREE);
        assert!(table.flags(a).contains(ObjectFlags::IS_TREE));
        table.clear_flags(a, ObjectFlags::IS_TREE);
        assert!(!table.flags(a).contains(ObjectFlags::IS_TREE));
        table.set_ref_pointer(b, a);
        table.set_root_pointer(b, a);
        table.set_retained_size(b, 12345);
        assert_eq!(table.ref_pointer(b), a);
        assert_eq!(table.root_pointer(b), a);
        assert_eq!(table.retained_size(b), 12345);
        Ok(())
    }

    #[test]
    fn test_growth_rehash() -> Result<()> {
        let (_dir, mut table) = table(4);
        // Far past any initial capacity.
        for i in 1..=5000u64 {
            let index = table.insert(i * 31, i * 100)?;
            assert_eq!(index, i as u32);
        }
        for i in 1..=5000u64 {
            let index = table.index_of_id(i * 31).unwrap();
            assert_eq!(index, i as u32);
            assert_eq!(table.file_offset(index), i * 100);
        }
        assert_eq!(table.index_of_id(12), None);
        Ok(())
    }

    #[test]
    fn test_duplicate_id_rejected() -> Result<()> {
        let (_dir, mut table) = table(16);
        table.insert(42, 16)?;
        assert!(table.insert(42, 32).is_err());
        Ok(())
    }

    #[test]
    fn test_four_byte_layout() -> Result<()> {
        let dir = CacheDirectory::temporary()?;
        let mut table = ObjectTable::create(&dir, IdSize::Four, 16)?;
        let a = table.insert(0x1234, 16)?;
        table.set_retained_size(a, u64::MAX);
        // Saturates at the 32-bit field width.
        assert_eq!(table.retained_size(a), u32::MAX as u64);
        assert!(table.insert(u64::MAX, 32).is_err());
        Ok(())
    }

    #[test]
    fn test_persist_and_load() -> Result<()> {
        let dir = CacheDirectory::temporary()?;
        let mut table = ObjectTable::create(&dir, IdSize::Eight, 16)?;
        for i in 1..=100u64 {
            table.insert(i * 7, i * 16)?;
        }
        table.set_root_pointer(5, 1);
        table.set_retained_size(5, 999);
        let bytes = table.record_bytes(5).to_vec();
        let path = dir.cache_file("objects.table");
        table.persist(&path)?;
        drop(table);
        let reloaded = ObjectTable::load(&dir, &path, IdSize::Eight)?;
        assert_eq!(reloaded.len(), 100);
        assert_eq!(reloaded.record_bytes(5), &bytes[..]);
        assert_eq!(reloaded.root_pointer(5), 1);
        assert_eq!(reloaded.index_of_id(7 * 5), Some(5));
        Ok(())
    }
}
