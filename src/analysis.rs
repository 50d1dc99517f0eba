/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The top-level analysis: phase orchestration, queries, persistence.
//!
//! [`HeapAnalysis`] owns the object table, the reference lists, and the
//! inter-pass streams, and runs the engines lazily: a query triggers the
//! phases it needs. All state sits behind one mutex, so the `compute_*`
//! entry points are idempotent under a concurrent first call and re-entrant
//! calls simply observe the completed phase. The engines themselves are
//! single-threaded.

use crate::algo::{compute_dominators, compute_nearest_roots, compute_retained_sizes};
use crate::heap::{ClassId, HeapSource, IdSize, ObjectId, ObjectIndex};
use crate::store::persist::{self, Header, StreamMeta};
use crate::store::{CacheDirectory, ObjectFlags, ObjectTable, ReferenceList};
use crate::utils::{BoundedLRUCache, DenseIntMap, PagedIntStream};
use anyhow::{anyhow, ensure, Context, Result};
use dsi_progress_logger::prelude::*;
use log::warn;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use sux::prelude::BitVec;

/// Tuning knobs of an analysis.
#[derive(Debug, Clone)]
pub struct Options {
    /// Words per in-memory page of the disk-backed streams.
    pub page_capacity: usize,
    /// Blocks held by the reference-list cache.
    pub block_cache_capacity: usize,
    /// BFS level beyond which objects are flagged deep.
    pub deep_level: usize,
    /// Expected object count for sizing the object table; 0 defers to the
    /// source's own hint.
    pub table_capacity_hint: u32,
    /// Entries of the nearest-root query cache.
    pub root_cache_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_capacity: 1 << 20,
            block_cache_capacity: 1 << 16,
            deep_level: 512,
            table_capacity_hint: 0,
            root_cache_capacity: 1 << 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Parsed,
    Roots,
    Dominators,
    Retained,
}

struct Core {
    table: ObjectTable,
    refs: ReferenceList,
    roots: BitVec,
    leaves: Option<PagedIntStream>,
    multi_parents: Option<PagedIntStream>,
    deep_paths: Option<PagedIntStream>,
    dom_map: DenseIntMap,
    phase: Phase,
    nearest_cache: BoundedLRUCache<ObjectIndex, ObjectIndex>,
    retain_cache: HashMap<ClassId, bool>,
}

/// A heap-dump analysis over a [`HeapSource`].
pub struct HeapAnalysis<S: HeapSource> {
    source: S,
    dir: CacheDirectory,
    options: Options,
    core: Mutex<Core>,
}

impl<S: HeapSource> HeapAnalysis<S> {
    /// Builds the object table from `source` and prepares a fresh analysis
    /// in `dir`. The engines run lazily on first demand.
    pub fn new(source: S, dir: CacheDirectory, options: Options) -> Result<Self> {
        dir.set_dirty(true)?;
        let hint = if options.table_capacity_hint > 0 {
            options.table_capacity_hint
        } else {
            source.object_count_hint().unwrap_or(0)
        };
        let mut table = ObjectTable::create(&dir, source.id_size(), hint)?;
        let mut pl = ProgressLogger::default();
        pl.item_name("object");
        pl.start("Indexing heap objects...");
        source.for_each_object(&mut |info| {
            table.insert(info.object_id, info.file_offset)?;
            pl.light_update();
            Ok(())
        })?;
        pl.done();
        let refs = ReferenceList::create(&dir, options.block_cache_capacity)?;
        let num_objects = table.len();
        let core = Core {
            table,
            refs,
            roots: BitVec::new(num_objects as usize + 1),
            leaves: None,
            multi_parents: None,
            deep_paths: None,
            dom_map: DenseIntMap::with_capacity(0),
            phase: Phase::Parsed,
            nearest_cache: BoundedLRUCache::new(options.root_cache_capacity),
            retain_cache: HashMap::new(),
        };
        Ok(Self {
            source,
            dir,
            options,
            core: Mutex::new(core),
        })
    }

    /// Reopens a persisted analysis from `dir`, or rebuilds from scratch
    /// when the dirty marker is set, the header is missing, or the
    /// persisted state does not match `source`.
    pub fn open(source: S, dir: CacheDirectory, options: Options) -> Result<Self> {
        if !dir.is_dirty() {
            match Self::load_core(&dir, &options, source.id_size()) {
                Ok(Some(core)) => {
                    return Ok(Self {
                        source,
                        dir,
                        options,
                        core: Mutex::new(core),
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("cannot reopen persisted analysis ({:#}); rebuilding", e);
                }
            }
        }
        Self::new(source, dir, options)
    }

    fn load_core(dir: &CacheDirectory, options: &Options, id_size: IdSize) -> Result<Option<Core>> {
        let header_path = dir.cache_file(persist::HEADER_FILE);
        if !header_path.exists() {
            return Ok(None);
        }
        let header = persist::read_header(&header_path)?;
        ensure!(
            header.id_size == id_size,
            "persisted id size does not match the dump"
        );
        let table = ObjectTable::load(dir, dir.cache_file(&header.table_file), header.id_size)?;
        ensure!(
            table.len() == header.num_objects,
            "persisted object count does not match the table"
        );
        let refs = ReferenceList::load(dir.cache_file(&header.references_file))?;
        let mut roots = BitVec::new(table.len() as usize + 1);
        for &index in &header.root_indices {
            ensure!(
                index >= 1 && index <= table.len(),
                "root index {} out of range",
                index
            );
            roots.set(index as usize, true);
        }
        let stream = |name: &str| -> Result<PagedIntStream> {
            let meta = header
                .streams
                .iter()
                .find(|meta| meta.name == name)
                .with_context(|| format!("stream {} missing from header", name))?;
            ensure!(meta.word_bytes == 4, "stream {} has bad word width", name);
            PagedIntStream::open_from(dir, dir.cache_file(name), meta.len, options.page_capacity)
        };
        let leaves = stream(persist::LEAVES_FILE)?;
        let multi_parents = stream(persist::MULTI_PARENTS_FILE)?;
        let deep_paths = stream(persist::DEEP_PATHS_FILE)?;
        Ok(Some(Core {
            table,
            refs,
            roots,
            leaves: Some(leaves),
            multi_parents: Some(multi_parents),
            deep_paths: Some(deep_paths),
            dom_map: DenseIntMap::from_raw(header.dom_map),
            phase: Phase::Retained,
            nearest_cache: BoundedLRUCache::new(options.root_cache_capacity),
            retain_cache: HashMap::new(),
        }))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Core>> {
        self.core.lock().map_err(|_| anyhow!("analysis lock poisoned"))
    }

    fn ensure_roots(&self, core: &mut Core) -> Result<()> {
        if core.phase >= Phase::Roots {
            return Ok(());
        }
        let output = compute_nearest_roots(
            &self.source,
            &mut core.table,
            &mut core.refs,
            &self.dir,
            &self.options,
        )?;
        core.roots = output.roots;
        core.multi_parents = Some(output.multi_parents);
        core.leaves = Some(output.leaves);
        core.deep_paths = Some(output.deep_paths);
        core.phase = Phase::Roots;
        Ok(())
    }

    fn ensure_dominators(&self, core: &mut Core) -> Result<()> {
        self.ensure_roots(core)?;
        if core.phase >= Phase::Dominators {
            return Ok(());
        }
        let multi_parents = core
            .multi_parents
            .as_mut()
            .context("multiple-parents stream missing")?;
        let doms = compute_dominators(
            &self.source,
            &mut core.table,
            &mut core.refs,
            multi_parents,
            &core.roots,
            &self.options,
        )?;
        let mut dom_map = DenseIntMap::with_capacity(core.table.len() as usize + 1);
        for (index, dominator) in doms.iter() {
            dom_map.put(index, dominator);
        }
        core.dom_map = dom_map;
        core.phase = Phase::Dominators;
        Ok(())
    }

    fn ensure_retained(&self, core: &mut Core) -> Result<()> {
        self.ensure_dominators(core)?;
        if core.phase >= Phase::Retained {
            return Ok(());
        }
        let leaves = core.leaves.as_mut().context("leaves stream missing")?;
        compute_retained_sizes(
            &self.source,
            &mut core.table,
            leaves,
            &core.roots,
            &self.dir,
            &self.options,
        )?;
        core.phase = Phase::Retained;
        Ok(())
    }

    /// Runs the nearest-root traversal if it has not run yet. Safe to call
    /// from several threads; later callers observe the completed state.
    pub fn compute_gc_roots(&self) -> Result<()> {
        let mut core = self.lock()?;
        self.ensure_roots(&mut core)
    }

    /// Runs the dominator fixed point (and its prerequisites) if needed.
    pub fn compute_dominators(&self) -> Result<()> {
        let mut core = self.lock()?;
        self.ensure_dominators(&mut core)
    }

    /// Runs retained-size propagation (and its prerequisites) if needed.
    pub fn compute_retained_sizes(&self) -> Result<()> {
        let mut core = self.lock()?;
        self.ensure_retained(&mut core)
    }

    /// Number of objects in the dump.
    pub fn object_count(&self) -> Result<u32> {
        Ok(self.lock()?.table.len())
    }

    /// The cache directory this analysis works in.
    pub fn cache_directory(&self) -> &CacheDirectory {
        &self.dir
    }

    /// The nearest GC root of `object_id`: the first root on some
    /// breadth-first path from the root set. A root is its own nearest
    /// root. `None` for unknown or unreachable objects.
    pub fn nearest_gc_root(&self, object_id: ObjectId) -> Result<Option<ObjectId>> {
        let mut core = self.lock()?;
        self.ensure_roots(&mut core)?;
        let core = &mut *core;
        let index = match core.table.index_of_id(object_id) {
            Some(index) => index,
            None => return Ok(None),
        };
        if !core.table.flags(index).contains(ObjectFlags::HAS_GC_ROOT) {
            return Ok(None);
        }
        let mut current = index;
        let mut steps = 0u32;
        loop {
            if core.roots[current as usize] {
                if core.nearest_cache.is_full() {
                    core.nearest_cache.pop_lru_where(|_| true);
                }
                core.nearest_cache.push(index, current);
                return Ok(Some(core.table.object_id(current)));
            }
            if let Some(&root) = core.nearest_cache.get(&current) {
                core.nearest_cache.push(index, root);
                return Ok(Some(core.table.object_id(root)));
            }
            let pointer = core.table.root_pointer(current);
            let next = if pointer == 0
                && core.table.flags(current).contains(ObjectFlags::HAS_REF_LIST)
            {
                // Dominated only by the virtual root: resume along the
                // first recorded parent, kept at the front of the list.
                core.refs.first(core.table.ref_pointer(current))?
            } else {
                pointer
            };
            if next == 0 || steps >= core.table.len() {
                return Ok(None);
            }
            current = next;
            steps += 1;
        }
    }

    /// The immediate dominator of `object_id`, or `None` when the object
    /// is unknown, unreachable, a GC root, or dominated only by the
    /// virtual root joining the roots.
    pub fn immediate_dominator(&self, object_id: ObjectId) -> Result<Option<ObjectId>> {
        let mut core = self.lock()?;
        self.ensure_dominators(&mut core)?;
        let index = match core.table.index_of_id(object_id) {
            Some(index) => index,
            None => return Ok(None),
        };
        if !core.table.flags(index).contains(ObjectFlags::HAS_GC_ROOT) {
            return Ok(None);
        }
        let dominator = core.table.root_pointer(index);
        if dominator == 0 {
            return Ok(None);
        }
        Ok(Some(core.table.object_id(dominator)))
    }

    /// The retained size of `object_id`: the sum of shallow sizes of every
    /// object it dominates, itself included. 0 for unknown or unreachable
    /// objects.
    pub fn retained_size(&self, object_id: ObjectId) -> Result<u64> {
        let mut core = self.lock()?;
        self.ensure_retained(&mut core)?;
        let index = match core.table.index_of_id(object_id) {
            Some(index) => index,
            None => return Ok(0),
        };
        if !core.table.flags(index).contains(ObjectFlags::HAS_GC_ROOT) {
            return Ok(0);
        }
        Ok(core.table.retained_size(index))
    }

    /// The `k` heaviest retainers, in descending retained-size order; ties
    /// break towards the smaller object identifier.
    pub fn top_retainers(&self, k: usize) -> Result<Vec<ObjectId>> {
        let mut core = self.lock()?;
        self.ensure_retained(&mut core)?;
        let mut heap = dary_heap::QuaternaryHeap::with_capacity(k + 1);
        for index in 1..=core.table.len() {
            if !core.table.flags(index).contains(ObjectFlags::HAS_GC_ROOT) {
                continue;
            }
            heap.push(Reverse(TopEntry {
                retained: core.table.retained_size(index),
                object_id: core.table.object_id(index),
            }));
            if heap.len() > k {
                heap.pop();
            }
        }
        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(entry)| entry.object_id)
            .collect())
    }

    /// Whether some ancestor of `object_id` in the dominator tree is an
    /// instance of the class `class_id`.
    ///
    /// Short-circuits for classes that cannot retain anything: primitive
    /// array classes, and instance classes whose hierarchy declares no
    /// object-typed field (predicate cached per class).
    pub fn has_ancestor_of_class(&self, object_id: ObjectId, class_id: ClassId) -> Result<bool> {
        let mut core = self.lock()?;
        self.ensure_dominators(&mut core)?;
        let index = match core.table.index_of_id(object_id) {
            Some(index) => index,
            None => return Ok(false),
        };
        if !core.table.flags(index).contains(ObjectFlags::HAS_GC_ROOT) {
            return Ok(false);
        }
        let class = match self.source.class_info(class_id) {
            Some(class) => class,
            None => return Ok(false),
        };
        if is_primitive_array_class(&class.name) {
            return Ok(false);
        }
        let can_retain = match core.retain_cache.get(&class_id) {
            Some(&can_retain) => can_retain,
            None => {
                let can_retain = class_can_retain(&self.source, class_id);
                core.retain_cache.insert(class_id, can_retain);
                can_retain
            }
        };
        if !can_retain {
            return Ok(false);
        }
        let mut current = index;
        let mut steps = 0u32;
        loop {
            let ancestor = core.table.root_pointer(current);
            if ancestor == 0 || steps >= core.table.len() {
                return Ok(false);
            }
            let info = self.source.object_at(core.table.file_offset(ancestor))?;
            if info.class_id == class_id {
                return Ok(true);
            }
            current = ancestor;
            steps += 1;
        }
    }

    /// Persists the completed analysis into the cache directory; see
    /// [`persist`](crate::store::persist) for the layout.
    pub fn persist(&self) -> Result<()> {
        let mut core = self.lock()?;
        self.ensure_retained(&mut core)?;
        let core = &mut *core;
        self.dir.set_dirty(true)?;
        core.table.persist(self.dir.cache_file(persist::TABLE_FILE))?;
        core.refs.persist(self.dir.cache_file(persist::REFERENCES_FILE))?;
        let mut stream_metas = Vec::new();
        for (name, stream) in [
            (persist::LEAVES_FILE, core.leaves.as_mut()),
            (persist::MULTI_PARENTS_FILE, core.multi_parents.as_mut()),
            (persist::DEEP_PATHS_FILE, core.deep_paths.as_mut()),
        ] {
            let stream = stream.with_context(|| format!("stream {} missing", name))?;
            stream.persist_into(self.dir.cache_file(name))?;
            stream_metas.push(StreamMeta {
                name: name.to_string(),
                word_bytes: 4,
                len: stream.len(),
            });
        }
        let root_indices = (1..=core.table.len())
            .filter(|&index| core.roots[index as usize])
            .collect();
        let header = Header {
            id_size: core.table.id_size(),
            num_objects: core.table.len(),
            root_indices,
            streams: stream_metas,
            table_file: persist::TABLE_FILE.to_string(),
            references_file: persist::REFERENCES_FILE.to_string(),
            dom_map: core.dom_map.raw().to_vec(),
        };
        persist::write_header(self.dir.cache_file(persist::HEADER_FILE), &header)?;
        self.dir.set_dirty(false)?;
        Ok(())
    }
}

#[derive(PartialEq, Eq)]
struct TopEntry {
    retained: u64,
    object_id: ObjectId,
}

impl PartialOrd for TopEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Heavier first; on equal sizes the smaller identifier wins.
        self.retained
            .cmp(&other.retained)
            .then_with(|| other.object_id.cmp(&self.object_id))
    }
}

const PRIMITIVE_ARRAY_NAMES: [&str; 16] = [
    "[Z", "[B", "[S", "[C", "[I", "[J", "[F", "[D", "boolean[]", "byte[]", "short[]", "char[]",
    "int[]", "long[]", "float[]", "double[]",
];

fn is_primitive_array_class(name: &str) -> bool {
    PRIMITIVE_ARRAY_NAMES.contains(&name)
}

fn is_object_array_class(name: &str) -> bool {
    (name.starts_with('[') || name.ends_with("[]")) && !is_primitive_array_class(name)
}

/// Whether instances of `class_id` can retain anything: object arrays can,
/// and so can any class whose hierarchy declares an object-typed field.
fn class_can_retain<S: HeapSource>(source: &S, class_id: ClassId) -> bool {
    let mut current = class_id;
    let mut depth = 0;
    while current != 0 && depth < 256 {
        let class = match source.class_info(current) {
            Some(class) => class,
            None => return true,
        };
        if is_object_array_class(&class.name) {
            return true;
        }
        if class.fields.iter().any(|field| field.is_object) {
            return true;
        }
        current = class.super_class_id;
        depth += 1;
    }
    false
}
