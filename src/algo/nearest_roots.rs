/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Breadth-first levelised traversal from the GC-root set.
//!
//! The traversal keeps two disk-backed frontiers of dump file offsets and
//! swaps them at each level. For every object it enumerates the outgoing
//! strong references (the `referent` edge of soft/weak/phantom references
//! is skipped against a precomputed closure of reference classes), records
//! incoming references on the targets, installs nearest-root pointers on
//! first visit, and emits the multiple-parents, leaves, and deep-path
//! streams the later passes consume.

use crate::analysis::Options;
use crate::heap::{ClassId, HeapSource, ObjectKind, ReferenceKind};
use crate::store::{CacheDirectory, ObjectFlags, ObjectTable, ReferenceList};
use crate::utils::{HashIntMap, PagedIntStream, PagedLongStream};
use crate::Error;
use anyhow::{Context, Result};
use dsi_progress_logger::prelude::*;
use log::debug;
use std::collections::HashSet;
use sux::prelude::BitVec;

/// Names under which the reference sentinel class may appear: HotSpot
/// (dotted and slashed) and SubstrateVM dumps use one of these.
const REFERENCE_CLASS_NAMES: [&str; 2] = ["java.lang.ref.Reference", "java/lang/ref/Reference"];

/// The field holding the weakly reachable target of a reference object.
const REFERENT_FIELD: &str = "referent";

/// Streams produced by the traversal, consumed by the later passes.
pub(crate) struct RootPassOutput {
    /// Objects that acquired a second (or further) parent, one entry per
    /// additional parent.
    pub(crate) multi_parents: PagedIntStream,
    /// Objects that wrote no outgoing edges.
    pub(crate) leaves: PagedIntStream,
    /// Objects first reached beyond the deep-level threshold.
    pub(crate) deep_paths: PagedIntStream,
    /// The GC-root index set.
    pub(crate) roots: BitVec,
}

/// All classes assignable to the reference sentinel class.
fn reference_class_closure<S: HeapSource>(source: &S) -> Result<HashSet<ClassId>> {
    let mut supers = Vec::new();
    let mut base = 0;
    source.for_each_class(&mut |class| {
        if REFERENCE_CLASS_NAMES.contains(&class.name.as_str()) {
            base = class.class_id;
        }
        supers.push((class.class_id, class.super_class_id));
        Ok(())
    })?;
    if base == 0 {
        return Err(Error::UnsupportedDump(format!(
            "reference sentinel class not found under any of {:?}",
            REFERENCE_CLASS_NAMES
        ))
        .into());
    }
    let mut closure = HashSet::new();
    closure.insert(base);
    // The class iterator has no topological guarantee, so close over the
    // subclass relation until stable.
    loop {
        let before = closure.len();
        for &(class, super_class) in &supers {
            if closure.contains(&super_class) {
                closure.insert(class);
            }
        }
        if closure.len() == before {
            break;
        }
    }
    Ok(closure)
}

/// Runs the traversal, filling nearest-root pointers and reference lists,
/// and freezing the reference list for the read-only passes that follow.
pub(crate) fn compute_nearest_roots<S: HeapSource>(
    source: &S,
    table: &mut ObjectTable,
    refs: &mut ReferenceList,
    dir: &CacheDirectory,
    options: &Options,
) -> Result<RootPassOutput> {
    let num_objects = table.len();
    let reference_classes = reference_class_closure(source)?;
    let mut roots = BitVec::new(num_objects as usize + 1);
    let mut multi_parents = PagedIntStream::new(dir, options.page_capacity);
    let mut leaves = PagedIntStream::new(dir, options.page_capacity);
    let mut deep_paths = PagedIntStream::new(dir, options.page_capacity);
    let mut processed_classes = HashIntMap::with_capacity(1024);
    let mut write_frontier = PagedLongStream::new(dir, options.page_capacity);

    let mut pl = ProgressLogger::default();
    pl.item_name("object")
        .expected_updates(Some(num_objects as usize));
    pl.start("Computing nearest GC roots...");

    for root_id in source.gc_roots() {
        let index = match table.index_of_id(root_id) {
            Some(index) => index,
            None => {
                debug!("GC root {:#x} not present in dump, skipped", root_id);
                continue;
            }
        };
        if roots[index as usize] {
            continue;
        }
        roots.set(index as usize, true);
        table.set_flags(index, ObjectFlags::HAS_GC_ROOT);
        table.set_root_pointer(index, 0);
        write_frontier.write(table.file_offset(index))?;
    }

    let mut level = 0usize;
    while !write_frontier.is_empty() {
        let mut read_frontier = std::mem::replace(
            &mut write_frontier,
            PagedLongStream::new(dir, options.page_capacity),
        );
        read_frontier.start_reading()?;
        level += 1;
        let deep_level = level > options.deep_level;

        loop {
            let offset = read_frontier.read()?;
            if offset == 0 {
                // Level complete.
                break;
            }
            pl.light_update();
            let info = source.object_at(offset)?;
            let current = table.index_of_id(info.object_id).ok_or_else(|| {
                Error::MalformedDump(format!(
                    "object {:#x} at offset {} missing from table",
                    info.object_id, offset
                ))
            })?;
            let is_reference_object = reference_classes.contains(&info.class_id);

            // Publish the instance's class once; later instances of the
            // same class do not repeat the edge.
            let class_edge = if info.kind != ObjectKind::Class && info.class_id != 0 {
                match table.index_of_id(info.class_id) {
                    Some(class_index) if !processed_classes.contains(class_index) => {
                        processed_classes.put(class_index, 1);
                        Some(info.class_id)
                    }
                    _ => None,
                }
            } else {
                None
            };

            // Records `current` as an incoming reference on the target and
            // queues the target on first visit; reports whether an edge was
            // actually written.
            let mut visit = |target_id: u64| -> Result<bool> {
                let target = match table.index_of_id(target_id) {
                    Some(target) => target,
                    None => return Ok(false),
                };
                if target == current || roots[target as usize] {
                    return Ok(false);
                }
                let flags = table.flags(target);
                if flags.contains(ObjectFlags::HAS_REF_LIST) {
                    let head = table.ref_pointer(target);
                    let (new_head, added) = refs.append(head, current)?;
                    if new_head != head {
                        table.set_ref_pointer(target, new_head);
                        // Keep the nearest-root pointer in the front slot.
                        let front = table.root_pointer(target);
                        refs.swap_to_front(new_head, front)?;
                    }
                    if added {
                        multi_parents.write(target)?;
                    }
                } else {
                    let previous = table.ref_pointer(target);
                    if previous == 0 {
                        table.set_ref_pointer(target, current);
                    } else if previous != current {
                        let head = refs.append_first(previous, current)?;
                        table.set_ref_pointer(target, head);
                        table.set_flags(target, ObjectFlags::HAS_REF_LIST);
                        multi_parents.write(target)?;
                    }
                }
                if !flags.contains(ObjectFlags::HAS_GC_ROOT) {
                    table.set_flags(target, ObjectFlags::HAS_GC_ROOT);
                    table.set_root_pointer(target, current);
                    write_frontier.write(table.file_offset(target))?;
                    if deep_level {
                        table.set_flags(target, ObjectFlags::IS_DEEP);
                        deep_paths.write(target)?;
                    }
                }
                Ok(true)
            };

            let mut edges_written = 0usize;
            source.for_each_reference(offset, &mut |reference| {
                if is_reference_object {
                    if let ReferenceKind::Field(name) = reference.kind {
                        if name == REFERENT_FIELD {
                            return Ok(());
                        }
                    }
                }
                if visit(reference.target)? {
                    edges_written += 1;
                }
                Ok(())
            })?;

            if let Some(class_id) = class_edge {
                visit(class_id)?;
            }

            if edges_written == 0 {
                table.set_retained_size(current, info.shallow_size);
                leaves.write(current)?;
            }
        }
    }
    pl.done();
    debug!(
        "nearest-root traversal: {} levels, {} multi-parent entries, {} leaves",
        level,
        multi_parents.len(),
        leaves.len()
    );

    refs.flush().context("Cannot freeze reference list")?;
    multi_parents.seal()?;
    leaves.seal()?;
    deep_paths.seal()?;
    Ok(RootPassOutput {
        multi_parents,
        leaves,
        deep_paths,
        roots,
    })
}
