/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Bottom-up retained-size propagation along dominator edges.
//!
//! One sweep over the object table initialises every live object's
//! retained size to its shallow size, marks tree objects (exactly one
//! incoming reference), and counts each dominator's pending children. The
//! walk then starts from the dominator-tree leaves (the leaves stream
//! first, then any remaining object with no pending children) and adds
//! each finished object's retained size to its immediate dominator; a
//! dominator whose last child completes joins the next level. Deep objects
//! propagate through the same iterative loop; nothing recurses.

use crate::analysis::Options;
use crate::heap::HeapSource;
use crate::store::{CacheDirectory, ObjectFlags, ObjectTable};
use crate::utils::{HashIntMap, PagedIntStream};
use anyhow::Result;
use dsi_progress_logger::prelude::*;
use log::debug;
use sux::prelude::BitVec;

/// Propagates retained sizes upward from the dominator-tree leaves.
pub(crate) fn compute_retained_sizes<S: HeapSource>(
    source: &S,
    table: &mut ObjectTable,
    leaves: &mut PagedIntStream,
    roots: &BitVec,
    dir: &CacheDirectory,
    options: &Options,
) -> Result<()> {
    let num_objects = table.len();
    let mut pending = HashIntMap::with_capacity(1024);

    let mut pl = ProgressLogger::default();
    pl.item_name("object")
        .expected_updates(Some(num_objects as usize));
    pl.start("Initializing retained sizes...");
    for index in 1..=num_objects {
        if !table.flags(index).contains(ObjectFlags::HAS_GC_ROOT) {
            continue;
        }
        pl.light_update();
        let info = source.object_at(table.file_offset(index))?;
        table.set_retained_size(index, info.shallow_size);
        let flags = table.flags(index);
        if !flags.contains(ObjectFlags::HAS_REF_LIST) && !roots[index as usize] {
            table.set_flags(index, ObjectFlags::IS_TREE);
        }
        let dominator = table.root_pointer(index);
        if dominator != 0 {
            pending.add(dominator, 1);
        }
    }
    pl.done();

    let mut queued = BitVec::new(num_objects as usize + 1);
    let mut current = PagedIntStream::new(dir, options.page_capacity);
    leaves.start_reading()?;
    loop {
        let leaf = leaves.read()?;
        if leaf == 0 {
            break;
        }
        if !table.flags(leaf).contains(ObjectFlags::HAS_GC_ROOT) || queued[leaf as usize] {
            continue;
        }
        if pending.get(leaf).unwrap_or(0) != 0 {
            continue;
        }
        queued.set(leaf as usize, true);
        current.write(leaf)?;
    }
    // Objects that dominate nothing but still hold outgoing edges never
    // reached the leaves stream; sweep them in as seeds too.
    for index in 1..=num_objects {
        if table.flags(index).contains(ObjectFlags::HAS_GC_ROOT)
            && !queued[index as usize]
            && pending.get(index).unwrap_or(0) == 0
        {
            queued.set(index as usize, true);
            current.write(index)?;
        }
    }

    let mut pl = ProgressLogger::default();
    pl.item_name("object")
        .expected_updates(Some(num_objects as usize));
    pl.start("Propagating retained sizes...");
    let mut levels = 0usize;
    while !current.is_empty() {
        levels += 1;
        current.start_reading()?;
        let mut next = PagedIntStream::new(dir, options.page_capacity);
        loop {
            let index = current.read()?;
            if index == 0 {
                break;
            }
            pl.light_update();
            let dominator = table.root_pointer(index);
            if dominator == 0 {
                // A GC root or a virtual-root join; nothing above it.
                continue;
            }
            let retained = table.retained_size(index);
            table.add_retained_size(dominator, retained);
            if pending.add(dominator, -1) == 0 {
                next.write(dominator)?;
            }
        }
        current = next;
    }
    pl.done();
    debug!("retained-size propagation: {} levels", levels);
    Ok(())
}
