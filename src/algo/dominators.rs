/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Iterative intersection-based dominator computation.
//!
//! Only objects with at least two parents need a computed immediate
//! dominator; everything else already holds it in its nearest-root pointer
//! (a single parent dominates its child). The engine sweeps the
//! multiple-parents stream until no estimate changes, alternating the
//! forward stream with its reversal between passes; reversing the sweep
//! direction accelerates convergence on the DAG-with-back-edges shape of
//! typical heap graphs.
//!
//! A pass normally re-examines only entries flagged dirty by the previous
//! one; since the dirty heuristic can miss, a pass with no changes is
//! followed by one full pass that ignores dirtiness, and the fixed point is
//! declared only when that pass is stable too. Dominator chains are walked
//! with explicit loops and visited sets, never recursion, so cycles in
//! interim estimates cannot overflow the stack.

use crate::analysis::Options;
use crate::heap::HeapSource;
use crate::store::{ObjectFlags, ObjectTable, ReferenceList};
use crate::utils::{HashIntMap, PagedIntStream};
use anyhow::Result;
use dsi_progress_logger::prelude::*;
use log::debug;
use std::collections::HashSet;
use sux::prelude::BitVec;

/// When the previous pass changed more entries than this, chasing the
/// children of changed nodes within the same pass stops paying off.
const ADDITIONAL_LIMIT: usize = 4096;

struct DominatorEngine<'a, S: HeapSource> {
    source: &'a S,
    table: &'a mut ObjectTable,
    refs: &'a mut ReferenceList,
    roots: &'a BitVec,
    /// Current immediate-dominator estimates for multi-parent objects;
    /// absent or 0 means undefined (or dominated only by the virtual root).
    doms: HashIntMap,
    processed: BitVec,
    dirty: BitVec,
    new_dirty: BitVec,
    new_dirty_len: usize,
    additional: Vec<u32>,
    changed: usize,
    ignore_dirty: bool,
    enqueue_children: bool,
}

impl<S: HeapSource> DominatorEngine<'_, S> {
    /// The current dominator estimate of `node`: 0 for GC roots and
    /// undefined entries, the map estimate for multi-parent objects, the
    /// recorded single parent otherwise.
    fn dom_of(&self, node: u32) -> u32 {
        if self.roots[node as usize] {
            return 0;
        }
        if self.table.flags(node).contains(ObjectFlags::HAS_REF_LIST) {
            return self.doms.get(node).unwrap_or(0);
        }
        self.table.root_pointer(node)
    }

    /// Whether `node` contributes to intersections: roots and single-parent
    /// objects always do, multi-parent objects once processed.
    fn defined(&self, node: u32) -> bool {
        if self.roots[node as usize] {
            return true;
        }
        if self.table.flags(node).contains(ObjectFlags::HAS_REF_LIST) {
            return self.processed[node as usize];
        }
        true
    }

    /// Walks upward from `a` and `b` simultaneously along the current
    /// estimates; returns the first node on both chains, or 0 when the
    /// chains reach the root without meeting.
    fn intersect(&self, a: u32, b: u32) -> u32 {
        if a == b {
            return a;
        }
        let mut seen_a = HashSet::new();
        seen_a.insert(a);
        let mut seen_b = HashSet::new();
        seen_b.insert(b);
        let (mut x, mut y) = (a, b);
        loop {
            if x != 0 {
                x = self.dom_of(x);
                if x != 0 {
                    if seen_b.contains(&x) {
                        return x;
                    }
                    if !seen_a.insert(x) {
                        // Interim estimates can be cyclic; stop this chain.
                        x = 0;
                    }
                }
            }
            if y != 0 {
                y = self.dom_of(y);
                if y != 0 {
                    if seen_a.contains(&y) {
                        return y;
                    }
                    if !seen_b.insert(y) {
                        y = 0;
                    }
                }
            }
            if x == 0 && y == 0 {
                return 0;
            }
        }
    }

    fn mark_new_dirty(&mut self, node: u32) {
        if node != 0 && !self.new_dirty[node as usize] {
            self.new_dirty.set(node as usize, true);
            self.new_dirty_len += 1;
        }
    }

    fn process(&mut self, x: u32) -> Result<()> {
        let old = self.doms.get(x).unwrap_or(0);
        let was_processed = self.processed[x as usize];
        if !self.ignore_dirty && was_processed {
            let dirty_hit =
                self.dirty[x as usize] || (old != 0 && self.dirty[old as usize]);
            if !dirty_hit {
                return Ok(());
            }
        }

        let parents = self.refs.values(self.table.ref_pointer(x))?;
        let mut new_dom = None;
        for &parent in &parents {
            if parent == x || !self.defined(parent) {
                continue;
            }
            new_dom = Some(match new_dom {
                None => parent,
                // Once only the virtual root is common, it stays that way.
                Some(0) => 0,
                Some(estimate) => self.intersect(estimate, parent),
            });
        }
        let new_dom = match new_dom {
            // No parent has an estimate yet; leave x unprocessed for a
            // later pass.
            None => return Ok(()),
            Some(new_dom) => new_dom,
        };

        if new_dom != old {
            self.doms.put(x, new_dom);
            self.changed += 1;
            self.mark_new_dirty(old);
            self.mark_new_dirty(new_dom);
            if self.enqueue_children && self.additional.len() < ADDITIONAL_LIMIT * 4 {
                self.enqueue_multi_parent_children(x)?;
            }
        } else if !was_processed {
            // A first estimate equal to the default still has to land in
            // the map so the final install overwrites the BFS parent.
            self.doms.put(x, new_dom);
        }
        self.processed.set(x as usize, true);
        Ok(())
    }

    /// Queues the multi-parent children of `x` for re-examination within
    /// the current pass.
    fn enqueue_multi_parent_children(&mut self, x: u32) -> Result<()> {
        let offset = self.table.file_offset(x);
        let mut targets = Vec::new();
        self.source.for_each_reference(offset, &mut |reference| {
            targets.push(reference.target);
            Ok(())
        })?;
        for target in targets {
            if let Some(index) = self.table.index_of_id(target) {
                if index != x && self.table.flags(index).contains(ObjectFlags::HAS_REF_LIST) {
                    self.additional.push(index);
                }
            }
        }
        Ok(())
    }
}

/// Runs the fixed point over the multiple-parents stream and overwrites
/// the nearest-root pointer of every multi-parent object with its immediate
/// dominator. Returns the dominator estimates keyed by object index.
pub(crate) fn compute_dominators<S: HeapSource>(
    source: &S,
    table: &mut ObjectTable,
    refs: &mut ReferenceList,
    multi_parents: &mut PagedIntStream,
    roots: &BitVec,
    _options: &Options,
) -> Result<HashIntMap> {
    let num_objects = table.len() as usize;
    let mut reversed = multi_parents.reverse()?;

    let mut pl = ProgressLogger::default();
    pl.item_name("entry");
    pl.start("Computing dominators...");

    let mut engine = DominatorEngine {
        source,
        table: &mut *table,
        refs: &mut *refs,
        roots,
        doms: HashIntMap::with_capacity(1024),
        processed: BitVec::new(num_objects + 1),
        dirty: BitVec::new(num_objects + 1),
        new_dirty: BitVec::new(num_objects + 1),
        new_dirty_len: 0,
        additional: Vec::new(),
        changed: 0,
        ignore_dirty: false,
        enqueue_children: false,
    };

    let mut forward = true;
    let mut pass = 0usize;
    loop {
        pass += 1;
        engine.changed = 0;
        engine.new_dirty = BitVec::new(num_objects + 1);
        let previous_dirty_len = engine.new_dirty_len;
        engine.new_dirty_len = 0;
        // Chase children in-pass only while the dirty set stays small.
        engine.enqueue_children = pass > 1 && previous_dirty_len < ADDITIONAL_LIMIT;

        // switchParents: alternate the sweep direction between passes.
        let stream = if forward {
            &mut *multi_parents
        } else {
            &mut reversed
        };
        stream.start_reading()?;
        loop {
            let x = stream.read()?;
            if x == 0 {
                // Pass boundary: drain the in-pass queue first.
                while let Some(y) = engine.additional.pop() {
                    pl.light_update();
                    engine.process(y)?;
                }
                break;
            }
            pl.light_update();
            engine.process(x)?;
        }
        debug!(
            "dominator pass {} ({}, {}): {} changes, {} dirty",
            pass,
            if forward { "forward" } else { "reversed" },
            if engine.ignore_dirty {
                "ignore-dirty"
            } else {
                "dirty-guided"
            },
            engine.changed,
            engine.new_dirty_len
        );

        if engine.changed == 0 {
            if engine.ignore_dirty {
                break;
            }
            // One full pass to catch entries the dirty heuristic missed;
            // the fixed point holds only if that pass is stable too.
            engine.ignore_dirty = true;
        } else {
            engine.ignore_dirty = false;
        }
        forward = !forward;
        engine.dirty = std::mem::replace(&mut engine.new_dirty, BitVec::new(0));
    }
    pl.done();

    let doms = engine.doms;
    for (index, dominator) in doms.iter() {
        table.set_root_pointer(index, dominator);
    }
    reversed.delete();
    Ok(doms)
}
