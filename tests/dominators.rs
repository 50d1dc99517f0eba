/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Randomised cross-checks of the dominator and retained-size engines
//! against a naive set-intersection reference implementation.

use anyhow::Result;
use heapgraph::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

/// A synthetic graph over nodes `1..=n` with its engine-visible edges.
struct TestGraph {
    n: usize,
    shallow: Vec<u64>,
    edges: Vec<(usize, usize)>,
    roots: Vec<usize>,
}

impl TestGraph {
    fn random(seed: u64, n: usize, num_edges: usize, num_roots: usize) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut edges = Vec::new();
        for _ in 0..num_edges {
            let from = rng.random_range(1..=n);
            let to = rng.random_range(1..=n);
            if from != to {
                edges.push((from, to));
            }
        }
        let mut roots = BTreeSet::new();
        while roots.len() < num_roots {
            roots.insert(rng.random_range(1..=n));
        }
        let shallow = (0..=n).map(|i| 8 + (i as u64 % 7) * 8).collect();
        Self {
            n,
            shallow,
            edges,
            roots: roots.into_iter().collect(),
        }
    }

    fn heap(&self) -> VecHeap {
        let mut heap = VecHeap::new(IdSize::Eight);
        let class = heap.add_class(0x1000, "Node", 0, &[("refs", true)]);
        for node in 1..=self.n {
            heap.add_object(node as u64, class, self.shallow[node], ObjectKind::Instance);
        }
        for &(from, to) in &self.edges {
            heap.add_ref(from as u64, to as u64);
        }
        for &root in &self.roots {
            heap.add_root(root as u64);
        }
        heap
    }

    /// Predecessor lists as the engine sees them: edges into GC roots and
    /// self-loops are discarded, and every root gains the virtual root 0.
    fn preds(&self) -> Vec<BTreeSet<usize>> {
        let mut preds = vec![BTreeSet::new(); self.n + 1];
        for &(from, to) in &self.edges {
            if !self.roots.contains(&to) {
                preds[to].insert(from);
            }
        }
        for &root in &self.roots {
            preds[root].insert(0);
        }
        preds
    }

    fn reachable(&self) -> Vec<bool> {
        let mut succ = vec![Vec::new(); self.n + 1];
        for &(from, to) in &self.edges {
            if !self.roots.contains(&to) {
                succ[from].push(to);
            }
        }
        let mut reachable = vec![false; self.n + 1];
        let mut queue: Vec<usize> = self.roots.clone();
        for &root in &self.roots {
            reachable[root] = true;
        }
        while let Some(node) = queue.pop() {
            for &next in &succ[node] {
                if !reachable[next] {
                    reachable[next] = true;
                    queue.push(next);
                }
            }
        }
        reachable
    }

    /// Iterative dataflow dominators over the virtual-rooted graph;
    /// `idom[v] == 0` means only the virtual root dominates `v`.
    fn reference_idoms(&self, reachable: &[bool]) -> Vec<Option<usize>> {
        let preds = self.preds();
        let all: BTreeSet<usize> = std::iter::once(0)
            .chain((1..=self.n).filter(|&v| reachable[v]))
            .collect();
        let mut dom: Vec<BTreeSet<usize>> = vec![all.clone(); self.n + 1];
        dom[0] = std::iter::once(0).collect();
        loop {
            let mut changed = false;
            for v in 1..=self.n {
                if !reachable[v] {
                    continue;
                }
                let mut new: Option<BTreeSet<usize>> = None;
                for &p in &preds[v] {
                    if p != 0 && !reachable[p] {
                        continue;
                    }
                    new = Some(match new {
                        None => dom[p].clone(),
                        Some(set) => set.intersection(&dom[p]).copied().collect(),
                    });
                }
                let mut new = new.unwrap_or_default();
                new.insert(v);
                if new != dom[v] {
                    dom[v] = new;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let mut idoms = vec![None; self.n + 1];
        for v in 1..=self.n {
            if !reachable[v] {
                continue;
            }
            let candidates: Vec<usize> = dom[v].iter().copied().filter(|&d| d != v).collect();
            // The immediate dominator is the strict dominator every other
            // strict dominator also dominates.
            let idom = candidates
                .iter()
                .copied()
                .find(|&d| candidates.iter().all(|&e| e == d || dom[d].contains(&e)));
            idoms[v] = idom;
        }
        idoms
    }

    /// Retained sizes from the reference dominator tree.
    fn reference_retained(&self, reachable: &[bool], idoms: &[Option<usize>]) -> Vec<u64> {
        let mut retained = vec![0u64; self.n + 1];
        for v in 1..=self.n {
            if reachable[v] {
                retained[v] = self.shallow[v];
            }
        }
        // Children finish before parents when accumulating by repeated
        // sweeps over the tree edges.
        let mut pending: Vec<usize> = (1..=self.n).filter(|&v| reachable[v]).collect();
        let mut children_left = vec![0usize; self.n + 1];
        for &v in &pending {
            if let Some(d) = idoms[v] {
                if d != 0 {
                    children_left[d] += 1;
                }
            }
        }
        let mut queue: Vec<usize> = pending
            .drain(..)
            .filter(|&v| children_left[v] == 0)
            .collect();
        while let Some(v) = queue.pop() {
            if let Some(d) = idoms[v] {
                if d != 0 {
                    retained[d] += retained[v];
                    children_left[d] -= 1;
                    if children_left[d] == 0 {
                        queue.push(d);
                    }
                }
            }
        }
        retained
    }
}

fn check_graph(graph: &TestGraph) -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = Options {
        page_capacity: 16,
        block_cache_capacity: 8,
        ..Options::default()
    };
    let analysis = HeapAnalysis::new(graph.heap(), CacheDirectory::temporary()?, options)?;
    let reachable = graph.reachable();
    let idoms = graph.reference_idoms(&reachable);
    let retained = graph.reference_retained(&reachable, &idoms);

    for v in 1..=graph.n {
        let id = v as u64;
        if !reachable[v] {
            assert_eq!(analysis.nearest_gc_root(id)?, None, "node {}", v);
            assert_eq!(analysis.retained_size(id)?, 0, "node {}", v);
            continue;
        }
        // Every reachable object resolves a nearest root.
        let nearest = analysis.nearest_gc_root(id)?;
        assert!(
            nearest.is_some_and(|root| graph.roots.contains(&(root as usize))),
            "node {} resolved nearest root {:?}",
            v,
            nearest
        );
        let expected = match idoms[v] {
            None | Some(0) => None,
            Some(d) => Some(d as u64),
        };
        assert_eq!(analysis.immediate_dominator(id)?, expected, "node {}", v);
        assert_eq!(analysis.retained_size(id)?, retained[v], "node {}", v);
    }

    // The retained sizes of the roots never exceed the live total, and
    // match it exactly when nothing is shared between root subtrees.
    let live_total: u64 = (1..=graph.n)
        .filter(|&v| reachable[v])
        .map(|v| graph.shallow[v])
        .sum();
    let mut root_total = 0u64;
    for &root in &graph.roots {
        root_total += analysis.retained_size(root as u64)?;
    }
    assert!(root_total <= live_total);
    Ok(())
}

#[test]
fn test_random_graphs() -> Result<()> {
    for seed in 0..8 {
        let graph = TestGraph::random(seed, 60, 140, 2);
        check_graph(&graph)?;
    }
    Ok(())
}

#[test]
fn test_random_sparse_graphs() -> Result<()> {
    for seed in 100..108 {
        let graph = TestGraph::random(seed, 80, 90, 3);
        check_graph(&graph)?;
    }
    Ok(())
}

#[test]
fn test_dense_single_root() -> Result<()> {
    for seed in 200..204 {
        let graph = TestGraph::random(seed, 40, 300, 1);
        check_graph(&graph)?;
    }
    Ok(())
}

#[test]
fn test_forest_retains_everything() -> Result<()> {
    // A perfect binary tree: retained sizes of the root cover the whole
    // heap exactly.
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x1000, "Node", 0, &[("l", true), ("r", true)]);
    let n = 31usize;
    for v in 1..=n {
        heap.add_object(v as u64, class, 16, ObjectKind::Instance);
    }
    for v in 1..=n {
        if 2 * v <= n {
            heap.add_ref(v as u64, (2 * v) as u64);
            heap.add_ref(v as u64, (2 * v + 1) as u64);
        }
    }
    heap.add_root(1);
    let analysis = HeapAnalysis::new(heap, CacheDirectory::temporary()?, Options::default())?;
    assert_eq!(analysis.retained_size(1)?, 16 * n as u64);
    for v in 2..=n {
        assert_eq!(analysis.immediate_dominator(v as u64)?, Some((v / 2) as u64));
    }
    Ok(())
}
