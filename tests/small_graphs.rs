/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use heapgraph::prelude::*;

fn analysis(heap: VecHeap) -> Result<HeapAnalysis<VecHeap>> {
    let _ = env_logger::builder().is_test(true).try_init();
    // Tiny pages and caches so even these graphs exercise the disk paths.
    let options = Options {
        page_capacity: 4,
        block_cache_capacity: 4,
        ..Options::default()
    };
    HeapAnalysis::new(heap, CacheDirectory::temporary()?, options)
}

#[test]
fn test_singleton_root() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Holder", 0, &[]);
    let a = heap.add_object(1, class, 40, ObjectKind::Instance);
    heap.add_root(a);

    let analysis = analysis(heap)?;
    assert_eq!(analysis.nearest_gc_root(a)?, Some(a));
    assert_eq!(analysis.immediate_dominator(a)?, None);
    assert_eq!(analysis.retained_size(a)?, 40);
    assert_eq!(analysis.top_retainers(1)?, vec![a]);
    Ok(())
}

#[test]
fn test_chain() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Node", 0, &[("next", true)]);
    let a = heap.add_object(1, class, 16, ObjectKind::Instance);
    let b = heap.add_object(2, class, 24, ObjectKind::Instance);
    let c = heap.add_object(3, class, 32, ObjectKind::Instance);
    heap.add_field_ref(a, b, "next");
    heap.add_field_ref(b, c, "next");
    heap.add_root(a);

    let analysis = analysis(heap)?;
    assert_eq!(analysis.immediate_dominator(b)?, Some(a));
    assert_eq!(analysis.immediate_dominator(c)?, Some(b));
    assert_eq!(analysis.nearest_gc_root(c)?, Some(a));
    assert_eq!(analysis.retained_size(a)?, 16 + 24 + 32);
    assert_eq!(analysis.retained_size(b)?, 24 + 32);
    assert_eq!(analysis.retained_size(c)?, 32);
    Ok(())
}

#[test]
fn test_diamond() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Node", 0, &[("left", true), ("right", true)]);
    let a = heap.add_object(1, class, 10, ObjectKind::Instance);
    let b = heap.add_object(2, class, 20, ObjectKind::Instance);
    let c = heap.add_object(3, class, 30, ObjectKind::Instance);
    let d = heap.add_object(4, class, 40, ObjectKind::Instance);
    heap.add_field_ref(a, b, "left");
    heap.add_field_ref(a, c, "right");
    heap.add_field_ref(b, d, "left");
    heap.add_field_ref(c, d, "left");
    heap.add_root(a);

    let analysis = analysis(heap)?;
    assert_eq!(analysis.immediate_dominator(b)?, Some(a));
    assert_eq!(analysis.immediate_dominator(c)?, Some(a));
    // Neither branch dominates the join.
    assert_eq!(analysis.immediate_dominator(d)?, Some(a));
    assert_eq!(analysis.retained_size(b)?, 20);
    assert_eq!(analysis.retained_size(c)?, 30);
    assert_eq!(analysis.retained_size(a)?, 10 + 20 + 30 + 40);
    Ok(())
}

#[test]
fn test_cycle_with_leaf() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Node", 0, &[("a", true), ("b", true)]);
    let a = heap.add_object(1, class, 8, ObjectKind::Instance);
    let b = heap.add_object(2, class, 8, ObjectKind::Instance);
    let c = heap.add_object(3, class, 8, ObjectKind::Instance);
    heap.add_field_ref(a, b, "a");
    heap.add_field_ref(b, a, "a");
    heap.add_field_ref(a, c, "b");
    heap.add_root(a);

    let analysis = analysis(heap)?;
    assert_eq!(analysis.immediate_dominator(b)?, Some(a));
    assert_eq!(analysis.immediate_dominator(c)?, Some(a));
    assert_eq!(analysis.retained_size(a)?, 24);
    Ok(())
}

#[test]
fn test_weak_referent_not_traversed() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let node = heap.add_class(0x100, "Node", 0, &[("strong", true), ("weak", true)]);
    let weak_ref = heap.add_class(
        0x200,
        "java.lang.ref.WeakReference",
        heap.reference_class(),
        &[],
    );
    let a = heap.add_object(1, node, 16, ObjectKind::Instance);
    let b = heap.add_object(2, node, 16, ObjectKind::Instance);
    let w = heap.add_object(3, weak_ref, 16, ObjectKind::Instance);
    let c = heap.add_object(4, node, 16, ObjectKind::Instance);
    heap.add_field_ref(a, b, "strong");
    heap.add_field_ref(a, w, "weak");
    heap.add_field_ref(w, c, "referent");
    heap.add_root(a);

    let analysis = analysis(heap)?;
    // The referent edge is not followed, so c is unreachable.
    assert_eq!(analysis.nearest_gc_root(c)?, None);
    assert_eq!(analysis.retained_size(c)?, 0);
    assert_eq!(analysis.nearest_gc_root(w)?, Some(a));
    assert_eq!(analysis.retained_size(a)?, 48);
    Ok(())
}

#[test]
fn test_top_retainers_tie_break() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Blob", 0, &[]);
    let x = heap.add_object(1, class, 100, ObjectKind::PrimitiveArray);
    let y = heap.add_object(2, class, 100, ObjectKind::PrimitiveArray);
    let z = heap.add_object(3, class, 50, ObjectKind::PrimitiveArray);
    heap.add_root(x);
    heap.add_root(y);
    heap.add_root(z);

    let analysis = analysis(heap)?;
    // Larger first; equal sizes break towards the smaller identifier.
    assert_eq!(analysis.top_retainers(2)?, vec![x, y]);
    assert_eq!(analysis.top_retainers(10)?, vec![x, y, z]);
    assert_eq!(analysis.top_retainers(0)?, Vec::<ObjectId>::new());
    Ok(())
}

#[test]
fn test_multiple_roots_share_object() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Node", 0, &[("x", true)]);
    let r1 = heap.add_object(1, class, 8, ObjectKind::Instance);
    let r2 = heap.add_object(2, class, 8, ObjectKind::Instance);
    let shared = heap.add_object(3, class, 8, ObjectKind::Instance);
    heap.add_field_ref(r1, shared, "x");
    heap.add_field_ref(r2, shared, "x");
    heap.add_root(r1);
    heap.add_root(r2);

    let analysis = analysis(heap)?;
    // Only the virtual root above both GC roots dominates the join.
    assert_eq!(analysis.immediate_dominator(shared)?, None);
    // The nearest root is still resolvable through the first parent.
    let nearest = analysis.nearest_gc_root(shared)?;
    assert!(nearest == Some(r1) || nearest == Some(r2));
    assert_eq!(analysis.retained_size(r1)?, 8);
    assert_eq!(analysis.retained_size(r2)?, 8);
    assert_eq!(analysis.retained_size(shared)?, 8);
    Ok(())
}

#[test]
fn test_class_edge_published_once() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Node", 0, &[("x", true)]);
    // The class object itself lives in the heap and holds a static.
    heap.add_object(0x100, class, 64, ObjectKind::Class);
    let held = heap.add_object(5, class, 16, ObjectKind::Instance);
    heap.add_static_ref(0x100, held);
    let a = heap.add_object(1, class, 16, ObjectKind::Instance);
    let b = heap.add_object(2, class, 16, ObjectKind::Instance);
    heap.add_field_ref(a, b, "x");
    heap.add_root(a);

    let analysis = analysis(heap)?;
    // The class object is reachable through the instance class edge, and
    // its static in turn.
    assert_eq!(analysis.nearest_gc_root(0x100)?, Some(a));
    assert_eq!(analysis.nearest_gc_root(held)?, Some(a));
    assert_eq!(analysis.immediate_dominator(held)?, Some(0x100));
    Ok(())
}

#[test]
fn test_has_ancestor_of_class() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let list = heap.add_class(0x100, "LinkedList", 0, &[("head", true)]);
    let node = heap.add_class(0x200, "Node", 0, &[("next", true)]);
    let blob = heap.add_class(0x300, "Blob", 0, &[]);
    let prim = heap.add_class(0x400, "byte[]", 0, &[]);
    let l = heap.add_object(1, list, 16, ObjectKind::Instance);
    let n1 = heap.add_object(2, node, 16, ObjectKind::Instance);
    let n2 = heap.add_object(3, node, 16, ObjectKind::Instance);
    let payload = heap.add_object(4, blob, 128, ObjectKind::Instance);
    heap.add_field_ref(l, n1, "head");
    heap.add_field_ref(n1, n2, "next");
    heap.add_field_ref(n2, payload, "next");
    heap.add_root(l);

    let analysis = analysis(heap)?;
    assert!(analysis.has_ancestor_of_class(payload, list)?);
    assert!(analysis.has_ancestor_of_class(payload, node)?);
    assert!(analysis.has_ancestor_of_class(n2, node)?);
    assert!(!analysis.has_ancestor_of_class(n1, node)?);
    // A fieldless class cannot retain, a primitive array class neither.
    assert!(!analysis.has_ancestor_of_class(payload, blob)?);
    assert!(!analysis.has_ancestor_of_class(payload, prim)?);
    Ok(())
}

#[test]
fn test_unknown_object_queries() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Node", 0, &[]);
    let a = heap.add_object(1, class, 8, ObjectKind::Instance);
    heap.add_root(a);

    let analysis = analysis(heap)?;
    assert_eq!(analysis.nearest_gc_root(999)?, None);
    assert_eq!(analysis.immediate_dominator(999)?, None);
    assert_eq!(analysis.retained_size(999)?, 0);
    Ok(())
}

#[test]
fn test_compute_entry_points_idempotent() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Eight);
    let class = heap.add_class(0x100, "Node", 0, &[("x", true)]);
    let a = heap.add_object(1, class, 8, ObjectKind::Instance);
    let b = heap.add_object(2, class, 8, ObjectKind::Instance);
    heap.add_field_ref(a, b, "x");
    heap.add_root(a);

    let analysis = analysis(heap)?;
    analysis.compute_gc_roots()?;
    analysis.compute_gc_roots()?;
    analysis.compute_dominators()?;
    analysis.compute_dominators()?;
    analysis.compute_retained_sizes()?;
    analysis.compute_retained_sizes()?;
    assert_eq!(analysis.retained_size(a)?, 16);
    Ok(())
}

#[test]
fn test_four_byte_dump() -> Result<()> {
    let mut heap = VecHeap::new(IdSize::Four);
    let class = heap.add_class(0x100, "Node", 0, &[("x", true)]);
    let a = heap.add_object(1, class, 8, ObjectKind::Instance);
    let b = heap.add_object(2, class, 8, ObjectKind::Instance);
    heap.add_field_ref(a, b, "x");
    heap.add_root(a);

    let analysis = analysis(heap)?;
    assert_eq!(analysis.immediate_dominator(b)?, Some(a));
    assert_eq!(analysis.retained_size(a)?, 16);
    Ok(())
}
