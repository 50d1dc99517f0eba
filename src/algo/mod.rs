/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The analysis passes: nearest-root traversal, dominator fixed point, and
//! retained-size propagation. Each pass runs once, on a single thread,
//! driven by [`HeapAnalysis`](crate::analysis::HeapAnalysis).

mod nearest_roots;
pub(crate) use nearest_roots::*;

mod dominators;
pub(crate) use dominators::*;

mod retained;
pub(crate) use retained::*;
