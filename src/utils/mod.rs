/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Collection of common structures we use throughout the codebase.

mod dense_int_map;
pub use dense_int_map::*;

mod hash_int_map;
pub use hash_int_map::*;

mod lru_cache;
pub use lru_cache::*;

mod mmap_backend;
pub use mmap_backend::*;

mod paged_stream;
pub use paged_stream::*;
