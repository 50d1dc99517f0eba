/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Fatal error kinds of the analysis engines.
//!
//! All engine entry points return [`anyhow::Result`]; the variants below are
//! the typed causes an embedder can downcast to. Query-time "object not
//! found" is not an error and is reported as `None` by the query API.

/// A fatal analysis error. Engines fail fast: none of these is retriable, and
/// the cache directory's dirty marker is left set so a restart rebuilds
/// instead of trusting partial state.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Structural violation of the dump contract: a bad record offset, a
    /// missing class, or a reference to an unknown object identifier.
    #[error("malformed dump: {0}")]
    MalformedDump(String),

    /// Disk read/write failure on a temp file or a mapped table.
    #[error("I/O failure during analysis")]
    Io(#[from] std::io::Error),

    /// A fixed-width structure ran out of representable indices.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(&'static str),

    /// The reference-field sentinel class was found under neither HotSpot
    /// nor SubstrateVM naming conventions.
    #[error("unsupported dump: {0}")]
    UnsupportedDump(String),
}
