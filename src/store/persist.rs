/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Self-describing framing for the persisted analysis layout.
//!
//! All integers are little-endian and fixed width; strings are
//! length-prefixed UTF-8. The header file records, in order, the dump's
//! pointer width, the object count, the GC-root index set, per-stream
//! metadata (logical file name, word width, element count), the backing
//! file names of the object table and reference list, and the dominator
//! map as a raw [`DenseIntMap`](crate::utils::DenseIntMap) dump. Clients
//! rehydrate in the same order.

use crate::heap::IdSize;
use crate::Error;
use anyhow::{Context, Result};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"HEAPGRPH";
const VERSION: u32 = 1;

/// Logical name of the header artifact.
pub const HEADER_FILE: &str = "analysis.header";
/// Logical name of the object table artifact.
pub const TABLE_FILE: &str = "objects.table";
/// Logical name of the reference list artifact.
pub const REFERENCES_FILE: &str = "references.list";
/// Logical name of the leaves stream artifact.
pub const LEAVES_FILE: &str = "leaves.stream";
/// Logical name of the multiple-parents stream artifact.
pub const MULTI_PARENTS_FILE: &str = "multiple-parents.stream";
/// Logical name of the deep-path stream artifact.
pub const DEEP_PATHS_FILE: &str = "deep-paths.stream";

/// Little-endian frame writer.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    /// Wraps a writer and emits the magic and version.
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(MAGIC)?;
        inner.write_all(&VERSION.to_le_bytes())?;
        Ok(Self { inner })
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.inner.write_all(&[value])?;
        Ok(())
    }

    /// Writes a 32-bit integer.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Writes a 64-bit integer.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.inner.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_u32(value.len() as u32)?;
        self.inner.write_all(value.as_bytes())?;
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Little-endian frame reader.
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a reader and checks the magic and version.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::MalformedDump("bad persisted-analysis magic".into()).into());
        }
        let mut version = [0u8; 4];
        inner.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(Error::MalformedDump(format!(
                "unsupported persisted-analysis version {}",
                version
            ))
            .into());
        }
        Ok(Self { inner })
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a 64-bit integer.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| Error::MalformedDump("non-UTF-8 string in header".into()).into())
    }
}

/// Metadata of one persisted stream.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    /// Logical file name inside the cache directory.
    pub name: String,
    /// Word width in bytes (4 or 8).
    pub word_bytes: u8,
    /// Element count.
    pub len: u64,
}

/// Everything the header records about a completed analysis.
#[derive(Debug, Clone)]
pub struct Header {
    /// The dump's pointer width.
    pub id_size: IdSize,
    /// Number of objects in the table.
    pub num_objects: u32,
    /// Indices of the GC roots.
    pub root_indices: Vec<u32>,
    /// Streams in rehydration order: leaves, multiple parents, deep paths.
    pub streams: Vec<StreamMeta>,
    /// Logical name of the object table file.
    pub table_file: String,
    /// Logical name of the reference list file.
    pub references_file: String,
    /// Raw dominator map dump (dense index → immediate dominator).
    pub dom_map: Vec<u32>,
}

/// Serializes the header to `path`.
pub fn write_header(path: impl AsRef<Path>, header: &Header) -> Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)
        .with_context(|| format!("Cannot create header {}", path.display()))?;
    let mut writer = FrameWriter::new(BufWriter::new(file))?;
    writer.write_u8(header.id_size.bytes() as u8)?;
    writer.write_u32(header.num_objects)?;
    writer.write_u32(header.root_indices.len() as u32)?;
    for &root in &header.root_indices {
        writer.write_u32(root)?;
    }
    writer.write_u32(header.streams.len() as u32)?;
    for stream in &header.streams {
        writer.write_str(&stream.name)?;
        writer.write_u8(stream.word_bytes)?;
        writer.write_u64(stream.len)?;
    }
    writer.write_str(&header.table_file)?;
    writer.write_str(&header.references_file)?;
    writer.write_u32(header.dom_map.len() as u32)?;
    for &value in &header.dom_map {
        writer.write_u32(value)?;
    }
    writer.finish()?;
    Ok(())
}

/// Deserializes the header from `path`.
pub fn read_header(path: impl AsRef<Path>) -> Result<Header> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Cannot open header {}", path.display()))?;
    let mut reader = FrameReader::new(BufReader::new(file))?;
    let id_size = match reader.read_u8()? {
        4 => IdSize::Four,
        8 => IdSize::Eight,
        other => {
            return Err(Error::MalformedDump(format!("bad id size {} in header", other)).into())
        }
    };
    let num_objects = reader.read_u32()?;
    let num_roots = reader.read_u32()?;
    let mut root_indices = Vec::with_capacity(num_roots as usize);
    for _ in 0..num_roots {
        root_indices.push(reader.read_u32()?);
    }
    let num_streams = reader.read_u32()?;
    let mut streams = Vec::with_capacity(num_streams as usize);
    for _ in 0..num_streams {
        let name = reader.read_str()?;
        let word_bytes = reader.read_u8()?;
        let len = reader.read_u64()?;
        streams.push(StreamMeta {
            name,
            word_bytes,
            len,
        });
    }
    let table_file = reader.read_str()?;
    let references_file = reader.read_str()?;
    let dom_len = reader.read_u32()?;
    let mut dom_map = Vec::with_capacity(dom_len as usize);
    for _ in 0..dom_len {
        dom_map.push(reader.read_u32()?);
    }
    Ok(Header {
        id_size,
        num_objects,
        root_indices,
        streams,
        table_file,
        references_file,
        dom_map,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(HEADER_FILE);
        let header = Header {
            id_size: IdSize::Eight,
            num_objects: 42,
            root_indices: vec![1, 5, 9],
            streams: vec![
                StreamMeta {
                    name: LEAVES_FILE.into(),
                    word_bytes: 4,
                    len: 10,
                },
                StreamMeta {
                    name: MULTI_PARENTS_FILE.into(),
                    word_bytes: 4,
                    len: 3,
                },
            ],
            table_file: TABLE_FILE.into(),
            references_file: REFERENCES_FILE.into(),
            dom_map: vec![u32::MAX, 0, 1, 2],
        };
        write_header(&path, &header)?;
        let back = read_header(&path)?;
        assert_eq!(back.id_size, IdSize::Eight);
        assert_eq!(back.num_objects, 42);
        assert_eq!(back.root_indices, vec![1, 5, 9]);
        assert_eq!(back.streams.len(), 2);
        assert_eq!(back.streams[1].name, MULTI_PARENTS_FILE);
        assert_eq!(back.table_file, TABLE_FILE);
        assert_eq!(back.dom_map, vec![u32::MAX, 0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bogus.header");
        std::fs::write(&path, b"NOTMAGIC0000")?;
        assert!(read_header(&path).is_err());
        Ok(())
    }
}
