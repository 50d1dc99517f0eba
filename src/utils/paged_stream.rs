/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Append-only sequences of fixed-width integers spilling to a temp file.
//!
//! A [`PagedStream`] buffers writes in an in-memory page and flushes the page
//! to a backing temp file once it fills up, so arbitrarily long sequences can
//! be written with bounded memory. After sealing, the stream can be swept
//! sequentially any number of times, and [reversed](PagedStream::reverse)
//! into a new stream by reading the backing file in backward page-sized
//! chunks; no random access to the forward reader is needed.
//!
//! The value 0 is legal in the sequence, but [`PagedStream::read`] also
//! returns 0 at end of stream, so callers that store 0 must track the
//! element count themselves. The engines in this crate reserve 0 as a
//! terminator throughout.

use crate::store::CacheDirectory;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A fixed-width little-endian word a [`PagedStream`] can hold.
///
/// Implemented for `u32` and `u64`.
pub trait StreamWord: Copy + Eq + std::fmt::Debug {
    /// The zero word, doubling as the end-of-stream marker.
    const ZERO: Self;
    /// Width in bytes of the on-disk encoding.
    const BYTES: usize;
    /// Encodes the word into the first [`BYTES`](StreamWord::BYTES) bytes of `buf`.
    fn put_le(self, buf: &mut [u8]);
    /// Decodes a word from the first [`BYTES`](StreamWord::BYTES) bytes of `buf`.
    fn get_le(buf: &[u8]) -> Self;
}

impl StreamWord for u32 {
    const ZERO: Self = 0;
    const BYTES: usize = 4;

    fn put_le(self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn get_le(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().unwrap())
    }
}

impl StreamWord for u64 {
    const ZERO: Self = 0;
    const BYTES: usize = 8;

    fn put_le(self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn get_le(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }
}

/// Stream of 32-bit words, used for object indices.
pub type PagedIntStream = PagedStream<u32>;
/// Stream of 64-bit words, used for dump file offsets.
pub type PagedLongStream = PagedStream<u64>;

enum Backing {
    /// Nothing spilled yet; the page holds the whole sequence.
    None,
    /// Spilled to an owned temp file, unlinked on drop.
    Temp(NamedTempFile),
    /// Rehydrated from a persisted file that we do not own.
    Persisted(PathBuf),
}

impl Backing {
    fn path(&self) -> Option<&Path> {
        match self {
            Backing::None => None,
            Backing::Temp(file) => Some(file.path()),
            Backing::Persisted(path) => Some(path),
        }
    }
}

enum Reader {
    Mem(usize),
    File(BufReader<File>, u64),
}

/// Append-only queue of fixed-width integers with three states: empty,
/// in-memory, and spilled to a temp file.
pub struct PagedStream<W: StreamWord> {
    dir: CacheDirectory,
    page_capacity: usize,
    page: Vec<W>,
    backing: Backing,
    len: u64,
    sealed: bool,
    reader: Option<Reader>,
}

impl<W: StreamWord> PagedStream<W> {
    /// Creates an empty stream whose in-memory page holds `page_capacity`
    /// words; spill files are created in `dir` on overflow.
    pub fn new(dir: &CacheDirectory, page_capacity: usize) -> Self {
        assert!(page_capacity > 0);
        Self {
            dir: dir.clone(),
            page_capacity,
            page: Vec::new(),
            backing: Backing::None,
            len: 0,
            sealed: false,
            reader: None,
        }
    }

    /// Reopens a stream previously written with
    /// [`persist_into`](PagedStream::persist_into). The stream is sealed and
    /// ready for [`start_reading`](PagedStream::start_reading); the file is
    /// not deleted on drop.
    pub fn open_from(
        dir: &CacheDirectory,
        path: impl AsRef<Path>,
        len: u64,
        page_capacity: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            bail!("stream file {} does not exist", path.display());
        }
        Ok(Self {
            dir: dir.clone(),
            page_capacity,
            page: Vec::new(),
            backing: Backing::Persisted(path),
            len,
            sealed: true,
            reader: None,
        })
    }

    /// Total count of words written.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no word has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a word. Fails if the stream has been sealed by a read or a
    /// reversal.
    pub fn write(&mut self, value: W) -> Result<()> {
        if self.sealed {
            bail!("write on a sealed stream");
        }
        self.page.push(value);
        self.len += 1;
        if self.page.len() == self.page_capacity {
            self.flush_page()?;
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }
        if matches!(self.backing, Backing::None) {
            let file = self
                .dir
                .create_temp_file("stream", ".bin")
                .context("Cannot create stream spill file")?;
            self.backing = Backing::Temp(file);
        }
        let mut bytes = vec![0u8; self.page.len() * W::BYTES];
        for (i, w) in self.page.iter().enumerate() {
            w.put_le(&mut bytes[i * W::BYTES..]);
        }
        match &mut self.backing {
            Backing::Temp(file) => file.as_file_mut().write_all(&bytes)?,
            Backing::Persisted(..) => bail!("write on a rehydrated stream"),
            Backing::None => unreachable!(),
        }
        self.page.clear();
        Ok(())
    }

    /// Seals the stream: no further writes are accepted. Idempotent; called
    /// implicitly by reads, reversal, and persistence.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        // A spilled stream flushes its tail so reads see a single file.
        if !matches!(self.backing, Backing::None) {
            self.flush_page()?;
        }
        self.sealed = true;
        Ok(())
    }

    /// Seals the stream and positions the read cursor at the beginning.
    /// Can be called again on a sealed stream to sweep it once more.
    pub fn start_reading(&mut self) -> Result<()> {
        self.seal()?;
        self.reader = Some(match self.backing.path() {
            None => Reader::Mem(0),
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Cannot open stream file {}", path.display()))?;
                Reader::File(BufReader::new(file), self.len)
            }
        });
        Ok(())
    }

    /// Returns the next word, or 0 at end of stream.
    pub fn read(&mut self) -> Result<W> {
        match &mut self.reader {
            None => bail!("read before start_reading"),
            Some(Reader::Mem(pos)) => {
                if *pos < self.page.len() {
                    let value = self.page[*pos];
                    *pos += 1;
                    Ok(value)
                } else {
                    Ok(W::ZERO)
                }
            }
            Some(Reader::File(reader, remaining)) => {
                if *remaining == 0 {
                    return Ok(W::ZERO);
                }
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf[..W::BYTES])?;
                *remaining -= 1;
                Ok(W::get_le(&buf))
            }
        }
    }

    /// Produces a new stream whose read sequence is the reverse of this
    /// one's write sequence.
    ///
    /// The spilled case sweeps the backing file backwards one page at a
    /// time, reversing each chunk in memory.
    pub fn reverse(&mut self) -> Result<PagedStream<W>> {
        self.seal()?;
        let mut out = PagedStream::new(&self.dir, self.page_capacity);
        match self.backing.path() {
            None => {
                for value in self.page.iter().rev() {
                    out.write(*value)?;
                }
            }
            Some(path) => {
                let mut file = File::open(path)
                    .with_context(|| format!("Cannot open stream file {}", path.display()))?;
                let mut remaining = self.len;
                let chunk_words = self.page_capacity as u64;
                let mut bytes = vec![0u8; self.page_capacity * W::BYTES];
                while remaining > 0 {
                    let take = remaining.min(chunk_words);
                    let start = remaining - take;
                    file.seek(SeekFrom::Start(start * W::BYTES as u64))?;
                    let chunk = &mut bytes[..take as usize * W::BYTES];
                    file.read_exact(chunk)?;
                    for i in (0..take as usize).rev() {
                        out.write(W::get_le(&chunk[i * W::BYTES..]))?;
                    }
                    remaining = start;
                }
            }
        }
        out.seal()?;
        Ok(out)
    }

    /// Copies the sealed contents to `path` so the stream can be rehydrated
    /// later with [`open_from`](PagedStream::open_from). The original backing
    /// file is left in place.
    pub fn persist_into(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.seal()?;
        let path = path.as_ref();
        match self.backing.path() {
            None => {
                let mut bytes = vec![0u8; self.page.len() * W::BYTES];
                for (i, w) in self.page.iter().enumerate() {
                    w.put_le(&mut bytes[i * W::BYTES..]);
                }
                std::fs::write(path, bytes)
                    .with_context(|| format!("Cannot persist stream to {}", path.display()))?;
            }
            Some(backing) => {
                std::fs::copy(backing, path)
                    .with_context(|| format!("Cannot persist stream to {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Releases the stream; an owned backing temp file is unlinked.
    /// Rehydrated persisted files are left in place.
    pub fn delete(self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    fn dir() -> CacheDirectory {
        CacheDirectory::temporary().unwrap()
    }

    #[test]
    fn test_in_memory() -> Result<()> {
        let dir = dir();
        let mut stream = PagedIntStream::new(&dir, 1024);
        for i in 1..=100u32 {
            stream.write(i)?;
        }
        assert_eq!(stream.len(), 100);
        stream.start_reading()?;
        for i in 1..=100u32 {
            assert_eq!(stream.read()?, i);
        }
        assert_eq!(stream.read()?, 0);
        Ok(())
    }

    #[test]
    fn test_spill_and_reread() -> Result<()> {
        let dir = dir();
        // Page of 16 words forces many spills.
        let mut stream = PagedLongStream::new(&dir, 16);
        for i in 1..=1000u64 {
            stream.write(i * 7)?;
        }
        for _ in 0..2 {
            stream.start_reading()?;
            for i in 1..=1000u64 {
                assert_eq!(stream.read()?, i * 7);
            }
            assert_eq!(stream.read()?, 0);
        }
        Ok(())
    }

    #[test]
    fn test_write_after_seal_fails() -> Result<()> {
        let dir = dir();
        let mut stream = PagedIntStream::new(&dir, 8);
        stream.write(1)?;
        stream.start_reading()?;
        assert!(stream.write(2).is_err());
        Ok(())
    }

    #[test]
    fn test_reverse_round_trip() -> Result<()> {
        let dir = dir();
        for n in [0u32, 5, 16, 17, 1000] {
            let mut stream = PagedIntStream::new(&dir, 16);
            for i in 0..n {
                stream.write(i.wrapping_mul(2654435769) | 1)?;
            }
            let mut rev = stream.reverse()?;
            let mut back = rev.reverse()?;
            stream.start_reading()?;
            back.start_reading()?;
            for _ in 0..n {
                assert_eq!(stream.read()?, back.read()?);
            }
            assert_eq!(back.read()?, 0);
        }
        Ok(())
    }

    #[test]
    fn test_reverse_order() -> Result<()> {
        let dir = dir();
        let mut stream = PagedIntStream::new(&dir, 4);
        for i in 1..=10u32 {
            stream.write(i)?;
        }
        let mut rev = stream.reverse()?;
        rev.start_reading()?;
        for i in (1..=10u32).rev() {
            assert_eq!(rev.read()?, i);
        }
        Ok(())
    }

    #[test]
    fn test_persist_and_open() -> Result<()> {
        let dir = dir();
        let mut stream = PagedIntStream::new(&dir, 8);
        for i in 1..=50u32 {
            stream.write(i)?;
        }
        let path = dir.cache_file("stream.test");
        stream.persist_into(&path)?;
        let mut reopened = PagedIntStream::open_from(&dir, &path, 50, 8)?;
        reopened.start_reading()?;
        for i in 1..=50u32 {
            assert_eq!(reopened.read()?, i);
        }
        assert_eq!(reopened.read()?, 0);
        Ok(())
    }
}
