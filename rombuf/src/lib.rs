//! Random-access byte buffer for ROM patching
//!
//! [`RomBuf`] is the value type every patch codec works on: an owned,
//! resizable byte sequence with a movable cursor, an endianness flag and
//! typed reads/writes. Reads past the logical size yield zero bytes and
//! clamp the cursor; writes past the logical size grow the buffer.
//!
//! The crate also provides the two variable-length integer codecs the
//! patch containers use (the `*_vlv_ups` and `*_vlv_rup` method pairs)
//! and the checksum primitives they embed (see [`checksum`]).

pub mod checksum;
mod vlv;

use std::io::{Read, Write};
use std::ops::Range;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Resizable byte buffer with a cursor.
///
/// Invariants: `0 <= offset <= size <= capacity`. The cursor never moves
/// past `size` on reads; writes at or past `size` extend both the backing
/// store and `size`.
#[derive(Debug)]
pub struct RomBuf {
    data: Vec<u8>,
    size: usize,
    offset: usize,
    little_endian: bool,
    name: Option<String>,
    saved: Vec<usize>,
}

impl RomBuf {
    /// Wrap raw bytes. The cursor starts at 0 and multi-byte access is
    /// big-endian until [`RomBuf::little_endian`] is called.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            data,
            size,
            offset: 0,
            little_endian: false,
            name: None,
            saved: Vec::new(),
        }
    }

    /// Create a zero-filled buffer of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self::from_bytes(vec![0; size])
    }

    /// Read a whole file into a buffer, recording its file name.
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let mut buf = Self::from_bytes(data);
        buf.name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        Ok(buf)
    }

    /// Write the logical byte range `[0, size)` to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        writer.write_all(self.as_bytes())?;
        writer.flush()
    }

    /// Switch multi-byte access to little-endian.
    #[must_use]
    pub fn little_endian(mut self) -> Self {
        self.little_endian = true;
        self
    }

    /// Attach a name (usually a file name, used for extension lookups).
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The logical byte range `[0, size)`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Consume the buffer, returning the logical byte range.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.size);
        self.data
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Move the cursor, clamped to `[0, size]`.
    pub fn seek(&mut self, offset: usize) {
        self.offset = offset.min(self.size);
    }

    pub fn tell(&self) -> usize {
        self.offset
    }

    /// Advance the cursor by `n`, clamped at `size`.
    pub fn skip(&mut self, n: usize) {
        self.offset = self.offset.saturating_add(n).min(self.size);
    }

    /// Bytes left between the cursor and `size`.
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.size
    }

    /// Push the current cursor position for nested parsing.
    pub fn save_offset(&mut self) {
        self.saved.push(self.offset);
    }

    /// Pop and restore the most recently saved cursor position.
    pub fn restore_offset(&mut self) {
        if let Some(offset) = self.saved.pop() {
            self.offset = offset.min(self.size);
        }
    }

    /// Grow the buffer to at least `size` zero-filled bytes. Idempotent
    /// when the buffer is already large enough.
    pub fn expand(&mut self, size: usize) {
        if size > self.data.len() {
            self.data.resize(size, 0);
        }
        if size > self.size {
            self.size = size;
        }
    }

    /// Shrink the logical size to `size`, clamping the cursor.
    pub fn truncate(&mut self, size: usize) {
        if size < self.size {
            self.size = size;
            self.data.truncate(size);
            if self.offset > size {
                self.offset = size;
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fill `out` from the cursor. Bytes past `size` read as zero; the
    /// cursor advances only over in-range bytes.
    fn fetch(&mut self, out: &mut [u8]) {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        out[n..].fill(0);
        self.offset += n;
    }

    /// Byte at an absolute position, zero when out of range.
    pub fn get(&self, pos: usize) -> u8 {
        if pos < self.size { self.data[pos] } else { 0 }
    }

    pub fn read_u8(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.fetch(&mut b);
        b[0]
    }

    pub fn read_u16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.fetch(&mut b);
        if self.little_endian {
            LittleEndian::read_u16(&b)
        } else {
            BigEndian::read_u16(&b)
        }
    }

    pub fn read_u24(&mut self) -> u32 {
        let mut b = [0u8; 3];
        self.fetch(&mut b);
        if self.little_endian {
            LittleEndian::read_u24(&b)
        } else {
            BigEndian::read_u24(&b)
        }
    }

    pub fn read_u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.fetch(&mut b);
        if self.little_endian {
            LittleEndian::read_u32(&b)
        } else {
            BigEndian::read_u32(&b)
        }
    }

    pub fn read_u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.fetch(&mut b);
        if self.little_endian {
            LittleEndian::read_u64(&b)
        } else {
            BigEndian::read_u64(&b)
        }
    }

    /// Read `n` bytes; bytes past `size` come back as zero.
    pub fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.fetch(&mut out);
        out
    }

    /// Read an `n`-byte ASCII/UTF-8 field, truncated at the first NUL.
    pub fn read_string(&mut self, n: usize) -> String {
        let bytes = self.read_bytes(n);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Store bytes at the cursor, growing `size` and the backing store
    /// when the write runs past the end.
    fn put(&mut self, bytes: &[u8]) {
        let end = self.offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.offset..end].copy_from_slice(bytes);
        self.offset = end;
        if end > self.size {
            self.size = end;
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        let mut b = [0u8; 2];
        if self.little_endian {
            LittleEndian::write_u16(&mut b, value);
        } else {
            BigEndian::write_u16(&mut b, value);
        }
        self.put(&b);
    }

    pub fn write_u24(&mut self, value: u32) {
        let mut b = [0u8; 3];
        if self.little_endian {
            LittleEndian::write_u24(&mut b, value);
        } else {
            BigEndian::write_u24(&mut b, value);
        }
        self.put(&b);
    }

    pub fn write_u32(&mut self, value: u32) {
        let mut b = [0u8; 4];
        if self.little_endian {
            LittleEndian::write_u32(&mut b, value);
        } else {
            BigEndian::write_u32(&mut b, value);
        }
        self.put(&b);
    }

    pub fn write_u64(&mut self, value: u64) {
        let mut b = [0u8; 8];
        if self.little_endian {
            LittleEndian::write_u64(&mut b, value);
        } else {
            BigEndian::write_u64(&mut b, value);
        }
        self.put(&b);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.put(bytes);
    }

    /// Write a string into a fixed `n`-byte field, NUL-padded, truncated
    /// when longer.
    pub fn write_string_padded(&mut self, s: &str, n: usize) {
        let bytes = s.as_bytes();
        let take = bytes.len().min(n);
        self.put(&bytes[..take]);
        if take < n {
            let pad = vec![0u8; n - take];
            self.put(&pad);
        }
    }

    // ------------------------------------------------------------------
    // Slicing
    // ------------------------------------------------------------------

    /// Deep copy of a byte range, clamped to `[0, size)`. The copy keeps
    /// the endianness flag; its cursor starts at 0.
    pub fn slice(&self, range: Range<usize>) -> RomBuf {
        let start = range.start.min(self.size);
        let end = range.end.min(self.size).max(start);
        let mut out = RomBuf::from_bytes(self.data[start..end].to_vec());
        out.little_endian = self.little_endian;
        out
    }
}

impl Clone for RomBuf {
    /// Deep copy of the byte range `[0, size)`. The saved-offset stack is
    /// not carried over.
    fn clone(&self) -> Self {
        Self {
            data: self.data[..self.size].to_vec(),
            size: self.size,
            offset: self.offset,
            little_endian: self.little_endian,
            name: self.name.clone(),
            saved: Vec::new(),
        }
    }
}

impl PartialEq for RomBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for RomBuf {}
