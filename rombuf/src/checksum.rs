//! Checksum primitives embedded by the patch containers
//!
//! CRC32 (reflected, poly 0xEDB88320) via `crc32fast`, Adler-32 via
//! `simd-adler32`, MD5 via the `md5` crate. CRC16/CCITT (init 0xFFFF,
//! poly 0x1021, MSB-first, no reflection, no final XOR) has no crate in
//! common use for exactly these parameters and is implemented here.
//!
//! Every primitive is computable over an arbitrary half-open range of a
//! [`RomBuf`] without mutating it.

use std::ops::Range;

use crate::RomBuf;

/// CRC32: reflected, polynomial 0xEDB88320, init and final XOR 0xFFFFFFFF.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC16: init 0xFFFF, polynomial 0x1021, MSB-first, no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Adler-32 per RFC 1950 (modulus 65521).
pub fn adler32(data: &[u8]) -> u32 {
    let mut hasher = simd_adler32::Adler32::new();
    hasher.write(data);
    hasher.finish()
}

/// MD5 per RFC 1321.
pub fn md5(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

impl RomBuf {
    /// Bytes of `range` clamped to the logical size.
    fn checked_range(&self, range: Range<usize>) -> &[u8] {
        let start = range.start.min(self.len());
        let end = range.end.min(self.len()).max(start);
        &self.as_bytes()[start..end]
    }

    pub fn crc32(&self, range: Range<usize>) -> u32 {
        crc32(self.checked_range(range))
    }

    pub fn crc16(&self, range: Range<usize>) -> u16 {
        crc16(self.checked_range(range))
    }

    pub fn adler32(&self, range: Range<usize>) -> u32 {
        adler32(self.checked_range(range))
    }

    pub fn md5(&self, range: Range<usize>) -> [u8; 16] {
        md5(self.checked_range(range))
    }
}
