//! UPS patch format
//!
//! `UPS1`, two VLV sizes, then XOR records (`{VLV gap, xor bytes, 0x00}`)
//! walking a running offset, and a 12-byte trailer of three
//! little-endian CRC32s: source, target, and the patch file itself
//! (computed over everything but its own last four bytes).

use rombuf::{checksum, RomBuf};
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC: &[u8; 4] = b"UPS1";
const TRAILER_LEN: usize = 12;

/// One XOR record: a gap from the end of the previous record, then the
/// bytes to XOR into the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsRecord {
    pub relative_offset: u64,
    pub xor: Vec<u8>,
}

/// A parsed UPS patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsPatch {
    pub source_size: u64,
    pub target_size: u64,
    pub records: Vec<UpsRecord>,
    pub source_crc32: u32,
    pub target_crc32: u32,
    pub patch_crc32: u32,
}

impl UpsPatch {
    pub fn identify(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() + TRAILER_LEN {
            return Err(PatchError::invalid("UPS", "file too short"));
        }

        let computed_patch_crc = checksum::crc32(&data[..data.len() - 4]);

        let mut f = RomBuf::from_bytes(data.to_vec()).little_endian();
        if f.read_bytes(MAGIC.len()) != MAGIC {
            return Err(PatchError::invalid("UPS", "bad magic"));
        }

        let source_size = f.read_vlv_ups();
        let target_size = f.read_vlv_ups();
        if source_size > MAX_DECLARED_SIZE || target_size > MAX_DECLARED_SIZE {
            return Err(PatchError::invalid("UPS", "declared size exceeds limit"));
        }

        let records_end = data.len() - TRAILER_LEN;
        let mut records = Vec::new();
        while f.tell() < records_end {
            let relative_offset = f.read_vlv_ups();
            let mut xor = Vec::new();
            loop {
                if f.tell() >= records_end {
                    return Err(PatchError::invalid("UPS", "unterminated XOR record"));
                }
                let byte = f.read_u8();
                if byte == 0 {
                    break;
                }
                xor.push(byte);
            }
            records.push(UpsRecord {
                relative_offset,
                xor,
            });
        }

        f.seek(records_end);
        let source_crc32 = f.read_u32();
        let target_crc32 = f.read_u32();
        let patch_crc32 = f.read_u32();
        if patch_crc32 != computed_patch_crc {
            return Err(PatchError::invalid(
                "UPS",
                format!(
                    "patch checksum self-test failed: declared {patch_crc32:08x}, computed {computed_patch_crc:08x}"
                ),
            ));
        }

        debug!(source_size, target_size, records = records.len(), "parsed UPS patch");
        Ok(Self {
            source_size,
            target_size,
            records,
            source_crc32,
            target_crc32,
            patch_crc32,
        })
    }

    /// Source CRC32 over the declared range, so a source carrying extra
    /// trailing bytes still validates.
    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        let declared = self.source_size as usize;
        source.crc32(skip..skip + declared) == self.source_crc32
    }

    pub fn apply(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        if check && !self.validate_source(source, 0) {
            return Err(PatchError::validation(
                "UPS",
                format!("source CRC32 does not match {:08x}", self.source_crc32),
            ));
        }

        // XOR happens in a working buffer wide enough for every declared
        // and actual size; the result is then cut down to the target
        // size, letting shrink-patches carry XOR data past the end.
        let work_size = (self.target_size as usize)
            .max(self.source_size as usize)
            .max(source.len());
        let mut out = RomBuf::with_size(work_size);
        out.seek(0);
        out.write_bytes(source.as_bytes());

        let mut pos: usize = 0;
        for record in &self.records {
            pos = pos
                .checked_add(record.relative_offset as usize)
                .filter(|&p| p <= work_size)
                .ok_or_else(|| PatchError::invalid("UPS", "record offset out of range"))?;
            for &x in &record.xor {
                if pos >= work_size {
                    return Err(PatchError::invalid("UPS", "XOR data out of range"));
                }
                out.seek(pos);
                out.write_u8(source.get(pos) ^ x);
                pos += 1;
            }
            // The record terminator advances the running offset too.
            pos += 1;
        }

        out.truncate(self.target_size as usize);
        let actual = out.crc32(0..out.len());
        if actual != self.target_crc32 {
            return Err(PatchError::checksum_u32("UPS", self.target_crc32, actual));
        }
        debug!(size = out.len(), "applied UPS patch");
        Ok(out)
    }

    pub fn build(source: &RomBuf, modified: &RomBuf) -> Self {
        let span = source.len().max(modified.len());
        let mut records = Vec::new();
        let mut pos = 0usize;
        let mut i = 0usize;
        while i < span {
            if source.get(i) == modified.get(i) {
                i += 1;
                continue;
            }
            let start = i;
            let mut xor = Vec::new();
            while i < span && source.get(i) != modified.get(i) {
                xor.push(source.get(i) ^ modified.get(i));
                i += 1;
            }
            records.push(UpsRecord {
                relative_offset: (start - pos) as u64,
                xor,
            });
            pos = i + 1;
        }

        Self {
            source_size: source.len() as u64,
            target_size: modified.len() as u64,
            records,
            source_crc32: source.crc32(0..source.len()),
            target_crc32: modified.crc32(0..modified.len()),
            patch_crc32: 0,
        }
        .with_patch_crc()
    }

    fn with_patch_crc(mut self) -> Self {
        let body = self.serialize_without_patch_crc(None);
        self.patch_crc32 = body.crc32(0..body.len());
        self
    }

    fn serialize_without_patch_crc(&self, name: Option<&str>) -> RomBuf {
        let mut out = RomBuf::with_size(0).little_endian();
        if let Some(name) = name {
            out.set_name(name);
        }
        out.write_bytes(MAGIC);
        out.write_vlv_ups(self.source_size);
        out.write_vlv_ups(self.target_size);
        for record in &self.records {
            out.write_vlv_ups(record.relative_offset);
            out.write_bytes(&record.xor);
            out.write_u8(0);
        }
        out.write_u32(self.source_crc32);
        out.write_u32(self.target_crc32);
        out
    }

    pub fn export(&self, name: Option<&str>) -> RomBuf {
        let mut out = self.serialize_without_patch_crc(name);
        let crc = out.crc32(0..out.len());
        out.seek(out.len());
        out.write_u32(crc);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_patch() {
        let source = RomBuf::from_bytes(vec![0x01, 0x02, 0x03]);
        let patch = UpsPatch::build(&source, &source);

        assert!(patch.records.is_empty());
        let expected = checksum::crc32(&[0x01, 0x02, 0x03]);
        assert_eq!(patch.source_crc32, expected);
        assert_eq!(patch.target_crc32, expected);

        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), source.as_bytes());
    }

    #[test]
    fn build_apply_roundtrip() {
        let source = RomBuf::from_bytes(vec![0x10, 0x20, 0x30, 0x40, 0x50]);
        let modified = RomBuf::from_bytes(vec![0x10, 0xFF, 0x30, 0x41, 0x51]);
        let patch = UpsPatch::build(&source, &modified);
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn grow_and_shrink() {
        let source = RomBuf::from_bytes(vec![1, 2, 3]);
        let grown = RomBuf::from_bytes(vec![1, 2, 3, 4, 5]);
        let patch = UpsPatch::build(&source, &grown);
        assert_eq!(patch.apply(&source, true).unwrap().as_bytes(), grown.as_bytes());

        // XOR is symmetric, so the shrink direction works the same way.
        let patch = UpsPatch::build(&grown, &source);
        assert_eq!(patch.apply(&grown, true).unwrap().as_bytes(), source.as_bytes());
    }

    #[test]
    fn oversized_source_still_applies() {
        let source = RomBuf::from_bytes(vec![1, 2, 3]);
        let modified = RomBuf::from_bytes(vec![1, 9, 3]);
        let patch = UpsPatch::build(&source, &modified);

        // Same source with extra trailing bytes: the declared-range CRC
        // still matches and the extra bytes pass through the work buffer.
        let padded = RomBuf::from_bytes(vec![1, 2, 3, 0xAA, 0xBB]);
        assert!(patch.validate_source(&padded, 0));
    }

    #[test]
    fn export_parse_roundtrip() {
        let source = RomBuf::from_bytes((0u8..200).collect());
        let mut m: Vec<u8> = (0u8..200).collect();
        m[3] = 0xAA;
        m[150] = 0xBB;
        m[151] = 0xBC;
        let modified = RomBuf::from_bytes(m);

        let patch = UpsPatch::build(&source, &modified);
        let reparsed = UpsPatch::parse(patch.export(None).as_bytes()).unwrap();
        assert_eq!(reparsed, patch);
    }

    #[test]
    fn corrupted_patch_crc_is_rejected() {
        let source = RomBuf::from_bytes(vec![1, 2, 3]);
        let modified = RomBuf::from_bytes(vec![4, 5, 6]);
        let mut bytes = UpsPatch::build(&source, &modified)
            .export(None)
            .into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            UpsPatch::parse(&bytes),
            Err(PatchError::InvalidPatchFile { .. })
        ));
    }

    #[test]
    fn wrong_source_fails_validation() {
        let source = RomBuf::from_bytes(vec![1, 2, 3]);
        let modified = RomBuf::from_bytes(vec![4, 5, 6]);
        let patch = UpsPatch::build(&source, &modified);

        let wrong = RomBuf::from_bytes(vec![9, 9, 9]);
        assert!(!patch.validate_source(&wrong, 0));
        assert!(matches!(
            patch.apply(&wrong, true),
            Err(PatchError::ValidationFailed { .. })
        ));
    }
}
