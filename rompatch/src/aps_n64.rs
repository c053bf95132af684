//! APS patch format, N64 lineage
//!
//! Little-endian container: `APS10`, a header type byte (0 raw, 1 N64),
//! an encoding method, a 50-byte description, an optional 17-byte N64
//! block mirroring the cartridge header, a u32 output size, then
//! records of `{u32 offset, u8 length}` where a zero length introduces
//! `{u8 fill byte, u8 run length}`.

use rombuf::RomBuf;
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC: &[u8; 5] = b"APS10";

const DESCRIPTION_LEN: usize = 50;

/// N64 cartridge header fields: the CRC pair lives at 0x10 and the
/// cartridge id at 0x3C of a big-endian ROM dump.
const N64_CRC_OFFSET: usize = 0x10;
const N64_CART_ID_OFFSET: usize = 0x3C;

/// Run-length records only pay off past this run length.
const MIN_RLE_RUN: usize = 3;

/// Extra header block present when `header_type == 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N64Info {
    pub original_format: u8,
    pub cart_id: [u8; 3],
    pub crc: [u8; 8],
    pub pad: [u8; 5],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApsN64Hunk {
    Data(Vec<u8>),
    Rle { byte: u8, length: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApsN64Record {
    pub offset: u32,
    pub hunk: ApsN64Hunk,
}

/// A parsed N64-family APS patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApsN64Patch {
    pub encoding_method: u8,
    pub description: String,
    pub n64: Option<N64Info>,
    pub target_size: u32,
    pub records: Vec<ApsN64Record>,
}

impl ApsN64Patch {
    pub fn identify(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut f = RomBuf::from_bytes(data.to_vec()).little_endian();
        if f.read_bytes(MAGIC.len()) != MAGIC {
            return Err(PatchError::invalid("APS", "bad magic"));
        }

        let header_type = f.read_u8();
        let encoding_method = f.read_u8();
        let description = f.read_string(DESCRIPTION_LEN);

        let n64 = match header_type {
            0 => None,
            1 => {
                let original_format = f.read_u8();
                let mut cart_id = [0u8; 3];
                cart_id.copy_from_slice(&f.read_bytes(3));
                let mut crc = [0u8; 8];
                crc.copy_from_slice(&f.read_bytes(8));
                let mut pad = [0u8; 5];
                pad.copy_from_slice(&f.read_bytes(5));
                Some(N64Info {
                    original_format,
                    cart_id,
                    crc,
                    pad,
                })
            }
            other => {
                return Err(PatchError::invalid(
                    "APS",
                    format!("unknown header type {other}"),
                ));
            }
        };

        let target_size = f.read_u32();
        if u64::from(target_size) > MAX_DECLARED_SIZE {
            return Err(PatchError::invalid("APS", "declared size exceeds limit"));
        }

        let mut records = Vec::new();
        while !f.is_eof() {
            if f.remaining() < 5 {
                return Err(PatchError::invalid("APS", "truncated record header"));
            }
            let offset = f.read_u32();
            let length = f.read_u8();
            let hunk = if length == 0 {
                if f.remaining() < 2 {
                    return Err(PatchError::invalid("APS", "truncated RLE record"));
                }
                let byte = f.read_u8();
                let run = f.read_u8();
                ApsN64Hunk::Rle { byte, length: run }
            } else {
                if f.remaining() < length as usize {
                    return Err(PatchError::invalid("APS", "record data past end of patch"));
                }
                ApsN64Hunk::Data(f.read_bytes(length as usize))
            };
            records.push(ApsN64Record { offset, hunk });
        }

        debug!(records = records.len(), target_size, "parsed APS patch");
        Ok(Self {
            encoding_method,
            description,
            n64,
            target_size,
            records,
        })
    }

    /// In N64 mode, the embedded cartridge id and CRC bytes must match
    /// the source ROM header. Raw mode accepts anything.
    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        let Some(n64) = &self.n64 else {
            return true;
        };
        let crc: Vec<u8> = (0..8).map(|i| source.get(skip + N64_CRC_OFFSET + i)).collect();
        let cart: Vec<u8> = (0..3)
            .map(|i| source.get(skip + N64_CART_ID_OFFSET + i))
            .collect();
        crc == n64.crc && cart == n64.cart_id
    }

    pub fn apply(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        if check && !self.validate_source(source, 0) {
            return Err(PatchError::validation(
                "APS",
                "cartridge id or CRC does not match the patch header".to_string(),
            ));
        }

        let mut out = source.clone();
        for record in &self.records {
            let offset = record.offset as usize;
            out.expand(offset);
            out.seek(offset);
            match &record.hunk {
                ApsN64Hunk::Data(data) => out.write_bytes(data),
                ApsN64Hunk::Rle { byte, length } => {
                    for _ in 0..*length {
                        out.write_u8(*byte);
                    }
                }
            }
        }

        let target = self.target_size as usize;
        out.expand(target);
        out.truncate(target);
        debug!(size = out.len(), "applied APS patch");
        Ok(out)
    }

    pub fn build(source: &RomBuf, modified: &RomBuf) -> Result<Self> {
        if modified.len() > u32::MAX as usize {
            return Err(PatchError::invalid("APS", "output exceeds 32-bit size"));
        }

        // ROM dumps large enough to carry the cartridge header get the
        // N64 header block; anything else is a raw patch.
        let n64 = (source.len() >= 0x40).then(|| {
            let mut cart_id = [0u8; 3];
            let mut crc = [0u8; 8];
            for (i, b) in cart_id.iter_mut().enumerate() {
                *b = source.get(N64_CART_ID_OFFSET + i);
            }
            for (i, b) in crc.iter_mut().enumerate() {
                *b = source.get(N64_CRC_OFFSET + i);
            }
            N64Info {
                original_format: 0,
                cart_id,
                crc,
                pad: [0; 5],
            }
        });

        let t = modified.as_bytes();
        let mut records = Vec::new();
        let mut ofs = 0usize;
        while ofs < t.len() {
            if source.get(ofs) == t[ofs] {
                ofs += 1;
                continue;
            }

            // Run of one repeated differing byte?
            let byte = t[ofs];
            let mut run = 0;
            while ofs + run < t.len()
                && run < u8::MAX as usize
                && t[ofs + run] == byte
                && source.get(ofs + run) != t[ofs + run]
            {
                run += 1;
            }
            if run >= MIN_RLE_RUN {
                records.push(ApsN64Record {
                    offset: ofs as u32,
                    hunk: ApsN64Hunk::Rle {
                        byte,
                        length: run as u8,
                    },
                });
                ofs += run;
                continue;
            }

            let start = ofs;
            while ofs < t.len()
                && ofs - start < u8::MAX as usize
                && source.get(ofs) != t[ofs]
            {
                ofs += 1;
            }
            records.push(ApsN64Record {
                offset: start as u32,
                hunk: ApsN64Hunk::Data(t[start..ofs].to_vec()),
            });
        }

        Ok(Self {
            encoding_method: 0,
            description: String::new(),
            n64,
            target_size: modified.len() as u32,
            records,
        })
    }

    pub fn export(&self, name: Option<&str>) -> RomBuf {
        let mut out = RomBuf::with_size(0).little_endian();
        if let Some(name) = name {
            out.set_name(name);
        }
        out.write_bytes(MAGIC);
        out.write_u8(self.n64.is_some() as u8);
        out.write_u8(self.encoding_method);
        out.write_string_padded(&self.description, DESCRIPTION_LEN);
        if let Some(n64) = &self.n64 {
            out.write_u8(n64.original_format);
            out.write_bytes(&n64.cart_id);
            out.write_bytes(&n64.crc);
            out.write_bytes(&n64.pad);
        }
        out.write_u32(self.target_size);
        for record in &self.records {
            out.write_u32(record.offset);
            match &record.hunk {
                ApsN64Hunk::Data(data) => {
                    out.write_u8(data.len() as u8);
                    out.write_bytes(data);
                }
                ApsN64Hunk::Rle { byte, length } => {
                    out.write_u8(0);
                    out.write_u8(*byte);
                    out.write_u8(*length);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rom() -> RomBuf {
        let mut data = vec![0u8; 0x100];
        data[N64_CRC_OFFSET..N64_CRC_OFFSET + 8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data[N64_CART_ID_OFFSET..N64_CART_ID_OFFSET + 3].copy_from_slice(b"SME");
        RomBuf::from_bytes(data)
    }

    #[test]
    fn build_apply_roundtrip() {
        let source = sample_rom();
        let mut m = source.as_bytes().to_vec();
        m[0x80] = 0xAA;
        m[0x81] = 0xBB;
        let modified = RomBuf::from_bytes(m);

        let patch = ApsN64Patch::build(&source, &modified).unwrap();
        assert!(patch.validate_source(&source, 0));
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn rle_for_long_runs() {
        let source = sample_rom();
        let mut m = source.as_bytes().to_vec();
        for b in &mut m[0x90..0xA0] {
            *b = 0x77;
        }
        let modified = RomBuf::from_bytes(m);

        let patch = ApsN64Patch::build(&source, &modified).unwrap();
        assert!(patch
            .records
            .iter()
            .any(|r| matches!(r.hunk, ApsN64Hunk::Rle { .. })));
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn output_resizes_to_declared_size() {
        let source = sample_rom();
        let mut m = source.as_bytes().to_vec();
        m.truncate(0x40);
        let modified = RomBuf::from_bytes(m);

        let patch = ApsN64Patch::build(&source, &modified).unwrap();
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.len(), 0x40);
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn wrong_cartridge_fails_validation() {
        let source = sample_rom();
        let modified = {
            let mut m = source.as_bytes().to_vec();
            m[0x80] = 0xAA;
            RomBuf::from_bytes(m)
        };
        let patch = ApsN64Patch::build(&source, &modified).unwrap();

        let other = RomBuf::from_bytes(vec![0u8; 0x100]);
        assert!(!patch.validate_source(&other, 0));
        assert!(matches!(
            patch.apply(&other, true),
            Err(PatchError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn export_parse_roundtrip() {
        let source = sample_rom();
        let mut m = source.as_bytes().to_vec();
        m[0x42] = 0x12;
        for b in &mut m[0xC0..0xD0] {
            *b = 0x34;
        }
        let modified = RomBuf::from_bytes(m);

        let patch = ApsN64Patch::build(&source, &modified).unwrap();
        let reparsed = ApsN64Patch::parse(patch.export(None).as_bytes()).unwrap();
        assert_eq!(reparsed, patch);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let source = sample_rom();
        let modified = {
            let mut m = source.as_bytes().to_vec();
            m[0x80] = 0xAA;
            RomBuf::from_bytes(m)
        };
        let patch = ApsN64Patch::build(&source, &modified).unwrap();
        let mut bytes = patch.export(None).into_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(ApsN64Patch::parse(&bytes).is_err());
    }
}
