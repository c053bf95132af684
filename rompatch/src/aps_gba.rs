//! APS patch format, GBA lineage
//!
//! Little-endian container: `APS1`, u32 source and target sizes, then
//! fixed-size records of `{u32 offset, u16 source CRC16, u16 target
//! CRC16, 64 KiB of XOR data}`. The source must match the declared size
//! exactly; every record's block checksums are verified on both sides
//! of the XOR.

use rombuf::{checksum, RomBuf};
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC: &[u8; 4] = b"APS1";

/// XOR blocks are one full 64 KiB bank.
pub const BLOCK_SIZE: usize = 0x10000;

const RECORD_SIZE: usize = 4 + 2 + 2 + BLOCK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApsGbaRecord {
    pub offset: u32,
    pub source_crc16: u16,
    pub target_crc16: u16,
    pub xor: Vec<u8>,
}

/// A parsed GBA-family APS patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApsGbaPatch {
    pub source_size: u32,
    pub target_size: u32,
    pub records: Vec<ApsGbaRecord>,
}

/// One zero-padded 64 KiB block starting at `offset`.
fn block_of(buf: &RomBuf, offset: usize) -> Vec<u8> {
    (0..BLOCK_SIZE).map(|i| buf.get(offset + i)).collect()
}

impl ApsGbaPatch {
    pub fn identify(data: &[u8]) -> bool {
        // `APS1` is a prefix of the N64 magic `APS10`; require the GBA
        // container here.
        data.starts_with(MAGIC) && !data.starts_with(super::aps_n64::MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut f = RomBuf::from_bytes(data.to_vec()).little_endian();
        if f.read_bytes(MAGIC.len()) != MAGIC {
            return Err(PatchError::invalid("APS-GBA", "bad magic"));
        }

        let source_size = f.read_u32();
        let target_size = f.read_u32();
        if u64::from(source_size) > MAX_DECLARED_SIZE || u64::from(target_size) > MAX_DECLARED_SIZE
        {
            return Err(PatchError::invalid("APS-GBA", "declared size exceeds limit"));
        }

        let body = f.remaining();
        if body % RECORD_SIZE != 0 {
            return Err(PatchError::invalid(
                "APS-GBA",
                format!("body is not a whole number of {RECORD_SIZE}-byte records"),
            ));
        }

        let mut records = Vec::with_capacity(body / RECORD_SIZE);
        while !f.is_eof() {
            let offset = f.read_u32();
            let source_crc16 = f.read_u16();
            let target_crc16 = f.read_u16();
            let xor = f.read_bytes(BLOCK_SIZE);
            records.push(ApsGbaRecord {
                offset,
                source_crc16,
                target_crc16,
                xor,
            });
        }

        debug!(source_size, target_size, records = records.len(), "parsed APS-GBA patch");
        Ok(Self {
            source_size,
            target_size,
            records,
        })
    }

    /// The source must have exactly the declared size and every declared
    /// block CRC16 must match.
    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        if source.len().saturating_sub(skip) != self.source_size as usize {
            return false;
        }
        self.records.iter().all(|record| {
            checksum::crc16(&block_of(source, skip + record.offset as usize))
                == record.source_crc16
        })
    }

    pub fn apply(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        if source.len() != self.source_size as usize {
            return Err(PatchError::InvalidSourceFile(format!(
                "APS-GBA needs a source of exactly {} bytes, got {}",
                self.source_size,
                source.len()
            )));
        }
        if check && !self.validate_source(source, 0) {
            return Err(PatchError::validation(
                "APS-GBA",
                "block CRC16 does not match the source".to_string(),
            ));
        }

        let target_size = self.target_size as usize;
        let mut out = RomBuf::with_size(target_size);
        out.seek(0);
        let copy = source.len().min(target_size);
        out.write_bytes(&source.as_bytes()[..copy]);

        for record in &self.records {
            let offset = record.offset as usize;
            for (i, &x) in record.xor.iter().enumerate() {
                let pos = offset + i;
                if pos < target_size {
                    out.seek(pos);
                    out.write_u8(source.get(pos) ^ x);
                }
            }
            let actual = checksum::crc16(&block_of(&out, offset));
            if actual != record.target_crc16 {
                return Err(PatchError::TargetChecksumMismatch {
                    format: "APS-GBA",
                    expected: format!("{:04x}", record.target_crc16),
                    actual: format!("{actual:04x}"),
                });
            }
        }

        debug!(size = out.len(), "applied APS-GBA patch");
        Ok(out)
    }

    pub fn build(source: &RomBuf, modified: &RomBuf) -> Result<Self> {
        if source.len() > u32::MAX as usize || modified.len() > u32::MAX as usize {
            return Err(PatchError::invalid("APS-GBA", "size exceeds 32 bits"));
        }

        let span = source.len().max(modified.len());
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < span {
            let src_block = block_of(source, offset);
            let dst_block = block_of(modified, offset);
            if src_block != dst_block {
                let xor = src_block
                    .iter()
                    .zip(&dst_block)
                    .map(|(a, b)| a ^ b)
                    .collect();
                records.push(ApsGbaRecord {
                    offset: offset as u32,
                    source_crc16: checksum::crc16(&src_block),
                    target_crc16: checksum::crc16(&dst_block),
                    xor,
                });
            }
            offset += BLOCK_SIZE;
        }

        Ok(Self {
            source_size: source.len() as u32,
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
        out.write_u32(self.source_size);
        out.write_u32(self.target_size);
        for record in &self.records {
            out.write_u32(record.offset);
            out.write_u16(record.source_crc16);
            out.write_u16(record.target_crc16);
            out.write_bytes(&record.xor);
        }
        out
    }
}
