//! PMSR patch format (Star Rod mod patches for Paper Mario)
//!
//! Big-endian container: `PMSR`, a u32 record count, then records of
//! `{u32 offset, u32 length, data}`. The patch targets exactly one ROM:
//! Paper Mario (USA) 1.0, 40 MiB with a known CRC32.

use rombuf::RomBuf;
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC: &[u8; 4] = b"PMSR";

/// Paper Mario (USA) 1.0: the only valid source ROM.
pub const PAPER_MARIO_SIZE: usize = 41_943_040;
pub const PAPER_MARIO_CRC32: u32 = 0xA7F5_CD7E;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmsrRecord {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// A parsed Star Rod patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmsrPatch {
    pub records: Vec<PmsrRecord>,
}

impl PmsrPatch {
    pub fn identify(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut f = RomBuf::from_bytes(data.to_vec());
        if f.read_bytes(MAGIC.len()) != MAGIC {
            return Err(PatchError::invalid("PMSR", "bad magic"));
        }

        let count = f.read_u32() as usize;
        let mut records = Vec::new();
        for _ in 0..count {
            if f.remaining() < 8 {
                return Err(PatchError::invalid("PMSR", "truncated record header"));
            }
            let offset = f.read_u32();
            let length = f.read_u32() as usize;
            if f.remaining() < length {
                return Err(PatchError::invalid("PMSR", "record data past end of patch"));
            }
            records.push(PmsrRecord {
                offset,
                data: f.read_bytes(length),
            });
        }
        if !f.is_eof() {
            return Err(PatchError::invalid("PMSR", "trailing bytes after records"));
        }

        debug!(records = records.len(), "parsed PMSR patch");
        Ok(Self { records })
    }

    /// Only the Paper Mario (USA) 1.0 ROM is a valid source.
    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        source.len().saturating_sub(skip) == PAPER_MARIO_SIZE
            && source.crc32(skip..source.len()) == PAPER_MARIO_CRC32
    }

    pub fn apply(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        if check && !self.validate_source(source, 0) {
            return Err(PatchError::validation(
                "PMSR",
                "source is not the Paper Mario (USA) 1.0 ROM".to_string(),
            ));
        }

        let mut out = source.clone();
        for record in &self.records {
            if u64::from(record.offset) > MAX_DECLARED_SIZE {
                return Err(PatchError::invalid(
                    "PMSR",
                    "record offset exceeds the size limit",
                ));
            }
            let offset = record.offset as usize;
            out.expand(offset);
            out.seek(offset);
            out.write_bytes(&record.data);
        }
        debug!(records = self.records.len(), size = out.len(), "applied PMSR patch");
        Ok(out)
    }

    pub fn build(source: &RomBuf, modified: &RomBuf) -> Result<Self> {
        if modified.len() < source.len() {
            return Err(PatchError::invalid(
                "PMSR",
                "the container cannot shrink a file",
            ));
        }
        if modified.len() > u32::MAX as usize {
            return Err(PatchError::invalid("PMSR", "output exceeds 32-bit range"));
        }

        let t = modified.as_bytes();
        let mut records = Vec::new();
        let mut ofs = 0usize;
        while ofs < t.len() {
            if source.get(ofs) == t[ofs] && ofs < source.len() {
                ofs += 1;
                continue;
            }
            let start = ofs;
            while ofs < t.len() && !(source.get(ofs) == t[ofs] && ofs < source.len()) {
                ofs += 1;
            }
            records.push(PmsrRecord {
                offset: start as u32,
                data: t[start..ofs].to_vec(),
            });
        }

        Ok(Self { records })
    }

    pub fn export(&self, name: Option<&str>) -> RomBuf {
        let mut out = RomBuf::with_size(0);
        if let Some(name) = name {
            out.set_name(name);
        }
        out.write_bytes(MAGIC);
        out.write_u32(self.records.len() as u32);
        for record in &self.records {
            out.write_u32(record.offset);
            out.write_u32(record.data.len() as u32);
            out.write_bytes(&record.data);
        }
        out
    }
}
