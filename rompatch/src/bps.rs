//! BPS patch format
//!
//! `BPS1`, VLV source/target sizes, a metadata string, then a stream of
//! action words until 12 bytes from the end. Each word packs the opcode
//! in its low 2 bits and `length - 1` above them. Copy actions carry a
//! signed VLV that advances a per-stream relative offset. The trailer
//! holds little-endian CRC32s of the source, the target, and the patch
//! file minus its own last four bytes.
//!
//! `TargetCopy` must copy byte-at-a-time: a delta pointing just behind
//! the write cursor is the format's idiom for run-length fills.

use std::collections::HashMap;

use rombuf::{checksum, RomBuf};
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC: &[u8; 4] = b"BPS1";
const TRAILER_LEN: usize = 12;

const SOURCE_READ: u64 = 0;
const TARGET_READ: u64 = 1;
const SOURCE_COPY: u64 = 2;
const TARGET_COPY: u64 = 3;

/// How many hash-chain candidates the builder examines per position.
const MAX_CANDIDATES: usize = 32;

/// One decoded action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BpsAction {
    SourceRead { length: u64 },
    TargetRead { bytes: Vec<u8> },
    SourceCopy { length: u64, delta: i64 },
    TargetCopy { length: u64, delta: i64 },
}

/// A parsed BPS patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpsPatch {
    pub source_size: u64,
    pub target_size: u64,
    pub metadata: String,
    pub actions: Vec<BpsAction>,
    pub source_crc32: u32,
    pub target_crc32: u32,
    pub patch_crc32: u32,
}

fn decode_signed(value: u64) -> i64 {
    let magnitude = (value >> 1) as i64;
    if value & 1 != 0 { -magnitude } else { magnitude }
}

fn encode_signed(delta: i64) -> u64 {
    (delta.unsigned_abs() << 1) | u64::from(delta < 0)
}

impl BpsPatch {
    pub fn identify(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() + TRAILER_LEN {
            return Err(PatchError::invalid("BPS", "file too short"));
        }
        let computed_patch_crc = checksum::crc32(&data[..data.len() - 4]);

        let mut f = RomBuf::from_bytes(data.to_vec()).little_endian();
        if f.read_bytes(MAGIC.len()) != MAGIC {
            return Err(PatchError::invalid("BPS", "bad magic"));
        }

        let source_size = f.read_vlv_ups();
        let target_size = f.read_vlv_ups();
        if source_size > MAX_DECLARED_SIZE || target_size > MAX_DECLARED_SIZE {
            return Err(PatchError::invalid("BPS", "declared size exceeds limit"));
        }

        let metadata_size = f.read_vlv_ups();
        let records_end = data.len() - TRAILER_LEN;
        if metadata_size > (records_end - f.tell()) as u64 {
            return Err(PatchError::invalid("BPS", "metadata past end of actions"));
        }
        let metadata = f.read_string(metadata_size as usize);

        let mut actions = Vec::new();
        while f.tell() < records_end {
            let word = f.read_vlv_ups();
            let length = (word >> 2) + 1;
            let action = match word & 3 {
                SOURCE_READ => BpsAction::SourceRead { length },
                TARGET_READ => {
                    if length > (records_end - f.tell()) as u64 {
                        return Err(PatchError::invalid("BPS", "literal data past end of actions"));
                    }
                    BpsAction::TargetRead {
                        bytes: f.read_bytes(length as usize),
                    }
                }
                SOURCE_COPY => BpsAction::SourceCopy {
                    length,
                    delta: decode_signed(f.read_vlv_ups()),
                },
                _ => BpsAction::TargetCopy {
                    length,
                    delta: decode_signed(f.read_vlv_ups()),
                },
            };
            actions.push(action);
        }

        f.seek(records_end);
        let source_crc32 = f.read_u32();
        let target_crc32 = f.read_u32();
        let patch_crc32 = f.read_u32();
        if patch_crc32 != computed_patch_crc {
            return Err(PatchError::invalid(
                "BPS",
                format!(
                    "patch checksum self-test failed: declared {patch_crc32:08x}, computed {computed_patch_crc:08x}"
                ),
            ));
        }

        debug!(source_size, target_size, actions = actions.len(), "parsed BPS patch");
        Ok(Self {
            source_size,
            target_size,
            metadata,
            actions,
            source_crc32,
            target_crc32,
            patch_crc32,
        })
    }

    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        source.crc32(skip..skip + self.source_size as usize) == self.source_crc32
    }

    pub fn apply(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        if check && !self.validate_source(source, 0) {
            return Err(PatchError::validation(
                "BPS",
                format!("source CRC32 does not match {:08x}", self.source_crc32),
            ));
        }

        let target_size = self.target_size as usize;
        let mut out = RomBuf::with_size(target_size);
        let src = source.as_bytes();

        let mut out_ofs: usize = 0;
        let mut src_rel: usize = 0;
        let mut tgt_rel: usize = 0;

        for action in &self.actions {
            match action {
                BpsAction::SourceRead { length } => {
                    let length = *length as usize;
                    let end = out_ofs + length;
                    if end > target_size || end > src.len() {
                        return Err(PatchError::invalid("BPS", "source read out of range"));
                    }
                    out.seek(out_ofs);
                    out.write_bytes(&src[out_ofs..end]);
                    out_ofs = end;
                }
                BpsAction::TargetRead { bytes } => {
                    if out_ofs + bytes.len() > target_size {
                        return Err(PatchError::invalid("BPS", "literal write out of range"));
                    }
                    out.seek(out_ofs);
                    out.write_bytes(bytes);
                    out_ofs += bytes.len();
                }
                BpsAction::SourceCopy { length, delta } => {
                    let length = *length as usize;
                    src_rel = offset_by(src_rel, *delta)
                        .ok_or_else(|| PatchError::invalid("BPS", "source copy offset underflow"))?;
                    if src_rel + length > src.len() || out_ofs + length > target_size {
                        return Err(PatchError::invalid("BPS", "source copy out of range"));
                    }
                    out.seek(out_ofs);
                    out.write_bytes(&src[src_rel..src_rel + length]);
                    src_rel += length;
                    out_ofs += length;
                }
                BpsAction::TargetCopy { length, delta } => {
                    let length = *length as usize;
                    tgt_rel = offset_by(tgt_rel, *delta)
                        .ok_or_else(|| PatchError::invalid("BPS", "target copy offset underflow"))?;
                    if out_ofs + length > target_size {
                        return Err(PatchError::invalid("BPS", "target copy out of range"));
                    }
                    // Byte-at-a-time on purpose: overlapping copies are
                    // the format's run-length fill.
                    for _ in 0..length {
                        if tgt_rel >= out_ofs {
                            return Err(PatchError::invalid("BPS", "target copy ahead of output"));
                        }
                        let byte = out.get(tgt_rel);
                        out.seek(out_ofs);
                        out.write_u8(byte);
                        tgt_rel += 1;
                        out_ofs += 1;
                    }
                }
            }
        }

        if out_ofs != target_size {
            return Err(PatchError::invalid(
                "BPS",
                format!("actions produced {out_ofs} bytes, declared {target_size}"),
            ));
        }
        let actual = out.crc32(0..out.len());
        if actual != self.target_crc32 {
            return Err(PatchError::checksum_u32("BPS", self.target_crc32, actual));
        }
        debug!(size = out.len(), "applied BPS patch");
        Ok(out)
    }

    /// Greedy delta builder.
    ///
    /// At each target position the longest of three candidates wins: an
    /// aligned equality run (`SourceRead`), a hash-chained match
    /// elsewhere in the source (`SourceCopy`), or a run of the previous
    /// output byte (`TargetCopy`, the run-length idiom). Anything
    /// shorter accumulates into a pending `TargetRead`.
    pub fn build(source: &RomBuf, modified: &RomBuf, metadata: Option<&str>) -> Self {
        let s = source.as_bytes();
        let t = modified.as_bytes();

        // Two-byte seeds so short relocated runs are still found.
        let mut chains: HashMap<u16, Vec<usize>> = HashMap::new();
        for pos in 0..s.len().saturating_sub(1) {
            chains
                .entry(u16::from_be_bytes([s[pos], s[pos + 1]]))
                .or_default()
                .push(pos);
        }

        let mut actions = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut src_rel: usize = 0;
        let mut tgt_rel: usize = 0;
        let mut ofs = 0usize;

        while ofs < t.len() {
            let aligned = {
                let limit = s.len().min(t.len());
                let mut n = 0;
                while ofs + n < limit && s[ofs + n] == t[ofs + n] {
                    n += 1;
                }
                n
            };

            let rle = if ofs > 0 {
                let byte = t[ofs - 1];
                let mut n = 0;
                while ofs + n < t.len() && t[ofs + n] == byte {
                    n += 1;
                }
                n
            } else {
                0
            };

            let (mut copy_len, mut copy_pos) = (0usize, 0usize);
            if ofs + 1 < t.len() {
                let seed = u16::from_be_bytes([t[ofs], t[ofs + 1]]);
                if let Some(positions) = chains.get(&seed) {
                    for &pos in positions.iter().rev().take(MAX_CANDIDATES) {
                        let mut n = 0;
                        while pos + n < s.len() && ofs + n < t.len() && s[pos + n] == t[ofs + n] {
                            n += 1;
                        }
                        if n > copy_len {
                            copy_len = n;
                            copy_pos = pos;
                        }
                    }
                }
            }

            if aligned >= 4 && aligned >= copy_len && aligned >= rle {
                flush_literal(&mut actions, &mut pending);
                actions.push(BpsAction::SourceRead {
                    length: aligned as u64,
                });
                ofs += aligned;
            } else if copy_len >= 2 && copy_len >= rle {
                flush_literal(&mut actions, &mut pending);
                actions.push(BpsAction::SourceCopy {
                    length: copy_len as u64,
                    delta: copy_pos as i64 - src_rel as i64,
                });
                src_rel = copy_pos + copy_len;
                ofs += copy_len;
            } else if rle >= 2 {
                flush_literal(&mut actions, &mut pending);
                actions.push(BpsAction::TargetCopy {
                    length: rle as u64,
                    delta: (ofs - 1) as i64 - tgt_rel as i64,
                });
                tgt_rel = (ofs - 1) + rle;
                ofs += rle;
            } else {
                pending.push(t[ofs]);
                ofs += 1;
            }
        }
        flush_literal(&mut actions, &mut pending);

        Self {
            source_size: s.len() as u64,
            target_size: t.len() as u64,
            metadata: metadata.unwrap_or("").to_owned(),
            actions,
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
        out.write_vlv_ups(self.metadata.len() as u64);
        out.write_bytes(self.metadata.as_bytes());
        for action in &self.actions {
            match action {
                BpsAction::SourceRead { length } => {
                    out.write_vlv_ups((length - 1) << 2 | SOURCE_READ);
                }
                BpsAction::TargetRead { bytes } => {
                    out.write_vlv_ups((bytes.len() as u64 - 1) << 2 | TARGET_READ);
                    out.write_bytes(bytes);
                }
                BpsAction::SourceCopy { length, delta } => {
                    out.write_vlv_ups((length - 1) << 2 | SOURCE_COPY);
                    out.write_vlv_ups(encode_signed(*delta));
                }
                BpsAction::TargetCopy { length, delta } => {
                    out.write_vlv_ups((length - 1) << 2 | TARGET_COPY);
                    out.write_vlv_ups(encode_signed(*delta));
                }
            }
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

fn offset_by(base: usize, delta: i64) -> Option<usize> {
    if delta < 0 {
        base.checked_sub(delta.unsigned_abs() as usize)
    } else {
        base.checked_add(delta as usize)
    }
}

fn flush_literal(actions: &mut Vec<BpsAction>, pending: &mut Vec<u8>) {
    if !pending.is_empty() {
        actions.push(BpsAction::TargetRead {
            bytes: std::mem::take(pending),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_vlv() {
        assert_eq!(decode_signed(encode_signed(0)), 0);
        assert_eq!(decode_signed(encode_signed(5)), 5);
        assert_eq!(decode_signed(encode_signed(-5)), -5);
        assert_eq!(encode_signed(-1), 3);
        assert_eq!(encode_signed(1), 2);
    }

    #[test]
    fn copy_actions_appear_and_roundtrip() {
        let source = RomBuf::from_bytes(vec![0xAA, 0xBB, 0xCC, 0xDD]);
        let modified = RomBuf::from_bytes(vec![0xCC, 0xDD, 0xAA, 0xBB, 0xBB, 0xBB]);

        let patch = BpsPatch::build(&source, &modified, None);
        assert!(patch
            .actions
            .iter()
            .any(|a| matches!(a, BpsAction::SourceCopy { .. })));
        assert!(patch
            .actions
            .iter()
            .any(|a| matches!(a, BpsAction::TargetCopy { .. })));

        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn identical_files_become_one_source_read() {
        let source = RomBuf::from_bytes((0u8..64).collect());
        let patch = BpsPatch::build(&source, &source, None);
        assert_eq!(
            patch.actions,
            vec![BpsAction::SourceRead { length: 64 }]
        );
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), source.as_bytes());
    }

    #[test]
    fn target_copy_backref_fills_rle() {
        // A hand-built patch: one literal byte, then a self-overlapping
        // copy with delta -1, which must repeat that byte.
        let patch = BpsPatch {
            source_size: 0,
            target_size: 5,
            metadata: String::new(),
            actions: vec![
                BpsAction::TargetRead { bytes: vec![0x7E] },
                BpsAction::TargetCopy { length: 4, delta: 0 },
            ],
            source_crc32: checksum::crc32(b""),
            target_crc32: checksum::crc32(&[0x7E; 5]),
            patch_crc32: 0,
        };
        let out = patch.apply(&RomBuf::with_size(0), true).unwrap();
        assert_eq!(out.as_bytes(), &[0x7E; 5]);
    }

    #[test]
    fn declared_size_mismatch_is_rejected() {
        let patch = BpsPatch {
            source_size: 0,
            target_size: 9,
            metadata: String::new(),
            actions: vec![BpsAction::TargetRead { bytes: vec![1, 2] }],
            source_crc32: checksum::crc32(b""),
            target_crc32: 0,
            patch_crc32: 0,
        };
        assert!(matches!(
            patch.apply(&RomBuf::with_size(0), true),
            Err(PatchError::InvalidPatchFile { .. })
        ));
    }

    #[test]
    fn target_checksum_mismatch_is_reported() {
        let source = RomBuf::from_bytes(vec![1, 2, 3, 4]);
        let modified = RomBuf::from_bytes(vec![4, 3, 2, 1]);
        let mut patch = BpsPatch::build(&source, &modified, None);
        patch.target_crc32 ^= 0xDEAD_BEEF;
        assert!(matches!(
            patch.apply(&source, true),
            Err(PatchError::TargetChecksumMismatch { .. })
        ));
    }

    #[test]
    fn export_parse_roundtrip_with_metadata() {
        let source = RomBuf::from_bytes((0u8..=255).collect());
        let mut m: Vec<u8> = (0u8..=255).collect();
        m.rotate_left(16);
        m.extend_from_slice(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let modified = RomBuf::from_bytes(m);

        let patch = BpsPatch::build(&source, &modified, Some("patch notes"));
        let reparsed = BpsPatch::parse(patch.export(None).as_bytes()).unwrap();
        assert_eq!(reparsed, patch);

        let out = reparsed.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }
}
