//! IPS patch format (and its EBP variant)
//!
//! The classic container: ASCII `PATCH`, then records of
//! `{u24be offset, u16be length, payload}` until the ASCII `EOF`
//! terminator. A record length of zero introduces a run-length record
//! (`u16be run length, u8 fill byte`). After `EOF` an optional trailing
//! u24 truncates the output. EBP files are IPS bodies with a JSON
//! object appended after the terminator; the JSON is carried verbatim
//! so exports stay byte-exact.

use rombuf::RomBuf;
use tracing::{debug, trace};

use crate::error::{PatchError, Result};

pub(crate) const MAGIC: &[u8; 5] = b"PATCH";
const EOF_MARK: &[u8; 3] = b"EOF";

/// Record offsets are 24-bit; 0x454F46 ("EOF") is reserved as the
/// terminator and never emitted as an offset.
const RESERVED_OFFSET: u32 = 0x454F46;

/// Data records hold at most a u16 of payload.
const MAX_RECORD_LEN: usize = 0xFFFF;

/// One IPS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsRecord {
    pub offset: u32,
    pub hunk: IpsHunk,
}

/// Record payload: literal bytes or a run-length fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpsHunk {
    Data(Vec<u8>),
    Rle { length: u16, byte: u8 },
}

impl IpsHunk {
    /// Number of output bytes the record produces.
    fn output_len(&self) -> usize {
        match self {
            IpsHunk::Data(data) => data.len(),
            IpsHunk::Rle { length, .. } => *length as usize,
        }
    }
}

/// A parsed IPS (or EBP) patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsPatch {
    pub records: Vec<IpsRecord>,
    /// Output size after apply, from the optional post-`EOF` word.
    pub truncate: Option<u32>,
    /// Raw EBP JSON trailer, when present.
    pub metadata: Option<String>,
}

impl IpsPatch {
    pub fn identify(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut f = RomBuf::from_bytes(data.to_vec());
        if f.read_bytes(MAGIC.len()) != MAGIC {
            return Err(PatchError::invalid("IPS", "bad magic"));
        }

        let mut records = Vec::new();
        loop {
            if f.remaining() < 3 {
                return Err(PatchError::invalid("IPS", "missing EOF terminator"));
            }
            f.save_offset();
            if f.read_bytes(3) == EOF_MARK {
                break;
            }
            f.restore_offset();

            let offset = f.read_u24();
            if f.remaining() < 2 {
                return Err(PatchError::invalid("IPS", "truncated record header"));
            }
            let length = f.read_u16() as usize;
            let hunk = if length == 0 {
                if f.remaining() < 3 {
                    return Err(PatchError::invalid("IPS", "truncated RLE record"));
                }
                let run = f.read_u16();
                let byte = f.read_u8();
                IpsHunk::Rle { length: run, byte }
            } else {
                if f.remaining() < length {
                    return Err(PatchError::invalid("IPS", "record data past end of patch"));
                }
                IpsHunk::Data(f.read_bytes(length))
            };
            records.push(IpsRecord { offset, hunk });
        }

        // After EOF: nothing, a 3-byte truncation word, or an EBP JSON
        // trailer.
        let mut truncate = None;
        let mut metadata = None;
        match f.remaining() {
            0 => {}
            3 => truncate = Some(f.read_u24()),
            n => {
                let trailer = f.read_bytes(n);
                let text = String::from_utf8(trailer)
                    .map_err(|_| PatchError::invalid("IPS", "non-UTF-8 trailer after EOF"))?;
                serde_json::from_str::<serde_json::Value>(&text)
                    .map_err(|e| PatchError::invalid("IPS", format!("bad EBP metadata: {e}")))?;
                metadata = Some(text);
            }
        }

        debug!(records = records.len(), "parsed IPS patch");
        Ok(Self {
            records,
            truncate,
            metadata,
        })
    }

    /// IPS carries no source fingerprint; any source is acceptable.
    pub fn validate_source(&self, _source: &RomBuf, _skip: usize) -> bool {
        true
    }

    pub fn apply(&self, source: &RomBuf, _check: bool) -> Result<RomBuf> {
        let mut out = source.clone();
        for record in &self.records {
            let offset = record.offset as usize;
            out.expand(offset);
            out.seek(offset);
            match &record.hunk {
                IpsHunk::Data(data) => out.write_bytes(data),
                IpsHunk::Rle { length, byte } => {
                    for _ in 0..*length {
                        out.write_u8(*byte);
                    }
                }
            }
            trace!(offset, len = record.hunk.output_len(), "applied record");
        }
        if let Some(size) = self.truncate {
            out.truncate(size as usize);
        }
        debug!(records = self.records.len(), size = out.len(), "applied IPS patch");
        Ok(out)
    }

    /// Diff `source` against `modified` into records.
    pub fn build(source: &RomBuf, modified: &RomBuf) -> Result<Self> {
        Self::build_with_metadata(source, modified, None)
    }

    /// EBP flavor: same record stream plus a JSON trailer.
    pub fn build_with_metadata(
        source: &RomBuf,
        modified: &RomBuf,
        metadata: Option<&str>,
    ) -> Result<Self> {
        if let Some(text) = metadata {
            serde_json::from_str::<serde_json::Value>(text)
                .map_err(|e| PatchError::invalid("IPS", format!("bad EBP metadata: {e}")))?;
        }

        let s = source.as_bytes();
        let t = modified.as_bytes();
        let mut records = Vec::new();
        let mut ofs = 0;
        while ofs < t.len() {
            let same = ofs < s.len() && s[ofs] == t[ofs];
            if same {
                ofs += 1;
                continue;
            }

            let mut start = ofs;
            // Collect the differing run, capped at the u16 record limit.
            let mut end = ofs;
            while end < t.len()
                && end - start < MAX_RECORD_LEN
                && !(end < s.len() && s[end] == t[end])
            {
                end += 1;
            }

            // The reserved terminator value cannot start a record; back
            // up one byte and re-write the preceding (equal) byte.
            if start == RESERVED_OFFSET as usize {
                start -= 1;
            }
            if start > 0xFF_FFFF {
                return Err(PatchError::invalid(
                    "IPS",
                    "difference beyond 24-bit offset range",
                ));
            }

            let chunk = &t[start..end];
            let rle = chunk.iter().all(|&b| b == chunk[0]);
            if rle && chunk.len() > 2 {
                records.push(IpsRecord {
                    offset: start as u32,
                    hunk: IpsHunk::Rle {
                        length: chunk.len() as u16,
                        byte: chunk[0],
                    },
                });
            } else {
                records.push(IpsRecord {
                    offset: start as u32,
                    hunk: IpsHunk::Data(chunk.to_vec()),
                });
            }
            ofs = end;
        }

        // A grown output must be reached by a record even when the new
        // tail bytes are zero (a zero tail compares equal to the
        // zero-extended source above).
        if t.len() > s.len() {
            let covered = records
                .iter()
                .map(|r| r.offset as usize + r.hunk.output_len())
                .max()
                .unwrap_or(0);
            if covered < t.len() {
                let last = t.len() - 1;
                if last > 0xFF_FFFF {
                    return Err(PatchError::invalid(
                        "IPS",
                        "difference beyond 24-bit offset range",
                    ));
                }
                records.push(IpsRecord {
                    offset: last as u32,
                    hunk: IpsHunk::Data(vec![t[last]]),
                });
            }
        }

        let truncate = (t.len() < s.len()).then(|| t.len() as u32);
        Ok(Self {
            records,
            truncate,
            metadata: metadata.map(str::to_owned),
        })
    }

    pub fn export(&self, name: Option<&str>) -> RomBuf {
        let mut out = RomBuf::with_size(0);
        if let Some(name) = name {
            out.set_name(name);
        }
        out.write_bytes(MAGIC);
        for record in &self.records {
            out.write_u24(record.offset);
            match &record.hunk {
                IpsHunk::Data(data) => {
                    out.write_u16(data.len() as u16);
                    out.write_bytes(data);
                }
                IpsHunk::Rle { length, byte } => {
                    out.write_u16(0);
                    out.write_u16(*length);
                    out.write_u8(*byte);
                }
            }
        }
        out.write_bytes(EOF_MARK);
        if let Some(size) = self.truncate {
            out.write_u24(size);
        }
        if let Some(metadata) = &self.metadata {
            out.write_bytes(metadata.as_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_patch() {
        // "PATCH" + record at 2, len 2, AA BB + "EOF"
        let patch = IpsPatch::parse(&[
            0x50, 0x41, 0x54, 0x43, 0x48, 0x00, 0x00, 0x02, 0x00, 0x02, 0xAA, 0xBB, 0x45, 0x4F,
            0x46,
        ])
        .unwrap();

        let source = RomBuf::from_bytes(vec![0x00; 5]);
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), &[0x00, 0x00, 0xAA, 0xBB, 0x00]);
    }

    #[test]
    fn rle_record() {
        let patch = IpsPatch::parse(&[
            0x50, 0x41, 0x54, 0x43, 0x48, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0xFF, 0x45,
            0x4F, 0x46,
        ])
        .unwrap();

        let source = RomBuf::from_bytes(vec![0x00; 8]);
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(
            out.as_bytes(),
            &[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn record_past_source_end_expands() {
        let patch = IpsPatch {
            records: vec![IpsRecord {
                offset: 6,
                hunk: IpsHunk::Data(vec![0x11, 0x22]),
            }],
            truncate: None,
            metadata: None,
        };
        let source = RomBuf::from_bytes(vec![0xAA; 4]);
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), &[0xAA, 0xAA, 0xAA, 0xAA, 0x00, 0x00, 0x11, 0x22]);
    }

    #[test]
    fn truncation_word() {
        let mut data = b"PATCH".to_vec();
        data.extend_from_slice(b"EOF");
        data.extend_from_slice(&[0x00, 0x00, 0x03]);
        let patch = IpsPatch::parse(&data).unwrap();
        assert_eq!(patch.truncate, Some(3));

        let source = RomBuf::from_bytes(vec![1, 2, 3, 4, 5]);
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let err = IpsPatch::parse(b"PATCH\x00\x00\x02\x00\x02\xAA\xBB").unwrap_err();
        assert!(matches!(err, PatchError::InvalidPatchFile { .. }));
    }

    #[test]
    fn record_data_overrun_is_rejected() {
        // Declares 4 bytes of payload but only 1 follows.
        let err = IpsPatch::parse(b"PATCH\x00\x00\x00\x00\x04\xAAEOF").unwrap_err();
        assert!(matches!(err, PatchError::InvalidPatchFile { .. }));
    }

    #[test]
    fn build_compares_source_against_modified() {
        let source = RomBuf::from_bytes(vec![1, 2, 3, 4, 5, 6]);
        let modified = RomBuf::from_bytes(vec![1, 9, 9, 4, 5, 7]);
        let patch = IpsPatch::build(&source, &modified).unwrap();
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn build_emits_rle_for_runs() {
        let source = RomBuf::from_bytes(vec![0u8; 64]);
        let modified = RomBuf::from_bytes(vec![0x5A; 64]);
        let patch = IpsPatch::build(&source, &modified).unwrap();
        assert!(patch
            .records
            .iter()
            .any(|r| matches!(r.hunk, IpsHunk::Rle { .. })));
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn build_handles_grown_zero_tail() {
        let source = RomBuf::from_bytes(vec![1, 2]);
        let modified = RomBuf::from_bytes(vec![1, 2, 0, 0, 0]);
        let patch = IpsPatch::build(&source, &modified).unwrap();
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn build_shrunk_output_truncates() {
        let source = RomBuf::from_bytes(vec![1, 2, 3, 4, 5]);
        let modified = RomBuf::from_bytes(vec![1, 2]);
        let patch = IpsPatch::build(&source, &modified).unwrap();
        assert_eq!(patch.truncate, Some(2));
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn export_parse_roundtrip() {
        let source = RomBuf::from_bytes(vec![7u8; 300]);
        let modified = {
            let mut m = vec![7u8; 300];
            m[10] = 1;
            m[11] = 2;
            for b in &mut m[100..140] {
                *b = 0xEE;
            }
            RomBuf::from_bytes(m)
        };
        let patch = IpsPatch::build(&source, &modified).unwrap();
        let reparsed = IpsPatch::parse(patch.export(None).as_bytes()).unwrap();
        assert_eq!(reparsed, patch);
    }

    #[test]
    fn ebp_metadata_roundtrip() {
        let source = RomBuf::from_bytes(vec![0u8; 8]);
        let modified = RomBuf::from_bytes(vec![1u8; 8]);
        let meta = r#"{"patcher":"EBPatcher","description":"test"}"#;
        let patch = IpsPatch::build_with_metadata(&source, &modified, Some(meta)).unwrap();

        let exported = patch.export(None);
        let reparsed = IpsPatch::parse(exported.as_bytes()).unwrap();
        assert_eq!(reparsed.metadata.as_deref(), Some(meta));
        assert_eq!(reparsed, patch);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut data = b"PATCH".to_vec();
        data.extend_from_slice(b"EOF");
        data.extend_from_slice(b"not json at all");
        assert!(IpsPatch::parse(&data).is_err());
    }
}
