//! PPF patch format (PlayStation Patch File), versions 1 to 3
//!
//! Little-endian container: a 5-byte magic (`PPF10`, `PPF20`, `PPF30`),
//! an encoding method byte, a 50-byte description, then per-version
//! header fields. Version 2 declares the input file size and always
//! carries a 1024-byte block check; version 3 gates the block check and
//! undo data behind flags and widens record offsets to 64 bits.
//! Records are `{offset, u8 length, data, undo?}` until end of file or
//! the optional `@BEGIN_FILE_ID.DIZ` trailer.

use rombuf::RomBuf;
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC_PREFIX: &[u8; 3] = b"PPF";

const DESCRIPTION_LEN: usize = 50;
const BLOCK_CHECK_LEN: usize = 1024;
const FILE_ID_BEGIN: &[u8] = b"@BEGIN_FILE_ID.DIZ";
const FILE_ID_END: &[u8] = b"@END_FILE_ID.DIZ";

/// Container revision, taken from the magic digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpfVersion {
    V1,
    V2,
    V3,
}

impl PpfVersion {
    fn magic(self) -> &'static [u8; 5] {
        match self {
            PpfVersion::V1 => b"PPF10",
            PpfVersion::V2 => b"PPF20",
            PpfVersion::V3 => b"PPF30",
        }
    }

    fn from_magic(magic: &[u8]) -> Option<Self> {
        if magic == b"PPF10" {
            Some(PpfVersion::V1)
        } else if magic == b"PPF20" {
            Some(PpfVersion::V2)
        } else if magic == b"PPF30" {
            Some(PpfVersion::V3)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpfRecord {
    /// Full 64-bit offset; v1/v2 containers store the low 32 bits.
    pub offset: u64,
    pub data: Vec<u8>,
    pub undo: Option<Vec<u8>>,
}

/// A parsed PPF patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpfPatch {
    pub version: PpfVersion,
    pub encoding_method: u8,
    pub description: String,
    /// v3 image type byte (0 BIN, 1 GI).
    pub image_type: u8,
    /// v2 declared input size.
    pub input_size: u32,
    /// 1024 bytes compared against the head of the source.
    pub block_check: Option<Vec<u8>>,
    /// v3: records carry undo data.
    pub has_undo: bool,
    pub records: Vec<PpfRecord>,
    pub file_id: Option<String>,
}

impl PpfPatch {
    pub fn identify(data: &[u8]) -> bool {
        data.len() >= 5
            && data.starts_with(MAGIC_PREFIX)
            && PpfVersion::from_magic(&data[..5]).is_some()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut f = RomBuf::from_bytes(data.to_vec()).little_endian();
        let magic = f.read_bytes(5);
        let version = PpfVersion::from_magic(&magic)
            .ok_or_else(|| PatchError::invalid("PPF", "bad magic"))?;
        let encoding_method = f.read_u8();
        let description = f.read_string(DESCRIPTION_LEN);

        let mut image_type = 0;
        let mut input_size = 0;
        let mut has_undo = false;
        let mut block_check = None;
        match version {
            PpfVersion::V1 => {}
            PpfVersion::V2 => {
                input_size = f.read_u32();
                if f.remaining() < BLOCK_CHECK_LEN {
                    return Err(PatchError::invalid("PPF", "truncated block check"));
                }
                block_check = Some(f.read_bytes(BLOCK_CHECK_LEN));
            }
            PpfVersion::V3 => {
                image_type = f.read_u8();
                let check_flag = f.read_u8() != 0;
                has_undo = f.read_u8() != 0;
                f.skip(1); // dummy
                if check_flag {
                    if f.remaining() < BLOCK_CHECK_LEN {
                        return Err(PatchError::invalid("PPF", "truncated block check"));
                    }
                    block_check = Some(f.read_bytes(BLOCK_CHECK_LEN));
                }
            }
        }

        let offset_width = if version == PpfVersion::V3 { 8 } else { 4 };
        let mut records = Vec::new();
        let mut file_id = None;
        while !f.is_eof() {
            // The optional file id trailer sits where a record offset
            // would begin.
            if f.get(f.tell()) == b'@' {
                f.save_offset();
                let marker = f.read_bytes(FILE_ID_BEGIN.len());
                f.restore_offset();
                if marker == FILE_ID_BEGIN {
                    file_id = Some(parse_file_id(&mut f)?);
                    break;
                }
            }
            if f.remaining() < offset_width + 1 {
                return Err(PatchError::invalid("PPF", "truncated record header"));
            }
            let offset = if version == PpfVersion::V3 {
                f.read_u64()
            } else {
                f.read_u32() as u64
            };
            let length = f.read_u8() as usize;
            let needed = if has_undo { length * 2 } else { length };
            if f.remaining() < needed {
                return Err(PatchError::invalid("PPF", "record data past end of patch"));
            }
            let data = f.read_bytes(length);
            let undo = has_undo.then(|| f.read_bytes(length));
            records.push(PpfRecord { offset, data, undo });
        }

        debug!(?version, records = records.len(), "parsed PPF patch");
        Ok(Self {
            version,
            encoding_method,
            description,
            image_type,
            input_size,
            block_check,
            has_undo,
            records,
            file_id,
        })
    }

    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        if self.version == PpfVersion::V2
            && source.len().saturating_sub(skip) != self.input_size as usize
        {
            return false;
        }
        match &self.block_check {
            Some(check) => {
                let head: Vec<u8> = (0..BLOCK_CHECK_LEN).map(|i| source.get(skip + i)).collect();
                head == *check
            }
            None => true,
        }
    }

    pub fn apply(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        if check && !self.validate_source(source, 0) {
            return Err(PatchError::validation(
                "PPF",
                "input size or block check does not match the source".to_string(),
            ));
        }

        let mut out = source.clone();
        for record in &self.records {
            if record.offset > MAX_DECLARED_SIZE {
                return Err(PatchError::invalid(
                    "PPF",
                    "record offset exceeds the size limit",
                ));
            }
            let offset = record.offset as usize;
            out.expand(offset);
            out.seek(offset);
            out.write_bytes(&record.data);
        }
        debug!(records = self.records.len(), size = out.len(), "applied PPF patch");
        Ok(out)
    }

    /// Build a v3 patch with undo data and a block check.
    pub fn build(source: &RomBuf, modified: &RomBuf) -> Result<Self> {
        if modified.len() < source.len() {
            return Err(PatchError::invalid(
                "PPF",
                "the container cannot shrink a file",
            ));
        }

        let t = modified.as_bytes();
        let mut records = Vec::new();
        let mut ofs = 0usize;
        while ofs < t.len() {
            if source.get(ofs) == t[ofs] {
                ofs += 1;
                continue;
            }
            let start = ofs;
            while ofs < t.len() && ofs - start < u8::MAX as usize && source.get(ofs) != t[ofs] {
                ofs += 1;
            }
            let undo: Vec<u8> = (start..ofs).map(|i| source.get(i)).collect();
            records.push(PpfRecord {
                offset: start as u64,
                data: t[start..ofs].to_vec(),
                undo: Some(undo),
            });
        }

        let block_check: Vec<u8> = (0..BLOCK_CHECK_LEN).map(|i| source.get(i)).collect();
        Ok(Self {
            version: PpfVersion::V3,
            encoding_method: 2,
            description: String::new(),
            image_type: 0,
            input_size: 0,
            block_check: Some(block_check),
            has_undo: true,
            records,
            file_id: None,
        })
    }

    pub fn export(&self, name: Option<&str>) -> RomBuf {
        let mut out = RomBuf::with_size(0).little_endian();
        if let Some(name) = name {
            out.set_name(name);
        }
        out.write_bytes(self.version.magic());
        out.write_u8(self.encoding_method);
        out.write_string_padded(&self.description, DESCRIPTION_LEN);
        match self.version {
            PpfVersion::V1 => {}
            PpfVersion::V2 => {
                out.write_u32(self.input_size);
                if let Some(check) = &self.block_check {
                    out.write_bytes(check);
                }
            }
            PpfVersion::V3 => {
                out.write_u8(self.image_type);
                out.write_u8(self.block_check.is_some() as u8);
                out.write_u8(self.has_undo as u8);
                out.write_u8(0);
                if let Some(check) = &self.block_check {
                    out.write_bytes(check);
                }
            }
        }
        for record in &self.records {
            if self.version == PpfVersion::V3 {
                out.write_u64(record.offset);
            } else {
                out.write_u32(record.offset as u32);
            }
            out.write_u8(record.data.len() as u8);
            out.write_bytes(&record.data);
            if let Some(undo) = &record.undo {
                out.write_bytes(undo);
            }
        }
        if let Some(file_id) = &self.file_id {
            out.write_bytes(FILE_ID_BEGIN);
            out.write_bytes(file_id.as_bytes());
            out.write_bytes(FILE_ID_END);
        }
        out
    }
}

fn parse_file_id(f: &mut RomBuf) -> Result<String> {
    let trailer = f.read_bytes(f.remaining());
    let body = trailer
        .strip_prefix(FILE_ID_BEGIN)
        .ok_or_else(|| PatchError::invalid("PPF", "malformed file id trailer"))?;
    let end = body
        .windows(FILE_ID_END.len())
        .position(|w| w == FILE_ID_END)
        .ok_or_else(|| PatchError::invalid("PPF", "unterminated file id trailer"))?;
    Ok(String::from_utf8_lossy(&body[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> RomBuf {
        RomBuf::from_bytes((0..2048u32).map(|i| (i % 251) as u8).collect())
    }

    #[test]
    fn build_apply_roundtrip() {
        let source = sample_source();
        let mut m = source.as_bytes().to_vec();
        m[1500] ^= 0xFF;
        m[1501] ^= 0xFF;
        let modified = RomBuf::from_bytes(m);

        let patch = PpfPatch::build(&source, &modified).unwrap();
        assert!(patch.validate_source(&source, 0));
        let out = patch.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), modified.as_bytes());
    }

    #[test]
    fn undo_data_mirrors_source() {
        let source = sample_source();
        let mut m = source.as_bytes().to_vec();
        m[100] = 0xAB;
        let modified = RomBuf::from_bytes(m);

        let patch = PpfPatch::build(&source, &modified).unwrap();
        assert_eq!(patch.records.len(), 1);
        assert_eq!(patch.records[0].undo.as_deref(), Some(&[source.get(100)][..]));
    }

    #[test]
    fn block_check_rejects_wrong_source() {
        let source = sample_source();
        let mut m = source.as_bytes().to_vec();
        m[600] = 0;
        let modified = RomBuf::from_bytes(m);
        let patch = PpfPatch::build(&source, &modified).unwrap();

        let wrong = RomBuf::with_size(2048);
        assert!(!patch.validate_source(&wrong, 0));
        assert!(matches!(
            patch.apply(&wrong, true),
            Err(PatchError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn v3_offsets_are_not_truncated() {
        let patch = PpfPatch {
            version: PpfVersion::V3,
            encoding_method: 2,
            description: String::new(),
            image_type: 0,
            input_size: 0,
            block_check: None,
            has_undo: false,
            records: vec![PpfRecord {
                offset: 0x1_0000_0000,
                data: vec![0xAA],
                undo: None,
            }],
            file_id: None,
        };
        let reparsed = PpfPatch::parse(patch.export(None).as_bytes()).unwrap();
        assert_eq!(reparsed.records[0].offset, 0x1_0000_0000);
    }

    #[test]
    fn export_parse_roundtrip_with_file_id() {
        let source = sample_source();
        let mut m = source.as_bytes().to_vec();
        m[42] = 0x42;
        let modified = RomBuf::from_bytes(m);

        let mut patch = PpfPatch::build(&source, &modified).unwrap();
        patch.file_id = Some("made with rompatch".to_owned());

        let reparsed = PpfPatch::parse(patch.export(None).as_bytes()).unwrap();
        assert_eq!(reparsed, patch);
    }

    #[test]
    fn v2_declares_input_size() {
        let source = sample_source();
        let patch = PpfPatch {
            version: PpfVersion::V2,
            encoding_method: 1,
            description: String::new(),
            image_type: 0,
            input_size: source.len() as u32,
            block_check: Some(source.as_bytes()[..BLOCK_CHECK_LEN].to_vec()),
            has_undo: false,
            records: vec![],
            file_id: None,
        };
        let reparsed = PpfPatch::parse(patch.export(None).as_bytes()).unwrap();
        assert_eq!(reparsed, patch);
        assert!(reparsed.validate_source(&source, 0));

        let short = RomBuf::with_size(100);
        assert!(!reparsed.validate_source(&short, 0));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let source = sample_source();
        let mut m = source.as_bytes().to_vec();
        m[99] = 1;
        let modified = RomBuf::from_bytes(m);
        let patch = PpfPatch::build(&source, &modified).unwrap();
        let mut bytes = patch.export(None).into_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(PpfPatch::parse(&bytes).is_err());
    }
}
