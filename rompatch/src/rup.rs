//! RUP patch format (NINJA2)
//!
//! A 2048-byte text header (`NINJA2`, an encoding byte, then padded
//! ASCII fields), followed by a command stream at 0x800: `0x01` opens a
//! file (name, rom type, sizes, MD5 of both sides, optional overflow
//! data for the size difference), `0x02` adds an XOR record, `0x00`
//! ends the patch. Integers are the RUP length-prefixed kind.
//!
//! XOR records are direction-agnostic: applying to a buffer matching
//! the source MD5 patches forward, applying to one matching the target
//! MD5 reverses the patch. Overflow bytes are stored masked with 0xFF.

use rombuf::RomBuf;
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC: &[u8; 6] = b"NINJA2";

const HEADER_LEN: usize = 0x800;

const CMD_END: u8 = 0x00;
const CMD_OPEN_FILE: u8 = 0x01;
const CMD_RECORD: u8 = 0x02;

/// Fixed header field widths, in file order.
const AUTHOR_LEN: usize = 84;
const VERSION_LEN: usize = 11;
const TITLE_LEN: usize = 256;
const GENRE_LEN: usize = 48;
const LANGUAGE_LEN: usize = 48;
const DATE_LEN: usize = 8;
const WEB_LEN: usize = 512;
const INFO_LEN: usize = 1074;

/// Bytes owned by the larger side of a size-changing patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RupOverflow {
    /// Target is larger; the bytes are appended when patching forward.
    Append(Vec<u8>),
    /// Target is smaller; the bytes restore the source tail on reverse.
    Minify(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RupRecord {
    pub offset: u64,
    pub xor: Vec<u8>,
}

/// One patched file within the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RupFile {
    pub name: String,
    pub rom_type: u8,
    pub source_size: u64,
    pub target_size: u64,
    pub source_md5: [u8; 16],
    pub target_md5: [u8; 16],
    pub overflow: Option<RupOverflow>,
    pub records: Vec<RupRecord>,
}

/// A parsed NINJA2 patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RupPatch {
    pub text_encoding: u8,
    pub author: String,
    pub version: String,
    pub title: String,
    pub genre: String,
    pub language: String,
    pub date: String,
    pub web: String,
    pub description: String,
    pub files: Vec<RupFile>,
}

/// Which MD5 the supplied buffer matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

impl RupPatch {
    pub fn identify(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(PatchError::invalid("RUP", "file shorter than header"));
        }

        let mut f = RomBuf::from_bytes(data.to_vec()).little_endian();
        if f.read_bytes(MAGIC.len()) != MAGIC {
            return Err(PatchError::invalid("RUP", "bad magic"));
        }
        let text_encoding = f.read_u8();
        let author = f.read_string(AUTHOR_LEN);
        let version = f.read_string(VERSION_LEN);
        let title = f.read_string(TITLE_LEN);
        let genre = f.read_string(GENRE_LEN);
        let language = f.read_string(LANGUAGE_LEN);
        let date = f.read_string(DATE_LEN);
        let web = f.read_string(WEB_LEN);
        let description = f.read_string(INFO_LEN);

        f.seek(HEADER_LEN);
        let mut files: Vec<RupFile> = Vec::new();
        loop {
            if f.is_eof() {
                return Err(PatchError::invalid("RUP", "missing end command"));
            }
            match f.read_u8() {
                CMD_END => break,
                CMD_OPEN_FILE => {
                    let name_len = f.read_vlv_rup() as usize;
                    if f.remaining() < name_len {
                        return Err(PatchError::invalid("RUP", "truncated file name"));
                    }
                    let name = f.read_string(name_len);
                    let rom_type = f.read_u8();
                    let source_size = f.read_vlv_rup();
                    let target_size = f.read_vlv_rup();
                    if source_size > MAX_DECLARED_SIZE || target_size > MAX_DECLARED_SIZE {
                        return Err(PatchError::invalid("RUP", "declared size exceeds limit"));
                    }
                    let mut source_md5 = [0u8; 16];
                    source_md5.copy_from_slice(&f.read_bytes(16));
                    let mut target_md5 = [0u8; 16];
                    target_md5.copy_from_slice(&f.read_bytes(16));

                    let overflow = if source_size != target_size {
                        let mode = f.read_u8();
                        let len = f.read_vlv_rup() as usize;
                        if f.remaining() < len {
                            return Err(PatchError::invalid("RUP", "truncated overflow data"));
                        }
                        let bytes: Vec<u8> =
                            f.read_bytes(len).iter().map(|b| b ^ 0xFF).collect();
                        match mode {
                            b'A' => Some(RupOverflow::Append(bytes)),
                            b'M' => Some(RupOverflow::Minify(bytes)),
                            other => {
                                return Err(PatchError::UnsupportedFeature {
                                    format: "RUP",
                                    feature: format!("overflow mode {:#04x}", other),
                                });
                            }
                        }
                    } else {
                        None
                    };

                    files.push(RupFile {
                        name,
                        rom_type,
                        source_size,
                        target_size,
                        source_md5,
                        target_md5,
                        overflow,
                        records: Vec::new(),
                    });
                }
                CMD_RECORD => {
                    let file = files.last_mut().ok_or_else(|| {
                        PatchError::invalid("RUP", "record before any open-file command")
                    })?;
                    let offset = f.read_vlv_rup();
                    let len = f.read_vlv_rup() as usize;
                    if f.remaining() < len {
                        return Err(PatchError::invalid("RUP", "truncated record data"));
                    }
                    file.records.push(RupRecord {
                        offset,
                        xor: f.read_bytes(len),
                    });
                }
                other => {
                    return Err(PatchError::invalid(
                        "RUP",
                        format!("unknown command {other:#04x}"),
                    ));
                }
            }
        }

        if files.is_empty() {
            return Err(PatchError::invalid("RUP", "patch opens no file"));
        }

        debug!(files = files.len(), "parsed RUP patch");
        Ok(Self {
            text_encoding,
            author,
            version,
            title,
            genre,
            language,
            date,
            web,
            description,
            files,
        })
    }

    fn match_direction(&self, source: &RomBuf, skip: usize) -> Option<(usize, Direction)> {
        let digest = source.md5(skip..source.len());
        for (i, file) in self.files.iter().enumerate() {
            if digest == file.source_md5 {
                return Some((i, Direction::Forward));
            }
            if digest == file.target_md5 {
                return Some((i, Direction::Reverse));
            }
        }
        None
    }

    /// A source is valid when its MD5 matches either side of any file in
    /// the container (the format patches both directions).
    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        self.match_direction(source, skip).is_some()
    }

    pub fn apply(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        let matched = self.match_direction(source, 0);
        if check && matched.is_none() {
            return Err(PatchError::validation(
                "RUP",
                "source MD5 matches neither side of the patch".to_string(),
            ));
        }
        let (index, direction) = matched.unwrap_or((0, Direction::Forward));
        let file = &self.files[index];

        let out_size = match direction {
            Direction::Forward => file.target_size as usize,
            Direction::Reverse => file.source_size as usize,
        };
        let mut out = RomBuf::with_size(out_size);
        out.seek(0);
        let copy = source.len().min(out_size);
        out.write_bytes(&source.as_bytes()[..copy]);

        for record in &file.records {
            let offset = record.offset as usize;
            for (i, &x) in record.xor.iter().enumerate() {
                let pos = offset + i;
                if pos >= out_size {
                    return Err(PatchError::invalid("RUP", "XOR record out of range"));
                }
                out.seek(pos);
                out.write_u8(source.get(pos) ^ x);
            }
        }

        // The larger side's tail comes from the overflow data.
        match (&file.overflow, direction) {
            (Some(RupOverflow::Append(bytes)), Direction::Forward) => {
                out.seek(file.source_size as usize);
                out.write_bytes(bytes);
                out.truncate(out_size);
            }
            (Some(RupOverflow::Minify(bytes)), Direction::Reverse) => {
                out.seek(file.target_size as usize);
                out.write_bytes(bytes);
                out.truncate(out_size);
            }
            _ => {}
        }

        let expected = match direction {
            Direction::Forward => file.target_md5,
            Direction::Reverse => file.source_md5,
        };
        let actual = out.md5(0..out.len());
        if actual != expected {
            return Err(PatchError::TargetChecksumMismatch {
                format: "RUP",
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        debug!(?direction, size = out.len(), "applied RUP patch");
        Ok(out)
    }

    pub fn build(source: &RomBuf, modified: &RomBuf) -> Self {
        let s_len = source.len();
        let t_len = modified.len();
        let common = s_len.min(t_len);

        let mut records = Vec::new();
        let mut i = 0usize;
        while i < common {
            if source.get(i) == modified.get(i) {
                i += 1;
                continue;
            }
            let start = i;
            let mut xor = Vec::new();
            while i < common && source.get(i) != modified.get(i) {
                xor.push(source.get(i) ^ modified.get(i));
                i += 1;
            }
            records.push(RupRecord {
                offset: start as u64,
                xor,
            });
        }

        let overflow = if t_len > s_len {
            Some(RupOverflow::Append(modified.as_bytes()[s_len..].to_vec()))
        } else if t_len < s_len {
            Some(RupOverflow::Minify(source.as_bytes()[t_len..].to_vec()))
        } else {
            None
        };

        let file = RupFile {
            name: modified.name().unwrap_or_default().to_owned(),
            rom_type: 0,
            source_size: s_len as u64,
            target_size: t_len as u64,
            source_md5: source.md5(0..s_len),
            target_md5: modified.md5(0..t_len),
            overflow,
            records,
        };

        Self {
            text_encoding: 0,
            author: String::new(),
            version: String::new(),
            title: String::new(),
            genre: String::new(),
            language: String::new(),
            date: String::new(),
            web: String::new(),
            description: String::new(),
            files: vec![file],
        }
    }

    pub fn export(&self, name: Option<&str>) -> RomBuf {
        let mut out = RomBuf::with_size(0).little_endian();
        if let Some(name) = name {
            out.set_name(name);
        }
        out.write_bytes(MAGIC);
        out.write_u8(self.text_encoding);
        out.write_string_padded(&self.author, AUTHOR_LEN);
        out.write_string_padded(&self.version, VERSION_LEN);
        out.write_string_padded(&self.title, TITLE_LEN);
        out.write_string_padded(&self.genre, GENRE_LEN);
        out.write_string_padded(&self.language, LANGUAGE_LEN);
        out.write_string_padded(&self.date, DATE_LEN);
        out.write_string_padded(&self.web, WEB_LEN);
        out.write_string_padded(&self.description, INFO_LEN);

        for file in &self.files {
            out.write_u8(CMD_OPEN_FILE);
            out.write_vlv_rup(file.name.len() as u64);
            out.write_bytes(file.name.as_bytes());
            out.write_u8(file.rom_type);
            out.write_vlv_rup(file.source_size);
            out.write_vlv_rup(file.target_size);
            out.write_bytes(&file.source_md5);
            out.write_bytes(&file.target_md5);
            if let Some(overflow) = &file.overflow {
                let (mode, bytes) = match overflow {
                    RupOverflow::Append(bytes) => (b'A', bytes),
                    RupOverflow::Minify(bytes) => (b'M', bytes),
                };
                out.write_u8(mode);
                out.write_vlv_rup(bytes.len() as u64);
                let masked: Vec<u8> = bytes.iter().map(|b| b ^ 0xFF).collect();
                out.write_bytes(&masked);
            }
            for record in &file.records {
                out.write_u8(CMD_RECORD);
                out.write_vlv_rup(record.offset);
                out.write_vlv_rup(record.xor.len() as u64);
                out.write_bytes(&record.xor);
            }
        }
        out.write_u8(CMD_END);
        out
    }
}
