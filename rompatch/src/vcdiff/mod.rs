//! VCDIFF delta format (RFC 3284 subset, decoder only)
//!
//! Each window declares an optional source segment (taken from the
//! original source or from the already-produced target), three parallel
//! sections (add/run data, instructions, COPY addresses) and an
//! optional Adler-32 over the window's output. Instructions index the
//! default code table; two half-instructions per opcode.
//!
//! Secondary decompressors and application-defined code tables are not
//! implemented and fail with `UnsupportedFeature`. Encoding is out of
//! scope: `build` and `export` are unsupported.

mod cache;
mod code_table;

pub use cache::AddressCache;
pub use code_table::{default_table, Entry};

use rombuf::{checksum, RomBuf};
use tracing::{debug, trace};

use crate::error::{PatchError, Result};
use crate::MAX_DECLARED_SIZE;

pub(crate) const MAGIC: &[u8; 3] = &[0xD6, 0xC3, 0xC4];

const VCD_DECOMPRESS: u8 = 0x01;
const VCD_CODETABLE: u8 = 0x02;
const VCD_APPHEADER: u8 = 0x04;

const VCD_SOURCE: u8 = 0x01;
const VCD_TARGET: u8 = 0x02;
const VCD_ADLER32: u8 = 0x04;

/// Read an RFC 3284 integer: base-128, most significant digits first,
/// continuation bit 0x80. Distinct from both `rombuf` VLV encodings.
pub(crate) fn read_int(f: &mut RomBuf) -> Result<u64> {
    let mut value: u64 = 0;
    for _ in 0..10 {
        if f.is_eof() {
            return Err(PatchError::invalid("VCDIFF", "integer past end of stream"));
        }
        let byte = f.read_u8();
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(PatchError::invalid("VCDIFF", "integer longer than 10 digits"))
}

/// One parsed delta window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcdiffWindow {
    pub indicator: u8,
    pub source_length: u64,
    pub source_position: u64,
    pub target_length: u64,
    pub data: Vec<u8>,
    pub instructions: Vec<u8>,
    pub addresses: Vec<u8>,
    pub adler32: Option<u32>,
}

impl VcdiffWindow {
    fn takes_segment_from_source(&self) -> bool {
        self.indicator & VCD_SOURCE != 0
    }

    fn takes_segment_from_target(&self) -> bool {
        self.indicator & VCD_TARGET != 0
    }
}

/// A parsed VCDIFF delta file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcdiffPatch {
    pub version: u8,
    pub windows: Vec<VcdiffWindow>,
}

impl VcdiffPatch {
    pub fn identify(data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut f = RomBuf::from_bytes(data.to_vec());
        if f.read_bytes(MAGIC.len()) != MAGIC.as_slice() {
            return Err(PatchError::invalid("VCDIFF", "bad magic"));
        }
        let version = f.read_u8();

        let hdr_indicator = f.read_u8();
        if hdr_indicator & VCD_DECOMPRESS != 0 {
            return Err(PatchError::UnsupportedFeature {
                format: "VCDIFF",
                feature: "secondary decompressor".to_string(),
            });
        }
        if hdr_indicator & VCD_CODETABLE != 0 {
            return Err(PatchError::UnsupportedFeature {
                format: "VCDIFF",
                feature: "application-defined code table".to_string(),
            });
        }
        if hdr_indicator & VCD_APPHEADER != 0 {
            let len = read_int(&mut f)? as usize;
            if f.remaining() < len {
                return Err(PatchError::invalid("VCDIFF", "truncated application header"));
            }
            f.skip(len);
        }

        let mut windows = Vec::new();
        let mut total_target: u64 = 0;
        while !f.is_eof() {
            let indicator = f.read_u8();
            let (source_length, source_position) = if indicator & (VCD_SOURCE | VCD_TARGET) != 0 {
                (read_int(&mut f)?, read_int(&mut f)?)
            } else {
                (0, 0)
            };

            let delta_length = read_int(&mut f)? as usize;
            let delta_start = f.tell();

            let target_length = read_int(&mut f)?;
            total_target = total_target.saturating_add(target_length);
            if target_length > MAX_DECLARED_SIZE || total_target > MAX_DECLARED_SIZE {
                return Err(PatchError::invalid("VCDIFF", "declared size exceeds limit"));
            }

            let delta_indicator = f.read_u8();
            if delta_indicator != 0 {
                return Err(PatchError::UnsupportedFeature {
                    format: "VCDIFF",
                    feature: "compressed delta sections".to_string(),
                });
            }

            let data_length = read_int(&mut f)?;
            let instructions_length = read_int(&mut f)?;
            let addresses_length = read_int(&mut f)?;
            let adler32 = if indicator & VCD_ADLER32 != 0 {
                Some(f.read_u32())
            } else {
                None
            };

            let sections = data_length
                .checked_add(instructions_length)
                .and_then(|s| s.checked_add(addresses_length));
            if sections.map_or(true, |s| s > f.remaining() as u64) {
                return Err(PatchError::invalid(
                    "VCDIFF",
                    "window sections past end of file",
                ));
            }
            let data = f.read_bytes(data_length as usize);
            let instructions = f.read_bytes(instructions_length as usize);
            let addresses = f.read_bytes(addresses_length as usize);

            if f.tell() - delta_start != delta_length {
                return Err(PatchError::invalid(
                    "VCDIFF",
                    "window length does not match its contents",
                ));
            }

            windows.push(VcdiffWindow {
                indicator,
                source_length,
                source_position,
                target_length,
                data,
                instructions,
                addresses,
                adler32,
            });
        }

        debug!(windows = windows.len(), "parsed VCDIFF patch");
        Ok(Self { version, windows })
    }

    /// VCDIFF carries no whole-source fingerprint.
    pub fn validate_source(&self, _source: &RomBuf, _skip: usize) -> bool {
        true
    }

    pub fn apply(&self, source: &RomBuf, _check: bool) -> Result<RomBuf> {
        let mut out: Vec<u8> = Vec::new();

        for (index, window) in self.windows.iter().enumerate() {
            let segment: Vec<u8> = if window.takes_segment_from_source() {
                slice_checked(source.as_bytes(), window.source_position, window.source_length)?
            } else if window.takes_segment_from_target() {
                slice_checked(&out, window.source_position, window.source_length)?
            } else {
                Vec::new()
            };

            let window_start = out.len();
            decode_window(window, &segment, &mut out)?;
            let produced = &out[window_start..];

            if produced.len() as u64 != window.target_length {
                return Err(PatchError::invalid(
                    "VCDIFF",
                    format!(
                        "window {index} produced {} bytes, declared {}",
                        produced.len(),
                        window.target_length
                    ),
                ));
            }
            if let Some(expected) = window.adler32 {
                let actual = checksum::adler32(produced);
                if actual != expected {
                    return Err(PatchError::checksum_u32("VCDIFF", expected, actual));
                }
            }
            trace!(index, bytes = produced.len(), "decoded window");
        }

        debug!(size = out.len(), "applied VCDIFF patch");
        Ok(RomBuf::from_bytes(out))
    }

    pub fn build(_source: &RomBuf, _modified: &RomBuf) -> Result<Self> {
        Err(PatchError::UnsupportedFeature {
            format: "VCDIFF",
            feature: "patch creation".to_string(),
        })
    }

    pub fn export(&self, _name: Option<&str>) -> Result<RomBuf> {
        Err(PatchError::UnsupportedFeature {
            format: "VCDIFF",
            feature: "re-serialization".to_string(),
        })
    }
}

fn slice_checked(from: &[u8], position: u64, length: u64) -> Result<Vec<u8>> {
    let position = position as usize;
    let length = length as usize;
    let end = position
        .checked_add(length)
        .filter(|&e| e <= from.len())
        .ok_or_else(|| PatchError::invalid("VCDIFF", "source segment out of range"))?;
    Ok(from[position..end].to_vec())
}

/// Execute one window's instruction program, appending to `out`.
fn decode_window(window: &VcdiffWindow, segment: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let table = default_table();
    let mut cache = AddressCache::new();

    let mut instructions = RomBuf::from_bytes(window.instructions.clone());
    let mut data = RomBuf::from_bytes(window.data.clone());
    let mut addresses = RomBuf::from_bytes(window.addresses.clone());

    let window_start = out.len();
    while !instructions.is_eof() {
        let opcode = instructions.read_u8();
        let entry = table[opcode as usize];
        for (itype, size, mode) in [
            (entry.type1, entry.size1, entry.mode1),
            (entry.type2, entry.size2, entry.mode2),
        ] {
            if itype == code_table::NOOP {
                continue;
            }
            let size = if size == 0 {
                read_int(&mut instructions)? as usize
            } else {
                size as usize
            };

            match itype {
                code_table::ADD => {
                    if data.remaining() < size {
                        return Err(PatchError::invalid("VCDIFF", "data section underflow"));
                    }
                    out.extend_from_slice(&data.read_bytes(size));
                }
                code_table::RUN => {
                    if data.is_eof() {
                        return Err(PatchError::invalid("VCDIFF", "data section underflow"));
                    }
                    let byte = data.read_u8();
                    out.resize(out.len() + size, byte);
                }
                _ => {
                    // COPY: addresses index the concatenation of the
                    // segment and this window's output so far. Byte-at-
                    // a-time so self-overlapping copies repeat bytes.
                    let produced = (out.len() - window_start) as u64;
                    let here = segment.len() as u64 + produced;
                    let addr = cache.decode(mode, &mut addresses, here)?;
                    for i in 0..size as u64 {
                        let pos = addr + i;
                        let byte = if (pos as usize) < segment.len() {
                            segment[pos as usize]
                        } else {
                            let rel = pos as usize - segment.len();
                            if window_start + rel >= out.len() {
                                return Err(PatchError::invalid(
                                    "VCDIFF",
                                    "COPY reads past produced output",
                                ));
                            }
                            out[window_start + rel]
                        };
                        out.push(byte);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_bytes(mut value: u64) -> Vec<u8> {
        let mut digits = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            digits.push((value & 0x7F) as u8 | 0x80);
            value >>= 7;
        }
        digits.reverse();
        digits
    }

    /// The RFC 3284 worked example: copy the source head, add "wxyz",
    /// copy "efgh", self-overlap copy three more "efgh" repeats, then a
    /// run of 'z'.
    fn rfc_example(corrupt_adler: bool) -> (RomBuf, Vec<u8>, Vec<u8>) {
        let source = RomBuf::from_bytes(b"abcdefghijklmnop".to_vec());
        let target = b"abcdwxyzefghefghefghefghzzzz".to_vec();

        let data = b"wxyzz".to_vec();
        // COPY(4,m0)=20, ADD(4)=5, COPY(4,m0)=20, COPY(12,m0)=28,
        // RUN=0 with explicit size 4.
        let instructions = vec![20, 5, 20, 28, 0, 4];
        let addresses = vec![0x00, 0x04, 0x18];

        let mut adler = rombuf::checksum::adler32(&target);
        if corrupt_adler {
            adler ^= 1;
        }

        let mut body = Vec::new();
        body.extend_from_slice(&int_bytes(target.len() as u64));
        body.push(0); // delta indicator
        body.extend_from_slice(&int_bytes(data.len() as u64));
        body.extend_from_slice(&int_bytes(instructions.len() as u64));
        body.extend_from_slice(&int_bytes(addresses.len() as u64));
        body.extend_from_slice(&adler.to_be_bytes());
        body.extend_from_slice(&data);
        body.extend_from_slice(&instructions);
        body.extend_from_slice(&addresses);

        let mut patch = vec![0xD6, 0xC3, 0xC4, 0x00, 0x00];
        patch.push(VCD_SOURCE | VCD_ADLER32);
        patch.extend_from_slice(&int_bytes(source.len() as u64));
        patch.extend_from_slice(&int_bytes(0));
        patch.extend_from_slice(&int_bytes(body.len() as u64));
        patch.extend_from_slice(&body);

        (source, target, patch)
    }

    #[test]
    fn rfc_example_decodes() {
        let (source, target, patch) = rfc_example(false);
        let parsed = VcdiffPatch::parse(&patch).unwrap();
        assert_eq!(parsed.windows.len(), 1);

        let out = parsed.apply(&source, true).unwrap();
        assert_eq!(out.as_bytes(), &target[..]);
    }

    #[test]
    fn corrupted_adler_is_a_checksum_mismatch() {
        let (source, _, patch) = rfc_example(true);
        let parsed = VcdiffPatch::parse(&patch).unwrap();
        assert!(matches!(
            parsed.apply(&source, true),
            Err(PatchError::TargetChecksumMismatch { .. })
        ));
    }

    #[test]
    fn window_without_source_segment() {
        // ADD(4) "abab", then a self-overlapping COPY(4) from offset 2
        // of the window itself: target is "abababab".
        let data = b"abab";
        let instructions = vec![5, 20];
        let addresses = vec![0x02];

        let mut body = Vec::new();
        body.extend_from_slice(&int_bytes(8));
        body.push(0);
        body.extend_from_slice(&int_bytes(data.len() as u64));
        body.extend_from_slice(&int_bytes(instructions.len() as u64));
        body.extend_from_slice(&int_bytes(addresses.len() as u64));
        body.extend_from_slice(data);
        body.extend_from_slice(&instructions);
        body.extend_from_slice(&addresses);

        let mut patch = vec![0xD6, 0xC3, 0xC4, 0x00, 0x00];
        patch.push(0x00); // no segment, no adler
        patch.extend_from_slice(&int_bytes(body.len() as u64));
        patch.extend_from_slice(&body);

        let parsed = VcdiffPatch::parse(&patch).unwrap();
        let out = parsed.apply(&RomBuf::with_size(0), true).unwrap();
        assert_eq!(out.as_bytes(), b"abababab");
    }

    #[test]
    fn secondary_compression_is_unsupported() {
        let patch = vec![0xD6, 0xC3, 0xC4, 0x00, VCD_DECOMPRESS];
        assert!(matches!(
            VcdiffPatch::parse(&patch),
            Err(PatchError::UnsupportedFeature { .. })
        ));
    }

    #[test]
    fn custom_code_table_is_unsupported() {
        let patch = vec![0xD6, 0xC3, 0xC4, 0x00, VCD_CODETABLE];
        assert!(matches!(
            VcdiffPatch::parse(&patch),
            Err(PatchError::UnsupportedFeature { .. })
        ));
    }

    #[test]
    fn application_header_is_skipped() {
        let mut patch = vec![0xD6, 0xC3, 0xC4, 0x00, VCD_APPHEADER];
        patch.extend_from_slice(&int_bytes(3));
        patch.extend_from_slice(b"xyz");
        let parsed = VcdiffPatch::parse(&patch).unwrap();
        assert!(parsed.windows.is_empty());
    }

    #[test]
    fn build_is_unsupported() {
        let a = RomBuf::with_size(4);
        let b = RomBuf::with_size(4);
        assert!(matches!(
            VcdiffPatch::build(&a, &b),
            Err(PatchError::UnsupportedFeature { .. })
        ));
    }

    #[test]
    fn integer_roundtrip() {
        for value in [0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64] {
            let mut f = RomBuf::from_bytes(int_bytes(value));
            assert_eq!(read_int(&mut f).unwrap(), value);
        }
    }
}
