//! Codecs and dispatcher for binary ROM patch containers
//!
//! This crate parses, validates, applies, creates and re-serializes the
//! patch formats the ROM hacking scene has accumulated over the years:
//! IPS (and its EBP variant), UPS, BPS, the two unrelated APS lineages
//! (N64 and GBA), PPF v1-v3, RUP (NINJA2), PMSR (Star Rod) and a
//! decode-only subset of VCDIFF (RFC 3284).
//!
//! The dispatcher identifies a container by magic bytes, delegates to
//! the right codec, and optionally strips or synthesizes console
//! headers (iNES, fwNES, LNX, SNES copier) around the apply.
//!
//! ```no_run
//! use rombuf::RomBuf;
//! use rompatch::{apply, parse, ApplyOptions};
//!
//! # fn main() -> rompatch::Result<()> {
//! let patch_bytes = std::fs::read("hack.bps")?;
//! let patch = parse(&patch_bytes)?;
//!
//! let source = RomBuf::load("game.sfc")?;
//! let options = ApplyOptions {
//!     require_validation: true,
//!     remove_header: true,
//!     ..Default::default()
//! };
//! let patched = apply(&patch, &source, &options)?;
//! patched.save("game-hacked.sfc")?;
//! # Ok(())
//! # }
//! ```

pub mod aps_gba;
pub mod aps_n64;
pub mod bps;
pub mod error;
pub mod ips;
mod patch;
pub mod pmsr;
pub mod ppf;
pub mod rom;
pub mod rup;
pub mod ups;
pub mod vcdiff;

pub use error::{PatchError, Result};
pub use patch::{FormatTag, Patch};

use rombuf::RomBuf;
use tracing::debug;

/// Hard ceiling for sizes a patch may declare, to bound memory.
pub const MAX_DECLARED_SIZE: u64 = 256 * 1024 * 1024;

/// Informational threshold above which callers may want to warn about
/// long-running operations. Nothing is refused at this size.
pub const LARGE_ROM_HINT: u64 = 64 * 1024 * 1024;

/// Options for [`apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOptions {
    /// Fail with `ValidationFailed` when the source does not satisfy
    /// the codec's precondition (size, CRC, MD5, block CRC16).
    pub require_validation: bool,
    /// Strip a recognized console header off the source before
    /// applying, and put it back on the output.
    pub remove_header: bool,
    /// Prepend a zero-filled synthetic header before applying (for
    /// patches made against headered dumps), stripped from the output.
    pub add_header: bool,
    /// Reserved hook for console-specific header checksum fix-ups.
    /// Currently a no-op.
    pub fix_checksum: bool,
}

/// Identify a patch container by its magic bytes.
///
/// `APS10` (N64) is probed before its prefix `APS1` (GBA).
pub fn identify(data: &[u8]) -> Option<FormatTag> {
    if ips::IpsPatch::identify(data) {
        Some(FormatTag::Ips)
    } else if ups::UpsPatch::identify(data) {
        Some(FormatTag::Ups)
    } else if bps::BpsPatch::identify(data) {
        Some(FormatTag::Bps)
    } else if aps_n64::ApsN64Patch::identify(data) {
        Some(FormatTag::ApsN64)
    } else if aps_gba::ApsGbaPatch::identify(data) {
        Some(FormatTag::ApsGba)
    } else if ppf::PpfPatch::identify(data) {
        Some(FormatTag::Ppf)
    } else if rup::RupPatch::identify(data) {
        Some(FormatTag::Rup)
    } else if pmsr::PmsrPatch::identify(data) {
        Some(FormatTag::Pmsr)
    } else if vcdiff::VcdiffPatch::identify(data) {
        Some(FormatTag::Vcdiff)
    } else {
        None
    }
}

/// Parse a patch container of any supported format.
pub fn parse(data: &[u8]) -> Result<Patch> {
    let tag = identify(data).ok_or(PatchError::UnsupportedFormat)?;
    debug!(format = %tag, bytes = data.len(), "dispatching parse");
    let patch = match tag {
        FormatTag::Ips | FormatTag::Ebp => Patch::Ips(ips::IpsPatch::parse(data)?),
        FormatTag::Ups => Patch::Ups(ups::UpsPatch::parse(data)?),
        FormatTag::Bps => Patch::Bps(bps::BpsPatch::parse(data)?),
        FormatTag::ApsN64 => Patch::ApsN64(aps_n64::ApsN64Patch::parse(data)?),
        FormatTag::ApsGba => Patch::ApsGba(aps_gba::ApsGbaPatch::parse(data)?),
        FormatTag::Ppf => Patch::Ppf(ppf::PpfPatch::parse(data)?),
        FormatTag::Rup => Patch::Rup(rup::RupPatch::parse(data)?),
        FormatTag::Pmsr => Patch::Pmsr(pmsr::PmsrPatch::parse(data)?),
        FormatTag::Vcdiff => Patch::Vcdiff(vcdiff::VcdiffPatch::parse(data)?),
    };
    Ok(patch)
}

/// Per-format source precondition check, shifted past `skip_header_size`
/// bytes of console header.
pub fn validate_source(patch: &Patch, source: &RomBuf, skip_header_size: usize) -> bool {
    patch.validate_source(source, skip_header_size)
}

/// Apply a parsed patch to a source buffer.
///
/// Console-header handling runs first when requested, then the codec:
/// `remove_header` splits a recognized header off the source and puts
/// it back on the output; `add_header` wraps the source in a synthetic
/// zero header and strips it from the output.
pub fn apply(patch: &Patch, source: &RomBuf, options: &ApplyOptions) -> Result<RomBuf> {
    let console = rom::for_buffer(source);

    if options.remove_header {
        if let Some(header) = console {
            if header.matches_with_header(source.len()) {
                debug!(console = header.name, size = header.size, "splitting console header");
                let head = source.slice(0..header.size);
                let body = source.slice(header.size..source.len());
                let patched = patch.apply_codec(&body, options.require_validation)?;

                let mut out = RomBuf::from_bytes(head.into_bytes());
                out.seek(out.len());
                out.write_bytes(patched.as_bytes());
                return Ok(out);
            }
        }
    } else if options.add_header {
        if let Some(header) = console {
            if header.matches_without_header(source.len()) {
                debug!(console = header.name, size = header.size, "adding synthetic header");
                let mut headered = RomBuf::with_size(header.size);
                headered.seek(header.size);
                headered.write_bytes(source.as_bytes());

                let patched = patch.apply_codec(&headered, options.require_validation)?;
                return Ok(patched.slice(header.size..patched.len()));
            }
        }
    }

    patch.apply_codec(source, options.require_validation)
}

/// Create a patch of the requested format from a source/modified pair.
///
/// `metadata` feeds the formats that carry free text: the BPS metadata
/// field, or the EBP JSON trailer.
pub fn create(
    source: &RomBuf,
    modified: &RomBuf,
    format: FormatTag,
    metadata: Option<&str>,
) -> Result<Patch> {
    debug!(format = %format, source = source.len(), modified = modified.len(), "creating patch");
    let patch = match format {
        FormatTag::Ips => Patch::Ips(ips::IpsPatch::build(source, modified)?),
        FormatTag::Ebp => Patch::Ips(ips::IpsPatch::build_with_metadata(
            source,
            modified,
            Some(metadata.unwrap_or("{}")),
        )?),
        FormatTag::Ups => Patch::Ups(ups::UpsPatch::build(source, modified)),
        FormatTag::Bps => Patch::Bps(bps::BpsPatch::build(source, modified, metadata)),
        FormatTag::ApsN64 => Patch::ApsN64(aps_n64::ApsN64Patch::build(source, modified)?),
        FormatTag::ApsGba => Patch::ApsGba(aps_gba::ApsGbaPatch::build(source, modified)?),
        FormatTag::Ppf => Patch::Ppf(ppf::PpfPatch::build(source, modified)?),
        FormatTag::Rup => Patch::Rup(rup::RupPatch::build(source, modified)),
        FormatTag::Pmsr => Patch::Pmsr(pmsr::PmsrPatch::build(source, modified)?),
        FormatTag::Vcdiff => Patch::Vcdiff(vcdiff::VcdiffPatch::build(source, modified)?),
    };
    Ok(patch)
}

/// Serialize a patch back to its container format.
pub fn export(patch: &Patch, name: Option<&str>) -> Result<RomBuf> {
    patch.export(name)
}
