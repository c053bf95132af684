//! The `Patch` sum type
//!
//! One variant per container format, with uniform dispatch for the
//! operations every codec provides. The hot path (`apply`) is a plain
//! `match`, no dynamic lookup.

use rombuf::RomBuf;

use crate::aps_gba::ApsGbaPatch;
use crate::aps_n64::ApsN64Patch;
use crate::bps::BpsPatch;
use crate::error::Result;
use crate::ips::IpsPatch;
use crate::pmsr::PmsrPatch;
use crate::ppf::PpfPatch;
use crate::rup::RupPatch;
use crate::ups::UpsPatch;
use crate::vcdiff::VcdiffPatch;

/// Container format identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Ips,
    /// IPS with a JSON metadata trailer.
    Ebp,
    Ups,
    Bps,
    ApsN64,
    ApsGba,
    Ppf,
    Rup,
    Pmsr,
    Vcdiff,
}

impl FormatTag {
    pub fn name(self) -> &'static str {
        match self {
            FormatTag::Ips => "IPS",
            FormatTag::Ebp => "EBP",
            FormatTag::Ups => "UPS",
            FormatTag::Bps => "BPS",
            FormatTag::ApsN64 => "APS (N64)",
            FormatTag::ApsGba => "APS (GBA)",
            FormatTag::Ppf => "PPF",
            FormatTag::Rup => "RUP",
            FormatTag::Pmsr => "PMSR",
            FormatTag::Vcdiff => "VCDIFF",
        }
    }
}

impl std::fmt::Display for FormatTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed patch of any supported format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    Ips(IpsPatch),
    Ups(UpsPatch),
    Bps(BpsPatch),
    ApsN64(ApsN64Patch),
    ApsGba(ApsGbaPatch),
    Ppf(PpfPatch),
    Rup(RupPatch),
    Pmsr(PmsrPatch),
    Vcdiff(VcdiffPatch),
}

impl Patch {
    pub fn format(&self) -> FormatTag {
        match self {
            Patch::Ips(p) if p.metadata.is_some() => FormatTag::Ebp,
            Patch::Ips(_) => FormatTag::Ips,
            Patch::Ups(_) => FormatTag::Ups,
            Patch::Bps(_) => FormatTag::Bps,
            Patch::ApsN64(_) => FormatTag::ApsN64,
            Patch::ApsGba(_) => FormatTag::ApsGba,
            Patch::Ppf(_) => FormatTag::Ppf,
            Patch::Rup(_) => FormatTag::Rup,
            Patch::Pmsr(_) => FormatTag::Pmsr,
            Patch::Vcdiff(_) => FormatTag::Vcdiff,
        }
    }

    /// Per-format source precondition check. `skip` shifts the checked
    /// range past a console header the caller wants ignored.
    pub fn validate_source(&self, source: &RomBuf, skip: usize) -> bool {
        match self {
            Patch::Ips(p) => p.validate_source(source, skip),
            Patch::Ups(p) => p.validate_source(source, skip),
            Patch::Bps(p) => p.validate_source(source, skip),
            Patch::ApsN64(p) => p.validate_source(source, skip),
            Patch::ApsGba(p) => p.validate_source(source, skip),
            Patch::Ppf(p) => p.validate_source(source, skip),
            Patch::Rup(p) => p.validate_source(source, skip),
            Patch::Pmsr(p) => p.validate_source(source, skip),
            Patch::Vcdiff(p) => p.validate_source(source, skip),
        }
    }

    /// Run the codec against a bare source body. Header handling lives
    /// in the dispatcher, not here.
    pub(crate) fn apply_codec(&self, source: &RomBuf, check: bool) -> Result<RomBuf> {
        match self {
            Patch::Ips(p) => p.apply(source, check),
            Patch::Ups(p) => p.apply(source, check),
            Patch::Bps(p) => p.apply(source, check),
            Patch::ApsN64(p) => p.apply(source, check),
            Patch::ApsGba(p) => p.apply(source, check),
            Patch::Ppf(p) => p.apply(source, check),
            Patch::Rup(p) => p.apply(source, check),
            Patch::Pmsr(p) => p.apply(source, check),
            Patch::Vcdiff(p) => p.apply(source, check),
        }
    }

    /// Serialize back to the container format. VCDIFF is decoder-only
    /// and fails with `UnsupportedFeature`.
    pub fn export(&self, name: Option<&str>) -> Result<RomBuf> {
        match self {
            Patch::Ips(p) => Ok(p.export(name)),
            Patch::Ups(p) => Ok(p.export(name)),
            Patch::Bps(p) => Ok(p.export(name)),
            Patch::ApsN64(p) => Ok(p.export(name)),
            Patch::ApsGba(p) => Ok(p.export(name)),
            Patch::Ppf(p) => Ok(p.export(name)),
            Patch::Rup(p) => Ok(p.export(name)),
            Patch::Pmsr(p) => Ok(p.export(name)),
            Patch::Vcdiff(p) => p.export(name),
        }
    }
}
