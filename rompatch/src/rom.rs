//! Console ROM header handling
//!
//! Some dump formats carry a fixed-size copier or loader header in
//! front of the actual ROM body, and patches are usually made against
//! the headerless body. The table below maps file extensions to the
//! header size and the stride the body must align to.

use rombuf::RomBuf;

/// A known console header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleHeader {
    pub size: usize,
    pub stride: usize,
    pub name: &'static str,
}

/// Look up a header layout by file extension (case-insensitive).
pub fn for_extension(extension: &str) -> Option<ConsoleHeader> {
    let header = match extension.to_ascii_lowercase().as_str() {
        "nes" => ConsoleHeader {
            size: 16,
            stride: 1024,
            name: "iNES",
        },
        "fds" => ConsoleHeader {
            size: 16,
            stride: 65500,
            name: "fwNES",
        },
        "lnx" => ConsoleHeader {
            size: 64,
            stride: 1024,
            name: "LNX",
        },
        "sfc" | "smc" | "swc" | "fig" => ConsoleHeader {
            size: 512,
            stride: 262144,
            name: "SNES copier",
        },
        _ => return None,
    };
    Some(header)
}

/// Look up a header layout from a buffer's file name.
pub fn for_buffer(buf: &RomBuf) -> Option<ConsoleHeader> {
    let name = buf.name()?;
    let (_, extension) = name.rsplit_once('.')?;
    for_extension(extension)
}

impl ConsoleHeader {
    /// Whether `len` looks like a headered dump of this kind.
    pub fn matches_with_header(&self, len: usize) -> bool {
        len > self.size && (len - self.size) % self.stride == 0
    }

    /// Whether `len` looks like a bare ROM body of this kind.
    pub fn matches_without_header(&self, len: usize) -> bool {
        len > 0 && len % self.stride == 0
    }
}
