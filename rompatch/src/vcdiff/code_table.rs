//! RFC 3284 default instruction code table
//!
//! 256 entries, each holding up to two half-instructions. The layout is
//! fixed: RUN at index 0, the ADD run over 1..=18, nine COPY blocks of
//! 16 entries (one per address mode), then the composite ADD+COPY and
//! COPY+ADD entries filling 163..=255.

/// Half-instruction types, RFC numbering.
pub const NOOP: u8 = 0;
pub const ADD: u8 = 1;
pub const RUN: u8 = 2;
pub const COPY: u8 = 3;

/// One code table entry: two half-instructions, possibly NOOP.
///
/// A size of 0 means the actual size follows the opcode in the
/// instruction stream as a variable-length integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub type1: u8,
    pub size1: u8,
    pub mode1: u8,
    pub type2: u8,
    pub size2: u8,
    pub mode2: u8,
}

const EMPTY: Entry = Entry {
    type1: NOOP,
    size1: 0,
    mode1: 0,
    type2: NOOP,
    size2: 0,
    mode2: 0,
};

fn single(itype: u8, size: u8, mode: u8) -> Entry {
    Entry {
        type1: itype,
        size1: size,
        mode1: mode,
        ..EMPTY
    }
}

fn pair(t1: u8, s1: u8, m1: u8, t2: u8, s2: u8, m2: u8) -> Entry {
    Entry {
        type1: t1,
        size1: s1,
        mode1: m1,
        type2: t2,
        size2: s2,
        mode2: m2,
    }
}

/// Build the default table. The construction is deterministic; every
/// conforming decoder enumerates exactly these 256 entries.
pub fn default_table() -> [Entry; 256] {
    let mut table = [EMPTY; 256];
    let mut i = 0;

    table[i] = single(RUN, 0, 0);
    i += 1;

    // ADD: size 0 (explicit), then 1..=17.
    table[i] = single(ADD, 0, 0);
    i += 1;
    for size in 1..=17 {
        table[i] = single(ADD, size, 0);
        i += 1;
    }

    // COPY: per mode, size 0 (explicit), then 4..=18.
    for mode in 0..9 {
        table[i] = single(COPY, 0, mode);
        i += 1;
        for size in 4..=18 {
            table[i] = single(COPY, size, mode);
            i += 1;
        }
    }

    // ADD+COPY composites.
    for mode in 0..6 {
        for add_size in 1..=4 {
            for copy_size in 4..=6 {
                table[i] = pair(ADD, add_size, 0, COPY, copy_size, mode);
                i += 1;
            }
        }
    }
    for mode in 6..9 {
        for add_size in 1..=4 {
            table[i] = pair(ADD, add_size, 0, COPY, 4, mode);
            i += 1;
        }
    }

    // COPY+ADD composites.
    for mode in 0..9 {
        table[i] = pair(COPY, 4, mode, ADD, 1, 0);
        i += 1;
    }

    debug_assert_eq!(i, 256);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landmark_entries() {
        let table = default_table();

        assert_eq!(table[0], single(RUN, 0, 0));
        assert_eq!(table[1], single(ADD, 0, 0));
        assert_eq!(table[18], single(ADD, 17, 0));
        // First COPY block, mode 0.
        assert_eq!(table[19], single(COPY, 0, 0));
        assert_eq!(table[20], single(COPY, 4, 0));
        assert_eq!(table[34], single(COPY, 18, 0));
        // Last single-instruction COPY, mode 8.
        assert_eq!(table[162], single(COPY, 18, 8));
        // First composite.
        assert_eq!(table[163], pair(ADD, 1, 0, COPY, 4, 0));
        // Final COPY+ADD row.
        assert_eq!(table[247], pair(COPY, 4, 0, ADD, 1, 0));
        assert_eq!(table[255], pair(COPY, 4, 8, ADD, 1, 0));
    }

    #[test]
    fn no_gaps() {
        let table = default_table();
        // Index 0 is the only RUN; everything else decodes to at least
        // one non-NOOP half-instruction.
        for entry in table.iter() {
            assert!(entry.type1 != NOOP || entry.type2 != NOOP);
        }
    }
}
