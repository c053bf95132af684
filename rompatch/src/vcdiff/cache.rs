//! VCDIFF address cache (RFC 3284 section 5.3)
//!
//! COPY addresses are encoded against two small caches: a round-robin
//! NEAR cache of recent addresses and a SAME cache keyed by
//! `address mod (same_size * 256)`. Every decoded address updates both.

use rombuf::RomBuf;

use crate::error::{PatchError, Result};

use super::read_int;

/// Absolute address mode.
const VCD_SELF: u8 = 0;
/// Address relative to the current position.
const VCD_HERE: u8 = 1;

pub struct AddressCache {
    near: Vec<u64>,
    same: Vec<u64>,
    next_slot: usize,
}

impl AddressCache {
    /// Default RFC configuration: 4 NEAR slots, 3 SAME groups.
    pub fn new() -> Self {
        Self::with_sizes(4, 3)
    }

    pub fn with_sizes(near_size: usize, same_size: usize) -> Self {
        Self {
            near: vec![0; near_size],
            same: vec![0; same_size * 256],
            next_slot: 0,
        }
    }

    /// Number of valid address modes for this configuration.
    pub fn mode_count(&self) -> usize {
        2 + self.near.len() + self.same.len() / 256
    }

    fn same_start(&self) -> usize {
        2 + self.near.len()
    }

    fn update(&mut self, addr: u64) {
        if !self.near.is_empty() {
            self.near[self.next_slot] = addr;
            self.next_slot = (self.next_slot + 1) % self.near.len();
        }
        if !self.same.is_empty() {
            let idx = (addr % self.same.len() as u64) as usize;
            self.same[idx] = addr;
        }
    }

    /// Decode one COPY address from the address section.
    ///
    /// `here` is the current position in the combined address space
    /// (source segment length plus target bytes produced so far); every
    /// valid address is strictly below it.
    pub fn decode(&mut self, mode: u8, addresses: &mut RomBuf, here: u64) -> Result<u64> {
        let mode = mode as usize;
        if mode >= self.mode_count() {
            return Err(PatchError::invalid(
                "VCDIFF",
                format!("address mode {mode} out of range"),
            ));
        }

        let addr = if mode < self.same_start() {
            let value = read_int(addresses)?;
            if mode == VCD_SELF as usize {
                value
            } else if mode == VCD_HERE as usize {
                here.checked_sub(value)
                    .ok_or_else(|| PatchError::invalid("VCDIFF", "HERE address underflow"))?
            } else {
                self.near[mode - 2]
                    .checked_add(value)
                    .ok_or_else(|| PatchError::invalid("VCDIFF", "NEAR address overflow"))?
            }
        } else {
            if addresses.is_eof() {
                return Err(PatchError::invalid("VCDIFF", "address section underflow"));
            }
            let slot = mode - self.same_start();
            let byte = addresses.read_u8() as usize;
            self.same[slot * 256 + byte]
        };

        if addr >= here {
            return Err(PatchError::invalid(
                "VCDIFF",
                format!("COPY address {addr} is not below {here}"),
            ));
        }
        self.update(addr);
        Ok(addr)
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}
