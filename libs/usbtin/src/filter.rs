//! Acceptance Filter Programming
//!
//! The MCP2515 has two receive buffers, each guarded by one mask: slot 0
//! with two filters, slot 1 with four. A [`FilterChain`] is one mask plus the
//! filters checked against it. [`plan`] turns up to two chains into the
//! ordered register writes that program them.
//!
//! ```text
//!   slot 0: mask @ 0x20   filters @ 0x00 0x04
//!   slot 1: mask @ 0x24   filters @ 0x08 0x10 0x14 0x18
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, UsbtinError};

/// Mask register base for slot 0; slot 1 follows four bytes later
pub const MASK_BASE: u8 = 0x20;

/// Filter register bases, two for slot 0 then four for slot 1
pub const FILTER_BASES: [u8; 6] = [0x00, 0x04, 0x08, 0x10, 0x14, 0x18];

/// Filters per hardware slot
pub const SLOT_CAPACITY: [usize; 2] = [2, 4];

/// Extended identifier enable bit in SIDL
const EXIDE: u8 = 0x08;

fn standard_registers(sid: u16, d0: u8, d1: u8) -> [u8; 4] {
    let sid = u32::from(sid);
    [((sid >> 3) & 0xFF) as u8, ((sid & 0x07) << 5) as u8, d0, d1]
}

fn extended_registers(eid: u32) -> [u8; 4] {
    [
        ((eid >> 21) & 0xFF) as u8,
        (((eid >> 16) & 0x03) | ((eid >> 13) & 0xE0)) as u8,
        ((eid >> 8) & 0xFF) as u8,
        (eid & 0xFF) as u8,
    ]
}

/// Mask register contents; set bits must match, clear bits are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMask {
    registers: [u8; 4],
}

impl FilterMask {
    /// Standard identifier mask plus masks for the first two data bytes
    pub fn standard(sid: u16, d0: u8, d1: u8) -> Self {
        Self {
            registers: standard_registers(sid, d0, d1),
        }
    }

    pub fn extended(eid: u32) -> Self {
        Self {
            registers: extended_registers(eid),
        }
    }

    /// Accept everything
    pub fn open() -> Self {
        Self { registers: [0; 4] }
    }

    pub fn registers(&self) -> [u8; 4] {
        self.registers
    }
}

/// Filter register contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterValue {
    registers: [u8; 4],
}

impl FilterValue {
    /// Standard identifier plus patterns for the first two data bytes
    pub fn standard(sid: u16, d0: u8, d1: u8) -> Self {
        Self {
            registers: standard_registers(sid, d0, d1),
        }
    }

    /// Extended identifier; only matches extended frames
    pub fn extended(eid: u32) -> Self {
        let mut registers = extended_registers(eid);
        registers[1] |= EXIDE;
        Self { registers }
    }

    pub fn registers(&self) -> [u8; 4] {
        self.registers
    }
}

/// One mask and the filters compared under it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterChain {
    mask: FilterMask,
    filters: Vec<FilterValue>,
}

impl FilterChain {
    pub fn new(mask: FilterMask, filters: impl Into<Vec<FilterValue>>) -> Self {
        Self {
            mask,
            filters: filters.into(),
        }
    }

    pub fn mask(&self) -> &FilterMask {
        &self.mask
    }

    pub fn filters(&self) -> &[FilterValue] {
        &self.filters
    }
}

/// Single register write, sent as `W<addr><value>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub address: u8,
    pub value: u8,
}

impl RegisterWrite {
    pub fn new(address: u8, value: u8) -> Self {
        Self { address, value }
    }

    pub fn command(&self) -> String {
        format!("W{:02x}{:02x}", self.address, self.value)
    }
}

fn push_block(plan: &mut Vec<RegisterWrite>, base: u8, registers: [u8; 4]) {
    plan.extend(
        registers
            .iter()
            .zip(base..)
            .map(|(&value, address)| RegisterWrite::new(address, value)),
    );
}

/// Register writes programming `chains` into the two hardware slots
///
/// No chain opens both masks and leaves the filters alone. A single chain
/// is mirrored into both slots (slot 0 takes its first two filters). With
/// two chains the shorter one goes to slot 0. Unused filter registers are
/// zeroed. Each slot is written mask first, then its filters.
pub fn plan(chains: &[FilterChain]) -> Result<Vec<RegisterWrite>> {
    let slots: [&FilterChain; 2] = match chains {
        [] => {
            let mut writes = Vec::with_capacity(8);
            for slot in 0..SLOT_CAPACITY.len() as u8 {
                push_block(&mut writes, MASK_BASE + 4 * slot, FilterMask::open().registers());
            }
            return Ok(writes);
        }
        [only] => {
            if only.filters.len() > SLOT_CAPACITY[1] {
                return Err(UsbtinError::FilterChainTooLong {
                    slot: 1,
                    len: only.filters.len(),
                    max: SLOT_CAPACITY[1],
                });
            }
            [only, only]
        }
        [first, second] => {
            let (short, long) = if first.filters.len() > second.filters.len() {
                (second, first)
            } else {
                (first, second)
            };
            for (slot, chain) in [short, long].iter().enumerate() {
                if chain.filters.len() > SLOT_CAPACITY[slot] {
                    return Err(UsbtinError::FilterChainTooLong {
                        slot,
                        len: chain.filters.len(),
                        max: SLOT_CAPACITY[slot],
                    });
                }
            }
            [short, long]
        }
        _ => {
            return Err(UsbtinError::TooManyFilterChains {
                count: chains.len(),
            })
        }
    };

    let mut writes = Vec::with_capacity(4 * (2 + FILTER_BASES.len()));
    let mut bases = FILTER_BASES.iter();

    for (slot, chain) in slots.iter().enumerate() {
        push_block(&mut writes, MASK_BASE + 4 * slot as u8, chain.mask.registers());

        for index in 0..SLOT_CAPACITY[slot] {
            let registers = chain
                .filters
                .get(index)
                .map(FilterValue::registers)
                .unwrap_or([0; 4]);
            if let Some(&base) = bases.next() {
                push_block(&mut writes, base, registers);
            }
        }
    }

    Ok(writes)
}
