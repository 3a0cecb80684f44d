//! CAN Bit Timing
//!
//! The adapter knows nine standard bit rates by a single preset digit. Any
//! other rate is programmed directly into the MCP2515 configuration
//! registers: CNF1 carries the baud rate prescaler, CNF2/CNF3 come from a
//! fixed table indexed by the number of time quanta per bit.

use std::fmt;

use crate::error::{Result, UsbtinError};

/// Crystal fitted to the USBtin board
pub const DEFAULT_OSCILLATOR_HZ: u32 = 24_000_000;

/// Bit rates with a firmware preset, paired with their `S` digit
pub const PRESET_BAUD_RATES: [(u32, char); 9] = [
    (10_000, '0'),
    (20_000, '1'),
    (50_000, '2'),
    (100_000, '3'),
    (125_000, '4'),
    (250_000, '5'),
    (500_000, '6'),
    (800_000, '7'),
    (1_000_000, '8'),
];

/// Shortest and longest bit time searched, in time quanta
pub const MIN_BIT_QUANTA: u32 = 11;
pub const MAX_BIT_QUANTA: u32 = 23;

/// CNF2 (high byte) / CNF3 (low byte) for 11..=23 time quanta per bit
const CNF_TABLE: [u16; 13] = [
    0x9203, 0x9303, 0x9B03, 0x9B04, 0x9C04, 0xA404, 0xA405, 0xAC05, 0xAC06, 0xAD06, 0xB506,
    0xB507, 0xBD07,
];

/// Doubled prescaler range (`2 * (BRP + 1)`) supported by CNF1
const MIN_DOUBLED_BRP: u64 = 2;
const MAX_DOUBLED_BRP: u64 = 128;

/// CNF1 synchronisation jump width bits (SJW = 4 TQ)
const SJW_BITS: u8 = 0xC0;

/// Register values for a non-preset bit rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomTiming {
    /// Baud rate prescaler as written to CNF1 (without SJW bits)
    pub brp: u8,
    /// Time quanta per bit
    pub bit_quanta: u8,
    /// CNF2/CNF3 pair
    pub cnf: u16,
    /// Oscillator the values were computed for
    pub oscillator_hz: u32,
}

impl CustomTiming {
    /// Search the register values closest to `baud`
    pub fn compute(oscillator_hz: u32, baud: u32) -> Result<Self> {
        if baud == 0 {
            return Err(UsbtinError::InvalidBaudRate(baud));
        }

        let desired = u64::from(oscillator_hz / baud);

        let mut best: Option<(u64, u32, u64)> = None;
        for quanta in MIN_BIT_QUANTA..=MAX_BIT_QUANTA {
            let doubled_brp = round_to_even_tenths(desired * 10 / u64::from(quanta))
                .clamp(MIN_DOUBLED_BRP, MAX_DOUBLED_BRP);
            let diff = desired.abs_diff(u64::from(quanta) * doubled_brp);

            // strict comparison: the earliest bit length wins a tie
            match best {
                Some((best_diff, _, _)) if diff >= best_diff => {}
                _ => best = Some((diff, quanta, doubled_brp)),
            }
        }

        let (_, quanta, doubled_brp) = best.ok_or(UsbtinError::InvalidBaudRate(baud))?;

        Ok(Self {
            brp: (doubled_brp / 2 - 1) as u8,
            bit_quanta: quanta as u8,
            cnf: CNF_TABLE[(quanta - MIN_BIT_QUANTA) as usize],
            oscillator_hz,
        })
    }

    /// `s` command carrying CNF1 and CNF2/CNF3
    pub fn command(&self) -> String {
        format!("s{:02x}{:04x}", self.brp | SJW_BITS, self.cnf)
    }

    /// Bit rate these registers actually produce
    pub fn achieved_baud(&self) -> u32 {
        let prescaled = self.oscillator_hz / ((u32::from(self.brp) + 1) * 2);
        prescaled / u32::from(self.bit_quanta)
    }
}

/// Round a value in tenths to the nearest multiple of twenty, half up,
/// and drop the decimal
fn round_to_even_tenths(value: u64) -> u64 {
    let rem = value % 20;
    let rounded = value - rem + if rem >= 10 { 20 } else { 0 };
    rounded / 10
}

/// How a requested bit rate is programmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudSetting {
    /// Firmware preset `S<code>`
    Preset { baud: u32, code: char },
    /// Explicit register values `s<cnf1><cnf2><cnf3>`
    Custom(CustomTiming),
}

impl BaudSetting {
    /// Preset when one exists, register search otherwise
    pub fn resolve(oscillator_hz: u32, baud: u32) -> Result<Self> {
        if let Some(&(baud, code)) = PRESET_BAUD_RATES.iter().find(|(rate, _)| *rate == baud) {
            return Ok(BaudSetting::Preset { baud, code });
        }
        CustomTiming::compute(oscillator_hz, baud).map(BaudSetting::Custom)
    }

    pub fn command(&self) -> String {
        match self {
            BaudSetting::Preset { code, .. } => format!("S{code}"),
            BaudSetting::Custom(timing) => timing.command(),
        }
    }

    pub fn achieved_baud(&self) -> u32 {
        match self {
            BaudSetting::Preset { baud, .. } => *baud,
            BaudSetting::Custom(timing) => timing.achieved_baud(),
        }
    }

    pub fn is_preset(&self) -> bool {
        matches!(self, BaudSetting::Preset { .. })
    }
}

impl fmt::Display for BaudSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let expected = [
            (10_000, "S0"),
            (20_000, "S1"),
            (50_000, "S2"),
            (100_000, "S3"),
            (125_000, "S4"),
            (250_000, "S5"),
            (500_000, "S6"),
            (800_000, "S7"),
            (1_000_000, "S8"),
        ];
        for (baud, command) in expected {
            let setting = BaudSetting::resolve(DEFAULT_OSCILLATOR_HZ, baud).unwrap();
            assert!(setting.is_preset());
            assert_eq!(setting.command(), command);
            assert_eq!(setting.achieved_baud(), baud);
        }
    }

    #[test]
    fn test_custom_83333() {
        let timing = CustomTiming::compute(DEFAULT_OSCILLATOR_HZ, 83_333).unwrap();
        assert_eq!(timing.bit_quanta, 12);
        assert_eq!(timing.brp, 11);
        assert_eq!(timing.cnf, 0x9303);
        assert_eq!(timing.command(), "scb9303");
        assert_eq!(timing.achieved_baud(), 83_333);
    }

    #[test]
    fn test_tie_keeps_shortest_bit() {
        // 720 quanta: 12 x 60 and 15 x 48 both hit exactly
        let timing = CustomTiming::compute(DEFAULT_OSCILLATOR_HZ, 33_333).unwrap();
        assert_eq!(timing.bit_quanta, 12);
        assert_eq!(timing.command(), "sdd9303");
    }

    #[test]
    fn test_prescaler_clamped_for_slow_rates() {
        let timing = CustomTiming::compute(DEFAULT_OSCILLATOR_HZ, 5_000).unwrap();
        assert_eq!(timing.bit_quanta, 23);
        assert_eq!(timing.brp, 63);
        assert_eq!(timing.command(), "sffbd07");
        assert_eq!(timing.achieved_baud(), 8_152);
    }

    #[test]
    fn test_prescaler_clamped_for_fast_rates() {
        let timing = CustomTiming::compute(DEFAULT_OSCILLATOR_HZ, 2_000_000).unwrap();
        assert_eq!(timing.brp, 0);
        assert_eq!(timing.bit_quanta, 11);
        assert_eq!(timing.command(), "sc09203");
    }

    #[test]
    fn test_zero_baud_rejected() {
        assert!(matches!(
            BaudSetting::resolve(DEFAULT_OSCILLATOR_HZ, 0),
            Err(UsbtinError::InvalidBaudRate(0))
        ));
    }

    #[test]
    fn test_command_shape() {
        for baud in [1_000, 33_000, 47_619, 95_238, 200_000, 333_333, 666_666] {
            let setting = BaudSetting::resolve(DEFAULT_OSCILLATOR_HZ, baud).unwrap();
            let command = setting.command();
            assert_eq!(command.len(), 7, "{command}");
            assert!(command.starts_with('s'));
            assert!(command[1..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_other_oscillator() {
        // 16 MHz crystal: 168 quanta per bit, exact with 12 x 14
        let timing = CustomTiming::compute(16_000_000, 95_000).unwrap();
        let achieved = timing.achieved_baud();
        assert!(achieved.abs_diff(95_000) < 5_000, "achieved {achieved}");
    }
}
