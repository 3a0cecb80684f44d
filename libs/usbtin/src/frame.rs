//! CAN Frame Definition
//!
//! Classic CAN frames as exchanged with the adapter: 11-bit or 29-bit
//! identifier, optional RTR, up to eight payload bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, UsbtinError};

/// Highest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Highest extended (29-bit) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit
pub const MAX_DLC: u8 = 8;

/// CAN frame
///
/// Invariants: `id <= 0x1FFFFFFF`, `id > 0x7FF` implies `extended`,
/// `dlc <= 8`; data frames carry exactly `dlc` bytes, remote frames carry
/// none and use `dlc` as the requested length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    remote: bool,
    dlc: u8,
    data: Vec<u8>,
}

impl CanFrame {
    /// Data frame; the extended flag follows from the identifier
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::with_flags(id, data, false, false)
    }

    /// Data frame with an explicit extended identifier
    pub fn new_extended(id: u32, data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::with_flags(id, data, true, false)
    }

    /// Remote transmission request for `requested_len` bytes
    pub fn remote(id: u32, requested_len: u8) -> Result<Self> {
        if requested_len > MAX_DLC {
            return Err(UsbtinError::invalid_frame(format!(
                "requested length {requested_len} exceeds {MAX_DLC}"
            )));
        }
        Ok(Self::from_parts(id, false, true, requested_len, Vec::new()))
    }

    /// Frame with explicit flags. Identifiers above 0x7FF are always
    /// extended; for remote frames the payload length becomes the requested
    /// length and the bytes themselves are dropped.
    pub fn with_flags(
        id: u32,
        data: impl Into<Vec<u8>>,
        extended: bool,
        remote: bool,
    ) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_DLC as usize {
            return Err(UsbtinError::invalid_frame(format!(
                "payload of {} bytes exceeds {MAX_DLC}",
                data.len()
            )));
        }

        let dlc = data.len() as u8;
        let data = if remote { Vec::new() } else { data };
        Ok(Self::from_parts(id, extended, remote, dlc, data))
    }

    /// Build from already-bounded parts, enforcing the identifier rules
    pub(crate) fn from_parts(id: u32, extended: bool, remote: bool, dlc: u8, data: Vec<u8>) -> Self {
        let id = id.min(MAX_EXTENDED_ID);
        Self {
            id,
            extended: extended || id > MAX_STANDARD_ID,
            remote,
            dlc: dlc.min(MAX_DLC),
            data,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Data length code: payload length, or the requested length of an RTR
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::codec::encode(self))
    }
}
