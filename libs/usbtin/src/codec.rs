//! ASCII line codec for CAN frames
//!
//! ```text
//!   t<ID:3hex><DLC:1hex><DATA:2hex*DLC>   standard data
//!   T<ID:8hex><DLC:1hex><DATA:2hex*DLC>   extended data
//!   r<ID:3hex><DLC:1hex>                  standard RTR
//!   R<ID:8hex><DLC:1hex>                  extended RTR
//! ```
//!
//! Decoding is deliberately lenient: a missing or malformed numeric field
//! reads as zero instead of rejecting the line, so a damaged line still
//! reaches the listeners. The length nibble is capped at eight.

use std::fmt::Write;

use crate::frame::{CanFrame, MAX_DLC};

/// Line terminator used in both directions
pub const TERMINATOR: u8 = b'\r';
/// Error / NAK byte
pub const BELL: u8 = 0x07;

/// Encode a frame as a wire line without terminator
pub fn encode(frame: &CanFrame) -> String {
    let mut line = String::with_capacity(1 + 8 + 1 + 2 * MAX_DLC as usize);

    let prefix = match (frame.is_extended(), frame.is_remote()) {
        (false, false) => 't',
        (false, true) => 'r',
        (true, false) => 'T',
        (true, true) => 'R',
    };
    line.push(prefix);

    // Writing to String buffer is infallible
    if frame.is_extended() {
        let _ = write!(line, "{:08x}", frame.id());
    } else {
        let _ = write!(line, "{:03x}", frame.id());
    }
    let _ = write!(line, "{:x}", frame.dlc());

    if !frame.is_remote() {
        for byte in frame.data() {
            let _ = write!(line, "{byte:02x}");
        }
    }

    line
}

/// Encode a frame as terminated wire bytes
pub fn encode_line(frame: &CanFrame) -> Vec<u8> {
    let mut bytes = encode(frame).into_bytes();
    bytes.push(TERMINATOR);
    bytes
}

/// Decode a wire line (terminator already stripped)
///
/// Never fails. `r`, `T` and `R` select their frame kinds; any other first
/// character is read as a standard data frame. An identifier wider than 29
/// bits is clamped to `0x1FFFFFFF`.
pub fn decode(line: &str) -> CanFrame {
    let (extended, remote) = match line.as_bytes().first() {
        Some(b'r') => (false, true),
        Some(b'T') => (true, false),
        Some(b'R') => (true, true),
        _ => (false, false),
    };

    let id_len = if extended { 8 } else { 3 };
    let mut index = 1;

    let id = hex_field(line, index, id_len);
    index += id_len;

    let dlc = hex_field(line, index, 1).min(u32::from(MAX_DLC)) as u8;
    index += 1;

    let data = if remote {
        Vec::new()
    } else {
        (0..dlc as usize)
            .map(|i| hex_field(line, index + 2 * i, 2) as u8)
            .collect()
    };

    CanFrame::from_parts(id, extended, remote, dlc, data)
}

/// Hex value of `line[start..start + len]`, zero when absent or malformed
fn hex_field(line: &str, start: usize, len: usize) -> u32 {
    line.get(start..start + len)
        .and_then(|field| u32::from_str_radix(field, 16).ok())
        .unwrap_or(0)
}
