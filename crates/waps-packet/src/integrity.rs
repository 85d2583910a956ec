//! Integrity checks of WAPS data packets
//!
//! - FLIR data packets carry a CRC-16/XMODEM (poly 0x1021, init 0) over the
//!   WAPS part of the BIOLAB packet, computed with the reserved upper nibble
//!   of the id word and the CRC field itself zeroed.
//! - uCAM data packets carry a verify code: the low byte of the sum of the
//!   id, size and payload bytes, shifted into the high byte.

use crate::biolab::{offsets, BIOLAB_LEN};
use crate::Integrity;

/// CRC-16/XMODEM
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| crc16_step(crc, byte))
}

fn crc16_step(mut crc: u16, byte: u8) -> u16 {
    crc ^= (byte as u16) << 8;
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ 0x1021
        } else {
            crc << 1
        };
    }
    crc
}

/// CRC of a FLIR data packet as it should appear at bytes 92..94
pub fn flir_crc(biolab: &[u8]) -> u16 {
    let region = &biolab[offsets::WAPS_WORD..BIOLAB_LEN.min(biolab.len())];
    region.iter().enumerate().fold(0u16, |crc, (i, &byte)| {
        let byte = match i {
            0 => byte & 0x0F,
            2 | 3 => 0,
            _ => byte,
        };
        crc16_step(crc, byte)
    })
}

/// Verify code of a uCAM data packet carrying `size` payload bytes
///
/// `None` when `size` does not fit in the BIOLAB packet.
pub fn ucam_verify_code(biolab: &[u8], size: usize) -> Option<u16> {
    let end = offsets::WAPS_PAYLOAD + size;
    if end + 2 > biolab.len().min(BIOLAB_LEN) {
        return None;
    }
    let sum: u32 = biolab[offsets::WAPS_WORD..end].iter().map(|&b| b as u32).sum();
    Some(((sum & 0xFF) as u16) << 8)
}

pub fn check_flir(biolab: &[u8]) -> Integrity {
    let stored = u16::from_be_bytes([biolab[offsets::WAPS_CHECK], biolab[offsets::WAPS_CHECK + 1]]);
    if flir_crc(biolab) == stored {
        Integrity::Verified
    } else {
        Integrity::Corrupted
    }
}

pub fn check_ucam(biolab: &[u8]) -> Integrity {
    let size = u16::from_be_bytes([biolab[offsets::WAPS_CHECK], biolab[offsets::WAPS_CHECK + 1]]) as usize;
    let Some(expected) = ucam_verify_code(biolab, size) else {
        return Integrity::Corrupted;
    };
    let at = offsets::WAPS_PAYLOAD + size;
    let stored = u16::from_be_bytes([biolab[at], biolab[at + 1]]);
    if expected == stored {
        Integrity::Verified
    } else {
        Integrity::Corrupted
    }
}
