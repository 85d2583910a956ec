//! CCSDS packet headers
//!
//! Primary header (6 bytes) and the 10-byte secondary header used on the
//! Columbus telemetry stream:
//!
//! ```text
//! 0      2      4      6           10   11   12          16
//! +------+------+------+-----------+----+----+-----------+
//! | id   | seq  | len  | coarse    |fine|type| packet id |
//! +------+------+------+-----------+----+----+-----------+
//! ```
//!
//! The length field holds the packet data field length minus one, counted
//! from the end of the primary header.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::Rejection;

pub const PRIMARY_HEADER_LEN: usize = 6;
pub const SECONDARY_HEADER_LEN: usize = 10;
pub const HEADERS_LEN: usize = PRIMARY_HEADER_LEN + SECONDARY_HEADER_LEN;

/// GPS epoch (1980-01-06T00:00:00Z) as a Unix timestamp
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

/// Element id of Columbus packets
pub const ELEMENT_COLUMBUS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    System,
    Payload,
}

/// Decoded CCSDS primary and secondary header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcsdsHeader {
    pub packet_type: PacketType,
    pub apid: u16,
    pub sequence_flags: u8,
    pub sequence_count: u16,
    pub packet_length: u16,
    pub coarse_time: u32,
    pub fine_time: u8,
    pub element_id: u8,
    pub packet_id27: u32,
}

impl CcsdsHeader {
    /// Parse both headers from the start of a packet
    pub fn parse(raw: &[u8]) -> Result<Self, Rejection> {
        if raw.len() < HEADERS_LEN {
            return Err(Rejection::MalformedHeader(format!(
                "CCSDS packet too short: {} bytes",
                raw.len()
            )));
        }

        let word1 = u16::from_be_bytes([raw[0], raw[1]]);
        let word2 = u16::from_be_bytes([raw[2], raw[3]]);
        let packet_length = u16::from_be_bytes([raw[4], raw[5]]);
        let coarse_time = u32::from_be_bytes([raw[6], raw[7], raw[8], raw[9]]);
        let word3 = u16::from_be_bytes([raw[10], raw[11]]);
        let packet_id32 = u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);

        Ok(Self {
            packet_type: if (word1 >> 12) & 0x1 == 1 {
                PacketType::Payload
            } else {
                PacketType::System
            },
            apid: word1 & 0x03FF,
            sequence_flags: ((word2 >> 14) & 0x3) as u8,
            sequence_count: word2 & 0x3FFF,
            packet_length,
            coarse_time,
            fine_time: ((word3 >> 8) & 0xFF) as u8,
            element_id: ((packet_id32 >> 27) & 0xF) as u8,
            packet_id27: packet_id32 & 0x07FF_FFFF,
        })
    }

    /// Length of the whole packet, headers included
    pub fn total_len(&self) -> usize {
        PRIMARY_HEADER_LEN + self.packet_length as usize + 1
    }

    /// Bytes still to read after the 16 header bytes
    pub fn remaining_len(&self) -> usize {
        self.total_len().saturating_sub(HEADERS_LEN)
    }

    /// Onboard time from the coarse (s) and fine (1/256 s) counters
    pub fn onboard_time(&self) -> DateTime<Utc> {
        let nanos = (self.fine_time as u64 * 1_000_000_000 / 256) as u32;
        DateTime::from_timestamp(GPS_EPOCH_UNIX + self.coarse_time as i64, nanos)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Encode both headers into 16 bytes
    pub fn encode(&self) -> [u8; HEADERS_LEN] {
        let mut out = [0u8; HEADERS_LEN];
        let type_bit = match self.packet_type {
            PacketType::System => 0u16,
            PacketType::Payload => 1u16,
        };
        // version 0, secondary header flag set
        let word1 = (type_bit << 12) | (1 << 11) | (self.apid & 0x03FF);
        let word2 = ((self.sequence_flags as u16 & 0x3) << 14) | (self.sequence_count & 0x3FFF);
        let word3 = (self.fine_time as u16) << 8;
        let packet_id32 = ((self.element_id as u32 & 0xF) << 27) | (self.packet_id27 & 0x07FF_FFFF);

        out[0..2].copy_from_slice(&word1.to_be_bytes());
        out[2..4].copy_from_slice(&word2.to_be_bytes());
        out[4..6].copy_from_slice(&self.packet_length.to_be_bytes());
        out[6..10].copy_from_slice(&self.coarse_time.to_be_bytes());
        out[10..12].copy_from_slice(&word3.to_be_bytes());
        out[12..16].copy_from_slice(&packet_id32.to_be_bytes());
        out
    }
}

/// Split an onboard time into coarse and fine counters
pub fn time_to_counters(time: DateTime<Utc>) -> (u32, u8) {
    let coarse = (time.timestamp() - GPS_EPOCH_UNIX).clamp(0, u32::MAX as i64) as u32;
    let fine = (time.timestamp_subsec_nanos() as u64 * 256 / 1_000_000_000) as u8;
    (coarse, fine)
}
