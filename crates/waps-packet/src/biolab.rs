//! BIOLAB generic telemetry packets
//!
//! A BIOLAB packet is a fixed 254-byte block starting at byte 40 of the CCSDS
//! packet. WAPS image packets are generic TM packets identified by their
//! generic TM id.

use serde::{Deserialize, Serialize};

use crate::classifier::Rejection;

/// Offset of the BIOLAB packet inside the CCSDS packet
pub const BIOLAB_OFFSET: usize = 40;
/// First byte of every BIOLAB packet
pub const BIOLAB_ID: u8 = 0x40;
/// Fixed BIOLAB packet length
pub const BIOLAB_LEN: usize = 254;

/// Offsets inside the BIOLAB packet
pub mod offsets {
    pub const LENGTH: usize = 1;
    pub const EC_ADDRESS: usize = 2;
    pub const TIME_TAG: usize = 4;
    pub const ACTIVE_SLOT: usize = 56;
    pub const GENERIC_TM_ID: usize = 84;
    pub const GENERIC_TM_TYPE: usize = 86;
    pub const GENERIC_TM_LENGTH: usize = 88;
    pub const WAPS_WORD: usize = 90;
    pub const WAPS_CHECK: usize = 92;
    pub const WAPS_PAYLOAD: usize = 94;
}

/// Generic TM ids of the WAPS image packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WapsTmId {
    FlirStart,
    FlirData,
    UcamStart,
    UcamData,
}

impl WapsTmId {
    pub fn from_generic_tm_id(id: u16) -> Option<Self> {
        match id {
            0x4100 => Some(WapsTmId::FlirStart),
            0x4200 => Some(WapsTmId::FlirData),
            0x5100 => Some(WapsTmId::UcamStart),
            0x5200 => Some(WapsTmId::UcamData),
            _ => None,
        }
    }

    pub fn generic_tm_id(self) -> u16 {
        match self {
            WapsTmId::FlirStart => 0x4100,
            WapsTmId::FlirData => 0x4200,
            WapsTmId::UcamStart => 0x5100,
            WapsTmId::UcamData => 0x5200,
        }
    }

    pub fn is_start(self) -> bool {
        matches!(self, WapsTmId::FlirStart | WapsTmId::UcamStart)
    }

    pub fn image_type(self) -> crate::ImageType {
        match self {
            WapsTmId::FlirStart | WapsTmId::FlirData => crate::ImageType::Infrared,
            WapsTmId::UcamStart | WapsTmId::UcamData => crate::ImageType::Color,
        }
    }
}

/// Borrowed view over a validated BIOLAB packet
#[derive(Debug, Clone, Copy)]
pub struct BiolabPacket<'a> {
    data: &'a [u8],
}

impl<'a> BiolabPacket<'a> {
    /// Locate the BIOLAB packet inside a CCSDS packet
    ///
    /// Returns `NotBiolabPacket` when the packet is too short to hold one or
    /// the BIOLAB id is absent, `MalformedHeader` when the declared length
    /// is not the fixed 254 bytes.
    pub fn locate(ccsds: &'a [u8]) -> Result<Self, Rejection> {
        let start = BIOLAB_OFFSET;
        if ccsds.len() < start + 2 || ccsds[start] != BIOLAB_ID {
            return Err(Rejection::NotBiolabPacket);
        }

        let declared = ccsds[start + offsets::LENGTH] as usize * 2 + 4;
        if declared != BIOLAB_LEN {
            return Err(Rejection::MalformedHeader(format!(
                "BIOLAB length {} (expected {})",
                declared, BIOLAB_LEN
            )));
        }
        if ccsds.len() < start + BIOLAB_LEN {
            return Err(Rejection::MalformedHeader(format!(
                "BIOLAB packet truncated: {} of {} bytes",
                ccsds.len() - start,
                BIOLAB_LEN
            )));
        }

        Ok(Self {
            data: &ccsds[start..start + BIOLAB_LEN],
        })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    fn u16_at(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.data[at], self.data[at + 1]])
    }

    pub fn ec_address(&self) -> u8 {
        self.data[offsets::EC_ADDRESS]
    }

    pub fn time_tag(&self) -> i32 {
        let at = offsets::TIME_TAG;
        i32::from_be_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    /// Image memory slot currently active in the EC housekeeping, wire numbering
    pub fn active_slot(&self) -> u8 {
        (self.u16_at(offsets::ACTIVE_SLOT) >> 12) as u8
    }

    pub fn generic_tm_id(&self) -> u16 {
        self.u16_at(offsets::GENERIC_TM_ID)
    }

    pub fn generic_tm_type(&self) -> u16 {
        self.u16_at(offsets::GENERIC_TM_TYPE)
    }

    pub fn generic_tm_length(&self) -> u16 {
        self.u16_at(offsets::GENERIC_TM_LENGTH)
    }

    /// Wire memory slot of a WAPS image packet
    pub fn memory_slot(&self) -> u8 {
        (self.generic_tm_type() >> 12) as u8
    }

    /// TM packet id of a WAPS image packet
    pub fn tm_packet_id(&self) -> u16 {
        self.generic_tm_type() & 0x03FF
    }

    pub fn waps_tm_id(&self) -> Option<WapsTmId> {
        WapsTmId::from_generic_tm_id(self.generic_tm_id())
    }

    /// Number of data packets declared by a start packet
    pub fn declared_packet_count(&self) -> u16 {
        self.u16_at(offsets::WAPS_WORD)
    }

    /// Packet id echoed in the data word (FLIR: low 12 bits, uCAM: id + 1)
    pub fn data_packet_word(&self) -> u16 {
        self.u16_at(offsets::WAPS_WORD)
    }

    pub fn flir_crc(&self) -> u16 {
        self.u16_at(offsets::WAPS_CHECK)
    }

    pub fn ucam_payload_size(&self) -> u16 {
        self.u16_at(offsets::WAPS_CHECK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_ccsds() -> Vec<u8> {
        let mut raw = vec![0u8; BIOLAB_OFFSET + BIOLAB_LEN];
        raw[BIOLAB_OFFSET] = BIOLAB_ID;
        raw[BIOLAB_OFFSET + offsets::LENGTH] = ((BIOLAB_LEN - 4) / 2) as u8;
        raw
    }

    #[test]
    fn test_locate_requires_biolab_id() {
        let mut raw = blank_ccsds();
        assert!(BiolabPacket::locate(&raw).is_ok());

        raw[BIOLAB_OFFSET] = 0x41;
        assert!(matches!(
            BiolabPacket::locate(&raw),
            Err(Rejection::NotBiolabPacket)
        ));
        assert!(matches!(
            BiolabPacket::locate(&raw[..20]),
            Err(Rejection::NotBiolabPacket)
        ));
    }

    #[test]
    fn test_locate_checks_declared_length() {
        let mut raw = blank_ccsds();
        raw[BIOLAB_OFFSET + offsets::LENGTH] = 100;
        assert!(matches!(
            BiolabPacket::locate(&raw),
            Err(Rejection::MalformedHeader(_))
        ));

        let raw = blank_ccsds();
        assert!(matches!(
            BiolabPacket::locate(&raw[..BIOLAB_OFFSET + 100]),
            Err(Rejection::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_generic_tm_fields() {
        let mut raw = blank_ccsds();
        let b = BIOLAB_OFFSET;
        raw[b + offsets::EC_ADDRESS] = 171;
        raw[b + 4..b + 8].copy_from_slice(&(-5i32).to_be_bytes());
        raw[b + 84..b + 86].copy_from_slice(&0x5200u16.to_be_bytes());
        // slot 3, packet id 517
        raw[b + 86..b + 88].copy_from_slice(&((3u16 << 12) | 517).to_be_bytes());
        raw[b + 56..b + 58].copy_from_slice(&(6u16 << 12).to_be_bytes());

        let packet = BiolabPacket::locate(&raw).unwrap();
        assert_eq!(packet.ec_address(), 171);
        assert_eq!(packet.time_tag(), -5);
        assert_eq!(packet.waps_tm_id(), Some(WapsTmId::UcamData));
        assert_eq!(packet.memory_slot(), 3);
        assert_eq!(packet.tm_packet_id(), 517);
        assert_eq!(packet.active_slot(), 6);
    }

    #[test]
    fn test_waps_tm_ids() {
        for id in [0x4100u16, 0x4200, 0x5100, 0x5200] {
            let tm = WapsTmId::from_generic_tm_id(id).unwrap();
            assert_eq!(tm.generic_tm_id(), id);
        }
        assert!(WapsTmId::from_generic_tm_id(0x0100).is_none());
        assert!(WapsTmId::FlirStart.is_start());
        assert!(!WapsTmId::UcamData.is_start());
    }
}
