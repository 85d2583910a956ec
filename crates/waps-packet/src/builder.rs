//! Packet builder
//!
//! Produces complete CCSDS packets carrying BIOLAB WAPS image packets or
//! housekeeping. It is the inverse of the classifier and is used by tests and
//! the telemetry simulator.

use chrono::{DateTime, Utc};

use crate::biolab::{offsets, WapsTmId, BIOLAB_ID, BIOLAB_LEN, BIOLAB_OFFSET};
use crate::ccsds::{time_to_counters, CcsdsHeader, PacketType, ELEMENT_COLUMBUS, PRIMARY_HEADER_LEN};
use crate::integrity;
use crate::ImageType;

/// Generic TM id used for housekeeping packets
pub const HOUSEKEEPING_TM_ID: u16 = 0x0100;

const BIOLAB_APID: u16 = 0x2A5;
const GENERIC_TM_LENGTH: u16 = 164;

#[derive(Debug, Clone)]
pub struct PacketBuilder {
    ec_address: u8,
    slot: u8,
    time_tag: i32,
    onboard_time: DateTime<Utc>,
    sequence_count: u16,
}

impl PacketBuilder {
    pub fn new(ec_address: u8) -> Self {
        Self {
            ec_address,
            slot: 0,
            time_tag: 0,
            onboard_time: DateTime::UNIX_EPOCH,
            sequence_count: 0,
        }
    }

    /// Wire memory slot (0..=7; larger values produce unaddressable packets)
    pub fn slot(mut self, slot: u8) -> Self {
        self.slot = slot;
        self
    }

    pub fn time_tag(mut self, time_tag: i32) -> Self {
        self.time_tag = time_tag;
        self
    }

    pub fn onboard_time(mut self, time: DateTime<Utc>) -> Self {
        self.onboard_time = time;
        self
    }

    pub fn sequence_count(mut self, count: u16) -> Self {
        self.sequence_count = count;
        self
    }

    /// Image start packet declaring `packet_count` data packets
    pub fn start(&self, image_type: ImageType, packet_count: u16) -> Vec<u8> {
        let tm = match image_type {
            ImageType::Infrared => WapsTmId::FlirStart,
            ImageType::Color => WapsTmId::UcamStart,
        };
        let mut packet = self.frame(tm.generic_tm_id(), 0);
        let data = biolab_mut(&mut packet);
        data[offsets::WAPS_WORD..offsets::WAPS_WORD + 2].copy_from_slice(&packet_count.to_be_bytes());
        packet
    }

    /// Image data packet with a valid CRC or verify code
    ///
    /// FLIR payloads are padded or cut to 160 bytes, uCAM payloads are cut
    /// to 158 bytes.
    pub fn data(&self, image_type: ImageType, index: u16, payload: &[u8]) -> Vec<u8> {
        match image_type {
            ImageType::Infrared => {
                let mut packet = self.frame(WapsTmId::FlirData.generic_tm_id(), index);
                let data = biolab_mut(&mut packet);
                data[offsets::WAPS_WORD..offsets::WAPS_WORD + 2]
                    .copy_from_slice(&(index & 0x0FFF).to_be_bytes());
                let room = BIOLAB_LEN - offsets::WAPS_PAYLOAD;
                let n = payload.len().min(room);
                data[offsets::WAPS_PAYLOAD..offsets::WAPS_PAYLOAD + n].copy_from_slice(&payload[..n]);
                let crc = integrity::flir_crc(data);
                data[offsets::WAPS_CHECK..offsets::WAPS_CHECK + 2].copy_from_slice(&crc.to_be_bytes());
                packet
            }
            ImageType::Color => {
                let mut packet = self.frame(WapsTmId::UcamData.generic_tm_id(), index);
                let data = biolab_mut(&mut packet);
                let size = payload.len().min(BIOLAB_LEN - offsets::WAPS_PAYLOAD - 2);
                data[offsets::WAPS_WORD..offsets::WAPS_WORD + 2]
                    .copy_from_slice(&index.wrapping_add(1).to_be_bytes());
                data[offsets::WAPS_CHECK..offsets::WAPS_CHECK + 2]
                    .copy_from_slice(&(size as u16).to_be_bytes());
                let end = offsets::WAPS_PAYLOAD + size;
                data[offsets::WAPS_PAYLOAD..end].copy_from_slice(&payload[..size]);
                let code = integrity::ucam_verify_code(data, size).unwrap_or(0);
                data[end..end + 2].copy_from_slice(&code.to_be_bytes());
                packet
            }
        }
    }

    /// Housekeeping packet reporting the active image memory slot
    pub fn housekeeping(&self, active_slot: u8) -> Vec<u8> {
        let mut packet = self.frame(HOUSEKEEPING_TM_ID, 0);
        let data = biolab_mut(&mut packet);
        data[offsets::ACTIVE_SLOT..offsets::ACTIVE_SLOT + 2]
            .copy_from_slice(&((active_slot as u16 & 0xF) << 12).to_be_bytes());
        packet
    }

    fn frame(&self, generic_tm_id: u16, packet_id: u16) -> Vec<u8> {
        let total = BIOLAB_OFFSET + BIOLAB_LEN;
        let (coarse_time, fine_time) = time_to_counters(self.onboard_time);
        let header = CcsdsHeader {
            packet_type: PacketType::Payload,
            apid: BIOLAB_APID,
            sequence_flags: 0b11,
            sequence_count: self.sequence_count,
            packet_length: (total - PRIMARY_HEADER_LEN - 1) as u16,
            coarse_time,
            fine_time,
            element_id: ELEMENT_COLUMBUS,
            packet_id27: 0,
        };

        let mut packet = vec![0u8; total];
        packet[..header.encode().len()].copy_from_slice(&header.encode());

        let data = biolab_mut(&mut packet);
        data[0] = BIOLAB_ID;
        data[offsets::LENGTH] = ((BIOLAB_LEN - 4) / 2) as u8;
        data[offsets::EC_ADDRESS] = self.ec_address;
        data[offsets::TIME_TAG..offsets::TIME_TAG + 4].copy_from_slice(&self.time_tag.to_be_bytes());
        data[offsets::GENERIC_TM_ID..offsets::GENERIC_TM_ID + 2].copy_from_slice(&generic_tm_id.to_be_bytes());
        let tm_type = ((self.slot as u16 & 0xF) << 12) | (packet_id & 0x03FF);
        data[offsets::GENERIC_TM_TYPE..offsets::GENERIC_TM_TYPE + 2].copy_from_slice(&tm_type.to_be_bytes());
        data[offsets::GENERIC_TM_LENGTH..offsets::GENERIC_TM_LENGTH + 2]
            .copy_from_slice(&GENERIC_TM_LENGTH.to_be_bytes());
        packet
    }
}

fn biolab_mut(packet: &mut [u8]) -> &mut [u8] {
    &mut packet[BIOLAB_OFFSET..BIOLAB_OFFSET + BIOLAB_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biolab::BiolabPacket;
    use crate::ccsds::CcsdsHeader;
    use chrono::TimeZone;

    #[test]
    fn test_frame_length_matches_header() {
        let packet = PacketBuilder::new(171).housekeeping(2);
        let header = CcsdsHeader::parse(&packet).unwrap();
        assert_eq!(header.total_len(), packet.len());
        assert_eq!(packet.len(), 294);

        let biolab = BiolabPacket::locate(&packet).unwrap();
        assert_eq!(biolab.active_slot(), 2);
        assert_eq!(biolab.generic_tm_id(), HOUSEKEEPING_TM_ID);
    }

    #[test]
    fn test_onboard_time_is_encoded() {
        let t = Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap();
        let packet = PacketBuilder::new(171).onboard_time(t).start(ImageType::Infrared, 30);
        let header = CcsdsHeader::parse(&packet).unwrap();
        assert_eq!(header.onboard_time(), t);
    }

    #[test]
    fn test_data_packets_verify() {
        let flir = PacketBuilder::new(171).slot(7).data(ImageType::Infrared, 1023, &[9u8; 10]);
        let biolab = BiolabPacket::locate(&flir).unwrap();
        assert_eq!(biolab.tm_packet_id(), 1023);
        assert_eq!(biolab.memory_slot(), 7);
        assert_eq!(integrity::check_flir(biolab.bytes()), crate::Integrity::Verified);

        let ucam = PacketBuilder::new(171).data(ImageType::Color, 4, &[0xAB; 200]);
        let biolab = BiolabPacket::locate(&ucam).unwrap();
        assert_eq!(biolab.ucam_payload_size(), 158);
        assert_eq!(biolab.data_packet_word(), 5);
        assert_eq!(integrity::check_ucam(biolab.bytes()), crate::Integrity::Verified);
    }
}
