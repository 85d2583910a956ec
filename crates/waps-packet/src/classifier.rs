//! Packet Classifier
//!
//! Stateless mapping from a raw CCSDS packet to either a channel-addressed
//! [`WapsFragment`] or a [`Rejection`]. Integrity failures are not
//! rejections: the fragment is returned flagged as corrupted and the
//! reconstruction policy decides what to do with it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::biolab::{offsets, BiolabPacket, WapsTmId, BIOLAB_LEN};
use crate::ccsds::CcsdsHeader;
use crate::integrity;
use crate::{AecId, ChannelKey, Integrity, RawPacket, SlotId, WapsFragment, MAX_AECS};

/// Why a packet is not a WAPS image fragment
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail")]
pub enum Rejection {
    #[error("not a BIOLAB packet")]
    NotBiolabPacket,

    #[error("BIOLAB packet from EC {ec_address} is not WAPS image data (generic TM id {generic_tm_id:#06x})")]
    NotWapsImageData {
        aec: Option<AecId>,
        ec_address: u8,
        generic_tm_id: u16,
    },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unknown AEC or slot: EC address {ec_address}, memory slot {slot}")]
    UnknownAecOrSlot { ec_address: u8, slot: u8 },
}

impl Rejection {
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::NotBiolabPacket => "not_biolab_packet",
            Rejection::NotWapsImageData { .. } => "not_waps_image_data",
            Rejection::MalformedHeader(_) => "malformed_header",
            Rejection::UnknownAecOrSlot { .. } => "unknown_aec_or_slot",
        }
    }

    /// Ordinary traffic that merely is not WAPS image data
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            Rejection::NotBiolabPacket | Rejection::NotWapsImageData { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Rejection>;

// ============================================================================
// AEC map
// ============================================================================

/// One configured equipment controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcEntry {
    /// EC address as found in BIOLAB telemetry
    pub address: u8,
    /// Position label, e.g. `EC_A4`
    pub position: String,
}

impl EcEntry {
    pub fn new(address: u8, position: impl Into<String>) -> Self {
        Self {
            address,
            position: position.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AecMapError {
    #[error("at most {max} ECs can be tracked, {count} configured")]
    TooMany { max: u8, count: usize },

    #[error("EC address {0} configured twice")]
    Duplicate(u8),
}

/// EC address to AEC id assignment. AEC ids follow list order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AecMap {
    entries: Vec<EcEntry>,
}

impl AecMap {
    pub fn new(entries: Vec<EcEntry>) -> std::result::Result<Self, AecMapError> {
        if entries.len() > MAX_AECS as usize {
            return Err(AecMapError::TooMany {
                max: MAX_AECS,
                count: entries.len(),
            });
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.address == entry.address) {
                return Err(AecMapError::Duplicate(entry.address));
            }
        }
        Ok(Self { entries })
    }

    pub fn lookup(&self, address: u8) -> Option<AecId> {
        self.entries
            .iter()
            .position(|e| e.address == address)
            .and_then(|i| AecId::new(i as u8 + 1))
    }

    pub fn entry(&self, aec: AecId) -> Option<&EcEntry> {
        self.entries.get(aec.get() as usize - 1)
    }

    pub fn position(&self, aec: AecId) -> Option<&str> {
        self.entry(aec).map(|e| e.position.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AecId, &EcEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| AecId::new(i as u8 + 1).map(|id| (id, e)))
    }
}

// ============================================================================
// Classifier
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    aec_map: AecMap,
}

impl Classifier {
    pub fn new(aec_map: AecMap) -> Self {
        Self { aec_map }
    }

    pub fn aec_map(&self) -> &AecMap {
        &self.aec_map
    }

    /// Classify one raw packet
    pub fn classify(&self, raw: &RawPacket) -> Result<WapsFragment> {
        let header = CcsdsHeader::parse(&raw.bytes)?;
        if raw.bytes.len() < header.total_len() {
            return Err(Rejection::MalformedHeader(format!(
                "CCSDS packet declares {} bytes, {} present",
                header.total_len(),
                raw.bytes.len()
            )));
        }

        let biolab = BiolabPacket::locate(&raw.bytes)?;
        let ec_address = biolab.ec_address();
        let aec = self.aec_map.lookup(ec_address);

        let Some(tm) = biolab.waps_tm_id() else {
            return Err(Rejection::NotWapsImageData {
                aec,
                ec_address,
                generic_tm_id: biolab.generic_tm_id(),
            });
        };

        let wire_slot = biolab.memory_slot();
        let (Some(aec), Some(slot)) = (aec, SlotId::from_wire(wire_slot)) else {
            return Err(Rejection::UnknownAecOrSlot {
                ec_address,
                slot: wire_slot,
            });
        };

        let data = biolab.bytes();
        let (index, total_hint, payload, integrity) = match tm {
            WapsTmId::FlirStart | WapsTmId::UcamStart => (
                0,
                Some(biolab.declared_packet_count()),
                Vec::new(),
                Integrity::Verified,
            ),
            WapsTmId::FlirData => (
                biolab.tm_packet_id(),
                None,
                data[offsets::WAPS_PAYLOAD..BIOLAB_LEN].to_vec(),
                integrity::check_flir(data),
            ),
            WapsTmId::UcamData => {
                let max = BIOLAB_LEN - offsets::WAPS_PAYLOAD - 2;
                let size = (biolab.ucam_payload_size() as usize).min(max);
                (
                    biolab.tm_packet_id(),
                    None,
                    data[offsets::WAPS_PAYLOAD..offsets::WAPS_PAYLOAD + size].to_vec(),
                    integrity::check_ucam(data),
                )
            }
        };

        Ok(WapsFragment {
            key: ChannelKey::new(aec, slot),
            ec_address,
            image_type: tm.image_type(),
            start_marker: tm.is_start(),
            index,
            total_hint,
            payload,
            integrity,
            time_tag: biolab.time_tag(),
            onboard_time: header.onboard_time(),
            received_at: raw.received_at,
            origin: raw.origin,
        })
    }
}
