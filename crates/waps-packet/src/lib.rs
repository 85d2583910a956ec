//! WAPS Packet Library
//!
//! Decoding of CCSDS telemetry carrying BIOLAB packets, and classification of
//! the WAPS image packets among them:
//! - CCSDS primary/secondary header decoding with onboard time
//! - BIOLAB generic TM field extraction
//! - FLIR CRC-16 and uCAM verify code checks
//! - Stateless classification into channel-addressed image fragments
//!
//! Up to 4 equipment controllers (AECs) with 8 memory slots each are
//! addressed; the AEC id is assigned from the configured EC address list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod biolab;
pub mod builder;
pub mod ccsds;
pub mod classifier;
pub mod integrity;

pub use builder::PacketBuilder;
pub use classifier::{AecMap, AecMapError, Classifier, EcEntry, Rejection};

/// Number of equipment controllers that can be tracked at once
pub const MAX_AECS: u8 = 4;

/// Memory slots per equipment controller
pub const SLOTS_PER_AEC: u8 = 8;

/// Equipment controller id (1..=4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AecId(u8);

impl AecId {
    pub fn new(id: u8) -> Option<Self> {
        (1..=MAX_AECS).contains(&id).then_some(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for AecId {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("AEC id out of range (1-{}): {}", MAX_AECS, value))
    }
}

impl From<AecId> for u8 {
    fn from(id: AecId) -> Self {
        id.0
    }
}

/// Image memory slot id (1..=8). On the wire slots are numbered 0..=7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlotId(u8);

impl SlotId {
    pub fn new(id: u8) -> Option<Self> {
        (1..=SLOTS_PER_AEC).contains(&id).then_some(Self(id))
    }

    /// Slot from the 0-based number carried in BIOLAB telemetry
    pub fn from_wire(slot: u8) -> Option<Self> {
        slot.checked_add(1).and_then(Self::new)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// 0-based slot number as used in telemetry and in command stacks
    pub fn wire(self) -> u8 {
        self.0 - 1
    }
}

impl TryFrom<u8> for SlotId {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("slot id out of range (1-{}): {}", SLOTS_PER_AEC, value))
    }
}

impl From<SlotId> for u8 {
    fn from(id: SlotId) -> Self {
        id.0
    }
}

/// A physical memory slot: (AEC, slot)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub aec: AecId,
    pub slot: SlotId,
}

impl ChannelKey {
    pub fn new(aec: AecId, slot: SlotId) -> Self {
        Self { aec, slot }
    }

    /// Convenience constructor from raw ids, `None` when out of range
    pub fn from_ids(aec: u8, slot: u8) -> Option<Self> {
        Some(Self::new(AecId::new(aec)?, SlotId::new(slot)?))
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AEC{}/S{}", self.aec.0, self.slot.0)
    }
}

/// Camera producing the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageType {
    /// uCAM colour camera (JPEG)
    Color,
    /// FLIR infrared camera (raw 80x60 frame)
    Infrared,
}

impl ImageType {
    /// Camera name used in file names and logs
    pub fn camera(&self) -> &'static str {
        match self {
            ImageType::Color => "uCAM",
            ImageType::Infrared => "FLIR",
        }
    }

    /// Nominal payload bytes per data fragment, used to fill gaps in
    /// partial reconstructions
    pub fn nominal_fragment_len(&self) -> usize {
        match self {
            ImageType::Color => 158,
            ImageType::Infrared => 160,
        }
    }
}

/// Stream a packet came from. Carried for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamOrigin {
    Live,
    Replay,
}

/// Outcome of the integrity check of a data fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Integrity {
    Verified,
    Corrupted,
}

/// One raw CCSDS packet as delivered by a source
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub origin: StreamOrigin,
}

impl RawPacket {
    pub fn new(bytes: Vec<u8>, received_at: DateTime<Utc>, origin: StreamOrigin) -> Self {
        Self {
            bytes,
            received_at,
            origin,
        }
    }
}

/// A classified WAPS image packet
///
/// Start packets are represented as `start_marker == true`, index 0, the
/// declared packet count as `total_hint` and an empty payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WapsFragment {
    pub key: ChannelKey,
    /// EC address as found on the wire
    pub ec_address: u8,
    pub image_type: ImageType,
    pub start_marker: bool,
    pub index: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_hint: Option<u16>,
    pub payload: Vec<u8>,
    pub integrity: Integrity,
    /// BIOLAB time tag of the packet
    pub time_tag: i32,
    /// CCSDS onboard time
    pub onboard_time: DateTime<Utc>,
    /// Ground arrival time
    pub received_at: DateTime<Utc>,
    pub origin: StreamOrigin,
}

impl WapsFragment {
    pub fn is_corrupted(&self) -> bool {
        self.integrity == Integrity::Corrupted
    }

    /// Short packet name for logs, e.g. `pkt_ec_171_m3_idx_12`
    pub fn name(&self) -> String {
        if self.start_marker {
            format!("pkt_ec_{}_m{}_start", self.ec_address, self.key.slot.wire())
        } else {
            format!(
                "pkt_ec_{}_m{}_idx_{}",
                self.ec_address,
                self.key.slot.wire(),
                self.index
            )
        }
    }
}
