//! Image Reconstructor
//!
//! One [`ImageReconstruction`] per generation of a slot. Fragments are keyed
//! by index; the first accepted copy of an index wins and the declared
//! fragment count is learned once (first writer wins).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use waps_packet::{ChannelKey, ImageType, WapsFragment};

use crate::events::{AnomalyKind, ReconstructedImage};
use crate::policy::ReconstructionPolicy;

/// Stand-in for a lost first colour fragment: SOI, quantisation tables and
/// the start of the Huffman tables, so a partial image still opens as JPEG
const JPEG_HEADER_FILL: [u8; 158] = [
    0xff, 0xd8, 0xff, 0xdb, 0x00, 0x84, 0x00, 0x0d, 0x09, 0x09, 0x0b, 0x0a,
    0x08, 0x0d, 0x0b, 0x0a, 0x0b, 0x0e, 0x0e, 0x0d, 0x0f, 0x13, 0x20, 0x15,
    0x13, 0x12, 0x12, 0x13, 0x27, 0x1c, 0x1e, 0x17, 0x20, 0x2e, 0x29, 0x31,
    0x30, 0x2e, 0x29, 0x2d, 0x2c, 0x33, 0x3a, 0x4a, 0x3e, 0x33, 0x36, 0x46,
    0x37, 0x2c, 0x2d, 0x40, 0x57, 0x41, 0x46, 0x4c, 0x4e, 0x52, 0x53, 0x52,
    0x32, 0x3e, 0x5a, 0x61, 0x5a, 0x50, 0x60, 0x4a, 0x51, 0x52, 0x4f, 0x01,
    0x0e, 0x0e, 0x0e, 0x13, 0x11, 0x13, 0x26, 0x15, 0x15, 0x26, 0x4f, 0x35,
    0x2d, 0x35, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f, 0x4f,
    0x4f, 0x4f, 0x4f, 0x4f, 0xff, 0xc4, 0x01, 0xa2, 0x00, 0x00, 0x01, 0x05,
    0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00,
];

/// Monotonic generation counter of a channel, starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(pub u32);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationState {
    Open,
    Complete,
    Overwritten,
    Abandoned,
}

/// Image start marker as received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMarker {
    pub time_tag: i32,
    pub declared: u16,
}

/// What happened to one fragment applied to a generation
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    Accepted,
    /// Identical copy of an accepted fragment
    Duplicate,
    /// Start marker recorded, or identical to the recorded one
    Marker,
    /// Not accepted; reported through the anomalies
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub outcome: FragmentOutcome,
    pub anomalies: Vec<AnomalyKind>,
}

impl Applied {
    fn new(outcome: FragmentOutcome) -> Self {
        Self {
            outcome,
            anomalies: Vec::new(),
        }
    }
}

/// Immutable view of a generation, kept after it closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub key: ChannelKey,
    pub generation: GenerationId,
    pub image_type: ImageType,
    pub ec_address: u8,
    pub state: GenerationState,
    pub time_tag: i32,
    pub accepted: usize,
    pub total: Option<u16>,
    pub highest_seen: Option<u16>,
    pub onboard_start: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImageReconstruction {
    key: ChannelKey,
    id: GenerationId,
    image_type: ImageType,
    ec_address: u8,
    fragments: BTreeMap<u16, Vec<u8>>,
    /// Indices seen only as corrupted copies
    corrupted: BTreeSet<u16>,
    total: Option<u16>,
    highest_seen: Option<u16>,
    marker: Option<StartMarker>,
    time_tag: i32,
    onboard_start: DateTime<Utc>,
    first_seen: DateTime<Utc>,
    last_update: DateTime<Utc>,
    state: GenerationState,
}

impl ImageReconstruction {
    /// New open generation, shaped by the fragment that opens it
    pub fn open(id: GenerationId, first: &WapsFragment) -> Self {
        Self {
            key: first.key,
            id,
            image_type: first.image_type,
            ec_address: first.ec_address,
            fragments: BTreeMap::new(),
            corrupted: BTreeSet::new(),
            total: None,
            highest_seen: None,
            marker: None,
            time_tag: first.time_tag,
            onboard_start: first.onboard_time,
            first_seen: first.received_at,
            last_update: first.received_at,
            state: GenerationState::Open,
        }
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn ec_address(&self) -> u8 {
        self.ec_address
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == GenerationState::Open
    }

    pub fn total(&self) -> Option<u16> {
        self.total
    }

    pub fn highest_seen(&self) -> Option<u16> {
        self.highest_seen
    }

    pub fn marker(&self) -> Option<StartMarker> {
        self.marker
    }

    pub fn time_tag(&self) -> i32 {
        self.time_tag
    }

    pub fn onboard_start(&self) -> DateTime<Utc> {
        self.onboard_start
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn accepted_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.fragments.keys().copied()
    }

    pub fn accepted_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn max_accepted(&self) -> Option<u16> {
        self.fragments.keys().next_back().copied()
    }

    pub fn payload(&self, index: u16) -> Option<&[u8]> {
        self.fragments.get(&index).map(Vec::as_slice)
    }

    pub fn corrupted_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.corrupted.iter().copied()
    }

    /// Whether a start marker declaring `declared` fragments can be adopted
    /// by this generation instead of opening a new one
    pub fn can_adopt(&self, declared: u16) -> bool {
        self.marker.is_none()
            && declared > 0
            && self.total.map_or(true, |t| t == declared)
            && self.highest_seen.map_or(true, |h| h < declared)
    }

    /// Whether `index` is a hole of this generation
    pub fn is_gap(&self, index: u16) -> bool {
        let extent = self.extent();
        (index as usize) < extent && !self.fragments.contains_key(&index)
    }

    /// Number of fragment positions known to exist
    pub fn extent(&self) -> usize {
        match self.total {
            Some(total) => total as usize,
            None => self.highest_seen.map_or(0, |h| h as usize + 1),
        }
    }

    /// Apply one fragment. Closed generations are never altered.
    pub fn apply_fragment(&mut self, fragment: &WapsFragment, policy: &ReconstructionPolicy) -> Applied {
        if !self.is_open() {
            return Applied::new(FragmentOutcome::Rejected);
        }

        if fragment.start_marker {
            let mut applied = Applied::new(FragmentOutcome::Marker);
            self.touch(fragment.received_at);
            if self.marker.is_none() {
                self.marker = Some(StartMarker {
                    time_tag: fragment.time_tag,
                    declared: fragment.total_hint.unwrap_or(0),
                });
                self.time_tag = fragment.time_tag;
                self.onboard_start = self.onboard_start.min(fragment.onboard_time);
            }
            if let Some(declared) = fragment.total_hint {
                if let Some(anomaly) = self.declare_total(declared) {
                    applied.anomalies.push(anomaly);
                }
            }
            self.check_complete();
            return applied;
        }

        let index = fragment.index;
        if let Some(total) = self.total {
            if index >= total {
                let mut applied = Applied::new(FragmentOutcome::Rejected);
                applied.anomalies.push(AnomalyKind::OutOfRange { index, total });
                return applied;
            }
        }

        self.touch(fragment.received_at);
        self.highest_seen = Some(self.highest_seen.map_or(index, |h| h.max(index)));

        if fragment.is_corrupted() && !policy.accept_corrupted {
            if !self.fragments.contains_key(&index) {
                self.corrupted.insert(index);
            }
            let mut applied = Applied::new(FragmentOutcome::Rejected);
            applied
                .anomalies
                .push(AnomalyKind::CorruptedFragment { index, accepted: false });
            return applied;
        }

        let mut applied = match self.fragments.get(&index) {
            Some(existing) if *existing == fragment.payload => Applied::new(FragmentOutcome::Duplicate),
            Some(_) => {
                let mut applied = Applied::new(FragmentOutcome::Rejected);
                applied.anomalies.push(AnomalyKind::ConflictingDuplicate { index });
                applied
            }
            None => {
                self.fragments.insert(index, fragment.payload.clone());
                self.corrupted.remove(&index);
                Applied::new(FragmentOutcome::Accepted)
            }
        };
        if applied.outcome == FragmentOutcome::Accepted && fragment.is_corrupted() {
            applied
                .anomalies
                .push(AnomalyKind::CorruptedFragment { index, accepted: true });
        }

        self.check_complete();
        applied
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_update = self.last_update.max(at);
        self.first_seen = self.first_seen.min(at);
    }

    fn declare_total(&mut self, declared: u16) -> Option<AnomalyKind> {
        if declared == 0 {
            return Some(AnomalyKind::EmptyImageDeclared);
        }
        match self.total {
            Some(kept) if kept != declared => Some(AnomalyKind::CountMismatch { declared, kept }),
            Some(_) => None,
            None => match self.highest_seen {
                Some(highest) if highest >= declared => {
                    Some(AnomalyKind::CountBelowReceived { declared, highest })
                }
                _ => {
                    self.total = Some(declared);
                    None
                }
            },
        }
    }

    fn check_complete(&mut self) {
        if let Some(total) = self.total {
            if self.is_open() && self.fragments.len() == total as usize {
                self.state = GenerationState::Complete;
            }
        }
    }

    pub(crate) fn close(&mut self, state: GenerationState) {
        if self.is_open() {
            self.state = state;
        }
    }

    /// Payloads concatenated in ascending index order
    pub fn reconstruct(&self) -> Vec<u8> {
        self.fragments.values().flatten().copied().collect()
    }

    /// Reconstruction with every missing position zero-filled at the
    /// nominal fragment length. A missing colour fragment 0 is filled with
    /// a generic JPEG header instead.
    pub fn reconstruct_partial(&self) -> Vec<u8> {
        let nominal = self.image_type.nominal_fragment_len();
        let filler = vec![0u8; nominal];
        let mut bytes = Vec::with_capacity(self.extent() * nominal);
        for index in 0..self.extent() {
            match self.fragments.get(&(index as u16)) {
                Some(payload) => bytes.extend_from_slice(payload),
                None if index == 0 && self.image_type == ImageType::Color => {
                    let header = &JPEG_HEADER_FILL[..JPEG_HEADER_FILL.len().min(nominal)];
                    bytes.extend_from_slice(header);
                    bytes.resize(bytes.len() + nominal - header.len(), 0);
                }
                None => bytes.extend_from_slice(&filler),
            }
        }
        bytes
    }

    /// Fraction of known fragment positions received
    pub fn completeness(&self) -> f64 {
        match self.extent() {
            0 => 0.0,
            extent => self.fragments.len() as f64 / extent as f64,
        }
    }

    pub fn to_image(&self, partial: bool) -> ReconstructedImage {
        let bytes = if partial {
            self.reconstruct_partial()
        } else {
            self.reconstruct()
        };
        ReconstructedImage {
            key: self.key,
            generation: self.id,
            image_type: self.image_type,
            ec_address: self.ec_address,
            time_tag: self.time_tag,
            onboard_start: self.onboard_start,
            first_seen: self.first_seen,
            last_update: self.last_update,
            fragments_received: self.fragments.len(),
            fragments_expected: self.extent(),
            completeness: self.completeness(),
            complete: self.state == GenerationState::Complete,
            byte_len: bytes.len(),
            bytes,
        }
    }

    pub fn summary(&self) -> GenerationSummary {
        GenerationSummary {
            key: self.key,
            generation: self.id,
            image_type: self.image_type,
            ec_address: self.ec_address,
            state: self.state,
            time_tag: self.time_tag,
            accepted: self.fragments.len(),
            total: self.total,
            highest_seen: self.highest_seen,
            onboard_start: self.onboard_start,
            first_seen: self.first_seen,
            last_update: self.last_update,
        }
    }
}
