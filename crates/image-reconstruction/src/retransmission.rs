//! Retransmission Request Builder
//!
//! Turns confirmed gaps into requests. A request is only issued when the
//! confirmed gap set differs from the last one issued for the same
//! generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use waps_packet::{ChannelKey, ImageType};

use crate::gaps::{FragmentRange, GapRecord};
use crate::generation::{GenerationId, ImageReconstruction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingReason {
    Lost,
    Corrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetransmissionRequest {
    pub id: Uuid,
    pub key: ChannelKey,
    pub ec_address: u8,
    pub generation: GenerationId,
    pub image_type: ImageType,
    pub ranges: Vec<FragmentRange>,
    pub corrupted: Vec<u16>,
    pub total: Option<u16>,
    pub time_tag: i32,
    pub onboard_start: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
    /// Issued as the generation was abandoned
    pub final_request: bool,
}

impl RetransmissionRequest {
    /// Every missing packet with the reason it is missing
    pub fn missing_packets(&self) -> impl Iterator<Item = (u16, MissingReason)> + '_ {
        self.ranges.iter().flat_map(FragmentRange::iter).map(|index| {
            if self.corrupted.binary_search(&index).is_ok() {
                (index, MissingReason::Corrupted)
            } else {
                (index, MissingReason::Lost)
            }
        })
    }

    pub fn missing_count(&self) -> usize {
        self.ranges.iter().map(FragmentRange::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    ranges: Vec<FragmentRange>,
    corrupted: Vec<u16>,
}

#[derive(Debug, Default)]
pub struct RequestBuilder {
    last_issued: HashMap<GenerationId, Signature>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request for the confirmed gaps, or `None` when there are none
    /// or they match the last request issued for this generation
    pub fn build(
        &mut self,
        generation: &ImageReconstruction,
        gaps: &GapRecord,
        final_request: bool,
    ) -> Option<RetransmissionRequest> {
        if gaps.confirmed.is_empty() {
            return None;
        }

        let signature = Signature {
            ranges: gaps.confirmed.clone(),
            corrupted: gaps.corrupted.clone(),
        };
        if self.last_issued.get(&generation.id()) == Some(&signature) {
            return None;
        }
        self.last_issued.insert(generation.id(), signature);

        Some(RetransmissionRequest {
            id: Uuid::new_v4(),
            key: generation.key(),
            ec_address: generation.ec_address(),
            generation: generation.id(),
            image_type: generation.image_type(),
            ranges: gaps.confirmed.clone(),
            corrupted: gaps.corrupted.clone(),
            total: generation.total(),
            time_tag: generation.time_tag(),
            onboard_start: generation.onboard_start(),
            last_update: generation.last_update(),
            requested_at: gaps.as_of,
            final_request,
        })
    }

    /// Drop the signature of a closed generation
    pub fn forget(&mut self, generation: GenerationId) {
        self.last_issued.remove(&generation);
    }

    pub fn tracked(&self) -> usize {
        self.last_issued.len()
    }
}
