//! Engine events
//!
//! Everything reportable that the engine produces: openings, completions,
//! overwrites, abandonments, retransmission requests and anomalies. Events
//! are plain data; routing them to sinks is the caller's business.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waps_packet::{ChannelKey, ImageType};

use crate::gaps::GapRecord;
use crate::generation::{GenerationId, GenerationSummary};
use crate::retransmission::RetransmissionRequest;

/// Reconstructed image bytes with their metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedImage {
    pub key: ChannelKey,
    pub generation: GenerationId,
    pub image_type: ImageType,
    pub ec_address: u8,
    pub time_tag: i32,
    pub onboard_start: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub fragments_received: usize,
    pub fragments_expected: usize,
    /// 0.0..=1.0
    pub completeness: f64,
    pub complete: bool,
    pub byte_len: usize,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl ReconstructedImage {
    pub fn completeness_percent(&self) -> u32 {
        (self.completeness * 100.0).floor() as u32
    }
}

/// Non-fatal irregularities. State is never altered by the fragment that
/// raised them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum AnomalyKind {
    CountMismatch { declared: u16, kept: u16 },
    CountBelowReceived { declared: u16, highest: u16 },
    EmptyImageDeclared,
    OutOfRange { index: u16, total: u16 },
    DuplicateAfterClose { index: u16, start_marker: bool },
    ConflictingDuplicate { index: u16 },
    DuplicateStartMarker,
    CorruptedFragment { index: u16, accepted: bool },
    LateFragment { index: u16 },
}

impl AnomalyKind {
    pub fn name(&self) -> &'static str {
        match self {
            AnomalyKind::CountMismatch { .. } => "count_mismatch",
            AnomalyKind::CountBelowReceived { .. } => "count_below_received",
            AnomalyKind::EmptyImageDeclared => "empty_image_declared",
            AnomalyKind::OutOfRange { .. } => "out_of_range",
            AnomalyKind::DuplicateAfterClose { .. } => "duplicate_after_close",
            AnomalyKind::ConflictingDuplicate { .. } => "conflicting_duplicate",
            AnomalyKind::DuplicateStartMarker => "duplicate_start_marker",
            AnomalyKind::CorruptedFragment { .. } => "corrupted_fragment",
            AnomalyKind::LateFragment { .. } => "late_fragment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    GenerationOpened {
        key: ChannelKey,
        generation: GenerationId,
        image_type: ImageType,
        ec_address: u8,
        time_tag: i32,
        at: DateTime<Utc>,
    },
    ImageCompleted(ReconstructedImage),
    /// Snapshot of an open generation with gaps, at the end of a transmission
    PartialImage(ReconstructedImage),
    GenerationOverwritten {
        summary: GenerationSummary,
        gaps: GapRecord,
        partial: Option<ReconstructedImage>,
    },
    GenerationAbandoned {
        summary: GenerationSummary,
        gaps: GapRecord,
        partial: Option<ReconstructedImage>,
    },
    RetransmissionRequested(RetransmissionRequest),
    Anomaly {
        key: ChannelKey,
        generation: Option<GenerationId>,
        fragment: String,
        kind: AnomalyKind,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::GenerationOpened { .. } => "generation_opened",
            EngineEvent::ImageCompleted(_) => "image_completed",
            EngineEvent::PartialImage(_) => "partial_image",
            EngineEvent::GenerationOverwritten { .. } => "generation_overwritten",
            EngineEvent::GenerationAbandoned { .. } => "generation_abandoned",
            EngineEvent::RetransmissionRequested(_) => "retransmission_requested",
            EngineEvent::Anomaly { .. } => "anomaly",
        }
    }

    pub fn key(&self) -> ChannelKey {
        match self {
            EngineEvent::GenerationOpened { key, .. } | EngineEvent::Anomaly { key, .. } => *key,
            EngineEvent::ImageCompleted(image) | EngineEvent::PartialImage(image) => image.key,
            EngineEvent::GenerationOverwritten { summary, .. }
            | EngineEvent::GenerationAbandoned { summary, .. } => summary.key,
            EngineEvent::RetransmissionRequested(request) => request.key,
        }
    }

    /// Conditions an operator should look at
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EngineEvent::GenerationOverwritten { .. }
                | EngineEvent::GenerationAbandoned { .. }
                | EngineEvent::Anomaly { .. }
        )
    }

    /// Image to hand to the image sink, if any
    pub fn image(&self) -> Option<&ReconstructedImage> {
        match self {
            EngineEvent::ImageCompleted(image) | EngineEvent::PartialImage(image) => Some(image),
            EngineEvent::GenerationOverwritten { partial, .. }
            | EngineEvent::GenerationAbandoned { partial, .. } => partial.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anomaly_event_json_shape() {
        let event = EngineEvent::Anomaly {
            key: ChannelKey::from_ids(1, 3).unwrap(),
            generation: Some(GenerationId(2)),
            fragment: "pkt_ec_171_m2_idx_4".into(),
            kind: AnomalyKind::ConflictingDuplicate { index: 4 },
            at: DateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "anomaly");
        assert_eq!(json["generation"], 2);
        assert_eq!(json["kind"]["anomaly"], "conflicting_duplicate");
        assert_eq!(json["kind"]["index"], 4);
        assert!(event.is_warning());
        assert_eq!(event.kind(), "anomaly");
    }
}
