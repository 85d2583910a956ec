//! Channel state and generation lifecycle
//!
//! One [`ChannelState`] per (AEC, slot). The most recent generation stays the
//! slot's current occupant after it closes, so late copies can still be
//! recognised. Only the current generation can be `OPEN`.
//!
//! Generation selection for an incoming fragment:
//! - no current generation: open one
//! - open current generation:
//!   - a different image type, or a start marker that can be neither
//!     adopted nor matched as a duplicate, overwrites it
//!   - index 0 with a payload different from the accepted index 0 overwrites it
//!   - anything else is applied to it
//! - closed current generation:
//!   - identical copy of an accepted fragment or of its start marker:
//!     `DuplicateAfterClose`
//!   - corrupted copy (when corrupted data is not accepted): discarded
//!   - a hole of an abandoned generation: `LateFragment`
//!   - anything else opens a new generation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use waps_packet::{ChannelKey, WapsFragment};

use crate::events::{AnomalyKind, EngineEvent};
use crate::gaps::{compute_gaps, GapRecord};
use crate::generation::{
    FragmentOutcome, GenerationId, GenerationState, GenerationSummary, ImageReconstruction,
    StartMarker,
};
use crate::policy::ReconstructionPolicy;
use crate::retransmission::RequestBuilder;
use crate::{ReconstructionError, Result};

/// What prompted a gap sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    /// Periodic sweep; requests wait for quiescence
    Scheduled,
    /// The AEC stopped sending WAPS packets; trailing gaps are promoted
    EndOfTransmission,
}

/// Point-in-time view of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub key: ChannelKey,
    pub generations_opened: u32,
    pub current: Option<GenerationSummary>,
    pub gaps: Option<GapRecord>,
    pub history: Vec<GenerationSummary>,
}

#[derive(Debug)]
pub struct ChannelState {
    key: ChannelKey,
    policy: ReconstructionPolicy,
    next_generation: u32,
    current: Option<ImageReconstruction>,
    history: VecDeque<GenerationSummary>,
    requests: RequestBuilder,
    /// Generation and fragment count of the last partial image handed out
    last_partial: Option<(GenerationId, usize)>,
}

impl ChannelState {
    pub fn new(key: ChannelKey, policy: ReconstructionPolicy) -> Self {
        Self {
            key,
            policy,
            next_generation: 1,
            current: None,
            history: VecDeque::new(),
            requests: RequestBuilder::new(),
            last_partial: None,
        }
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn current(&self) -> Option<&ImageReconstruction> {
        self.current.as_ref()
    }

    /// Generation a fragment applied now would be attributed to
    pub fn current_generation(&self) -> Option<GenerationId> {
        self.current.as_ref().map(ImageReconstruction::id)
    }

    pub fn has_open_generation(&self) -> bool {
        self.current.as_ref().is_some_and(ImageReconstruction::is_open)
    }

    pub fn history(&self) -> impl Iterator<Item = &GenerationSummary> {
        self.history.iter()
    }

    /// Apply one classified fragment and return the resulting events
    pub fn apply(&mut self, fragment: &WapsFragment) -> Result<Vec<EngineEvent>> {
        if fragment.key != self.key {
            return Err(ReconstructionError::ChannelMismatch {
                expected: self.key,
                got: fragment.key,
            });
        }

        let mut events = Vec::new();
        let Some(current) = self.current.as_ref() else {
            self.open_generation(fragment, &mut events);
            return Ok(events);
        };

        if current.is_open() {
            if self.starts_new_image(current, fragment) {
                self.open_generation(fragment, &mut events);
            } else if fragment.start_marker && Self::same_marker(current.marker(), fragment) {
                self.anomaly(AnomalyKind::DuplicateStartMarker, fragment, &mut events);
            } else {
                self.apply_to_current(fragment, &mut events);
            }
            return Ok(events);
        }

        match self.closed_disposition(current, fragment) {
            Some(kind) => self.anomaly(kind, fragment, &mut events),
            None => self.open_generation(fragment, &mut events),
        }
        Ok(events)
    }

    /// Apply a fragment recorded earlier. The channel is first swept as of
    /// the recorded arrival, so abandonments that happened between arrivals
    /// happen again before it.
    pub fn replay(&mut self, fragment: &WapsFragment) -> Result<Vec<EngineEvent>> {
        if fragment.key != self.key {
            return Err(ReconstructionError::ChannelMismatch {
                expected: self.key,
                got: fragment.key,
            });
        }
        let mut events = self.sweep(fragment.received_at, SweepTrigger::Scheduled);
        events.extend(self.apply(fragment)?);
        Ok(events)
    }

    fn same_marker(marker: Option<StartMarker>, fragment: &WapsFragment) -> bool {
        marker.is_some_and(|m| {
            m.time_tag == fragment.time_tag && Some(m.declared) == fragment.total_hint
        })
    }

    fn starts_new_image(&self, current: &ImageReconstruction, fragment: &WapsFragment) -> bool {
        if fragment.image_type != current.image_type() {
            return true;
        }
        if fragment.start_marker {
            if Self::same_marker(current.marker(), fragment) {
                return false;
            }
            let declared = fragment.total_hint.unwrap_or(0);
            return !current.can_adopt(declared);
        }
        let acceptable = !fragment.is_corrupted() || self.policy.accept_corrupted;
        fragment.index == 0
            && acceptable
            && current
                .payload(0)
                .is_some_and(|existing| existing != fragment.payload.as_slice())
    }

    /// Anomaly for a fragment reaching a closed current generation, or
    /// `None` when it starts a new one
    fn closed_disposition(
        &self,
        current: &ImageReconstruction,
        fragment: &WapsFragment,
    ) -> Option<AnomalyKind> {
        if fragment.start_marker {
            return Self::same_marker(current.marker(), fragment).then_some(
                AnomalyKind::DuplicateAfterClose {
                    index: 0,
                    start_marker: true,
                },
            );
        }
        if fragment.image_type == current.image_type()
            && current.payload(fragment.index) == Some(fragment.payload.as_slice())
        {
            return Some(AnomalyKind::DuplicateAfterClose {
                index: fragment.index,
                start_marker: false,
            });
        }
        if fragment.is_corrupted() && !self.policy.accept_corrupted {
            return Some(AnomalyKind::CorruptedFragment {
                index: fragment.index,
                accepted: false,
            });
        }
        if current.state() == GenerationState::Abandoned
            && fragment.image_type == current.image_type()
            && current.is_gap(fragment.index)
        {
            return Some(AnomalyKind::LateFragment {
                index: fragment.index,
            });
        }
        None
    }

    fn apply_to_current(&mut self, fragment: &WapsFragment, events: &mut Vec<EngineEvent>) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let was_open = current.is_open();
        let applied = current.apply_fragment(fragment, &self.policy);
        let generation = current.id();

        if applied.outcome == FragmentOutcome::Duplicate {
            debug!(channel = %self.key, %generation, "Duplicate {} ignored", fragment.name());
        }
        for kind in applied.anomalies {
            events.push(EngineEvent::Anomaly {
                key: self.key,
                generation: Some(generation),
                fragment: fragment.name(),
                kind,
                at: fragment.received_at,
            });
        }

        if was_open && current.state() == GenerationState::Complete {
            events.push(EngineEvent::ImageCompleted(current.to_image(false)));
            self.requests.forget(generation);
        }
    }

    fn open_generation(&mut self, fragment: &WapsFragment, events: &mut Vec<EngineEvent>) {
        if let Some(mut previous) = self.current.take() {
            if previous.is_open() {
                previous.close(GenerationState::Overwritten);
                let gaps = compute_gaps(&previous, fragment.received_at, chrono::Duration::zero());
                let partial = self
                    .policy
                    .emit_partial_images
                    .then(|| previous.to_image(true));
                self.requests.forget(previous.id());
                events.push(EngineEvent::GenerationOverwritten {
                    summary: previous.summary(),
                    gaps,
                    partial,
                });
            }
            self.remember(previous.summary());
        }

        let id = GenerationId(self.next_generation);
        self.next_generation += 1;
        let generation = ImageReconstruction::open(id, fragment);
        events.push(EngineEvent::GenerationOpened {
            key: self.key,
            generation: id,
            image_type: generation.image_type(),
            ec_address: generation.ec_address(),
            time_tag: fragment.time_tag,
            at: fragment.received_at,
        });
        self.current = Some(generation);
        self.apply_to_current(fragment, events);
    }

    fn remember(&mut self, summary: GenerationSummary) {
        self.history.push_back(summary);
        while self.history.len() > self.policy.history_limit {
            self.history.pop_front();
        }
    }

    fn anomaly(&self, kind: AnomalyKind, fragment: &WapsFragment, events: &mut Vec<EngineEvent>) {
        events.push(EngineEvent::Anomaly {
            key: self.key,
            generation: self.current_generation(),
            fragment: fragment.name(),
            kind,
            at: fragment.received_at,
        });
    }

    /// Gap sweep of the open generation
    ///
    /// Abandons it after the abandonment interval of silence, otherwise
    /// issues a retransmission request for changed confirmed gaps once the
    /// generation is quiet or its transmission has ended.
    pub fn sweep(&mut self, as_of: DateTime<Utc>, trigger: SweepTrigger) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let Some(current) = self.current.as_mut().filter(|g| g.is_open()) else {
            return events;
        };

        let idle = as_of - current.last_update();
        let quiescence = match trigger {
            SweepTrigger::Scheduled => self.policy.quiescence,
            SweepTrigger::EndOfTransmission => chrono::Duration::zero(),
        };
        let gaps = compute_gaps(current, as_of, quiescence);

        if idle >= self.policy.abandon_after {
            let gaps = compute_gaps(current, as_of, chrono::Duration::zero());
            if let Some(request) = self.requests.build(current, &gaps, true) {
                events.push(EngineEvent::RetransmissionRequested(request));
            }
            current.close(GenerationState::Abandoned);
            self.requests.forget(current.id());
            let partial = self
                .policy
                .emit_partial_images
                .then(|| current.to_image(true));
            events.push(EngineEvent::GenerationAbandoned {
                summary: current.summary(),
                gaps,
                partial,
            });
        } else if idle >= self.policy.quiescence || trigger == SweepTrigger::EndOfTransmission {
            if let Some(request) = self.requests.build(current, &gaps, false) {
                events.push(EngineEvent::RetransmissionRequested(request));
            }
            let progress = (current.id(), current.accepted_count());
            if trigger == SweepTrigger::EndOfTransmission
                && self.policy.emit_partial_images
                && progress.1 > 0
                && !gaps.is_empty()
                && self.last_partial != Some(progress)
            {
                self.last_partial = Some(progress);
                events.push(EngineEvent::PartialImage(current.to_image(true)));
            }
        }
        events
    }

    pub fn snapshot(&self, as_of: DateTime<Utc>) -> ChannelSnapshot {
        ChannelSnapshot {
            key: self.key,
            generations_opened: self.next_generation - 1,
            current: self.current.as_ref().map(ImageReconstruction::summary),
            gaps: self
                .current
                .as_ref()
                .filter(|g| g.is_open())
                .map(|g| compute_gaps(g, as_of, self.policy.quiescence)),
            history: self.history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaps::FragmentRange;
    use crate::testing::{base_time, data, start, At};
    use chrono::Duration;
    use waps_packet::ImageType;

    fn channel() -> ChannelState {
        ChannelState::new(ChannelKey::from_ids(1, 1).unwrap(), ReconstructionPolicy::default())
    }

    fn kinds(events: &[EngineEvent]) -> Vec<&'static str> {
        events.iter().map(EngineEvent::kind).collect()
    }

    #[test]
    fn test_marker_then_data_completes() {
        let mut ch = channel();
        let events = ch.apply(&start(1, 1, 2)).unwrap();
        assert_eq!(kinds(&events), vec!["generation_opened"]);

        ch.apply(&data(1, 1, 0, b"ab")).unwrap();
        let events = ch.apply(&data(1, 1, 1, b"cd")).unwrap();
        match &events[..] {
            [EngineEvent::ImageCompleted(image)] => {
                assert_eq!(image.bytes, b"abcd");
                assert_eq!(image.generation, GenerationId(1));
                assert!(image.complete);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(!ch.has_open_generation());
    }

    #[test]
    fn test_new_marker_overwrites_incomplete_generation() {
        let mut ch = channel();
        ch.apply(&start(1, 1, 5)).unwrap();
        for i in 0..3 {
            ch.apply(&data(1, 1, i, &[i as u8])).unwrap();
        }

        let events = ch.apply(&start(1, 1, 4).tagged(77)).unwrap();
        assert_eq!(kinds(&events), vec!["generation_overwritten", "generation_opened"]);
        match &events[0] {
            EngineEvent::GenerationOverwritten { summary, gaps, partial } => {
                assert_eq!(summary.generation, GenerationId(1));
                assert_eq!(summary.state, GenerationState::Overwritten);
                assert_eq!(gaps.confirmed, vec![FragmentRange::new(3, 4)]);
                assert_eq!(partial.as_ref().map(|p| p.fragments_received), Some(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(ch.current_generation(), Some(GenerationId(2)));
        assert!(ch.has_open_generation());
        assert_eq!(ch.history().count(), 1);
    }

    #[test]
    fn test_marker_adopted_by_implicit_generation() {
        let mut ch = channel();
        ch.apply(&data(1, 1, 1, b"b")).unwrap();
        let events = ch.apply(&start(1, 1, 3)).unwrap();
        assert!(events.is_empty());
        assert_eq!(ch.current_generation(), Some(GenerationId(1)));
        assert_eq!(ch.current().and_then(ImageReconstruction::total), Some(3));

        let events = ch.apply(&start(1, 1, 3)).unwrap();
        assert!(matches!(
            &events[..],
            [EngineEvent::Anomaly { kind: AnomalyKind::DuplicateStartMarker, .. }]
        ));
    }

    #[test]
    fn test_restart_by_index_zero() {
        let mut ch = channel();
        ch.apply(&data(1, 1, 0, b"old")).unwrap();
        ch.apply(&data(1, 1, 1, b"old")).unwrap();

        let events = ch.apply(&data(1, 1, 1, b"new")).unwrap();
        assert!(matches!(
            &events[..],
            [EngineEvent::Anomaly { kind: AnomalyKind::ConflictingDuplicate { index: 1 }, .. }]
        ));

        let events = ch.apply(&data(1, 1, 0, b"new")).unwrap();
        assert_eq!(kinds(&events), vec!["generation_overwritten", "generation_opened"]);
        assert_eq!(ch.current_generation(), Some(GenerationId(2)));
    }

    #[test]
    fn test_image_type_change_opens_generation() {
        let mut ch = channel();
        ch.apply(&data(1, 1, 0, b"ir")).unwrap();
        let mut color = data(1, 1, 0, b"ir");
        color.image_type = ImageType::Color;
        let events = ch.apply(&color).unwrap();
        assert_eq!(kinds(&events), vec!["generation_overwritten", "generation_opened"]);
    }

    #[test]
    fn test_duplicate_after_close() {
        let mut ch = channel();
        ch.apply(&start(1, 1, 1)).unwrap();
        ch.apply(&data(1, 1, 0, b"only")).unwrap();
        assert!(!ch.has_open_generation());

        let events = ch.apply(&data(1, 1, 0, b"only").at(30)).unwrap();
        assert!(matches!(
            &events[..],
            [EngineEvent::Anomaly {
                kind: AnomalyKind::DuplicateAfterClose { index: 0, start_marker: false },
                generation: Some(GenerationId(1)),
                ..
            }]
        ));
        let events = ch.apply(&start(1, 1, 1)).unwrap();
        assert!(matches!(
            &events[..],
            [EngineEvent::Anomaly { kind: AnomalyKind::DuplicateAfterClose { start_marker: true, .. }, .. }]
        ));
        assert_eq!(ch.current().map(|g| g.reconstruct()), Some(b"only".to_vec()));
    }

    #[test]
    fn test_new_data_after_close_opens_generation() {
        let mut ch = channel();
        ch.apply(&start(1, 1, 1)).unwrap();
        ch.apply(&data(1, 1, 0, b"first")).unwrap();

        let events = ch.apply(&data(1, 1, 0, b"second")).unwrap();
        assert_eq!(kinds(&events), vec!["generation_opened"]);
        assert_eq!(ch.current_generation(), Some(GenerationId(2)));
    }

    #[test]
    fn test_sweep_waits_for_quiescence() {
        let mut ch = channel();
        ch.apply(&start(1, 1, 3)).unwrap();
        ch.apply(&data(1, 1, 0, b"a")).unwrap();

        assert!(ch.sweep(base_time() + Duration::seconds(10), SweepTrigger::Scheduled).is_empty());

        let events = ch.sweep(base_time() + Duration::seconds(120), SweepTrigger::Scheduled);
        match &events[..] {
            [EngineEvent::RetransmissionRequested(request)] => {
                assert_eq!(request.ranges, vec![FragmentRange::new(1, 2)]);
                assert!(!request.final_request);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(ch.sweep(base_time() + Duration::seconds(180), SweepTrigger::Scheduled).is_empty());
    }

    #[test]
    fn test_end_of_transmission_promotes_trailing_gaps() {
        let mut ch = channel();
        ch.apply(&data(1, 1, 0, b"a")).unwrap();
        ch.apply(&data(1, 1, 3, b"d")).unwrap();

        let events = ch.sweep(base_time() + Duration::seconds(1), SweepTrigger::EndOfTransmission);
        match &events[..] {
            [EngineEvent::RetransmissionRequested(request), EngineEvent::PartialImage(_)] => {
                assert_eq!(request.ranges, vec![FragmentRange::new(1, 2)]);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_end_of_transmission_snapshots_gapped_image() {
        let mut ch = channel();
        ch.apply(&start(1, 1, 3)).unwrap();
        ch.apply(&data(1, 1, 0, &[1u8; 160])).unwrap();
        ch.apply(&data(1, 1, 2, &[3u8; 160])).unwrap();

        let events = ch.sweep(base_time() + Duration::seconds(1), SweepTrigger::EndOfTransmission);
        let partial = events
            .iter()
            .find_map(|e| match e {
                EngineEvent::PartialImage(image) => Some(image),
                _ => None,
            })
            .expect("partial image");
        assert_eq!(partial.fragments_received, 2);
        assert_eq!(partial.fragments_expected, 3);
        assert!(!partial.complete);
        assert_eq!(partial.byte_len, 480);
        assert_eq!(&partial.bytes[160..320], &[0u8; 160][..]);
        assert!(ch.has_open_generation());

        // nothing new arrived, nothing new to save
        let events = ch.sweep(base_time() + Duration::seconds(2), SweepTrigger::EndOfTransmission);
        assert!(events.iter().all(|e| e.kind() != "partial_image"));

        ch.apply(&data(1, 1, 1, &[2u8; 160]).at(3)).unwrap();
        assert!(!ch.has_open_generation());
        let events = ch.sweep(base_time() + Duration::seconds(4), SweepTrigger::EndOfTransmission);
        assert!(events.is_empty());
    }

    #[test]
    fn test_scheduled_sweep_does_not_snapshot() {
        let mut ch = channel();
        ch.apply(&start(1, 1, 3)).unwrap();
        ch.apply(&data(1, 1, 0, b"a")).unwrap();

        let events = ch.sweep(base_time() + Duration::seconds(120), SweepTrigger::Scheduled);
        assert_eq!(kinds(&events), vec!["retransmission_requested"]);
    }

    #[test]
    fn test_abandonment_and_late_fragment() {
        let mut ch = channel();
        ch.apply(&start(1, 1, 3)).unwrap();
        ch.apply(&data(1, 1, 0, b"a")).unwrap();

        let events = ch.sweep(base_time() + Duration::minutes(600), SweepTrigger::Scheduled);
        assert_eq!(kinds(&events), vec!["retransmission_requested", "generation_abandoned"]);
        assert!(!ch.has_open_generation());
        assert_eq!(ch.current().map(ImageReconstruction::state), Some(GenerationState::Abandoned));

        let events = ch.apply(&data(1, 1, 2, b"c").at(36_001)).unwrap();
        assert!(matches!(
            &events[..],
            [EngineEvent::Anomaly { kind: AnomalyKind::LateFragment { index: 2 }, .. }]
        ));
        assert_eq!(ch.current().map(ImageReconstruction::accepted_count), Some(1));
    }

    #[test]
    fn test_replay_abandons_before_late_fragment() {
        let late = data(1, 1, 2, b"c").at(36_001);

        let mut live = channel();
        live.apply(&start(1, 1, 3)).unwrap();
        live.apply(&data(1, 1, 0, b"a")).unwrap();
        live.sweep(base_time() + Duration::minutes(600), SweepTrigger::Scheduled);
        live.apply(&late).unwrap();

        let mut resumed = channel();
        resumed.replay(&start(1, 1, 3)).unwrap();
        resumed.replay(&data(1, 1, 0, b"a")).unwrap();
        let events = resumed.replay(&late).unwrap();
        assert_eq!(
            kinds(&events),
            vec!["retransmission_requested", "generation_abandoned", "anomaly"]
        );
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Anomaly { kind: AnomalyKind::LateFragment { index: 2 }, .. })
        ));
        assert_eq!(resumed.current().map(|g| g.summary()), live.current().map(|g| g.summary()));
        assert_eq!(resumed.current().map(ImageReconstruction::accepted_count), Some(1));
    }

    #[test]
    fn test_wrong_channel_is_an_error() {
        let mut ch = channel();
        let err = ch.apply(&data(2, 1, 0, b"x")).unwrap_err();
        assert!(matches!(err, ReconstructionError::ChannelMismatch { .. }));
    }
}
