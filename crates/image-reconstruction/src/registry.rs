use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use waps_packet::{AecId, ChannelKey, WapsFragment};

use crate::channel::{ChannelSnapshot, ChannelState, SweepTrigger};
use crate::events::EngineEvent;
use crate::generation::GenerationId;
use crate::policy::ReconstructionPolicy;
use crate::Result;

/// Single-threaded registry of every channel
///
/// The gateway runs one [`ChannelState`] per actor instead; this registry
/// serves replays, diagnostics and tests where one thread owns all state.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    policy: ReconstructionPolicy,
    channels: BTreeMap<ChannelKey, ChannelState>,
}

impl ChannelRegistry {
    pub fn new(policy: ReconstructionPolicy) -> Self {
        Self {
            policy,
            channels: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> &ReconstructionPolicy {
        &self.policy
    }

    /// Apply a fragment, returning the generation it was attributed to and
    /// the resulting events
    pub fn apply(&mut self, fragment: &WapsFragment) -> Result<(Option<GenerationId>, Vec<EngineEvent>)> {
        let policy = &self.policy;
        let channel = self
            .channels
            .entry(fragment.key)
            .or_insert_with(|| ChannelState::new(fragment.key, policy.clone()));
        let events = channel.apply(fragment)?;
        Ok((channel.current_generation(), events))
    }

    /// [`apply`](Self::apply) for a recorded fragment, see [`ChannelState::replay`]
    pub fn replay(&mut self, fragment: &WapsFragment) -> Result<(Option<GenerationId>, Vec<EngineEvent>)> {
        let policy = &self.policy;
        let channel = self
            .channels
            .entry(fragment.key)
            .or_insert_with(|| ChannelState::new(fragment.key, policy.clone()));
        let events = channel.replay(fragment)?;
        Ok((channel.current_generation(), events))
    }

    /// Sweep every channel, or only those of one AEC
    pub fn sweep(
        &mut self,
        as_of: DateTime<Utc>,
        trigger: SweepTrigger,
        aec: Option<AecId>,
    ) -> Vec<EngineEvent> {
        self.channels
            .iter_mut()
            .filter(|(key, _)| aec.map_or(true, |aec| key.aec == aec))
            .flat_map(|(_, channel)| channel.sweep(as_of, trigger))
            .collect()
    }

    pub fn channel(&self, key: ChannelKey) -> Option<&ChannelState> {
        self.channels.get(&key)
    }

    pub fn snapshot(&self, key: ChannelKey, as_of: DateTime<Utc>) -> Option<ChannelSnapshot> {
        self.channels.get(&key).map(|c| c.snapshot(as_of))
    }

    pub fn snapshots(&self, as_of: DateTime<Utc>) -> Vec<ChannelSnapshot> {
        self.channels.values().map(|c| c.snapshot(as_of)).collect()
    }

    pub fn open_generations(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.has_open_generation())
            .count()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
