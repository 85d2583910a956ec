//! Gap Detector
//!
//! Missing fragments are split in two tiers:
//! - confirmed: the total is known, or the generation has been quiet for the
//!   quiescence interval (trailing indices up to the highest seen included)
//! - pending: total unknown and still active; only holes below the highest
//!   accepted index are listed, and they are not retransmission candidates

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use waps_packet::{ChannelKey, ImageType};

use crate::generation::{GenerationId, ImageReconstruction};

/// Inclusive range of fragment indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentRange {
    pub start: u16,
    pub end: u16,
}

impl FragmentRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, index: u16) -> bool {
        (self.start..=self.end).contains(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for FragmentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "[{}]", self.start)
        } else {
            write!(f, "[{}-{}]", self.start, self.end)
        }
    }
}

/// Coalesce ascending indices into contiguous ranges
pub fn coalesce(indices: impl IntoIterator<Item = u16>) -> Vec<FragmentRange> {
    let mut ranges: Vec<FragmentRange> = Vec::new();
    for index in indices {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(index) => last.end = index,
            Some(last) if last.contains(index) => {}
            _ => ranges.push(FragmentRange::new(index, index)),
        }
    }
    ranges
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub key: ChannelKey,
    pub generation: GenerationId,
    pub image_type: ImageType,
    pub confirmed: Vec<FragmentRange>,
    pub pending: Vec<FragmentRange>,
    /// Confirmed-missing indices for which only corrupted copies arrived
    pub corrupted: Vec<u16>,
    pub total: Option<u16>,
    pub as_of: DateTime<Utc>,
}

impl GapRecord {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.pending.is_empty()
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.iter().map(FragmentRange::len).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.iter().map(FragmentRange::len).sum()
    }
}

/// Compute the gaps of a generation as of `as_of`
pub fn compute_gaps(
    generation: &ImageReconstruction,
    as_of: DateTime<Utc>,
    quiescence: Duration,
) -> GapRecord {
    let quiet = as_of - generation.last_update() >= quiescence;
    let missing_below = |bound: usize| {
        let accepted: Vec<u16> = generation.accepted_indices().collect();
        let mut cursor = accepted.iter().peekable();
        let mut missing = Vec::new();
        for index in 0..bound {
            let index = index as u16;
            while cursor.next_if(|&&a| a < index).is_some() {}
            if cursor.peek() != Some(&&index) {
                missing.push(index);
            }
        }
        missing
    };

    let (confirmed, pending) = match (generation.total(), quiet) {
        (Some(total), _) => (missing_below(total as usize), Vec::new()),
        (None, true) => {
            let bound = generation.highest_seen().map_or(0, |h| h as usize + 1);
            (missing_below(bound), Vec::new())
        }
        (None, false) => {
            let bound = generation.max_accepted().map_or(0, |m| m as usize);
            (Vec::new(), missing_below(bound))
        }
    };

    let corrupted = generation
        .corrupted_indices()
        .filter(|i| confirmed.binary_search(i).is_ok())
        .collect();

    GapRecord {
        key: generation.key(),
        generation: generation.id(),
        image_type: generation.image_type(),
        confirmed: coalesce(confirmed),
        pending: coalesce(pending),
        corrupted,
        total: generation.total(),
        as_of,
    }
}
