//! Image Reconstruction Engine
//!
//! Per-channel reconstruction of WAPS images from classified fragments:
//! - [`ImageReconstruction`]: one generation of a slot, its fragments and
//!   its `OPEN`/`COMPLETE`/`OVERWRITTEN`/`ABANDONED` state
//! - [`ChannelState`]: generation selection, overwrite detection and gap
//!   sweeps for one (AEC, slot)
//! - [`compute_gaps`]: pending versus confirmed missing ranges
//! - [`RequestBuilder`]: deduplicated retransmission requests
//!
//! The engine is synchronous and owns no threads. Time only enters through
//! fragment arrival stamps and the `as_of` argument of sweeps.

use thiserror::Error;

use waps_packet::ChannelKey;

pub mod channel;
pub mod events;
pub mod gaps;
pub mod generation;
pub mod policy;
pub mod registry;
pub mod retransmission;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelSnapshot, ChannelState, SweepTrigger};
pub use events::{AnomalyKind, EngineEvent, ReconstructedImage};
pub use gaps::{coalesce, compute_gaps, FragmentRange, GapRecord};
pub use generation::{GenerationId, GenerationState, GenerationSummary, ImageReconstruction};
pub use policy::ReconstructionPolicy;
pub use registry::ChannelRegistry;
pub use retransmission::{MissingReason, RequestBuilder, RetransmissionRequest};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconstructionError {
    #[error("fragment for {got} routed to channel {expected}")]
    ChannelMismatch { expected: ChannelKey, got: ChannelKey },
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;
