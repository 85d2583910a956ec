//! Replay Store
//!
//! Durable append of every classified WAPS fragment together with the
//! generation it was attributed to. Reloading the store in sequence order
//! and feeding it through the engine rebuilds the same reconstruction state.
//!
//! - [`FragmentStore`]: the persistence contract
//! - [`JsonlStore`]: append-only JSON lines file, one record per line
//! - [`MemoryStore`]: in-process store for tests and store-less runs

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use thiserror::Error;

use waps_packet::{ChannelKey, WapsFragment};

mod jsonl;

pub use jsonl::JsonlStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

impl StoreError {
    /// Underlying OS error code, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            StoreError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One persisted fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFragment {
    /// Append order, starting at 1
    pub sequence: u64,
    pub generation: u32,
    pub fragment: WapsFragment,
}

pub trait FragmentStore: Send {
    /// Append a fragment. Returns `false` when an identical record for the
    /// same generation is already stored.
    fn append(&mut self, generation: u32, fragment: &WapsFragment) -> Result<bool>;

    /// Every record in append order
    fn load(&mut self) -> Result<Vec<StoredFragment>>;

    /// Records of one generation of one channel, in append order
    fn lookup(&mut self, key: ChannelKey, generation: u32) -> Result<Vec<StoredFragment>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.fragment.key == key && r.generation == generation)
            .collect())
    }

    fn flush(&mut self) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Content fingerprint used for de-duplication. Arrival time and origin
/// are not part of it, so a redelivered copy matches the stored one.
pub fn fingerprint(generation: u32, fragment: &WapsFragment) -> u64 {
    let mut hasher = DefaultHasher::new();
    generation.hash(&mut hasher);
    fragment.key.hash(&mut hasher);
    fragment.image_type.hash(&mut hasher);
    fragment.start_marker.hash(&mut hasher);
    fragment.index.hash(&mut hasher);
    fragment.total_hint.hash(&mut hasher);
    fragment.payload.hash(&mut hasher);
    fragment.time_tag.hash(&mut hasher);
    fragment.is_corrupted().hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<StoredFragment>,
    seen: HashSet<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FragmentStore for MemoryStore {
    fn append(&mut self, generation: u32, fragment: &WapsFragment) -> Result<bool> {
        if !self.seen.insert(fingerprint(generation, fragment)) {
            return Ok(false);
        }
        self.records.push(StoredFragment {
            sequence: self.records.len() as u64 + 1,
            generation,
            fragment: fragment.clone(),
        });
        Ok(true)
    }

    fn load(&mut self) -> Result<Vec<StoredFragment>> {
        Ok(self.records.clone())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
