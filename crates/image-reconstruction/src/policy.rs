use chrono::Duration;

/// Timing and acceptance rules shared by every channel
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionPolicy {
    /// Silence after which pending gaps are promoted to confirmed
    pub quiescence: Duration,
    /// Silence after which an incomplete generation is abandoned
    pub abandon_after: Duration,
    /// Accept fragments that failed their CRC or verify code check
    pub accept_corrupted: bool,
    /// Attach zero-filled partial reconstructions to overwrite and
    /// abandonment events, and snapshot gapped images when their
    /// transmission ends
    pub emit_partial_images: bool,
    /// Closed generations remembered per channel
    pub history_limit: usize,
}

impl Default for ReconstructionPolicy {
    fn default() -> Self {
        Self {
            quiescence: Duration::seconds(120),
            abandon_after: Duration::minutes(600),
            accept_corrupted: false,
            emit_partial_images: true,
            history_limit: 16,
        }
    }
}

impl ReconstructionPolicy {
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    pub fn with_abandon_after(mut self, abandon_after: Duration) -> Self {
        self.abandon_after = abandon_after;
        self
    }

    pub fn with_accept_corrupted(mut self, accept: bool) -> Self {
        self.accept_corrupted = accept;
        self
    }
}
