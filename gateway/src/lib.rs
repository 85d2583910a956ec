//! WAPS Image Extraction Software
//!
//! Ingests BIOLAB telemetry from the live TCP link or from capture files,
//! reconstructs WAPS images per (AEC, memory slot) and writes image files
//! and retransmission command stacks. Status and the event stream are
//! served over HTTP and optionally mirrored to NATS.

use std::sync::Arc;

pub mod command_stack;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod image_files;
pub mod nats;
pub mod report;
pub mod routes;
pub mod shutdown;
pub mod sinks;
pub mod source;
pub mod stats;

pub use config::{ConfigError, IesConfig};
pub use coordinator::{ChannelDirectory, Coordinator, CoordinatorConfig, Ingest, Outputs};
pub use events::{EventBus, IesEvent};
pub use shutdown::Shutdown;
pub use stats::{SessionStats, StatsSnapshot};

/// Shared state for the HTTP routes
#[derive(Clone)]
pub struct AppState {
    pub instance: String,
    /// `live` or `replay`
    pub mode: &'static str,
    pub server: Option<String>,
    pub directory: ChannelDirectory,
    pub stats: Arc<SessionStats>,
    pub bus: EventBus,
}
