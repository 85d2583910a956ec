//! IES event stream
//!
//! Every reportable condition goes through one [`EventBus`]: it is logged
//! at its severity and broadcast to subscribers (WebSocket clients, NATS).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use image_reconstruction::EngineEvent;
use waps_packet::{Rejection, StreamOrigin};

/// Capacity of the broadcast ring. Slow subscribers lag, they never block
/// publishers.
pub const EVENT_BUS_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
pub enum IesEvent {
    Engine(EngineEvent),
    PacketRejected {
        rejection: Rejection,
        origin: StreamOrigin,
        at: DateTime<Utc>,
    },
    SinkUnavailable {
        sink: String,
        error: String,
        /// The sink gave up on the item
        dropped: bool,
        /// Storage exhausted, the process shuts down
        fatal: bool,
        at: DateTime<Utc>,
    },
    SinkBackpressure {
        sink: String,
        depth: usize,
        at: DateTime<Utc>,
    },
    LinkUp {
        server: String,
        at: DateTime<Utc>,
    },
    LinkDown {
        server: String,
        reason: String,
        at: DateTime<Utc>,
    },
    LinkIdle {
        server: String,
        silent_ms: u64,
        at: DateTime<Utc>,
    },
}

impl IesEvent {
    /// Subject suffix and WebSocket event name
    pub fn kind(&self) -> &'static str {
        match self {
            IesEvent::Engine(event) => event.kind(),
            IesEvent::PacketRejected { .. } => "packet_rejected",
            IesEvent::SinkUnavailable { .. } => "sink_unavailable",
            IesEvent::SinkBackpressure { .. } => "sink_backpressure",
            IesEvent::LinkUp { .. } => "link_up",
            IesEvent::LinkDown { .. } => "link_down",
            IesEvent::LinkIdle { .. } => "link_idle",
        }
    }

    pub fn rejected(rejection: Rejection, origin: StreamOrigin) -> Self {
        IesEvent::PacketRejected {
            rejection,
            origin,
            at: Utc::now(),
        }
    }
}

fn log_engine(event: &EngineEvent) {
    match event {
        EngineEvent::GenerationOpened {
            key,
            generation,
            image_type,
            time_tag,
            ..
        } => info!(
            "🆕 {} generation {} opened: {} image, time tag {}",
            key,
            generation,
            image_type.camera(),
            time_tag
        ),
        EngineEvent::ImageCompleted(image) => info!(
            "🖼️  {} generation {} complete: {} {} fragments, {} bytes",
            image.key,
            image.generation,
            image.image_type.camera(),
            image.fragments_received,
            image.byte_len
        ),
        EngineEvent::PartialImage(image) => info!(
            "🧩 {} generation {} transmission ended at {}%: {}/{} fragments",
            image.key,
            image.generation,
            image.completeness_percent(),
            image.fragments_received,
            image.fragments_expected
        ),
        EngineEvent::GenerationOverwritten { summary, gaps, .. } => warn!(
            "{} generation {} overwritten at {}/{} fragments, missing {:?}",
            summary.key,
            summary.generation,
            summary.accepted,
            summary.total.map_or("?".to_string(), |t| t.to_string()),
            gaps.confirmed.iter().chain(&gaps.pending).map(ToString::to_string).collect::<Vec<_>>()
        ),
        EngineEvent::GenerationAbandoned { summary, gaps, .. } => warn!(
            "{} generation {} abandoned at {}/{} fragments, {} missing",
            summary.key,
            summary.generation,
            summary.accepted,
            summary.total.map_or("?".to_string(), |t| t.to_string()),
            gaps.confirmed_count() + gaps.pending_count()
        ),
        EngineEvent::RetransmissionRequested(request) => info!(
            "📡 {} generation {}: retransmission of {} packets requested",
            request.key,
            request.generation,
            request.missing_count()
        ),
        EngineEvent::Anomaly {
            key,
            generation,
            fragment,
            kind,
            ..
        } => warn!(
            "{} {} anomaly on {}: {:?}",
            key,
            generation.map_or("-".to_string(), |g| g.to_string()),
            fragment,
            kind
        ),
    }
}

/// Log an event at the level matching its severity
pub fn log_event(event: &IesEvent) {
    match event {
        IesEvent::Engine(engine) => log_engine(engine),
        IesEvent::PacketRejected { rejection, origin, .. } => {
            if rejection.is_routine() {
                debug!("{:?} packet skipped: {}", origin, rejection);
            } else {
                warn!("{:?} packet rejected: {}", origin, rejection);
            }
        }
        IesEvent::SinkUnavailable {
            sink, error, fatal, ..
        } => {
            if *fatal {
                error!("❌ {} sink out of storage: {}", sink, error);
            } else {
                error!("{} sink unavailable: {}", sink, error);
            }
        }
        IesEvent::SinkBackpressure { sink, depth, .. } => {
            warn!("{} sink is falling behind, {} items queued", sink, depth)
        }
        IesEvent::LinkUp { server, .. } => info!("🔗 Connected to {}", server),
        IesEvent::LinkDown { server, reason, .. } => warn!("Link to {} down: {}", server, reason),
        IesEvent::LinkIdle {
            server, silent_ms, ..
        } => info!("No data from {} for {} ms", server, silent_ms),
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IesEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: IesEvent) {
        log_event(&event);
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn engine(&self, event: EngineEvent) {
        self.publish(IesEvent::Engine(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IesEvent> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_tagging() {
        let event = IesEvent::rejected(
            Rejection::UnknownAecOrSlot {
                ec_address: 99,
                slot: 3,
            },
            StreamOrigin::Live,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["source"], "packet_rejected");
        assert_eq!(json["event"]["rejection"]["reason"], "UnknownAecOrSlot");
        assert_eq!(json["event"]["rejection"]["detail"]["ec_address"], 99);
        assert_eq!(event.kind(), "packet_rejected");

        let malformed = IesEvent::rejected(Rejection::MalformedHeader("short".into()), StreamOrigin::Replay);
        let json = serde_json::to_value(&malformed).unwrap();
        assert_eq!(json["event"]["rejection"]["reason"], "MalformedHeader");
        assert_eq!(json["event"]["rejection"]["detail"], "short");
        let back: IesEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, malformed);
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscribers(), 2);

        bus.publish(IesEvent::LinkUp {
            server: "sim:9000".into(),
            at: Utc::now(),
        });
        assert_eq!(a.recv().await.unwrap().kind(), "link_up");
        assert_eq!(b.recv().await.unwrap().kind(), "link_up");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(IesEvent::SinkBackpressure {
            sink: "images".into(),
            depth: 10,
            at: Utc::now(),
        });
        assert_eq!(bus.subscribers(), 0);
    }
}
