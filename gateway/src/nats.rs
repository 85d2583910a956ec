//! NATS Event Publisher
//!
//! Mirrors the event bus onto NATS subjects:
//! - waps.ies.image_completed, waps.ies.generation_overwritten, ...
//! - waps.ies.packet_rejected, waps.ies.link_down, ...
//!
//! NATS is optional. Without a server the publisher stays offline and the
//! rest of the system is unaffected.

use anyhow::Result;
use async_nats::Client;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::events::IesEvent;
use crate::shutdown::Shutdown;

pub const SUBJECT_PREFIX: &str = "waps.ies";

#[derive(Serialize)]
struct Envelope<'a> {
    instance: &'a str,
    #[serde(flatten)]
    event: &'a IesEvent,
}

pub fn subject_for(event: &IesEvent) -> String {
    format!("{}.{}", SUBJECT_PREFIX, event.kind())
}

pub struct NatsPublisher {
    client: Option<Client>,
    instance: String,
}

impl NatsPublisher {
    /// Connect if a URL is configured; any failure means offline mode
    pub async fn connect(url: Option<&str>, instance: impl Into<String>) -> Self {
        let client = match url {
            Some(url) => match async_nats::connect(url).await {
                Ok(client) => {
                    tracing::info!("📡 Connected to NATS at {}", url);
                    Some(client)
                }
                Err(e) => {
                    tracing::warn!("⚠️  NATS not available: {} (events stay local)", e);
                    None
                }
            },
            None => None,
        };
        Self {
            client,
            instance: instance.into(),
        }
    }

    pub fn offline(instance: impl Into<String>) -> Self {
        Self {
            client: None,
            instance: instance.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Publish bus events until the bus closes or shutdown
    pub async fn run(self, mut events: broadcast::Receiver<IesEvent>, shutdown: Shutdown) -> Result<()> {
        let Some(client) = self.client else {
            tracing::info!("📴 Running in offline mode (NATS not connected)");
            return Ok(());
        };

        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("NATS publisher lagging, {} events skipped", missed);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let subject = subject_for(&event);
            let payload = match serde_json::to_vec(&Envelope {
                instance: &self.instance,
                event: &event,
            }) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("{} event not serialisable: {}", event.kind(), e);
                    continue;
                }
            };
            if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                tracing::error!("Failed to publish to {}: {}", subject, e);
            }
        }

        if let Err(e) = client.flush().await {
            tracing::warn!("NATS flush on shutdown failed: {}", e);
        }
        Ok(())
    }
}
