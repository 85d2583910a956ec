//! HTTP status API and event stream
//!
//! Read-only: channel snapshots are answered by the channel actors
//! themselves, so a request never observes a half-applied fragment.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use image_reconstruction::{ChannelSnapshot, GenerationState};
use waps_packet::ChannelKey;

use crate::events::IesEvent;
use crate::stats::StatsSnapshot;
use crate::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub instance: String,
    pub mode: String,
    pub server: Option<String>,
    pub as_of: DateTime<Utc>,
    pub channels: usize,
    pub open_generations: usize,
    pub event_subscribers: usize,
    pub stats: StatsSnapshot,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(status))
        .route("/channels", get(list_channels))
        .route("/channels/:aec/:slot", get(get_channel))
        .route("/events", get(events_ws));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "waps-ies",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let as_of = Utc::now();
    let snapshots = state.directory.snapshots(as_of).await;
    let open_generations = snapshots
        .iter()
        .filter(|s| {
            s.current
                .as_ref()
                .is_some_and(|g| g.state == GenerationState::Open)
        })
        .count();
    Json(StatusResponse {
        instance: state.instance.clone(),
        mode: state.mode.to_string(),
        server: state.server.clone(),
        as_of,
        channels: snapshots.len(),
        open_generations,
        event_subscribers: state.bus.subscribers(),
        stats: state.stats.snapshot(),
    })
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelSnapshot>> {
    Json(state.directory.snapshots(Utc::now()).await)
}

async fn get_channel(
    State(state): State<AppState>,
    Path((aec, slot)): Path<(u8, u8)>,
) -> Result<Json<ChannelSnapshot>, (StatusCode, String)> {
    let key = ChannelKey::from_ids(aec, slot).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("no such channel: AEC {aec} slot {slot} (AEC 1-4, slot 1-8)"),
        )
    })?;
    state
        .directory
        .snapshot(key, Utc::now())
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("{key} has seen no fragments")))
}

async fn events_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

/// WebSocket text frame for one event
pub fn event_message(event: &IesEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::warn!("Event not serialisable: {}", e);
            None
        }
    }
}

async fn stream_events(mut socket: WebSocket, state: AppState) {
    let mut events = state.bus.subscribe();
    tracing::debug!("Event stream client connected");
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    let Some(message) = event_message(&event) else { continue };
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Event stream client lagging, {} events skipped", missed);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("Event stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{ChannelDirectory, Coordinator, CoordinatorConfig, Ingest, Outputs};
    use crate::events::EventBus;
    use crate::stats::SessionStats;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use image_reconstruction::ReconstructionPolicy;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use waps_packet::{ImageType, Integrity, StreamOrigin, WapsFragment};

    fn state(directory: ChannelDirectory, bus: EventBus, stats: Arc<SessionStats>) -> AppState {
        AppState {
            instance: "ies-test".into(),
            mode: "replay",
            server: None,
            directory,
            stats,
            bus,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state(
            ChannelDirectory::default(),
            EventBus::new(4),
            Arc::new(SessionStats::new()),
        ));
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_channel_endpoints() {
        let bus = EventBus::new(64);
        let stats = Arc::new(SessionStats::new());
        let coordinator = Coordinator::start(
            CoordinatorConfig::new(ReconstructionPolicy::default(), Duration::from_secs(3600)),
            Outputs::new(bus.clone(), Arc::clone(&stats)),
        );
        let now = Utc::now();
        let tx = coordinator.sender();
        tx.send(Ingest::Fragment {
            fragment: WapsFragment {
                key: ChannelKey::from_ids(2, 3).unwrap(),
                ec_address: 172,
                image_type: ImageType::Infrared,
                start_marker: true,
                index: 0,
                total_hint: Some(4),
                payload: Vec::new(),
                integrity: Integrity::Verified,
                time_tag: 1,
                onboard_time: now,
                received_at: now,
                origin: StreamOrigin::Live,
            },
            persist: false,
        })
        .await
        .unwrap();
        assert!(coordinator.flush().await);

        let app = router(state(coordinator.directory(), bus, stats));
        let (status, json) = get_json(app.clone(), "/api/v1/channels").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);

        let (status, json) = get_json(app.clone(), "/api/v1/channels/2/3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["current"]["state"], "OPEN");
        assert_eq!(json["current"]["total"], 4);

        let (status, _) = get_json(app.clone(), "/api/v1/channels/2/4").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(app.clone(), "/api/v1/channels/9/3").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = get_json(app, "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["channels"], 1);
        assert_eq!(json["open_generations"], 1);
        assert_eq!(json["stats"]["generations_opened"], 1);

        drop(tx);
        coordinator.shutdown().await;
    }

    #[test]
    fn test_event_message_is_json_text() {
        let message = event_message(&IesEvent::LinkUp {
            server: "sim:9000".into(),
            at: Utc::now(),
        })
        .unwrap();
        match message {
            Message::Text(text) => assert!(text.contains("\"source\":\"link_up\"")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
