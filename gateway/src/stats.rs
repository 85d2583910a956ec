//! Session statistics

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::info;

use image_reconstruction::EngineEvent;
use waps_packet::Rejection;

const NO_TIME: i64 = i64::MIN;

/// Counters shared by sources, channel actors and sinks
pub struct SessionStats {
    started_at: DateTime<Utc>,
    ccsds_packets: AtomicU64,
    ccsds_bytes: AtomicU64,
    biolab_packets: AtomicU64,
    waps_packets: AtomicU64,
    rejected_packets: AtomicU64,
    corrupted_fragments: AtomicU64,
    generations_opened: AtomicU64,
    images_completed: AtomicU64,
    partial_images: AtomicU64,
    generations_overwritten: AtomicU64,
    generations_abandoned: AtomicU64,
    requests_issued: AtomicU64,
    anomalies: AtomicU64,
    link_reconnects: AtomicU64,
    sink_failures: AtomicU64,
    unexpected_errors: AtomicU64,
    /// CCSDS time of the last packet, Unix milliseconds
    last_ccsds_time: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub last_ccsds_time: Option<DateTime<Utc>>,
    pub ccsds_packets: u64,
    pub ccsds_bytes: u64,
    pub biolab_packets: u64,
    pub waps_packets: u64,
    pub rejected_packets: u64,
    pub corrupted_fragments: u64,
    pub generations_opened: u64,
    pub images_completed: u64,
    pub partial_images: u64,
    pub generations_overwritten: u64,
    pub generations_abandoned: u64,
    pub requests_issued: u64,
    pub anomalies: u64,
    pub link_reconnects: u64,
    pub sink_failures: u64,
    pub unexpected_errors: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            ccsds_packets: AtomicU64::new(0),
            ccsds_bytes: AtomicU64::new(0),
            biolab_packets: AtomicU64::new(0),
            waps_packets: AtomicU64::new(0),
            rejected_packets: AtomicU64::new(0),
            corrupted_fragments: AtomicU64::new(0),
            generations_opened: AtomicU64::new(0),
            images_completed: AtomicU64::new(0),
            partial_images: AtomicU64::new(0),
            generations_overwritten: AtomicU64::new(0),
            generations_abandoned: AtomicU64::new(0),
            requests_issued: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            link_reconnects: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            unexpected_errors: AtomicU64::new(0),
            last_ccsds_time: AtomicI64::new(NO_TIME),
        }
    }

    pub fn record_ccsds(&self, bytes: usize, onboard_time: Option<DateTime<Utc>>) {
        bump(&self.ccsds_packets);
        self.ccsds_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Some(time) = onboard_time {
            self.last_ccsds_time
                .store(time.timestamp_millis(), Ordering::Relaxed);
        }
    }

    pub fn record_fragment(&self, corrupted: bool) {
        bump(&self.biolab_packets);
        bump(&self.waps_packets);
        if corrupted {
            bump(&self.corrupted_fragments);
        }
    }

    pub fn record_rejection(&self, rejection: &Rejection) {
        bump(&self.rejected_packets);
        // these still passed the BIOLAB checks
        if matches!(
            rejection,
            Rejection::NotWapsImageData { .. } | Rejection::UnknownAecOrSlot { .. }
        ) {
            bump(&self.biolab_packets);
        }
    }

    pub fn record_engine_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::GenerationOpened { .. } => bump(&self.generations_opened),
            EngineEvent::ImageCompleted(_) => bump(&self.images_completed),
            EngineEvent::PartialImage(_) => bump(&self.partial_images),
            EngineEvent::GenerationOverwritten { .. } => bump(&self.generations_overwritten),
            EngineEvent::GenerationAbandoned { .. } => bump(&self.generations_abandoned),
            EngineEvent::RetransmissionRequested(_) => bump(&self.requests_issued),
            EngineEvent::Anomaly { .. } => bump(&self.anomalies),
        }
    }

    pub fn record_reconnect(&self) {
        bump(&self.link_reconnects);
    }

    pub fn record_sink_failure(&self) {
        bump(&self.sink_failures);
    }

    pub fn record_unexpected_error(&self) {
        bump(&self.unexpected_errors);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let last = self.last_ccsds_time.load(Ordering::Relaxed);
        StatsSnapshot {
            started_at: self.started_at,
            last_ccsds_time: (last != NO_TIME)
                .then(|| Utc.timestamp_millis_opt(last).single())
                .flatten(),
            ccsds_packets: load(&self.ccsds_packets),
            ccsds_bytes: load(&self.ccsds_bytes),
            biolab_packets: load(&self.biolab_packets),
            waps_packets: load(&self.waps_packets),
            rejected_packets: load(&self.rejected_packets),
            corrupted_fragments: load(&self.corrupted_fragments),
            generations_opened: load(&self.generations_opened),
            images_completed: load(&self.images_completed),
            partial_images: load(&self.partial_images),
            generations_overwritten: load(&self.generations_overwritten),
            generations_abandoned: load(&self.generations_abandoned),
            requests_issued: load(&self.requests_issued),
            anomalies: load(&self.anomalies),
            link_reconnects: load(&self.link_reconnects),
            sink_failures: load(&self.sink_failures),
            unexpected_errors: load(&self.unexpected_errors),
        }
    }
}

impl StatsSnapshot {
    /// One-line periodic status
    pub fn status_line(&self) -> String {
        let time = self
            .last_ccsds_time
            .map_or("----".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        format!(
            "CCSDS time {} | packets {} ({} B) | BIOLAB {} | WAPS {} | corrupted {} | images {}/{} | overwritten {} | requests {}",
            time,
            self.ccsds_packets,
            self.ccsds_bytes,
            self.biolab_packets,
            self.waps_packets,
            self.corrupted_fragments,
            self.images_completed,
            self.generations_opened,
            self.generations_overwritten,
            self.requests_issued
        )
    }

    /// Close-out block logged at shutdown
    pub fn log_closeout(&self) {
        let elapsed = Utc::now() - self.started_at;
        info!("📊 Session statistics ({} s)", elapsed.num_seconds());
        info!("   CCSDS packets:           {}", self.ccsds_packets);
        info!("   CCSDS bytes:             {}", self.ccsds_bytes);
        info!("   BIOLAB packets:          {}", self.biolab_packets);
        info!("   WAPS packets:            {}", self.waps_packets);
        info!("   Rejected packets:        {}", self.rejected_packets);
        info!("   Corrupted fragments:     {}", self.corrupted_fragments);
        info!("   Generations opened:      {}", self.generations_opened);
        info!("   Images completed:        {}", self.images_completed);
        info!("   Partial images:          {}", self.partial_images);
        info!("   Generations overwritten: {}", self.generations_overwritten);
        info!("   Generations abandoned:   {}", self.generations_abandoned);
        info!("   Requests issued:         {}", self.requests_issued);
        info!("   Anomalies:               {}", self.anomalies);
        info!("   Link reconnects:         {}", self.link_reconnects);
        info!("   Sink failures:           {}", self.sink_failures);
        info!("   Unexpected errors:       {}", self.unexpected_errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = SessionStats::new();
        assert!(stats.snapshot().last_ccsds_time.is_none());

        let t = Utc.with_ymd_and_hms(2024, 2, 20, 14, 0, 0).unwrap();
        stats.record_ccsds(294, Some(t));
        stats.record_ccsds(12, None);
        stats.record_fragment(true);
        stats.record_rejection(&Rejection::NotBiolabPacket);
        stats.record_rejection(&Rejection::UnknownAecOrSlot {
            ec_address: 1,
            slot: 9,
        });

        let snap = stats.snapshot();
        assert_eq!(snap.ccsds_packets, 2);
        assert_eq!(snap.ccsds_bytes, 306);
        assert_eq!(snap.biolab_packets, 2);
        assert_eq!(snap.waps_packets, 1);
        assert_eq!(snap.corrupted_fragments, 1);
        assert_eq!(snap.rejected_packets, 2);
        assert_eq!(snap.last_ccsds_time, Some(t));
        assert!(snap.status_line().starts_with("CCSDS time 2024-02-20 14:00:00"));
    }
}
