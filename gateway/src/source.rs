//! Packet sources
//!
//! The live TCP link and raw capture files use the same framing: a 16-byte
//! CCSDS header followed by the rest of the packet as declared in it. Both
//! classify each packet as it is read and hand the result to the
//! coordinator. The replay store is a third source that skips
//! classification and re-persistence.

use chrono::Utc;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use replay_store::StoredFragment;
use waps_packet::ccsds::{CcsdsHeader, HEADERS_LEN};
use waps_packet::{Classifier, RawPacket, StreamOrigin};

use crate::coordinator::Ingest;
use crate::events::{EventBus, IesEvent};
use crate::shutdown::Shutdown;
use crate::stats::SessionStats;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Read one CCSDS packet. `Ok(None)` on a clean end of stream between
/// packets; a stream ending inside a packet is `UnexpectedEof`.
pub async fn read_ccsds_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADERS_LEN];
    let mut filled = 0;
    while filled < HEADERS_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {filled} header bytes"),
            ));
        }
        filled += n;
    }

    let parsed = CcsdsHeader::parse(&header)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut packet = vec![0u8; parsed.total_len().max(HEADERS_LEN)];
    packet[..HEADERS_LEN].copy_from_slice(&header);
    reader.read_exact(&mut packet[HEADERS_LEN..]).await?;
    Ok(Some(packet))
}

/// Classification stage shared by the packet sources
#[derive(Clone)]
pub struct PacketIntake {
    classifier: Arc<Classifier>,
    stats: Arc<SessionStats>,
    tx: mpsc::Sender<Ingest>,
}

impl PacketIntake {
    pub fn new(classifier: Arc<Classifier>, stats: Arc<SessionStats>, tx: mpsc::Sender<Ingest>) -> Self {
        Self { classifier, stats, tx }
    }

    /// Classify and forward. Fails only when the coordinator is gone.
    pub async fn submit(&self, raw: RawPacket) -> Result<(), mpsc::error::SendError<Ingest>> {
        let onboard = CcsdsHeader::parse(&raw.bytes).ok().map(|h| h.onboard_time());
        self.stats.record_ccsds(raw.bytes.len(), onboard);

        let item = match self.classifier.classify(&raw) {
            Ok(fragment) => {
                self.stats.record_fragment(fragment.is_corrupted());
                debug!("{} classified", fragment.name());
                Ingest::Fragment {
                    fragment,
                    persist: true,
                }
            }
            Err(rejection) => {
                self.stats.record_rejection(&rejection);
                Ingest::Rejected {
                    rejection,
                    origin: raw.origin,
                    at: raw.received_at,
                }
            }
        };
        self.tx.send(item).await
    }
}

/// Supervised TCP connection to the telemetry server
pub struct LiveSource {
    server: String,
    idle_timeout: Duration,
    intake: PacketIntake,
    bus: EventBus,
    stats: Arc<SessionStats>,
}

enum LinkEnd {
    Closed(String),
    Shutdown,
}

impl LiveSource {
    pub fn new(
        server: impl Into<String>,
        idle_timeout: Duration,
        intake: PacketIntake,
        bus: EventBus,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            server: server.into(),
            idle_timeout,
            intake,
            bus,
            stats,
        }
    }

    /// Run until shutdown, reconnecting after every failure
    pub async fn run(self, shutdown: Shutdown) {
        let mut first_failure = true;
        info!("📡 Receiving telemetry from {}", self.server);

        while !shutdown.is_triggered() {
            let connect = tokio::select! {
                _ = shutdown.wait() => break,
                result = TcpStream::connect(self.server.as_str()) => result,
            };
            match connect {
                Ok(stream) => {
                    first_failure = true;
                    self.bus.publish(IesEvent::LinkUp {
                        server: self.server.clone(),
                        at: Utc::now(),
                    });
                    match self.receive(stream, &shutdown).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Closed(reason) => {
                            self.bus.publish(IesEvent::LinkDown {
                                server: self.server.clone(),
                                reason,
                                at: Utc::now(),
                            });
                        }
                    }
                }
                Err(e) => {
                    // one report per outage, not per attempt
                    if first_failure {
                        first_failure = false;
                        self.bus.publish(IesEvent::LinkDown {
                            server: self.server.clone(),
                            reason: e.to_string(),
                            at: Utc::now(),
                        });
                    }
                }
            }

            self.stats.record_reconnect();
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        info!("Live source stopped");
    }

    async fn receive(&self, stream: TcpStream, shutdown: &Shutdown) -> LinkEnd {
        let (packets_tx, mut packets) = mpsc::channel::<Vec<u8>>(1024);
        // framing runs in its own task so the idle timer can never cut a
        // packet in half
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            loop {
                match read_ccsds_packet(&mut reader).await {
                    Ok(Some(packet)) => {
                        if packets_tx.send(packet).await.is_err() {
                            return "receiver stopped".to_string();
                        }
                    }
                    Ok(None) => return "connection closed by server".to_string(),
                    Err(e) => return e.to_string(),
                }
            }
        });

        let mut idle_reported = false;
        let end = loop {
            let next = tokio::select! {
                _ = shutdown.wait() => break LinkEnd::Shutdown,
                next = tokio::time::timeout(self.idle_timeout, packets.recv()) => next,
            };
            match next {
                Ok(Some(bytes)) => {
                    idle_reported = false;
                    let raw = RawPacket::new(bytes, Utc::now(), StreamOrigin::Live);
                    if self.intake.submit(raw).await.is_err() {
                        break LinkEnd::Shutdown;
                    }
                }
                Ok(None) => break LinkEnd::Closed(String::new()),
                Err(_) => {
                    if !idle_reported {
                        idle_reported = true;
                        self.bus.publish(IesEvent::LinkIdle {
                            server: self.server.clone(),
                            silent_ms: self.idle_timeout.as_millis() as u64,
                            at: Utc::now(),
                        });
                    }
                }
            }
        };

        match end {
            LinkEnd::Closed(_) => {
                let reason = reader
                    .await
                    .unwrap_or_else(|e| format!("reader task failed: {e}"));
                LinkEnd::Closed(reason)
            }
            LinkEnd::Shutdown => {
                reader.abort();
                LinkEnd::Shutdown
            }
        }
    }
}

/// Replay a raw CCSDS capture file. Returns the number of packets read.
pub async fn replay_capture(path: &Path, intake: &PacketIntake, shutdown: &Shutdown) -> io::Result<usize> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut count = 0;
    info!("▶️  Replaying capture {}", path.display());

    while !shutdown.is_triggered() {
        match read_ccsds_packet(&mut reader).await {
            Ok(Some(bytes)) => {
                count += 1;
                let raw = RawPacket::new(bytes, Utc::now(), StreamOrigin::Replay);
                if intake.submit(raw).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("{} ends inside a packet, {} packets read", path.display(), count);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    info!("Capture {} replayed: {} packets", path.display(), count);
    Ok(count)
}

/// Feed stored fragments back in append order without persisting them again
pub async fn resume_from_store(
    records: Vec<StoredFragment>,
    tx: &mpsc::Sender<Ingest>,
) -> Result<usize, mpsc::error::SendError<Ingest>> {
    let count = records.len();
    for record in records {
        tx.send(Ingest::Fragment {
            fragment: record.fragment,
            persist: false,
        })
        .await?;
    }
    info!("🔁 Resumed {} stored fragments", count);
    Ok(count)
}
