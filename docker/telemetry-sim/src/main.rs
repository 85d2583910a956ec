// BIOLAB Telemetry Simulation
// Serves WAPS image transmissions from a set of ECs as raw CCSDS packets,
// either to TCP clients or into a capture file for replay

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waps_packet::biolab::{offsets, BIOLAB_OFFSET};
use waps_packet::{ImageType, PacketBuilder};

const FLIR_CHUNK: usize = 160;
const UCAM_CHUNK: usize = 158;
/// 480 TM bytes plus an 80x60 frame of 16-bit pixels
const FLIR_IMAGE_LEN: usize = 480 + 80 * 60 * 2;
const SLOTS: usize = 8;

#[derive(Parser, Debug, Clone)]
#[command(name = "telemetry-sim", about = "BIOLAB WAPS telemetry simulator")]
struct Args {
    #[arg(long, env = "TELEMETRY_SIM_LISTEN", default_value = "0.0.0.0:9000")]
    listen: String,

    /// EC addresses transmitting images, in rotation
    #[arg(long = "ec", default_values_t = [171u8])]
    ecs: Vec<u8>,

    /// Pause between two image transmissions
    #[arg(long, default_value_t = 30)]
    image_period_secs: u64,

    /// Packets per second while transmitting
    #[arg(long, default_value_t = 200)]
    packet_rate: u32,

    /// Probability of losing a data packet
    #[arg(long, default_value_t = 0.0, value_parser = probability)]
    loss: f64,

    /// Probability of sending a data packet twice
    #[arg(long, default_value_t = 0.0, value_parser = probability)]
    duplicate: f64,

    /// Probability of flipping a payload byte of a data packet
    #[arg(long, default_value_t = 0.0, value_parser = probability)]
    corrupt: f64,

    /// Write a capture file instead of serving TCP clients
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Number of images written to the capture file
    #[arg(long, default_value_t = 4)]
    images: u32,

    #[arg(long)]
    seed: Option<u64>,
}

fn probability(value: &str) -> std::result::Result<f64, String> {
    let p: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{p} is not a probability"))
    }
}

/// Link fault model applied to data packets
#[derive(Debug, Clone, Copy)]
struct Faults {
    loss: f64,
    duplicate: f64,
    corrupt: f64,
}

impl From<&Args> for Faults {
    fn from(args: &Args) -> Self {
        Self {
            loss: args.loss,
            duplicate: args.duplicate,
            corrupt: args.corrupt,
        }
    }
}

/// One image as transmitted by one EC
#[derive(Debug)]
struct Transmission {
    ec: u8,
    slot: u8,
    image_type: ImageType,
    time_tag: i32,
    /// Start packet followed by the data packets
    packets: Vec<Vec<u8>>,
}

/// Rotates through ECs, memory slots and cameras
struct Campaign {
    ecs: Vec<u8>,
    next: usize,
    time_tag: i32,
    sequence: u16,
}

impl Campaign {
    fn new(ecs: Vec<u8>) -> Self {
        Self {
            ecs,
            next: 0,
            time_tag: 0,
            sequence: 0,
        }
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = (self.sequence + 1) & 0x3FFF;
        self.sequence
    }

    fn next_image(&mut self, rng: &mut impl Rng) -> Transmission {
        let ec = self.ecs[self.next % self.ecs.len()];
        let slot = ((self.next / self.ecs.len()) % SLOTS) as u8;
        let image_type = if self.next % 2 == 0 {
            ImageType::Infrared
        } else {
            ImageType::Color
        };
        self.next += 1;
        self.time_tag += 1;

        let (bytes, chunk) = match image_type {
            ImageType::Infrared => (flir_image(self.time_tag), FLIR_CHUNK),
            ImageType::Color => (jpeg_like(rng), UCAM_CHUNK),
        };
        let builder = PacketBuilder::new(ec)
            .slot(slot)
            .time_tag(self.time_tag)
            .onboard_time(Utc::now());

        let chunks: Vec<&[u8]> = bytes.chunks(chunk).collect();
        let mut packets = Vec::with_capacity(chunks.len() + 1);
        packets.push(
            builder
                .clone()
                .sequence_count(self.next_sequence())
                .start(image_type, chunks.len() as u16),
        );
        for (index, payload) in chunks.into_iter().enumerate() {
            packets.push(
                builder
                    .clone()
                    .sequence_count(self.next_sequence())
                    .data(image_type, index as u16, payload),
            );
        }

        Transmission {
            ec,
            slot,
            image_type,
            time_tag: self.time_tag,
            packets,
        }
    }

    fn housekeeping(&mut self, ec: u8, active_slot: u8) -> Vec<u8> {
        PacketBuilder::new(ec)
            .time_tag(self.time_tag)
            .onboard_time(Utc::now())
            .sequence_count(self.next_sequence())
            .housekeeping(active_slot)
    }
}

fn flir_image(time_tag: i32) -> Vec<u8> {
    (0..FLIR_IMAGE_LEN)
        .map(|i| ((i / 2) as i32).wrapping_add(time_tag) as u8)
        .collect()
}

fn jpeg_like(rng: &mut impl Rng) -> Vec<u8> {
    let len = rng.gen_range(2_000..4_000);
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xDB];
    bytes.extend((0..len).map(|_| rng.gen::<u8>()));
    bytes.extend([0xFF, 0xD9]);
    bytes
}

/// Apply the fault model. The start packet always gets through.
fn degrade(packets: Vec<Vec<u8>>, faults: Faults, rng: &mut impl Rng) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(packets.len());
    for (i, mut packet) in packets.into_iter().enumerate() {
        if i == 0 {
            out.push(packet);
            continue;
        }
        if rng.gen_bool(faults.loss) {
            continue;
        }
        if rng.gen_bool(faults.corrupt) {
            let at = BIOLAB_OFFSET + offsets::WAPS_PAYLOAD + rng.gen_range(0..16);
            packet[at] ^= 0xA5;
        }
        if rng.gen_bool(faults.duplicate) {
            out.push(packet.clone());
        }
        out.push(packet);
    }
    out
}

/// Stream images until `limit` images are written or the writer fails.
/// Returns the number of packets written.
async fn stream<W: AsyncWrite + Unpin>(out: &mut W, args: &Args, paced: bool, limit: Option<u32>) -> Result<u64> {
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let faults = Faults::from(args);
    let rate = args.packet_rate.max(1);
    let mut pace = time::interval(Duration::from_secs_f64(1.0 / rate as f64));
    let mut campaign = Campaign::new(args.ecs.clone());
    let mut sent = 0u64;
    let mut images = 0u32;

    loop {
        let image = campaign.next_image(&mut rng);
        let declared = image.packets.len() - 1;
        let packets = degrade(image.packets, faults, &mut rng);
        info!(
            "📷 EC {} slot {} {:?} time tag {}: {} packets declared, {} sent",
            image.ec,
            image.slot,
            image.image_type,
            image.time_tag,
            declared,
            packets.len() - 1
        );

        for packet in packets {
            if paced {
                pace.tick().await;
            }
            out.write_all(&packet).await?;
            sent += 1;
            if paced && sent % rate as u64 == 0 {
                for &ec in &args.ecs {
                    out.write_all(&campaign.housekeeping(ec, image.slot)).await?;
                }
            }
        }
        // housekeeping right after the last data packet ends the transmission
        out.write_all(&campaign.housekeeping(image.ec, image.slot)).await?;
        out.flush().await?;

        images += 1;
        if limit.is_some_and(|limit| images >= limit) {
            break;
        }
        if paced {
            let mut heartbeat = time::interval(Duration::from_secs(1));
            for _ in 0..args.image_period_secs {
                heartbeat.tick().await;
                for &ec in &args.ecs {
                    out.write_all(&campaign.housekeeping(ec, image.slot)).await?;
                }
                out.flush().await?;
            }
        }
    }
    Ok(sent)
}

async fn serve(args: Args) -> Result<()> {
    let listener = TcpListener::bind(&args.listen).await?;
    info!("🛰️  Telemetry simulator listening on {}", args.listen);
    info!(
        "   ECs {:?}, loss {:.1}%, duplicates {:.1}%, corruption {:.1}%",
        args.ecs,
        args.loss * 100.0,
        args.duplicate * 100.0,
        args.corrupt * 100.0
    );

    loop {
        let (mut socket, peer) = listener.accept().await?;
        info!("Client connected: {}", peer);
        let args = args.clone();
        tokio::spawn(async move {
            match stream(&mut socket, &args, true, None).await {
                Ok(sent) => info!("Client {} done after {} packets", peer, sent),
                Err(e) => warn!("Client {} disconnected: {}", peer, e),
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "telemetry_sim=info,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.ecs.is_empty() {
        bail!("at least one --ec is required");
    }

    match &args.capture {
        Some(path) => {
            let file = tokio::fs::File::create(path).await?;
            let mut out = BufWriter::new(file);
            let sent = stream(&mut out, &args, false, Some(args.images)).await?;
            out.flush().await?;
            info!("💾 Wrote {} images ({} packets) to {}", args.images, sent, path.display());
            Ok(())
        }
        None => serve(args).await,
    }
}
