//! Command stack sink
//!
//! Renders each retransmission request to a text file operators use to
//! re-request the missing packets from the EC.

use chrono::Utc;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use image_reconstruction::{MissingReason, RetransmissionRequest};
use waps_packet::AecMap;

use crate::sinks::{Result, Sink, SinkError};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct CommandStackSink {
    path: PathBuf,
    aec_map: AecMap,
}

impl CommandStackSink {
    pub fn new(path: impl Into<PathBuf>, aec_map: AecMap) -> Self {
        Self {
            path: path.into(),
            aec_map,
        }
    }

    pub fn render(&self, request: &RetransmissionRequest) -> Result<String> {
        let mut out = String::new();
        self.write_stack(&mut out, request)
            .map_err(|e| SinkError::Rejected(format!("command stack for {}: {}", request.key, e)))?;
        Ok(out)
    }

    fn write_stack<W: fmt::Write>(&self, out: &mut W, request: &RetransmissionRequest) -> fmt::Result {
        let position = self.position(request);
        let slot = request.key.slot.wire();
        let declared = request
            .total
            .map_or("unknown".to_string(), |t| t.to_string());

        writeln!(out, "Command stack for missing packet list re-request by")?;
        writeln!(out, "\tWAPS Image Extraction Software for WAPS payload")?;
        writeln!(out, "Request id: {}", request.id)?;
        writeln!(
            out,
            "Image initialization timestamp: {}",
            request.onboard_start.format(TIME_FORMAT)
        )?;
        writeln!(
            out,
            "Last received packet timestamp: {}",
            request.last_update.format(TIME_FORMAT)
        )?;
        writeln!(
            out,
            "Image: {} {}, time tag {}, generation {}, declared packets {}{}",
            request.key,
            request.image_type.camera(),
            request.time_tag,
            request.generation.0,
            declared,
            if request.final_request { ", final request" } else { "" }
        )?;
        writeln!(out)?;
        writeln!(out, "ec_address\tec_position\tmemory_slot\tmissing_packet\treason")?;
        for (index, reason) in request.missing_packets() {
            let reason = match reason {
                MissingReason::Lost => "lost",
                MissingReason::Corrupted => "corrupted",
            };
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                request.ec_address, position, slot, index, reason
            )?;
        }
        writeln!(out, "Total commands to issue: {}", request.missing_count())?;
        writeln!(out, "Generated by WAPS IES, {}", Utc::now().format(TIME_FORMAT))
    }

    fn position(&self, request: &RetransmissionRequest) -> String {
        self.aec_map
            .position(request.key.aec)
            .map_or_else(|| format!("ec_{}", request.ec_address), str::to_string)
    }

    pub fn save(&self, request: &RetransmissionRequest) -> Result<PathBuf> {
        fs::create_dir_all(&self.path)?;
        let stem = format!(
            "ec_{}_m{}_g{}_{}",
            request.ec_address,
            request.key.slot.wire(),
            request.generation.0,
            request.requested_at.format("%Y-%m-%d_%H%M%S")
        );
        let mut file = self.path.join(format!("{stem}.txt"));
        if file.exists() {
            file = self
                .path
                .join(format!("{}_{}.txt", stem, request.id.simple()));
        }
        fs::write(&file, self.render(request)?)?;
        info!(
            "📝 Command stack for {} {} m{} with {} missing packets: {}",
            request.ec_address,
            self.position(request),
            request.key.slot.wire(),
            request.missing_count(),
            file.display()
        );
        Ok(file)
    }
}

impl Sink<RetransmissionRequest> for CommandStackSink {
    fn name(&self) -> &'static str {
        "commands"
    }

    fn write(&mut self, request: &RetransmissionRequest) -> Result<()> {
        self.save(request).map(|_| ())
    }
}
