//! Store diagnostics
//!
//! Replays the store through a single-threaded registry and prints what
//! the engine makes of it, or lists the stored fragments of one
//! generation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;

use image_reconstruction::{ChannelRegistry, GenerationSummary, ReconstructionPolicy};
use replay_store::StoredFragment;
use waps_packet::ChannelKey;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportFilter {
    pub key: Option<ChannelKey>,
    pub generation: Option<u32>,
}

pub fn write_report(
    records: &[StoredFragment],
    policy: ReconstructionPolicy,
    filter: ReportFilter,
    out: &mut impl Write,
) -> Result<()> {
    if let (Some(key), Some(generation)) = (filter.key, filter.generation) {
        return write_generation(records, key, generation, out);
    }

    let mut registry = ChannelRegistry::new(policy);
    let mut events: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut mismatched = 0;
    for record in records {
        let (generation, emitted) = registry.replay(&record.fragment)?;
        if generation.map(|g| g.0) != Some(record.generation) {
            mismatched += 1;
        }
        for event in emitted {
            *events.entry(event.kind()).or_default() += 1;
        }
    }

    let as_of = records
        .iter()
        .map(|r| r.fragment.received_at)
        .max()
        .unwrap_or_else(Utc::now);
    writeln!(
        out,
        "{} stored fragments, {} channels, as of {}",
        records.len(),
        registry.len(),
        as_of.format(TIME_FORMAT)
    )?;
    if mismatched > 0 {
        writeln!(
            out,
            "WARNING: {} fragments replay into a different generation than stored",
            mismatched
        )?;
    }
    for (kind, count) in &events {
        writeln!(out, "  {kind}: {count}")?;
    }

    for snapshot in registry.snapshots(as_of) {
        if filter.key.is_some_and(|key| key != snapshot.key) {
            continue;
        }
        writeln!(out)?;
        writeln!(
            out,
            "{} ({} generations)",
            snapshot.key, snapshot.generations_opened
        )?;
        for summary in snapshot.history.iter().chain(&snapshot.current) {
            writeln!(out, "  {}", summary_line(summary))?;
        }
        if let Some(gaps) = snapshot.gaps.filter(|g| !g.is_empty()) {
            let list = |ranges: &[image_reconstruction::FragmentRange]| {
                ranges.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
            };
            writeln!(
                out,
                "    missing: confirmed {} pending {}",
                list(&gaps.confirmed),
                list(&gaps.pending)
            )?;
        }
    }
    Ok(())
}

fn summary_line(summary: &GenerationSummary) -> String {
    format!(
        "{} {:?} {} time tag {} fragments {}/{} first {} last {}",
        summary.generation,
        summary.state,
        summary.image_type.camera(),
        summary.time_tag,
        summary.accepted,
        summary.total.map_or("?".to_string(), |t| t.to_string()),
        fmt_time(summary.first_seen),
        fmt_time(summary.last_update)
    )
}

fn fmt_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn write_generation(
    records: &[StoredFragment],
    key: ChannelKey,
    generation: u32,
    out: &mut impl Write,
) -> Result<()> {
    let matching: Vec<&StoredFragment> = records
        .iter()
        .filter(|r| r.fragment.key == key && r.generation == generation)
        .collect();
    writeln!(
        out,
        "{} generation #{}: {} stored fragments",
        key,
        generation,
        matching.len()
    )?;
    for record in matching {
        let f = &record.fragment;
        let what = if f.start_marker {
            format!("start, {} packets declared", f.total_hint.unwrap_or(0))
        } else {
            format!("index {}, {} bytes", f.index, f.payload.len())
        };
        writeln!(
            out,
            "  #{:<6} {:<28} {:?} {:?} received {}",
            record.sequence,
            what,
            f.integrity,
            f.origin,
            fmt_time(f.received_at)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use waps_packet::{ImageType, Integrity, StreamOrigin, WapsFragment};

    fn record(sequence: u64, generation: u32, index: u16, start: Option<u16>) -> StoredFragment {
        let at = Utc.with_ymd_and_hms(2024, 2, 20, 14, 0, sequence as u32).unwrap();
        StoredFragment {
            sequence,
            generation,
            fragment: WapsFragment {
                key: ChannelKey::from_ids(1, 2).unwrap(),
                ec_address: 171,
                image_type: ImageType::Infrared,
                start_marker: start.is_some(),
                index,
                total_hint: start,
                payload: if start.is_some() { Vec::new() } else { vec![1; 160] },
                integrity: Integrity::Verified,
                time_tag: 10,
                onboard_time: at,
                received_at: at,
                origin: StreamOrigin::Live,
            },
        }
    }

    fn render(records: &[StoredFragment], filter: ReportFilter) -> String {
        let mut out = Vec::new();
        write_report(records, ReconstructionPolicy::default(), filter, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_channel_summary() {
        let records = vec![record(1, 1, 0, Some(3)), record(2, 1, 0, None), record(3, 1, 2, None)];
        let text = render(&records, ReportFilter::default());
        assert!(text.starts_with("3 stored fragments, 1 channels"));
        assert!(text.contains("generation_opened: 1"));
        assert!(text.contains("AEC1/S2 (1 generations)"));
        assert!(text.contains("#1 Open FLIR time tag 10 fragments 2/3"));
        assert!(text.contains("missing: confirmed [1] pending "));
        assert!(!text.contains("WARNING"));
    }

    #[test]
    fn test_generation_listing() {
        let records = vec![record(1, 1, 0, Some(2)), record(2, 1, 1, None), record(3, 2, 0, None)];
        let filter = ReportFilter {
            key: ChannelKey::from_ids(1, 2),
            generation: Some(1),
        };
        let text = render(&records, filter);
        assert!(text.starts_with("AEC1/S2 generation #1: 2 stored fragments"));
        assert!(text.contains("start, 2 packets declared"));
        assert!(text.contains("index 1, 160 bytes"));
    }

    #[test]
    fn test_late_fragment_stays_out_of_abandoned_generation() {
        let mut late = record(3, 1, 2, None);
        late.fragment.received_at += chrono::Duration::minutes(601);
        let records = vec![record(1, 1, 0, Some(3)), record(2, 1, 0, None), late];
        let text = render(&records, ReportFilter::default());
        assert!(text.contains("generation_abandoned: 1"));
        assert!(text.contains("anomaly: 1"));
        assert!(text.contains("#1 Abandoned FLIR time tag 10 fragments 1/3"));
        assert!(!text.contains("WARNING"));
    }

    #[test]
    fn test_generation_mismatch_is_flagged() {
        let records = vec![record(1, 4, 0, Some(2))];
        assert!(render(&records, ReportFilter::default()).contains("WARNING: 1 fragments"));
    }
}
