//! Fragment fixtures for unit tests

use chrono::{DateTime, Duration, TimeZone, Utc};

use waps_packet::{ChannelKey, ImageType, Integrity, StreamOrigin, WapsFragment};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 14, 9, 30, 0).unwrap()
}

fn fragment(aec: u8, slot: u8) -> WapsFragment {
    WapsFragment {
        key: ChannelKey::from_ids(aec, slot).unwrap(),
        ec_address: 170 + aec,
        image_type: ImageType::Infrared,
        start_marker: false,
        index: 0,
        total_hint: None,
        payload: Vec::new(),
        integrity: Integrity::Verified,
        time_tag: 0,
        onboard_time: base_time(),
        received_at: base_time(),
        origin: StreamOrigin::Live,
    }
}

pub fn start(aec: u8, slot: u8, count: u16) -> WapsFragment {
    WapsFragment {
        start_marker: true,
        total_hint: Some(count),
        ..fragment(aec, slot)
    }
}

pub fn data(aec: u8, slot: u8, index: u16, payload: &[u8]) -> WapsFragment {
    WapsFragment {
        index,
        payload: payload.to_vec(),
        ..fragment(aec, slot)
    }
}

pub trait At {
    /// Arrival `secs` after the base time
    fn at(self, secs: i64) -> Self;
    fn tagged(self, time_tag: i32) -> Self;
}

impl At for WapsFragment {
    fn at(mut self, secs: i64) -> Self {
        self.received_at = base_time() + Duration::seconds(secs);
        self
    }

    fn tagged(mut self, time_tag: i32) -> Self {
        self.time_tag = time_tag;
        self
    }
}
