//! Image file sink
//!
//! uCAM images are stored as received (JPEG). FLIR images carry 480 bytes
//! of camera telemetry followed by an 80x60 frame of big-endian 16-bit
//! pixels; they become a telemetry listing, a CSV pixel grid and a
//! normalised grayscale bitmap.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use image_reconstruction::ReconstructedImage;
use waps_packet::{AecMap, ImageType};

use crate::sinks::{Result, Sink, SinkError};

pub const FLIR_TM_LEN: usize = 480;
pub const FLIR_WIDTH: usize = 80;
pub const FLIR_HEIGHT: usize = 60;
pub const FLIR_DATA_LEN: usize = FLIR_WIDTH * FLIR_HEIGHT * 2;

const BMP_HEADER_LEN: usize = 54;
const MAX_VERSIONS: u32 = 999;

pub struct ImageFileSink {
    output: PathBuf,
    aec_map: AecMap,
}

impl ImageFileSink {
    pub fn new(output: impl Into<PathBuf>, aec_map: AecMap) -> Self {
        Self {
            output: output.into(),
            aec_map,
        }
    }

    /// File stem without version suffix or extension
    pub fn base_name(&self, image: &ReconstructedImage) -> String {
        let position = self
            .aec_map
            .position(image.key.aec)
            .map_or_else(|| format!("ec_{}", image.ec_address), str::to_string);
        format!(
            "{}_{}_{}_m{}_{}_g{}_{}",
            position,
            image.image_type.camera(),
            image.onboard_start.format("%Y%m%d_%H%M%S"),
            image.key.slot.wire(),
            image.time_tag,
            image.generation.0,
            image.completeness_percent()
        )
    }

    pub fn date_dir(&self, image: &ReconstructedImage) -> PathBuf {
        self.output
            .join(image.onboard_start.format("%Y%m%d").to_string())
    }

    /// Write the image files, returning the main file, or `None` when an
    /// identical copy is already on disk
    pub fn save(&self, image: &ReconstructedImage) -> Result<Option<PathBuf>> {
        let files = match image.image_type {
            ImageType::Color => {
                if !has_jpeg_header(&image.bytes) {
                    warn!("{} generation {} does not have a .JPG header", image.key, image.generation);
                }
                vec![(".jpg", image.bytes.clone())]
            }
            ImageType::Infrared => {
                if image.bytes.len() != FLIR_TM_LEN + FLIR_DATA_LEN {
                    warn!(
                        "{} generation {} has incorrect FLIR data size: {}",
                        image.key,
                        image.generation,
                        image.bytes.len()
                    );
                }
                let (tm, pixels) = split_flir(&image.bytes);
                vec![
                    (".bmp", flir_bmp(&pixels)),
                    ("_tm.txt", flir_tm_listing(&tm).into_bytes()),
                    ("_data.csv", flir_csv(&pixels).into_bytes()),
                ]
            }
        };

        let dir = self.date_dir(image);
        fs::create_dir_all(&dir)?;
        let base = self.base_name(image);

        let Some(stem) = free_stem(&dir, &base, &files)? else {
            info!("{} already saved", base);
            return Ok(None);
        };
        for (suffix, bytes) in &files {
            fs::write(dir.join(format!("{stem}{suffix}")), bytes)?;
        }
        let main = dir.join(format!("{}{}", stem, files[0].0));
        info!("💾 Saved {}", main.display());
        Ok(Some(main))
    }
}

impl Sink<ReconstructedImage> for ImageFileSink {
    fn name(&self) -> &'static str {
        "images"
    }

    fn write(&mut self, image: &ReconstructedImage) -> Result<()> {
        self.save(image).map(|_| ())
    }
}

/// First stem (`base`, `base_v2`, `base_v3`...) not holding different
/// content. `None` when one of them already holds exactly these files.
fn free_stem(dir: &Path, base: &str, files: &[(&str, Vec<u8>)]) -> Result<Option<String>> {
    for version in 1..=MAX_VERSIONS {
        let stem = if version == 1 {
            base.to_string()
        } else {
            format!("{base}_v{version}")
        };
        let mut present = 0;
        let mut identical = 0;
        for (suffix, bytes) in files {
            let path = dir.join(format!("{stem}{suffix}"));
            if path.exists() {
                present += 1;
                if fs::read(&path)? == *bytes {
                    identical += 1;
                }
            }
        }
        if present == 0 {
            return Ok(Some(stem));
        }
        if identical == files.len() {
            return Ok(None);
        }
    }
    Err(SinkError::Rejected(format!(
        "{MAX_VERSIONS} versions of {base} already exist"
    )))
}

pub fn has_jpeg_header(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8, 0xFF, 0xDB])
}

/// Telemetry words and pixels, zero-padded to the nominal frame
fn split_flir(bytes: &[u8]) -> (Vec<u16>, Vec<u16>) {
    let words: Vec<u16> = (0..(FLIR_TM_LEN + FLIR_DATA_LEN) / 2)
        .map(|i| {
            let hi = bytes.get(i * 2).copied().unwrap_or(0);
            let lo = bytes.get(i * 2 + 1).copied().unwrap_or(0);
            u16::from_be_bytes([hi, lo])
        })
        .collect();
    let (tm, pixels) = words.split_at(FLIR_TM_LEN / 2);
    (tm.to_vec(), pixels.to_vec())
}

/// One line per telemetry word: row letter, column and value
pub fn flir_tm_listing(tm: &[u16]) -> String {
    let mut out = String::with_capacity(tm.len() * 8);
    for (i, value) in tm.iter().enumerate() {
        let row = match i / FLIR_WIDTH {
            0 => 'A',
            1 => 'B',
            _ => 'C',
        };
        out.push_str(&format!("{}{}:{}\n", row, i % FLIR_WIDTH, value));
    }
    out
}

pub fn flir_csv(pixels: &[u16]) -> String {
    let mut out = String::with_capacity(pixels.len() * 6);
    for row in pixels.chunks(FLIR_WIDTH) {
        let line: Vec<String> = row.iter().map(u16::to_string).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

/// 80x60 32-bit bitmap, bottom-up rows, stretched to the frame's own range
pub fn flir_bmp(pixels: &[u16]) -> Vec<u8> {
    let data_len = FLIR_WIDTH * FLIR_HEIGHT * 4;
    let mut bmp = Vec::with_capacity(BMP_HEADER_LEN + data_len);

    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&((BMP_HEADER_LEN + data_len) as u32).to_le_bytes());
    bmp.extend_from_slice(&[0; 4]);
    bmp.extend_from_slice(&(BMP_HEADER_LEN as u32).to_le_bytes());
    bmp.extend_from_slice(&40u32.to_le_bytes());
    bmp.extend_from_slice(&(FLIR_WIDTH as i32).to_le_bytes());
    bmp.extend_from_slice(&(FLIR_HEIGHT as i32).to_le_bytes());
    bmp.extend_from_slice(&1u16.to_le_bytes());
    bmp.extend_from_slice(&32u16.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(&(data_len as u32).to_le_bytes());
    bmp.extend_from_slice(&3780i32.to_le_bytes());
    bmp.extend_from_slice(&3780i32.to_le_bytes());
    bmp.extend_from_slice(&[0; 8]);

    let min = pixels.iter().copied().min().unwrap_or(0);
    let max = pixels.iter().copied().max().unwrap_or(0);
    let range = u32::from(max - min);
    for y in (0..FLIR_HEIGHT).rev() {
        for x in 0..FLIR_WIDTH {
            let pixel = pixels.get(y * FLIR_WIDTH + x).copied().unwrap_or(min);
            let level = if range == 0 {
                0
            } else {
                (u32::from(pixel - min) * 255 / range) as u8
            };
            bmp.extend_from_slice(&[level, level, level, 255]);
        }
    }
    bmp
}
