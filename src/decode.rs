//! Source image decoding.
//!
//! JPEGs open directly with EXIF orientation applied. ARW (Sony RAW)
//! files are demosaiced to 8-bit sRGB and written as a temporary JPEG
//! under the batch's temp directory, which is removed on every exit
//! path by an RAII guard.

use anyhow::{anyhow, Result};
use image::{DynamicImage, RgbImage};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

pub fn is_raw_extension(extension: &str) -> bool {
    extension.eq_ignore_ascii_case(".arw")
}

/// Per-batch temp directory for RAW intermediates. Dropping the guard
/// removes the directory and everything in it.
pub struct TempBatchDir {
    path: PathBuf,
}

impl TempBatchDir {
    pub fn create(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempBatchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = ?self.path, error = %e, "failed to remove temp dir");
            }
        }
    }
}

/// EXIF orientation tag value (1-8), defaulting to 1 when absent.
fn read_orientation(path: &Path) -> u32 {
    let Ok(file) = File::open(path) else {
        return 1;
    };
    let mut reader = BufReader::new(file);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut reader) else {
        return 1;
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

/// Apply an EXIF orientation to decoded pixels.
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Open a JPEG with its EXIF orientation applied.
pub fn open_oriented(path: &Path) -> Result<DynamicImage> {
    let img = image::open(path)?;
    Ok(apply_orientation(img, read_orientation(path)))
}

/// Demosaic an ARW to an in-memory 8-bit sRGB image (camera white
/// balance, sRGB gamma).
pub fn decode_raw(path: &Path) -> Result<DynamicImage> {
    let decoded = imagepipe::simple_decode_8bit(path, 0, 0)
        .map_err(|e| anyhow!("raw decode failed for {}: {e}", path.display()))?;
    let rgb = RgbImage::from_raw(decoded.width as u32, decoded.height as u32, decoded.data)
        .ok_or_else(|| anyhow!("raw decode produced a malformed buffer for {}", path.display()))?;
    Ok(DynamicImage::ImageRgb8(rgb))
}

/// Convert an ARW to a temporary JPEG for the analyzer and return its
/// path. The file lives inside the batch temp dir and is deleted when
/// the guard drops.
pub fn raw_to_temp_jpeg(raw_path: &Path, temp_dir: &TempBatchDir, image_id: i64) -> Result<PathBuf> {
    let img = decode_raw(raw_path)?;
    let temp_path = temp_dir.path().join(format!("{image_id}.jpg"));
    let mut writer = std::io::BufWriter::new(File::create(&temp_path)?);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, 90);
    img.write_with_encoder(encoder)?;
    writer.flush()?;
    Ok(temp_path)
}

/// Load the source image for face analysis. RAW goes through the temp
/// JPEG; JPEG is opened directly with orientation applied.
pub fn load_for_analysis(
    source_path: &Path,
    extension: &str,
    image_id: i64,
    temp_dir: &TempBatchDir,
) -> Result<DynamicImage> {
    if is_raw_extension(extension) {
        let temp_path = raw_to_temp_jpeg(source_path, temp_dir, image_id)?;
        Ok(image::open(&temp_path)?)
    } else {
        open_oriented(source_path)
    }
}

/// Load the source image for delivery compression, full quality.
pub fn load_for_delivery(source_path: &Path, extension: &str) -> Result<DynamicImage> {
    if is_raw_extension(extension) {
        decode_raw(source_path)
    } else {
        open_oriented(source_path)
    }
}
