//! Deliverable compression with a locked output policy.
//!
//! Every staged artifact is an sRGB JPEG, quality 85, long edge at
//! most 2048 px (never upscaled), with all metadata stripped: the
//! encoder writes pixels only, so EXIF/XMP/IPTC and embedded profiles
//! do not survive. Identical input bytes produce identical output
//! bytes.

use anyhow::Result;
use image::DynamicImage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::OutputConfig;
use crate::decode;

/// Downscale so the long edge fits the cap; small images pass through.
fn fit_long_edge(img: DynamicImage, max_long_edge: u32) -> DynamicImage {
    let long_edge = img.width().max(img.height());
    if long_edge <= max_long_edge {
        return img;
    }
    let scale = max_long_edge as f64 / long_edge as f64;
    let new_width = (img.width() as f64 * scale) as u32;
    let new_height = (img.height() as f64 * scale) as u32;
    img.resize_exact(
        new_width.max(1),
        new_height.max(1),
        image::imageops::FilterType::Lanczos3,
    )
}

/// Encode an already-decoded image to the staged path.
pub fn write_artifact(img: DynamicImage, staged_path: &Path, output: &OutputConfig) -> Result<()> {
    if let Some(parent) = staged_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let img = fit_long_edge(img, output.max_long_edge);
    let rgb = img.to_rgb8();

    let mut writer = BufWriter::new(File::create(staged_path)?);
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, output.jpeg_quality);
    rgb.write_with_encoder(encoder)?;
    writer.flush()?;
    Ok(())
}

/// Produce the single staged artifact for a source image.
pub fn stage_artifact(
    source_path: &Path,
    extension: &str,
    staged_path: &Path,
    output: &OutputConfig,
) -> Result<()> {
    let img = decode::load_for_delivery(source_path, extension)?;
    write_artifact(img, staged_path, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn long_edge_is_capped_and_aspect_kept() {
        let resized = fit_long_edge(gradient(4096, 1024), 2048);
        assert_eq!(resized.width(), 2048);
        assert_eq!(resized.height(), 512);

        let tall = fit_long_edge(gradient(1000, 4000), 2048);
        assert_eq!(tall.height(), 2048);
        assert_eq!(tall.width(), 512);
    }

    #[test]
    fn small_images_are_never_upscaled() {
        let img = fit_long_edge(gradient(640, 480), 2048);
        assert_eq!((img.width(), img.height()), (640, 480));
    }

    #[test]
    fn artifact_is_a_decodable_jpeg() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staging").join("1").join("7.jpg");
        write_artifact(gradient(320, 200), &staged, &OutputConfig::default()).unwrap();

        let reloaded = image::open(&staged).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (320, 200));
    }

    #[test]
    fn same_input_yields_identical_bytes() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src.jpg");
        gradient(600, 400).save(&source).unwrap();

        let first = dir.path().join("a.jpg");
        let second = dir.path().join("b.jpg");
        let output = OutputConfig::default();
        stage_artifact(&source, ".jpg", &first, &output).unwrap();
        stage_artifact(&source, ".jpg", &second, &output).unwrap();

        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }
}
