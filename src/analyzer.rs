//! Face detection and embedding.
//!
//! The ONNX implementation pairs a lightweight UltraFace detector with
//! an ArcFace embedder, both running CPU-only through ort. Models are
//! loaded once at worker startup from hot storage; fetching them is the
//! bootstrap tooling's job, so a missing file is a startup error here.

use anyhow::{anyhow, bail, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

pub const DETECTOR_MODEL_FILE: &str = "ultraface-320.onnx";
pub const EMBEDDER_MODEL_FILE: &str = "arcface-resnet100.onnx";

/// Pixel-space face rectangle.
#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// One detected face with its 512-dim unit-norm embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub score: f32,
    pub embedding: Vec<f32>,
}

/// Seam between the batch engine and the inference stack, so engine
/// behaviour can be exercised without model files.
pub trait FaceAnalyzer {
    fn analyze(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

pub struct OnnxFaceAnalyzer {
    detector: Session,
    embedder: Session,
    min_detection_score: f32,
}

impl OnnxFaceAnalyzer {
    /// Load both sessions from the hot models directory.
    pub fn load(models_dir: &Path, min_detection_score: f32) -> Result<Self> {
        let detector_path = models_dir.join(DETECTOR_MODEL_FILE);
        let embedder_path = models_dir.join(EMBEDDER_MODEL_FILE);
        for path in [&detector_path, &embedder_path] {
            if !path.exists() {
                bail!(
                    "model file missing: {} (place detector and embedder models in {})",
                    path.display(),
                    models_dir.display()
                );
            }
        }

        let detector = Session::builder()
            .map_err(|e| anyhow!(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!(e.to_string()))?
            .with_intra_threads(4)
            .map_err(|e| anyhow!(e.to_string()))?
            .commit_from_file(&detector_path)
            .map_err(|e| anyhow!(e.to_string()))?;
        let embedder = Session::builder()
            .map_err(|e| anyhow!(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!(e.to_string()))?
            .with_intra_threads(4)
            .map_err(|e| anyhow!(e.to_string()))?
            .commit_from_file(&embedder_path)
            .map_err(|e| anyhow!(e.to_string()))?;

        tracing::info!(dir = ?models_dir, "face models loaded (CPU)");
        Ok(Self {
            detector,
            embedder,
            min_detection_score,
        })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let boxes = run_detection(&mut self.detector, img, self.min_detection_score)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let (img_width, img_height) = img.dimensions();
        let mut faces = Vec::with_capacity(boxes.len());
        for (bbox, score) in boxes {
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }
            let crop = crop_with_margin(img, &bbox, img_width, img_height);
            match run_embedding(&mut self.embedder, &crop) {
                Ok(embedding) => faces.push(DetectedFace {
                    bbox,
                    score,
                    embedding,
                }),
                Err(e) => {
                    // A face we cannot embed cannot be matched; drop it
                    // rather than feeding a zero vector to the matcher.
                    tracing::warn!(error = %e, "embedding failed for a detected face");
                }
            }
        }
        Ok(faces)
    }
}

/// UltraFace forward pass: 320x240 input, scores + boxes outputs.
fn run_detection(
    session: &mut Session,
    img: &DynamicImage,
    min_score: f32,
) -> Result<Vec<(FaceBox, f32)>> {
    const INPUT_WIDTH: u32 = 320;
    const INPUT_HEIGHT: u32 = 240;
    const NMS_IOU_THRESHOLD: f32 = 0.3;

    let (orig_width, orig_height) = img.dimensions();
    let resized = img.resize_exact(INPUT_WIDTH, INPUT_HEIGHT, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, (pixel - 127) / 128 per channel
    let plane = (INPUT_WIDTH * INPUT_HEIGHT) as usize;
    let mut input = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH as usize + x as usize;
        input[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let tensor = Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize],
        input.into_boxed_slice(),
    ))?;
    let outputs = session.run(ort::inputs!["input" => tensor])?;

    let scores_value = outputs
        .get("scores")
        .ok_or_else(|| anyhow!("detector produced no scores output"))?;
    let boxes_value = outputs
        .get("boxes")
        .ok_or_else(|| anyhow!("detector produced no boxes output"))?;
    let (scores_shape, scores) = scores_value.try_extract_tensor::<f32>()?;
    let (_, boxes) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2], boxes: [1, anchors, 4] normalized corners
    let anchors = scores_shape[1] as usize;
    let mut candidates = Vec::new();
    for i in 0..anchors {
        let score = scores[i * 2 + 1];
        if score < min_score {
            continue;
        }
        let x1 = (boxes[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes[i * 4 + 3] * orig_height as f32) as i32;
        candidates.push((
            FaceBox {
                x: x1.max(0),
                y: y1.max(0),
                width: (x2 - x1).max(1),
                height: (y2 - y1).max(1),
            },
            score,
        ));
    }

    Ok(suppress_overlaps(candidates, NMS_IOU_THRESHOLD))
}

/// Non-maximum suppression, keeping the highest-scoring of any
/// overlapping pair.
fn suppress_overlaps(mut boxes: Vec<(FaceBox, f32)>, iou_threshold: f32) -> Vec<(FaceBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(FaceBox, f32)> = Vec::new();
    'outer: for candidate in boxes {
        for kept in &keep {
            if intersection_over_union(&candidate.0, &kept.0) > iou_threshold {
                continue 'outer;
            }
        }
        keep.push(candidate);
    }
    keep
}

fn intersection_over_union(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let union = (a.width * a.height + b.width * b.height) as f32 - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop the face with a 20% margin for the embedder.
fn crop_with_margin(
    img: &DynamicImage,
    bbox: &FaceBox,
    img_width: u32,
    img_height: u32,
) -> DynamicImage {
    let margin_x = (bbox.width as f32 * 0.2) as i32;
    let margin_y = (bbox.height as f32 * 0.2) as i32;

    let x = (bbox.x - margin_x).max(0) as u32;
    let y = (bbox.y - margin_y).max(0) as u32;
    let w = ((bbox.width + margin_x * 2) as u32).min(img_width.saturating_sub(x));
    let h = ((bbox.height + margin_y * 2) as u32).min(img_height.saturating_sub(y));

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// ArcFace forward pass: 112x112 input, L2-normalised 512-dim output.
fn run_embedding(session: &mut Session, face: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: u32 = 112;

    let resized = face.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut input = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE as usize + x as usize;
        input[idx] = (pixel[0] as f32 - 127.5) / 127.5;
        input[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
        input[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
    }

    let tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
        input.into_boxed_slice(),
    ))?;
    let outputs = session.run(ort::inputs!["data" => tensor])?;

    let first_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("embedder produced no output"))?;
    let (_, raw) = first_output.1.try_extract_tensor::<f32>()?;

    let embedding: Vec<f32> = raw.to_vec();
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= 0.0 {
        bail!("embedder produced a zero vector");
    }
    Ok(embedding.iter().map(|x| x / norm).collect())
}
