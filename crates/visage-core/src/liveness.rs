//! Anti-spoof liveness check: crop a wider context box, run a dedicated
//! CNN, softmax its output, and treat index 1 as the "real" probability.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and screen replays presented to the
//!   detector whose texture/depth cues the anti-spoof network was trained
//!   to separate from a live capture.
//! - **Does not block:** adversarial displays or 3D masks crafted
//!   specifically against this network's decision boundary — the network
//!   is the only line of defense here, there is no secondary signal.

use image::{DynamicImage, GenericImageView};
use ndarray::{Array, IxDyn};
use ort::session::Session;
use thiserror::Error;

use crate::types::{BoundingBox, Face, LivenessRecord};

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("failed to load anti-spoof model: {0}")]
    Load(#[source] ort::Error),
    #[error("onnx inference failed: {0}")]
    Inference(#[from] ort::Error),
    #[error("anti-spoof model produced no output tensor")]
    MissingOutput,
    #[error("context box had zero area after clamping")]
    EmptyCrop,
}

/// Default minimum "real" probability below which a capture is rejected.
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.30;

/// Context box scale factor applied around the detected face box, per
/// spec.md §4.1 step 3.
const CONTEXT_SCALE: f32 = 2.7;
const ANTISPOOF_INPUT_SIZE: u32 = 112;

pub struct AntiSpoofModel {
    session: Session,
}

impl AntiSpoofModel {
    pub fn load(model_path: &str) -> Result<Self, LivenessError> {
        let session = Session::builder()
            .map_err(LivenessError::Load)?
            .commit_from_file(model_path)
            .map_err(LivenessError::Load)?;
        Ok(Self { session })
    }

    /// Run the anti-spoof check for `face` within `image`. Returns the
    /// "real" probability (softmax index 1) regardless of threshold — the
    /// caller decides pass/fail and is responsible for publishing the
    /// result to the telemetry slot.
    pub fn check(&mut self, image: &DynamicImage, face: &Face) -> Result<f32, LivenessError> {
        let (img_w, img_h) = image.dimensions();
        let context = face.bbox.scaled_centered(CONTEXT_SCALE).clamp(img_w as f32, img_h as f32);
        if context.area() <= 0.0 {
            return Err(LivenessError::EmptyCrop);
        }

        let crop = image.crop_imm(
            context.x0 as u32,
            context.y0 as u32,
            context.width().max(1.0) as u32,
            context.height().max(1.0) as u32,
        );
        let input = preprocess(&crop);
        let input_tensor = ort::value::Value::from_array(input)?;

        let outputs = self.session.run(ort::inputs![input_tensor])?;
        let output_value = outputs
            .get("output")
            .or_else(|| outputs.get("output0"))
            .ok_or(LivenessError::MissingOutput)?;
        let (_, data) = output_value.try_extract_tensor::<f32>()?;
        let logits = data.to_vec();
        if logits.len() < 2 {
            return Err(LivenessError::MissingOutput);
        }

        let probs = softmax(&logits);
        Ok(probs[1])
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|v| v / sum).collect()
    } else {
        vec![0.0; logits.len()]
    }
}

/// Normalize to [0,1] with an R/B channel swap, per spec.md §4.1 step 3.
fn preprocess(crop: &DynamicImage) -> Array<f32, IxDyn> {
    let resized = crop.resize_exact(
        ANTISPOOF_INPUT_SIZE,
        ANTISPOOF_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();
    let size = ANTISPOOF_INPUT_SIZE as usize;
    let mut input = Array::zeros(IxDyn(&[1, 3, size, size]));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        // channel swap: BGR order for this network's training pipeline.
        input[[0, 0, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
        input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        input[[0, 2, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
    }
    input
}

pub fn build_record(real_prob: f32, threshold: f32, elapsed_ms: u64) -> LivenessRecord {
    LivenessRecord {
        real_prob,
        is_live: real_prob >= threshold,
        elapsed_ms,
    }
}

/// Widen and clamp a detected face box into the liveness context box,
/// exposed so callers (and tests) can reason about crop geometry without
/// an actual model.
pub fn context_box(face_bbox: BoundingBox, img_w: u32, img_h: u32) -> BoundingBox {
    face_bbox.scaled_centered(CONTEXT_SCALE).clamp(img_w as f32, img_h as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn softmax_prefers_larger_logit() {
        let probs = softmax(&[0.1, 5.0]);
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn build_record_rejects_below_threshold() {
        let record = build_record(0.20, DEFAULT_LIVENESS_THRESHOLD, 12);
        assert!(!record.is_live);
        assert_eq!(record.real_prob, 0.20);
    }

    #[test]
    fn build_record_accepts_at_threshold() {
        let record = build_record(0.30, DEFAULT_LIVENESS_THRESHOLD, 5);
        assert!(record.is_live);
    }

    #[test]
    fn context_box_is_larger_than_face_box() {
        let face = BoundingBox {
            x0: 100.0,
            y0: 100.0,
            x1: 140.0,
            y1: 140.0,
        };
        let ctx = context_box(face, 1000, 1000);
        assert!(ctx.width() > face.width());
        assert!(ctx.height() > face.height());
    }
}
