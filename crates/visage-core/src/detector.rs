//! SCRFD-style face detection: decode -> NCHW tensor -> ONNX forward -> boxes.

use image::{DynamicImage, GenericImageView};
use ndarray::{Array, IxDyn};
use ort::session::Session;
use thiserror::Error;

use crate::types::{BoundingBox, Face};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to load detector model: {0}")]
    Load(#[source] ort::Error),
    #[error("onnx inference failed: {0}")]
    Inference(#[from] ort::Error),
    #[error("detector produced no output tensor")]
    MissingOutput,
}

/// Minimum confidence for a detection to be considered at all. Candidates
/// below this are never returned by `detect`, so callers that only want the
/// single best face do not need to repeat the check.
pub const MIN_DETECTION_CONFIDENCE: f32 = 0.6;

const DETECTOR_INPUT_SIZE: u32 = 640;

pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        let session = Session::builder()
            .map_err(DetectorError::Load)?
            .commit_from_file(model_path)
            .map_err(DetectorError::Load)?;
        Ok(Self { session })
    }

    /// Detect candidate faces in `image`, already decoded. Only candidates
    /// at or above [`MIN_DETECTION_CONFIDENCE`] are returned, sorted by
    /// descending confidence.
    pub fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Face>, DetectorError> {
        let (orig_w, orig_h) = image.dimensions();
        let input = preprocess(image);
        let input_tensor = ort::value::Value::from_array(input)?;

        let outputs = self.session.run(ort::inputs![input_tensor])?;
        let output_value = outputs
            .get("output0")
            .or_else(|| outputs.get("output"))
            .or_else(|| outputs.get("boxes"))
            .ok_or(DetectorError::MissingOutput)?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;
        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output =
            Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec()).map_err(|_| DetectorError::MissingOutput)?;

        let scale_x = orig_w as f32 / DETECTOR_INPUT_SIZE as f32;
        let scale_y = orig_h as f32 / DETECTOR_INPUT_SIZE as f32;
        let num_predictions = *output.shape().get(2).unwrap_or(&0);

        let mut faces = Vec::new();
        for i in 0..num_predictions {
            let confidence = output[[0, 4, i]];
            if confidence < MIN_DETECTION_CONFIDENCE {
                continue;
            }
            let cx = output[[0, 0, i]];
            let cy = output[[0, 1, i]];
            let w = output[[0, 2, i]];
            let h = output[[0, 3, i]];

            let bbox = BoundingBox {
                x0: (cx - w / 2.0) * scale_x,
                y0: (cy - h / 2.0) * scale_y,
                x1: (cx + w / 2.0) * scale_x,
                y1: (cy + h / 2.0) * scale_y,
            };

            faces.push(Face {
                bbox,
                confidence,
                landmarks: None,
            });
        }

        faces.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        Ok(faces)
    }
}

/// Select the single best candidate per spec.md §4.1 step 2: highest
/// confidence, clamped to image bounds, rejected if the clamped box has
/// zero area.
pub fn pick_best(faces: &[Face], img_w: u32, img_h: u32) -> Option<Face> {
    let best = faces.first()?;
    let clamped = best.bbox.clamp(img_w as f32, img_h as f32);
    if clamped.area() <= 0.0 {
        return None;
    }
    Some(Face {
        bbox: clamped,
        confidence: best.confidence,
        landmarks: best.landmarks,
    })
}

fn preprocess(image: &DynamicImage) -> Array<f32, IxDyn> {
    let resized = image.resize_exact(
        DETECTOR_INPUT_SIZE,
        DETECTOR_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();
    let size = DETECTOR_INPUT_SIZE as usize;
    let mut input = Array::zeros(IxDyn(&[1, 3, size, size]));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_best_rejects_zero_area_after_clamp() {
        let faces = vec![Face {
            bbox: BoundingBox {
                x0: 150.0,
                y0: 150.0,
                x1: 200.0,
                y1: 200.0,
            },
            confidence: 0.9,
            landmarks: None,
        }];
        assert!(pick_best(&faces, 100, 100).is_none());
    }

    #[test]
    fn pick_best_takes_highest_confidence_first_entry() {
        let faces = vec![
            Face {
                bbox: BoundingBox {
                    x0: 0.0,
                    y0: 0.0,
                    x1: 50.0,
                    y1: 50.0,
                },
                confidence: 0.95,
                landmarks: None,
            },
            Face {
                bbox: BoundingBox {
                    x0: 10.0,
                    y0: 10.0,
                    x1: 60.0,
                    y1: 60.0,
                },
                confidence: 0.7,
                landmarks: None,
            },
        ];
        let best = pick_best(&faces, 200, 200).unwrap();
        assert!((best.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn pick_best_none_when_no_candidates() {
        assert!(pick_best(&[], 100, 100).is_none());
    }
}
