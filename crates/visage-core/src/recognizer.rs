//! ArcFace-style embedding extraction: crop -> 112x112 -> normalize -> ONNX forward -> L2-normalize.

use image::{DynamicImage, GenericImageView};
use ndarray::{Array, IxDyn};
use ort::session::Session;
use thiserror::Error;

use crate::types::{Embedding, Face};

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("failed to load recognizer model: {0}")]
    Load(#[source] ort::Error),
    #[error("onnx inference failed: {0}")]
    Inference(#[from] ort::Error),
    #[error("recognizer produced no output tensor")]
    MissingOutput,
    #[error("face crop had zero area")]
    EmptyCrop,
}

const RECOGNIZER_INPUT_SIZE: u32 = 112;

pub struct FaceRecognizer {
    session: Session,
    model_version: String,
}

impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        let session = Session::builder()
            .map_err(RecognizerError::Load)?
            .commit_from_file(model_path)
            .map_err(RecognizerError::Load)?;
        let model_version = std::path::Path::new(model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self {
            session,
            model_version,
        })
    }

    /// Crop `face`'s bounding box out of `image`, resize to 112x112,
    /// normalize, run the recognizer and L2-normalize the resulting vector.
    pub fn extract(&mut self, image: &DynamicImage, face: &Face) -> Result<Embedding, RecognizerError> {
        let (img_w, img_h) = image.dimensions();
        let bbox = face.bbox.clamp(img_w as f32, img_h as f32);
        if bbox.area() <= 0.0 {
            return Err(RecognizerError::EmptyCrop);
        }

        let crop = image.crop_imm(
            bbox.x0 as u32,
            bbox.y0 as u32,
            bbox.width().max(1.0) as u32,
            bbox.height().max(1.0) as u32,
        );
        let input = preprocess(&crop);
        let input_tensor = ort::value::Value::from_array(input)?;

        let outputs = self.session.run(ort::inputs![input_tensor])?;
        let output_value = outputs
            .get("output")
            .or_else(|| outputs.get("output0"))
            .or_else(|| outputs.get("embedding"))
            .ok_or(RecognizerError::MissingOutput)?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;
        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output = Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())
            .map_err(|_| RecognizerError::MissingOutput)?;

        let dim = *output.shape().get(1).unwrap_or(&0);
        let mut values: Vec<f32> = (0..dim).map(|i| output[[0, i]]).collect();
        l2_normalize(&mut values);

        Ok(Embedding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }
}

/// L2-normalize `values` in place. No-op on a zero vector.
pub fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

fn preprocess(crop: &DynamicImage) -> Array<f32, IxDyn> {
    let resized = crop.resize_exact(
        RECOGNIZER_INPUT_SIZE,
        RECOGNIZER_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();
    let size = RECOGNIZER_INPUT_SIZE as usize;
    let mut input = Array::zeros(IxDyn(&[1, 3, size, size]));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        input[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 / 127.5) - 1.0;
        input[[0, 1, y as usize, x as usize]] = (pixel[1] as f32 / 127.5) - 1.0;
        input[[0, 2, y as usize, x as usize]] = (pixel[2] as f32 / 127.5) - 1.0;
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector_is_noop() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
