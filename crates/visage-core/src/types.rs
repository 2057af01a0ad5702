//! Shared value types for detection, recognition and matching.

/// A face embedding vector: fixed-length, L2-normalized, recognizer-dependent
/// length (128 for one backend, higher for another — treat the length as
/// model-dictated and never assume a constant).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A candidate face rectangle in pixel coordinates, corner form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Clamp this box to `[0, img_w] x [0, img_h]`.
    pub fn clamp(&self, img_w: f32, img_h: f32) -> Self {
        Self {
            x0: self.x0.clamp(0.0, img_w),
            y0: self.y0.clamp(0.0, img_h),
            x1: self.x1.clamp(0.0, img_w),
            y1: self.y1.clamp(0.0, img_h),
        }
    }

    /// Scale this box around its own center by `factor`, producing the wider
    /// "context box" the liveness check crops. Does not clamp.
    pub fn scaled_centered(&self, factor: f32) -> Self {
        let cx = (self.x0 + self.x1) / 2.0;
        let cy = (self.y0 + self.y1) / 2.0;
        let half_w = self.width() * factor / 2.0;
        let half_h = self.height() * factor / 2.0;
        Self {
            x0: cx - half_w,
            y0: cy - half_h,
            x1: cx + half_w,
            y1: cy + half_h,
        }
    }
}

/// A 5-point landmark set in SCRFD convention: left eye, right eye, nose,
/// left mouth corner, right mouth corner.
pub type Landmarks = [(f32, f32); 5];

/// A single detected face candidate.
#[derive(Debug, Clone)]
pub struct Face {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// Outcome of comparing a probe embedding against the gallery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    pub enroll_id: i64,
    pub score: f32,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            enroll_id: 0,
            score: 0.0,
        }
    }
}

/// Metadata about one enrolled user, kept alongside the gallery embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub enroll_id: i64,
    pub name: String,
    pub has_face: bool,
    pub is_active: bool,
}

/// Result of the optional liveness check, published for telemetry fan-out.
#[derive(Debug, Clone, Copy)]
pub struct LivenessRecord {
    pub real_prob: f32,
    pub is_live: bool,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_clamp_shrinks_to_image_bounds() {
        let bbox = BoundingBox {
            x0: -10.0,
            y0: -10.0,
            x1: 200.0,
            y1: 200.0,
        };
        let clamped = bbox.clamp(100.0, 80.0);
        assert_eq!(clamped.x0, 0.0);
        assert_eq!(clamped.y0, 0.0);
        assert_eq!(clamped.x1, 100.0);
        assert_eq!(clamped.y1, 80.0);
    }

    #[test]
    fn bbox_clamp_can_produce_zero_area() {
        let bbox = BoundingBox {
            x0: 150.0,
            y0: 150.0,
            x1: 200.0,
            y1: 200.0,
        };
        let clamped = bbox.clamp(100.0, 100.0);
        assert_eq!(clamped.area(), 0.0);
    }

    #[test]
    fn scaled_centered_keeps_center() {
        let bbox = BoundingBox {
            x0: 40.0,
            y0: 40.0,
            x1: 60.0,
            y1: 60.0,
        };
        let scaled = bbox.scaled_centered(2.0);
        assert!((scaled.x0 - 30.0).abs() < 1e-6);
        assert!((scaled.x1 - 70.0).abs() < 1e-6);
        let cx_before = (bbox.x0 + bbox.x1) / 2.0;
        let cx_after = (scaled.x0 + scaled.x1) / 2.0;
        assert!((cx_before - cx_after).abs() < 1e-6);
    }
}
