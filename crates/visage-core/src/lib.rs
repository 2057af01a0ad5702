//! Detection, recognition, liveness and gallery primitives shared between
//! the daemon and any future client. Free of async-runtime and storage
//! dependencies so it can be exercised in isolation.

pub mod detector;
pub mod gallery;
pub mod liveness;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use detector::{pick_best, DetectorError, FaceDetector, MIN_DETECTION_CONFIDENCE};
pub use gallery::Gallery;
pub use liveness::{AntiSpoofModel, LivenessError, DEFAULT_LIVENESS_THRESHOLD};
pub use matcher::{CosineMatcher, Matcher};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use types::{BoundingBox, Embedding, Face, Landmarks, LivenessRecord, MatchResult, UserInfo};

use std::path::PathBuf;

/// Default directory the daemon looks for ONNX models in, mirroring
/// `visage-cli setup`'s own default.
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/accessd/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("accessd/models")
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
