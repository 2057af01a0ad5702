use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use visage_core::{
    AntiSpoofModel, CosineMatcher, DetectorError, Embedding, FaceDetector, FaceRecognizer,
    Gallery, LivenessError, LivenessRecord, Matcher, RecognizerError,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("liveness error: {0}")]
    Liveness(#[from] LivenessError),
    #[error("failed to decode image")]
    DecodeFailed,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("liveness check rejected the frame")]
    LivenessRejected,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the Router/Enrollment Controller to the engine thread.
enum EngineRequest {
    Embed {
        image: image::DynamicImage,
        check_liveness: bool,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
    MatchProbe {
        image: image::DynamicImage,
        check_liveness: bool,
        threshold: f32,
        reply: oneshot::Sender<Result<visage_core::MatchResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread. Cloning shares the request
/// channel and the gallery and liveness-telemetry handles; it does not
/// duplicate model state.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gallery: Arc<Gallery>,
    latest_liveness: Arc<RwLock<Option<LivenessRecord>>>,
}

impl EngineHandle {
    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Latest liveness score observed by any caller, for telemetry fan-out.
    pub fn latest_liveness(&self) -> Option<LivenessRecord> {
        *self.latest_liveness.read().expect("liveness slot poisoned")
    }

    /// Decode transport-encoded image bytes and run detect (→ liveness) →
    /// embed, under the engine's single-flight gate. Decode happens here,
    /// outside the gate, so callers may prepare inputs in parallel.
    pub async fn embed(
        &self,
        image_bytes: &[u8],
        check_liveness: bool,
    ) -> Result<Embedding, EngineError> {
        let image = decode_image(image_bytes)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed {
                image,
                check_liveness,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Decode, embed (with liveness if requested), then compare against the
    /// gallery under the engine's gate — the gallery read happens inside the
    /// gate so the match and the embed it depends on are atomic together.
    pub async fn match_probe(
        &self,
        image_bytes: &[u8],
        check_liveness: bool,
        threshold: f32,
    ) -> Result<visage_core::MatchResult, EngineError> {
        let image = decode_image(image_bytes)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::MatchProbe {
                image,
                check_liveness,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

fn decode_image(bytes: &[u8]) -> Result<image::DynamicImage, EngineError> {
    if bytes.is_empty() {
        return Err(EngineError::DecodeFailed);
    }
    image::load_from_memory(bytes).map_err(|_| EngineError::DecodeFailed)
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads all three ONNX sessions once, synchronously (fail-fast at
/// startup), then enters a request loop. The sessions never leave this
/// thread; the mpsc channel is the only way in.
pub fn spawn_engine(
    detector_path: &str,
    recognizer_path: &str,
    antispoof_path: &str,
    liveness_threshold: f32,
) -> Result<EngineHandle, EngineError> {
    let mut detector = FaceDetector::load(detector_path)?;
    tracing::info!(path = detector_path, "detector loaded");

    let mut recognizer = FaceRecognizer::load(recognizer_path)?;
    tracing::info!(path = recognizer_path, "recognizer loaded");

    let mut antispoof = AntiSpoofModel::load(antispoof_path)?;
    tracing::info!(path = antispoof_path, "anti-spoof model loaded");

    let gallery = Arc::new(Gallery::new());
    let latest_liveness = Arc::new(RwLock::new(None));

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(32);

    let gallery_for_thread = gallery.clone();
    let liveness_for_thread = latest_liveness.clone();

    std::thread::Builder::new()
        .name("accessd-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let matcher = CosineMatcher;
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Embed {
                        image,
                        check_liveness,
                        reply,
                    } => {
                        let result = run_embed(
                            &mut detector,
                            &mut recognizer,
                            &mut antispoof,
                            &image,
                            check_liveness,
                            liveness_threshold,
                            &liveness_for_thread,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::MatchProbe {
                        image,
                        check_liveness,
                        threshold,
                        reply,
                    } => {
                        let result = run_embed(
                            &mut detector,
                            &mut recognizer,
                            &mut antispoof,
                            &image,
                            check_liveness,
                            liveness_threshold,
                            &liveness_for_thread,
                        )
                        .map(|embedding| matcher.compare(&embedding, &gallery_for_thread, threshold));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle {
        tx,
        gallery,
        latest_liveness,
    })
}

/// Detect the best face, optionally gate on liveness, then extract and
/// L2-normalize its embedding. Runs entirely on the engine thread.
fn run_embed(
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    antispoof: &mut AntiSpoofModel,
    image: &image::DynamicImage,
    check_liveness: bool,
    liveness_threshold: f32,
    latest_liveness: &Arc<RwLock<Option<LivenessRecord>>>,
) -> Result<Embedding, EngineError> {
    let faces = detector.detect(image)?;
    let face = visage_core::pick_best(&faces, image.width(), image.height())
        .ok_or(EngineError::NoFaceDetected)?;

    if check_liveness {
        let started = std::time::Instant::now();
        let real_prob = antispoof.check(image, &face)?;
        let record = visage_core::liveness::build_record(
            real_prob,
            liveness_threshold,
            started.elapsed().as_millis() as u64,
        );
        *latest_liveness.write().expect("liveness slot poisoned") = Some(record);
        if !record.is_live {
            return Err(EngineError::LivenessRejected);
        }
    }

    let embedding = recognizer.extract(image, &face)?;
    Ok(embedding)
}
