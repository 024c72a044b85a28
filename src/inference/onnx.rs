//! ONNX Runtime model backends
//!
//! Selfie segmentation and face mesh models from the MediaPipe family,
//! exported to ONNX. Sessions run on the blocking thread pool so the gateway's
//! two calls actually execute in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::Array4;
use parking_lot::Mutex;

use super::{FaceDetector, FaceLandmarkSet, InferenceError, Landmark, SegmentationMask, Segmenter};
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Segmentation model file name inside the models directory
pub const SEGMENTATION_MODEL: &str = "selfie_segmentation.onnx";
/// Face mesh model file name inside the models directory
pub const FACE_MESH_MODEL: &str = "face_landmark.onnx";

const SEG_WIDTH: u32 = 256;
const SEG_HEIGHT: u32 = 256;
const MESH_SIZE: u32 = 192;
const MESH_POINTS: usize = 468;

/// Person segmentation via ONNX Runtime
pub struct OnnxSegmenter {
    session: Arc<Mutex<ort::session::Session>>,
    /// Probability at or above which a pixel counts as person
    threshold: f32,
}

impl OnnxSegmenter {
    /// Load `selfie_segmentation.onnx` from `model_dir`
    pub fn load(model_dir: &Path, threshold: f32) -> Result<Self, InferenceError> {
        let session = load_session(&model_dir.join(SEGMENTATION_MODEL))?;
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            threshold,
        })
    }
}

#[async_trait]
impl Segmenter for OnnxSegmenter {
    fn name(&self) -> &str {
        SEGMENTATION_MODEL
    }

    async fn segment(&self, frame: &Frame) -> Result<SegmentationMask, InferenceError> {
        ensure_idle(&self.session, SEGMENTATION_MODEL)?;
        let input = preprocess_frame_nhwc(frame, SEG_WIDTH, SEG_HEIGHT);
        let (width, height) = (frame.width(), frame.height());
        let threshold = self.threshold;

        run_exclusive(&self.session, SEGMENTATION_MODEL, move |session| {
            let probabilities = run_segmentation(session, input)?;
            Ok(SegmentationMask::from_probabilities(
                &probabilities,
                SEG_WIDTH,
                SEG_HEIGHT,
                width,
                height,
                threshold,
            ))
        })
        .await
    }
}

/// Face landmarks via the face mesh model, run on the whole frame
pub struct OnnxFaceMesh {
    session: Arc<Mutex<ort::session::Session>>,
    /// Minimum face presence probability
    min_presence: f32,
}

impl OnnxFaceMesh {
    /// Load `face_landmark.onnx` from `model_dir`
    pub fn load(model_dir: &Path, min_presence: f32) -> Result<Self, InferenceError> {
        let session = load_session(&model_dir.join(FACE_MESH_MODEL))?;
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            min_presence,
        })
    }
}

#[async_trait]
impl FaceDetector for OnnxFaceMesh {
    fn name(&self) -> &str {
        FACE_MESH_MODEL
    }

    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceLandmarkSet>, InferenceError> {
        ensure_idle(&self.session, FACE_MESH_MODEL)?;
        let input = preprocess_frame_nhwc(frame, MESH_SIZE, MESH_SIZE);
        let scale_x = frame.width() as f32 / MESH_SIZE as f32;
        let scale_y = frame.height() as f32 / MESH_SIZE as f32;
        let min_presence = self.min_presence;

        run_exclusive(&self.session, FACE_MESH_MODEL, move |session| {
            let (coords, presence) = run_face_mesh(session, input)?;
            if presence < min_presence {
                return Ok(Vec::new());
            }
            Ok(vec![landmarks_from_mesh(&coords, scale_x, scale_y)])
        })
        .await
    }
}

fn busy(model: &str) -> InferenceError {
    InferenceError::Backend(format!("{} is still busy with an earlier frame", model))
}

/// Refuse a new call while an earlier one, possibly abandoned after a
/// timeout, still holds the model.
fn ensure_idle<S>(session: &Mutex<S>, model: &str) -> Result<(), InferenceError> {
    if session.is_locked() {
        Err(busy(model))
    } else {
        Ok(())
    }
}

/// Run `job` on the blocking pool with exclusive use of `session`.
///
/// At most one call per model is ever in flight: if the session is taken
/// when the blocking task starts, the call fails as busy instead of queueing
/// behind it.
async fn run_exclusive<S, T, F>(session: &Arc<Mutex<S>>, model: &str, job: F) -> Result<T, InferenceError>
where
    S: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> Result<T, InferenceError> + Send + 'static,
{
    let session = session.clone();
    let name = model.to_string();

    tokio::task::spawn_blocking(move || {
        let mut guard = session.try_lock().ok_or_else(|| busy(&name))?;
        job(&mut *guard)
    })
    .await
    .map_err(|e| InferenceError::Backend(format!("{} task failed: {}", model, e)))?
}

/// Locate the models directory.
///
/// An explicitly configured directory wins; otherwise look next to the
/// executable (and a few levels up for `target/<profile>` builds), then in the
/// working directory.
pub fn find_model_dir(configured: Option<&Path>) -> Result<PathBuf, InferenceError> {
    if let Some(dir) = configured {
        if dir.is_dir() {
            return Ok(dir.to_path_buf());
        }
        return Err(InferenceError::Unavailable(format!(
            "models directory not found: {}",
            dir.display()
        )));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for ancestor in exe_path.ancestors().skip(1).take(3) {
            let model_dir = ancestor.join("models");
            if model_dir.is_dir() {
                return Ok(model_dir);
            }
        }
    }

    let cwd = std::env::current_dir().map_err(|e| InferenceError::Unavailable(e.to_string()))?;
    let model_dir = cwd.join("models");
    if model_dir.is_dir() {
        return Ok(model_dir);
    }

    Err(InferenceError::Unavailable(
        "models directory not found; create a 'models' directory with ONNX models".to_string(),
    ))
}

fn load_session(path: &Path) -> Result<ort::session::Session, InferenceError> {
    if !path.exists() {
        return Err(InferenceError::Unavailable(format!(
            "model not found: {}",
            path.display()
        )));
    }

    ort::init()
        .with_name("Flashcam")
        .commit()
        .map_err(|e| InferenceError::Unavailable(format!("failed to initialize ORT: {}", e)))?;

    let session = ort::session::Session::builder()
        .map_err(|e| InferenceError::Unavailable(format!("failed to create session builder: {}", e)))?
        .with_intra_threads(2)
        .map_err(|e| InferenceError::Unavailable(format!("failed to set threads: {}", e)))?
        .commit_from_file(path)
        .map_err(|e| InferenceError::Unavailable(format!("failed to load {}: {}", path.display(), e)))?;

    log::info!("Loaded model from {:?}", path);
    Ok(session)
}

/// Resize to the model input and convert to NHWC float RGB in [0, 1]
fn preprocess_frame_nhwc(frame: &Frame, target_width: u32, target_height: u32) -> Vec<f32> {
    frame
        .downscale(target_width, target_height)
        .chunks_exact(BYTES_PER_PIXEL)
        .flat_map(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect()
}

fn input_tensor(
    input: Vec<f32>,
    width: u32,
    height: u32,
) -> Result<ort::value::Tensor<f32>, InferenceError> {
    let input_array = Array4::from_shape_vec((1, height as usize, width as usize, 3), input)
        .map_err(|e| InferenceError::Backend(format!("failed to create input array: {}", e)))?;

    ort::value::Tensor::from_array(input_array)
        .map_err(|e| InferenceError::Backend(format!("failed to create tensor: {}", e)))
}

/// Returns the person probability map, `SEG_WIDTH * SEG_HEIGHT` entries
fn run_segmentation(
    session: &mut ort::session::Session,
    input: Vec<f32>,
) -> Result<Vec<f32>, InferenceError> {
    let input_tensor = input_tensor(input, SEG_WIDTH, SEG_HEIGHT)?;

    let outputs = session
        .run(ort::inputs![input_tensor])
        .map_err(|e| InferenceError::Backend(format!("segmentation failed: {}", e)))?;

    let output = outputs
        .iter()
        .next()
        .ok_or_else(|| InferenceError::Backend("no output from segmentation model".to_string()))?;

    let (_shape, data) = output
        .1
        .try_extract_tensor::<f32>()
        .map_err(|e| InferenceError::Backend(format!("failed to extract mask: {}", e)))?;

    Ok(data.iter().map(|&v| v.clamp(0.0, 1.0)).collect())
}

/// Returns raw mesh coordinates (x, y, z triples in input pixels) and the
/// face presence probability
fn run_face_mesh(
    session: &mut ort::session::Session,
    input: Vec<f32>,
) -> Result<(Vec<f32>, f32), InferenceError> {
    let input_tensor = input_tensor(input, MESH_SIZE, MESH_SIZE)?;

    let outputs = session
        .run(ort::inputs![input_tensor])
        .map_err(|e| InferenceError::Backend(format!("face mesh failed: {}", e)))?;

    let mut iter = outputs.iter();
    let coords_output = iter
        .next()
        .ok_or_else(|| InferenceError::Backend("no landmark output from face mesh".to_string()))?;
    let (_shape, coords) = coords_output
        .1
        .try_extract_tensor::<f32>()
        .map_err(|e| InferenceError::Backend(format!("failed to extract landmarks: {}", e)))?;
    let coords = coords.to_vec();

    let presence = match iter.next() {
        Some(score_output) => {
            let (_shape, score) = score_output
                .1
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::Backend(format!("failed to extract face score: {}", e)))?;
            score.first().map(|&logit| sigmoid(logit)).unwrap_or(0.0)
        }
        None => 1.0,
    };

    Ok((coords, presence))
}

/// Map mesh output (input-space x, y, z triples) back to frame pixels
fn landmarks_from_mesh(coords: &[f32], scale_x: f32, scale_y: f32) -> FaceLandmarkSet {
    let points = coords
        .chunks_exact(3)
        .take(MESH_POINTS)
        .map(|p| Landmark::new(p[0] * scale_x, p[1] * scale_y))
        .collect();
    FaceLandmarkSet::new(points)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
