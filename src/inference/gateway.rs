//! Fork/join dispatch of the two models.
//!
//! Both calls are issued together and awaited together, so a cycle costs
//! `max(segmentation, landmarks)` rather than their sum. Errors stay inside
//! the returned [`InferenceOutcome`]; the caller just sees missing results.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{FaceDetector, FaceLandmarkSet, InferenceError, SegmentationMask, Segmenter};
use crate::frame::Frame;

/// Results of one dispatch. `None` means "nothing detected" to the compositor.
#[derive(Debug, Default)]
pub struct InferenceOutcome {
    pub mask: Option<SegmentationMask>,
    pub faces: Option<Vec<FaceLandmarkSet>>,
    pub segmentation_error: Option<InferenceError>,
    pub landmark_error: Option<InferenceError>,
    pub segmentation_latency: Duration,
    pub landmark_latency: Duration,
}

impl InferenceOutcome {
    /// Landmarks of all faces, empty when detection failed
    pub fn faces(&self) -> &[FaceLandmarkSet] {
        self.faces.as_deref().unwrap_or(&[])
    }
}

/// Wraps the segmentation and landmark models
pub struct InferenceGateway {
    segmenter: Option<Arc<dyn Segmenter>>,
    face_detector: Option<Arc<dyn FaceDetector>>,
    /// Upper bound on each individual model call
    timeout: Duration,
}

impl InferenceGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            segmenter: None,
            face_detector: None,
            timeout,
        }
    }

    pub fn with_segmenter(mut self, segmenter: Arc<dyn Segmenter>) -> Self {
        log::info!("Segmentation model: {}", segmenter.name());
        self.segmenter = Some(segmenter);
        self
    }

    pub fn with_face_detector(mut self, face_detector: Arc<dyn FaceDetector>) -> Self {
        log::info!("Face landmark model: {}", face_detector.name());
        self.face_detector = Some(face_detector);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_segmenter(&self) -> bool {
        self.segmenter.is_some()
    }

    pub fn has_face_detector(&self) -> bool {
        self.face_detector.is_some()
    }

    /// Run both models on `frame` concurrently and wait for both.
    pub async fn dispatch(&self, frame: &Frame) -> InferenceOutcome {
        let segmentation = bounded(self.timeout, async {
            match &self.segmenter {
                Some(segmenter) => segmenter.segment(frame).await,
                None => Err(InferenceError::Unavailable("no segmentation model".to_string())),
            }
        });

        let landmarks = bounded(self.timeout, async {
            match &self.face_detector {
                Some(detector) => detector.detect_faces(frame).await,
                None => Err(InferenceError::Unavailable("no face landmark model".to_string())),
            }
        });

        let ((seg_result, segmentation_latency), (face_result, landmark_latency)) =
            tokio::join!(segmentation, landmarks);

        let mut outcome = InferenceOutcome {
            segmentation_latency,
            landmark_latency,
            ..Default::default()
        };

        match seg_result {
            Ok(mask) => outcome.mask = Some(mask),
            Err(e) => {
                if self.segmenter.is_some() {
                    log::warn!("Segmentation skipped for frame {}: {}", frame.frame_number, e);
                }
                outcome.segmentation_error = Some(e);
            }
        }

        match face_result {
            Ok(faces) => outcome.faces = Some(faces),
            Err(e) => {
                if self.face_detector.is_some() {
                    log::warn!("Landmarks skipped for frame {}: {}", frame.frame_number, e);
                }
                outcome.landmark_error = Some(e);
            }
        }

        log::debug!(
            "Inference for frame {}: segmentation {:?}, landmarks {:?}",
            frame.frame_number,
            outcome.segmentation_latency,
            outcome.landmark_latency
        );

        outcome
    }
}

/// Apply the per-call timeout and measure latency
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, InferenceError>>,
) -> (Result<T, InferenceError>, Duration) {
    let started = Instant::now();
    let result = match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(InferenceError::Timeout(limit)),
    };
    (result, started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rgba;
    use crate::inference::Landmark;
    use async_trait::async_trait;
    use tokio::sync::Barrier;

    /// Both models wait on a shared barrier, so they only finish when run together
    struct BarrierSegmenter(Arc<Barrier>);
    struct BarrierDetector(Arc<Barrier>);

    #[async_trait]
    impl Segmenter for BarrierSegmenter {
        fn name(&self) -> &str {
            "barrier-segmenter"
        }

        async fn segment(&self, frame: &Frame) -> Result<SegmentationMask, InferenceError> {
            self.0.wait().await;
            Ok(SegmentationMask::all_foreground(frame.pixel_count()))
        }
    }

    #[async_trait]
    impl FaceDetector for BarrierDetector {
        fn name(&self) -> &str {
            "barrier-detector"
        }

        async fn detect_faces(&self, _frame: &Frame) -> Result<Vec<FaceLandmarkSet>, InferenceError> {
            self.0.wait().await;
            Ok(vec![FaceLandmarkSet::new(vec![Landmark::new(1.0, 1.0)])])
        }
    }

    struct FailingSegmenter;

    #[async_trait]
    impl Segmenter for FailingSegmenter {
        fn name(&self) -> &str {
            "failing"
        }

        async fn segment(&self, _frame: &Frame) -> Result<SegmentationMask, InferenceError> {
            Err(InferenceError::Backend("tensor shape mismatch".to_string()))
        }
    }

    struct SlowDetector;

    #[async_trait]
    impl FaceDetector for SlowDetector {
        fn name(&self) -> &str {
            "slow"
        }

        async fn detect_faces(&self, _frame: &Frame) -> Result<Vec<FaceLandmarkSet>, InferenceError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn frame() -> Frame {
        Frame::filled(4, 4, Rgba::new(10, 10, 10, 255))
    }

    #[tokio::test]
    async fn test_dispatch_runs_models_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let gateway = InferenceGateway::new(Duration::from_secs(5))
            .with_segmenter(Arc::new(BarrierSegmenter(barrier.clone())))
            .with_face_detector(Arc::new(BarrierDetector(barrier)));

        let outcome = gateway.dispatch(&frame()).await;

        assert!(outcome.segmentation_error.is_none());
        assert!(outcome.landmark_error.is_none());
        assert_eq!(outcome.mask.unwrap().len(), 16);
        assert_eq!(outcome.faces.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let barrier = Arc::new(Barrier::new(1));
        let gateway = InferenceGateway::new(Duration::from_secs(5))
            .with_segmenter(Arc::new(FailingSegmenter))
            .with_face_detector(Arc::new(BarrierDetector(barrier)));

        let outcome = gateway.dispatch(&frame()).await;

        assert!(outcome.mask.is_none());
        assert_eq!(
            outcome.segmentation_error,
            Some(InferenceError::Backend("tensor shape mismatch".to_string()))
        );
        assert_eq!(outcome.faces().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_does_not_stall() {
        let limit = Duration::from_millis(20);
        let gateway = InferenceGateway::new(limit).with_face_detector(Arc::new(SlowDetector));

        let started = Instant::now();
        let outcome = gateway.dispatch(&frame()).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.landmark_error, Some(InferenceError::Timeout(limit)));
        assert!(outcome.faces().is_empty());
    }

    #[tokio::test]
    async fn test_missing_models_are_unavailable() {
        let gateway = InferenceGateway::new(Duration::from_millis(100));
        let outcome = gateway.dispatch(&frame()).await;

        assert!(matches!(outcome.segmentation_error, Some(InferenceError::Unavailable(_))));
        assert!(matches!(outcome.landmark_error, Some(InferenceError::Unavailable(_))));
        assert!(outcome.mask.is_none());
        assert!(outcome.faces.is_none());
    }
}
