//! Native camera capture
//!
//! Cross-platform camera capture using the nokhwa crate. Frames are captured
//! on a dedicated thread and handed to the pipeline through a
//! [`FrameMailbox`], so a slow pipeline only ever sees the newest frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::{Camera, NokhwaError};
use tokio::sync::oneshot;

use super::{CaptureError, CaptureSource, FrameMailbox, FrameStream};
use crate::devices::{Device, DeviceId};
use crate::frame::Frame;

/// Consecutive failed reads after which the camera is considered gone
const MAX_CONSECUTIVE_FAILURES: u32 = 50;

/// Capture source backed by the platform camera API
pub struct NokhwaSource {
    /// Requested frame width
    width: u32,
    /// Requested frame height
    height: u32,
}

impl NokhwaSource {
    /// # Arguments
    /// * `width` - Requested frame width
    /// * `height` - Requested frame height
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[async_trait]
impl CaptureSource for NokhwaSource {
    fn enumerate(&self) -> Result<Vec<Device>, CaptureError> {
        let cameras = nokhwa::query(ApiBackend::Auto).map_err(map_nokhwa_error)?;

        Ok(cameras
            .iter()
            .enumerate()
            .map(|(idx, info)| Device::new(idx.to_string(), info.human_name()))
            .collect())
    }

    async fn open(&mut self, device: &DeviceId) -> Result<Box<dyn FrameStream>, CaptureError> {
        let index: u32 = if device.is_default() {
            0
        } else {
            device
                .as_str()
                .parse()
                .map_err(|_| CaptureError::DeviceUnavailable(format!("not a camera index: {}", device)))?
        };

        log::info!("Opening camera {} (requested {}x{})", index, self.width, self.height);
        let stream = CameraStream::open(device.clone(), index, self.width, self.height).await?;
        Ok(Box::new(stream))
    }
}

/// Live camera stream running on its own capture thread
pub struct CameraStream {
    device: DeviceId,
    mailbox: Arc<FrameMailbox>,
    /// Whether capture is running
    running: Arc<AtomicBool>,
    /// Capture thread handle
    thread_handle: Option<std::thread::JoinHandle<()>>,
    /// Negotiated camera resolution
    resolution: (u32, u32),
}

impl CameraStream {
    fn spawn(
        device: DeviceId,
        camera_index: u32,
        width: u32,
        height: u32,
    ) -> Result<PendingStream, CaptureError> {
        let mailbox = Arc::new(FrameMailbox::new());
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel();

        let mailbox_clone = mailbox.clone();
        let running_clone = running.clone();

        let thread_handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                Self::capture_thread(camera_index, width, height, ready_tx, mailbox_clone, running_clone);
            })
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to spawn capture thread: {}", e)))?;

        Ok(PendingStream {
            stream: Some(Self {
                device,
                mailbox,
                running,
                thread_handle: Some(thread_handle),
                resolution: (0, 0),
            }),
            ready_rx,
        })
    }

    /// Camera capture thread
    fn capture_thread(
        camera_index: u32,
        width: u32,
        height: u32,
        ready_tx: oneshot::Sender<Result<(u32, u32), CaptureError>>,
        mailbox: Arc<FrameMailbox>,
        running: Arc<AtomicBool>,
    ) {
        log::info!("Starting camera capture thread (camera {})", camera_index);

        let mut camera = match Self::open_camera(camera_index, width, height) {
            Ok(camera) => camera,
            Err(e) => {
                log::error!("Failed to open camera {}: {}", camera_index, e);
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let resolution = (camera.resolution().width(), camera.resolution().height());
        log::info!(
            "Camera opened: {} ({}x{})",
            camera.info().human_name(),
            resolution.0,
            resolution.1
        );

        if ready_tx.send(Ok(resolution)).is_err() {
            // Opener went away before the camera came up
            let _ = camera.stop_stream();
            return;
        }

        let frame_count = AtomicU64::new(0);
        let mut failures = ReadFailures::new(MAX_CONSECUTIVE_FAILURES);

        while running.load(Ordering::Acquire) {
            let buffer = match camera.frame() {
                Ok(buffer) => {
                    failures.reset();
                    buffer
                }
                Err(e) => {
                    log::warn!("Failed to capture frame: {:?}", e);
                    if let Some(fatal) = failures.record(map_nokhwa_error(e)) {
                        log::error!("Camera {} lost: {}", camera_index, fatal);
                        mailbox.fail(fatal);
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
            };

            match buffer.decode_image::<RgbAFormat>() {
                Ok(image) => {
                    let frame_number = frame_count.fetch_add(1, Ordering::Relaxed);
                    let frame_width = buffer.resolution().width();
                    let frame_height = buffer.resolution().height();

                    match Frame::from_rgba(frame_width, frame_height, image.into_raw()) {
                        Ok(mut frame) => {
                            frame.frame_number = frame_number;
                            frame.timestamp = Instant::now();
                            if !mailbox.publish(frame) {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Discarding malformed camera frame: {}", e),
                    }
                }
                Err(e) => {
                    log::warn!("Failed to decode frame: {:?}", e);
                }
            }
        }

        if let Err(e) = camera.stop_stream() {
            log::warn!("Failed to stop camera stream: {:?}", e);
        }
        log::info!("Camera capture thread stopped");
    }

    /// Open the camera, walking down from the highest resolution it offers
    fn open_camera(camera_index: u32, width: u32, height: u32) -> Result<Camera, CaptureError> {
        let index = CameraIndex::Index(camera_index);

        let attempts = [
            RequestedFormatType::AbsoluteHighestResolution,
            RequestedFormatType::HighestResolution(Resolution::new(width, height)),
            RequestedFormatType::None,
        ];

        let mut last_error = None;
        for (attempt, format_type) in attempts.into_iter().enumerate() {
            let requested = RequestedFormat::new::<RgbAFormat>(format_type);
            match Camera::new(index.clone(), requested) {
                Ok(mut camera) => {
                    camera.open_stream().map_err(map_nokhwa_error)?;
                    return Ok(camera);
                }
                Err(e) => {
                    log::warn!("Camera format attempt {} failed: {:?}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(map_nokhwa_error)
            .unwrap_or_else(|| CaptureError::DeviceUnavailable(format!("camera {}", camera_index))))
    }

    /// Negotiated capture resolution
    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}

#[async_trait]
impl FrameStream for CameraStream {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(CaptureError::Closed);
        }
        self.mailbox.recv().await
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        self.mailbox.close();
        if let Some(handle) = self.thread_handle.take() {
            log::info!("Closing camera stream {}", self.device);
            join_capture_thread(handle);
        }
    }

    fn dropped_frames(&self) -> u64 {
        self.mailbox.dropped()
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wait for a capture thread to exit.
///
/// The thread may be inside a blocking read for up to one frame period. On a
/// multi-threaded runtime the wait happens in blocking mode so other tasks
/// keep being scheduled; the caller still only continues once the device has
/// been released.
fn join_capture_thread(handle: std::thread::JoinHandle<()>) {
    let join = move || {
        if handle.join().is_err() {
            log::error!("Camera capture thread panicked");
        }
    };

    let multi_thread = tokio::runtime::Handle::try_current()
        .map(|rt| rt.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread)
        .unwrap_or(false);

    if multi_thread {
        tokio::task::block_in_place(join);
    } else {
        join();
    }
}

/// Tracks consecutive read failures on a live camera.
///
/// Permission and support errors are fatal at once; anything else is
/// retried until `limit` failures in a row.
struct ReadFailures {
    consecutive: u32,
    limit: u32,
}

impl ReadFailures {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Returns the error to report once the camera should be given up on
    fn record(&mut self, error: CaptureError) -> Option<CaptureError> {
        self.consecutive += 1;
        match error {
            CaptureError::PermissionDenied | CaptureError::Unsupported(_) => Some(error),
            _ if self.consecutive >= self.limit => Some(error),
            _ => None,
        }
    }
}

/// A stream whose capture thread has not yet reported back
struct PendingStream {
    stream: Option<CameraStream>,
    ready_rx: oneshot::Receiver<Result<(u32, u32), CaptureError>>,
}

impl PendingStream {
    async fn wait(mut self) -> Result<CameraStream, CaptureError> {
        let outcome = (&mut self.ready_rx).await.unwrap_or_else(|_| {
            Err(CaptureError::DeviceUnavailable("capture thread exited".to_string()))
        });

        // Dropping the stream on error joins the (already finished) thread
        let mut stream = self.stream.take().ok_or(CaptureError::Closed)?;
        let resolution = outcome?;
        stream.resolution = resolution;
        Ok(stream)
    }
}

impl CameraStream {
    /// Spawn the capture thread and wait until the camera is streaming
    pub async fn open(
        device: DeviceId,
        camera_index: u32,
        width: u32,
        height: u32,
    ) -> Result<Self, CaptureError> {
        Self::spawn(device, camera_index, width, height)?.wait().await
    }
}

/// Classify a nokhwa failure into the capture error taxonomy
fn map_nokhwa_error(error: NokhwaError) -> CaptureError {
    match error {
        NokhwaError::UnsupportedOperationError(backend) => {
            CaptureError::Unsupported(format!("{:?}", backend))
        }
        NokhwaError::NotImplementedError(what) => CaptureError::Unsupported(what),
        other => classify_message(other.to_string()),
    }
}

fn classify_message(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message("Camera access denied by user".to_string()),
            CaptureError::PermissionDenied
        );
        assert_eq!(
            classify_message("Permission not granted".to_string()),
            CaptureError::PermissionDenied
        );
        assert_eq!(
            classify_message("Could not open device /dev/video3".to_string()),
            CaptureError::DeviceUnavailable("Could not open device /dev/video3".to_string())
        );
    }

    #[test]
    fn test_read_failures_give_up_after_limit() {
        let mut failures = ReadFailures::new(3);
        let unplugged = || CaptureError::DeviceUnavailable("read failed".to_string());

        assert_eq!(failures.record(unplugged()), None);
        assert_eq!(failures.record(unplugged()), None);
        failures.reset();
        assert_eq!(failures.record(unplugged()), None);
        assert_eq!(failures.record(unplugged()), None);
        assert_eq!(failures.record(unplugged()), Some(unplugged()));
    }

    #[test]
    fn test_read_failures_permission_is_fatal() {
        let mut failures = ReadFailures::new(50);
        assert_eq!(
            failures.record(CaptureError::PermissionDenied),
            Some(CaptureError::PermissionDenied)
        );
    }

    fn slow_thread(finished: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            finished.store(true, Ordering::Release);
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_capture_thread_multi_thread() {
        let finished = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicU64::new(0));

        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            })
        };

        join_capture_thread(slow_thread(finished.clone()));

        assert!(finished.load(Ordering::Acquire));
        // Other tasks kept running while the join waited
        assert!(ticks.load(Ordering::Relaxed) > 0);
        ticker.abort();
    }

    #[tokio::test]
    async fn test_join_capture_thread_current_thread() {
        let finished = Arc::new(AtomicBool::new(false));
        join_capture_thread(slow_thread(finished.clone()));
        assert!(finished.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_open_rejects_non_index_id() {
        let mut source = NokhwaSource::new(640, 480);
        let result = source.open(&DeviceId::new("front-camera")).await;
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
    }
}
