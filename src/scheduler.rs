//! Frame scheduler
//!
//! Drives the capture -> inference -> composite -> flash -> present loop as an
//! explicit state machine:
//!
//! ```text
//! Idle -> Starting (open stream) -> Running (cycles) -> Stopping (close) -> Idle
//! ```
//!
//! Cycles never overlap. A stop request is checked before every capture and
//! can abandon a cycle while it waits for a frame or for inference, but once
//! inference has joined the cycle always runs through presentation. Device
//! switches are applied between cycles, or while waiting on a stream that has
//! no frame to give: the old stream is closed before the new one is opened.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::capture::{CaptureError, CaptureSource, FrameStream};
use crate::compositor::Compositor;
use crate::devices::{Device, DeviceId, DeviceRegistry, UnknownDevice};
use crate::flash::FlashController;
use crate::inference::InferenceGateway;
use crate::present::{PresentError, Presenter};

/// Scheduler lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    UnknownDevice(#[from] UnknownDevice),
    #[error("no capture devices found")]
    NoDevices,
    #[error("not allowed while the scheduler is {0:?}")]
    Busy(SchedulerState),
}

/// Counters for one run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Cycles that reached presentation
    pub cycles: u64,
    pub segmentation_failures: u64,
    pub landmark_failures: u64,
    /// Cycles whose mask was rejected for a length mismatch
    pub mask_violations: u64,
    /// Cycles presented with the flash overlay
    pub flash_cycles: u64,
    pub device_switches: u64,
    /// Frames the capture streams overwrote before delivery
    pub dropped_frames: u64,
}

/// State shared between the scheduler and its handles
struct Control {
    state: Mutex<SchedulerState>,
    stop_tx: watch::Sender<bool>,
    switch_tx: mpsc::UnboundedSender<DeviceId>,
}

/// Cloneable remote control for a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    control: Arc<Control>,
}

impl SchedulerHandle {
    /// Ask the scheduler to stop. No new cycle starts after this; a stop
    /// issued while idle makes the next run stop before its first cycle.
    pub fn stop(&self) {
        log::info!("Stop requested");
        self.control.stop_tx.send_replace(true);
    }

    /// Switch capture to another device between cycles
    pub fn switch_device(&self, device: DeviceId) {
        log::info!("Device switch to {} requested", device);
        let _ = self.control.switch_tx.send(device);
    }

    pub fn state(&self) -> SchedulerState {
        *self.control.state.lock()
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.control.stop_tx.borrow()
    }
}

/// Resolves once a stop has been requested
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    if stop_rx.wait_for(|stop| *stop).await.is_err() {
        // All senders gone: nobody can ask us to stop any more
        std::future::pending::<()>().await;
    }
}

/// Pipeline session: owns every stage and the flash/device state
pub struct FrameScheduler {
    source: Box<dyn CaptureSource>,
    gateway: InferenceGateway,
    compositor: Compositor,
    flash: FlashController,
    presenter: Box<dyn Presenter>,
    registry: DeviceRegistry,
    control: Arc<Control>,
    stop_rx: watch::Receiver<bool>,
    switch_rx: mpsc::UnboundedReceiver<DeviceId>,
    /// Stop by itself after this many cycles
    max_cycles: Option<u64>,
}

impl FrameScheduler {
    pub fn new(
        source: Box<dyn CaptureSource>,
        gateway: InferenceGateway,
        compositor: Compositor,
        flash: FlashController,
        presenter: Box<dyn Presenter>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (switch_tx, switch_rx) = mpsc::unbounded_channel();

        Self {
            source,
            gateway,
            compositor,
            flash,
            presenter,
            registry: DeviceRegistry::new(),
            control: Arc::new(Control {
                state: Mutex::new(SchedulerState::Idle),
                stop_tx,
                switch_tx,
            }),
            stop_rx,
            switch_rx,
            max_cycles: None,
        }
    }

    pub fn with_max_cycles(mut self, max_cycles: u64) -> Self {
        self.max_cycles = Some(max_cycles);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: self.control.clone(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.control.state.lock()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Flash decision of the most recent cycle
    pub fn is_flash_on(&self) -> bool {
        self.flash.is_flash_on()
    }

    fn set_state(&self, state: SchedulerState) {
        let mut current = self.control.state.lock();
        if *current != state {
            log::info!("Scheduler {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Re-enumerate capture devices. Only allowed while idle, so no open
    /// stream can outlive the list it was chosen from.
    pub fn refresh_devices(&mut self) -> Result<&[Device], SessionError> {
        let state = self.state();
        if state != SchedulerState::Idle {
            return Err(SessionError::Busy(state));
        }

        let devices = self.source.enumerate()?;
        self.registry.replace(devices);
        Ok(self.registry.devices())
    }

    /// Run the pipeline on `device` until stopped, a fatal capture error, or
    /// the presenter closes.
    pub async fn run(&mut self, device: &DeviceId) -> Result<RunSummary, SessionError> {
        let state = self.state();
        if state != SchedulerState::Idle {
            return Err(SessionError::Busy(state));
        }

        if self.registry.is_empty() {
            self.refresh_devices()?;
        }
        if self.registry.is_empty() {
            return Err(SessionError::NoDevices);
        }
        let selected = self.registry.select(device)?.clone();

        self.set_state(SchedulerState::Starting);
        self.flash.reset();
        log::info!("Opening {} ({})", selected.label, selected.id);

        let mut stream = match self.source.open(&selected.id).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to open {}: {}", selected.id, e);
                self.finish();
                return Err(e.into());
            }
        };

        self.set_state(SchedulerState::Running);
        let mut summary = RunSummary::default();
        let result = self.run_cycles(&mut stream, &mut summary).await;

        self.set_state(SchedulerState::Stopping);
        summary.dropped_frames += stream.dropped_frames();
        stream.close();
        self.finish();

        match &result {
            Ok(()) => log::info!("Session ended after {} cycles", summary.cycles),
            Err(e) => log::error!("Session failed after {} cycles: {}", summary.cycles, e),
        }
        result.map(|()| summary)
    }

    /// Back to idle: clear the stop request and discard stale switch requests
    fn finish(&mut self) {
        self.control.stop_tx.send_replace(false);
        while let Ok(device) = self.switch_rx.try_recv() {
            log::debug!("Discarding switch to {} requested after the session ended", device);
        }
        self.set_state(SchedulerState::Idle);
    }

    /// Latest pending switch request, if any
    fn take_switch_request(&mut self) -> Option<DeviceId> {
        let mut latest = None;
        while let Ok(device) = self.switch_rx.try_recv() {
            latest = Some(device);
        }
        latest
    }

    /// Close the current stream and open `requested` in its place. The
    /// registry selection only moves once the new stream is open.
    async fn switch_stream(
        &mut self,
        stream: &mut Box<dyn FrameStream>,
        requested: DeviceId,
        summary: &mut RunSummary,
    ) -> Result<(), SessionError> {
        let target = match self.registry.resolve(&requested) {
            Some(device) => device.clone(),
            None => {
                log::warn!("Ignoring switch to unknown device {}", requested);
                return Ok(());
            }
        };

        if &target.id == stream.device() {
            return Ok(());
        }

        log::info!("Switching capture from {} to {}", stream.device(), target.id);
        summary.dropped_frames += stream.dropped_frames();
        stream.close();

        *stream = self.source.open(&target.id).await?;
        self.registry.select(&target.id)?;
        summary.device_switches += 1;
        Ok(())
    }

    async fn run_cycles(
        &mut self,
        stream: &mut Box<dyn FrameStream>,
        summary: &mut RunSummary,
    ) -> Result<(), SessionError> {
        // Switch request that arrived while waiting for a frame
        let mut deferred_switch = None;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            if self.max_cycles.is_some_and(|max| summary.cycles >= max) {
                log::info!("Reached cycle limit");
                break;
            }

            if let Some(requested) = self.take_switch_request().or(deferred_switch.take()) {
                self.switch_stream(stream, requested, summary).await?;
            }

            let frame = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => break,
                Some(requested) = self.switch_rx.recv() => {
                    deferred_switch = Some(requested);
                    continue;
                }
                frame = stream.next_frame() => frame?,
            };
            let cycle_start = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => break,
                outcome = self.gateway.dispatch(&frame) => outcome,
            };

            // Past the join barrier: finish the cycle whatever happens
            let mut frame = frame;
            let report = self
                .compositor
                .apply(&mut frame, outcome.mask.as_ref(), outcome.faces.as_deref());
            let decision = self.flash.process(&mut frame);

            if outcome.segmentation_error.is_some() && self.gateway.has_segmenter() {
                summary.segmentation_failures += 1;
            }
            if outcome.landmark_error.is_some() && self.gateway.has_face_detector() {
                summary.landmark_failures += 1;
            }
            if report.violation.is_some() {
                summary.mask_violations += 1;
            }
            if decision.flash {
                summary.flash_cycles += 1;
            }

            let presented = self.presenter.present(&frame).await;
            summary.cycles += 1;

            log::debug!(
                "Frame {}: {} darkened, {} brightened, brightness {:.1}, {:?}",
                frame.frame_number,
                report.darkened,
                report.brightened,
                decision.brightness,
                cycle_start.elapsed()
            );

            match presented {
                Ok(()) => {}
                Err(PresentError::Lost(reason)) => {
                    log::warn!("Frame {} not presented: {}", frame.frame_number, reason);
                }
                Err(PresentError::Closed) => {
                    log::info!("Presenter closed, stopping");
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => break,
                _ = self.presenter.next_refresh() => {}
            }
        }

        Ok(())
    }
}
