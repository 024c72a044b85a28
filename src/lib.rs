//! Flashcam - real-time camera effects pipeline
//!
//! Captures a live camera stream, runs person segmentation and face landmark
//! models on every frame, darkens the background, brightens skin, and adds a
//! simulated front flash when the scene is too dark.

pub mod capture;
pub mod compositor;
pub mod config;
pub mod devices;
pub mod flash;
pub mod frame;
pub mod inference;
pub mod present;
pub mod scheduler;

pub use compositor::Compositor;
pub use config::FlashcamConfig;
pub use flash::FlashController;
pub use frame::Frame;
pub use scheduler::{FrameScheduler, SchedulerHandle, SchedulerState};
