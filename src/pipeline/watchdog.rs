//! Fine-grained pipeline lifecycle callbacks.
//!
//! A watchdog observes the inference loop at a finer grain than status
//! events: it is told when a batch enters the model and when predictions
//! come back, and it additionally receives every status update as an
//! ordinary bus handler. Meant for profilers and latency monitors; the
//! default [`NullPipelineWatchdog`] does nothing.

use crate::frame::VideoFrame;
use crate::status::StatusUpdate;

pub trait PipelineWatchdog: Send + Sync {
    fn on_status_update(&self, _update: &StatusUpdate) {}

    fn on_model_inference_started(&self, _frames: &[VideoFrame]) {}

    fn on_model_prediction_ready(&self, _frames: &[VideoFrame]) {}
}

/// Watchdog that ignores every callback.
pub struct NullPipelineWatchdog;

impl PipelineWatchdog for NullPipelineWatchdog {}
