//! # Frame Entities
//!
//! Core data types flowing through the pipeline: decoded video frames,
//! opaque predictions and the envelope pairing them up for dispatch.
//!
//! Frames carry their pixel payload behind `Arc` so that buffering,
//! multiplexing and dispatching never copy image data.

use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

/// Raw decoded pixel buffer shared between pipeline stages.
pub type ImageData = Arc<Vec<u8>>;

/// Result of the user-supplied inference function for a single frame.
///
/// The pipeline treats predictions as opaque JSON values: it never inspects
/// or post-processes them, only pairs them with their frames positionally.
pub type Prediction = serde_json::Value;

/// A single decoded frame emitted by a video source.
///
/// `frame_id` is assigned at capture time and is strictly increasing for the
/// lifetime of the source (gaps are possible when frames are dropped). By
/// default the counter survives reconnects and restarts; sources can be
/// configured to reset it on restart instead.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Decoded pixels, layout defined by the capture backend.
    pub image: ImageData,
    /// Per-source monotonic counter, starting at 1.
    pub frame_id: u64,
    /// Wall-clock time at decode.
    pub frame_timestamp: SystemTime,
    /// Identifier of the owning video source within the pipeline.
    pub source_id: usize,
    /// Producer-side measured frame rate, when enough samples exist.
    pub fps: Option<f64>,
    /// Consumer-side measured frame rate, stamped at read time.
    pub measured_fps: Option<f64>,
}

impl VideoFrame {
    /// Compact metadata view used in status payloads and logs.
    pub fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor {
            frame_id: self.frame_id,
            source_id: self.source_id,
        }
    }
}

/// Lightweight identification of a frame without its pixel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameDescriptor {
    pub frame_id: u64,
    pub source_id: usize,
}

/// Predictions paired with the frames they were computed from.
///
/// The two vectors always have identical length and positional
/// correspondence: `predictions[i]` belongs to `frames[i]`.
#[derive(Debug, Clone)]
pub struct PredictionEnvelope {
    pub predictions: Vec<Prediction>,
    pub frames: Vec<VideoFrame>,
}
