//! # infermux
//!
//! A multi-source video inference pipeline. The runtime concurrently decodes
//! frames from an arbitrary set of video sources (files, network streams,
//! attached cameras), multiplexes them into batches under a global rate
//! limit, feeds each batch through a user-supplied inference function and
//! dispatches the results to a user-supplied sink, while tolerating source
//! reconnects and exposing per-source pause/mute/resume/restart control.
//!
//! ## Architecture
//!
//! Each source runs a producer task feeding a bounded frame buffer; the
//! multiplexer collects fair round-robin batches from those buffers; the
//! inference worker runs the model over each batch and pushes envelopes into
//! a bounded predictions queue; the dispatcher drains that queue into the
//! sink. Lifecycle and error events fan out through a synchronous status
//! bus. Shutdown is cooperative via a stop signal observed at every
//! suspension point.
//!
//! ```text
//! source[0] ─► buffer ─┐
//! source[1] ─► buffer ─┼─► multiplexer ─► inference ─► queue ─► dispatch ─► sink
//! source[n] ─► buffer ─┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use infermux::pipeline::{InferencePipeline, sinks::PredictionSink};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = InferencePipeline::builder(["synthetic://gradient?frames=300"])
//!         .on_video_frame(|frames| {
//!             Ok(frames
//!                 .iter()
//!                 .map(|frame| json!({ "frame_id": frame.frame_id }))
//!                 .collect())
//!         })
//!         .on_prediction(PredictionSink::sequential(|prediction, frame| {
//!             println!("source {}: {prediction}", frame.source_id);
//!             Ok(())
//!         }))
//!         .build()?;
//!     pipeline.start(false).await?;
//!     pipeline.join().await;
//!     Ok(())
//! }
//! ```
//!
//! Decoder backends are pluggable: the crate ships a synthetic test-pattern
//! source and a memory-mapped raw frame file reader, and embedders register
//! real decoders on the [`capture::CaptureRegistry`] under their URI scheme.

pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod mux;
pub mod pipeline;
pub mod source;
pub mod status;

pub use capture::{Capture, CaptureFactory, CaptureRegistry, SourceProperties, VideoReference};
pub use config::PipelineSettings;
pub use error::{PipelineError, VideoSourceError};
pub use frame::{Prediction, PredictionEnvelope, VideoFrame};
pub use pipeline::{
    InferenceErrorPolicy, InferencePipeline, NullPipelineWatchdog, PipelineWatchdog,
    PredictionSink, SinkMode,
};
pub use source::{
    BufferConsumptionStrategy, BufferFillingStrategy, VideoSource, VideoSourceState,
};
pub use status::{StatusBus, StatusHandler, StatusUpdate, UpdateSeverity};
