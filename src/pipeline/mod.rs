//! # Inference Pipeline
//!
//! The orchestrator wiring everything together: it owns the video sources,
//! the multiplexer, the inference worker, the bounded predictions queue and
//! the dispatcher.
//!
//! Data flow: sources produce into their buffers, the multiplexer collects
//! batches, the inference worker runs the user's `on_video_frame` over each
//! batch and pushes the resulting [`PredictionEnvelope`] into the
//! predictions queue (blocking when it is full), and the dispatcher drains
//! the queue into the user's sink. Shutdown is cooperative: `terminate` sets
//! the stop signal and terminates the sources, the multiplexer runs dry, the
//! worker drops its queue sender, and the dispatcher exits when the closed
//! queue is empty.
//!
//! Construction goes through [`InferencePipeline::builder`]:
//!
//! ```no_run
//! use infermux::pipeline::{InferencePipeline, sinks::PredictionSink};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pipeline = InferencePipeline::builder(["synthetic://gradient?frames=100"])
//!     .on_video_frame(|frames| Ok(frames.iter().map(|f| json!(f.frame_id)).collect()))
//!     .on_prediction(PredictionSink::batch(|predictions, _frames| {
//!         println!("{predictions:?}");
//!         Ok(())
//!     }))
//!     .max_fps(30.0)
//!     .build()?;
//! pipeline.start(false).await?;
//! pipeline.join().await;
//! # Ok(())
//! # }
//! ```

pub mod sinks;
pub mod watchdog;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::ensure;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::capture::{CaptureRegistry, VideoReference};
use crate::config::PipelineSettings;
use crate::error::{PipelineError, VideoSourceError};
use crate::frame::{Prediction, PredictionEnvelope, VideoFrame};
use crate::mux::Multiplexer;
use crate::source::{
    BufferConsumptionStrategy, BufferFillingStrategy, VideoSource, VideoSourceOptions,
};
use crate::status::{
    INFERENCE_COMPLETED_EVENT, INFERENCE_ERROR_EVENT, INFERENCE_RESULTS_DISPATCHING_ERROR_EVENT,
    INFERENCE_THREAD_FINISHED_EVENT, INFERENCE_THREAD_STARTED_EVENT, StatusBus, StatusHandler,
    UpdateSeverity,
};

pub use sinks::{PredictionSink, SinkMode, multi_sink};
pub use watchdog::{NullPipelineWatchdog, PipelineWatchdog};

/// User-supplied inference function: one prediction per input frame.
pub type InferenceHandler = Box<dyn FnMut(&[VideoFrame]) -> anyhow::Result<Vec<Prediction>> + Send>;

/// One-shot lifecycle callback.
pub type LifecycleCallback = Box<dyn FnOnce() + Send>;

/// What the inference worker does after `on_video_frame` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferenceErrorPolicy {
    /// Emit `INFERENCE_ERROR` and shut the pipeline down in order.
    #[default]
    Terminate,
    /// Emit `INFERENCE_ERROR` and continue with the next batch.
    Skip,
}

enum PropertiesSpec {
    None,
    Shared(HashMap<String, f64>),
    PerSource(Vec<HashMap<String, f64>>),
}

/// Builder for [`InferencePipeline`]. Created via
/// [`InferencePipeline::builder`].
pub struct InferencePipelineBuilder {
    references: Vec<VideoReference>,
    on_video_frame: Option<InferenceHandler>,
    on_prediction: Option<PredictionSink>,
    on_pipeline_start: Option<LifecycleCallback>,
    on_pipeline_end: Option<LifecycleCallback>,
    max_fps: Option<f64>,
    status_update_handlers: Vec<StatusHandler>,
    watchdog: Option<Arc<dyn PipelineWatchdog>>,
    buffer_filling_strategy: Option<BufferFillingStrategy>,
    buffer_consumption_strategy: Option<BufferConsumptionStrategy>,
    video_source_properties: PropertiesSpec,
    sink_mode: SinkMode,
    inference_error_policy: InferenceErrorPolicy,
    frame_id_reset_on_restart: bool,
    batch_collection_timeout: Option<Duration>,
    registry: Option<CaptureRegistry>,
    settings: Option<PipelineSettings>,
}

impl InferencePipelineBuilder {
    fn new(references: Vec<VideoReference>) -> Self {
        Self {
            references,
            on_video_frame: None,
            on_prediction: None,
            on_pipeline_start: None,
            on_pipeline_end: None,
            max_fps: None,
            status_update_handlers: Vec::new(),
            watchdog: None,
            buffer_filling_strategy: None,
            buffer_consumption_strategy: None,
            video_source_properties: PropertiesSpec::None,
            sink_mode: SinkMode::default(),
            inference_error_policy: InferenceErrorPolicy::default(),
            frame_id_reset_on_restart: false,
            batch_collection_timeout: None,
            registry: None,
            settings: None,
        }
    }

    /// The inference function, required. It runs inline on the inference
    /// worker: a long-blocking model call occupies one runtime worker
    /// thread, which matches a dedicated inference thread in practice.
    pub fn on_video_frame<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&[VideoFrame]) -> anyhow::Result<Vec<Prediction>> + Send + 'static,
    {
        self.on_video_frame = Some(Box::new(handler));
        self
    }

    /// The results sink. Without one, predictions are dropped after the
    /// inference call but all status events still fire.
    pub fn on_prediction(mut self, sink: PredictionSink) -> Self {
        self.on_prediction = Some(sink);
        self
    }

    pub fn on_pipeline_start<F: FnOnce() + Send + 'static>(mut self, callback: F) -> Self {
        self.on_pipeline_start = Some(Box::new(callback));
        self
    }

    pub fn on_pipeline_end<F: FnOnce() + Send + 'static>(mut self, callback: F) -> Self {
        self.on_pipeline_end = Some(Box::new(callback));
        self
    }

    /// Global ceiling on batch emission rate. Must be positive and finite.
    pub fn max_fps(mut self, max_fps: f64) -> Self {
        self.max_fps = Some(max_fps);
        self
    }

    pub fn status_update_handlers(mut self, handlers: Vec<StatusHandler>) -> Self {
        self.status_update_handlers = handlers;
        self
    }

    pub fn watchdog(mut self, watchdog: Arc<dyn PipelineWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn buffer_filling_strategy(mut self, strategy: BufferFillingStrategy) -> Self {
        self.buffer_filling_strategy = Some(strategy);
        self
    }

    pub fn buffer_consumption_strategy(mut self, strategy: BufferConsumptionStrategy) -> Self {
        self.buffer_consumption_strategy = Some(strategy);
        self
    }

    /// Capture properties applied to every source after each connection.
    pub fn video_source_properties(mut self, properties: HashMap<String, f64>) -> Self {
        self.video_source_properties = PropertiesSpec::Shared(properties);
        self
    }

    /// Per-source capture properties, aligned with the reference list.
    pub fn video_source_properties_list(mut self, properties: Vec<HashMap<String, f64>>) -> Self {
        self.video_source_properties = PropertiesSpec::PerSource(properties);
        self
    }

    pub fn sink_mode(mut self, mode: SinkMode) -> Self {
        self.sink_mode = mode;
        self
    }

    pub fn inference_error_policy(mut self, policy: InferenceErrorPolicy) -> Self {
        self.inference_error_policy = policy;
        self
    }

    /// Restart the per-source frame counter at 1 after `restart()`.
    pub fn frame_id_reset_on_restart(mut self, reset: bool) -> Self {
        self.frame_id_reset_on_restart = reset;
        self
    }

    /// Grace period for late sources once a batch is non-empty but
    /// incomplete.
    pub fn batch_collection_timeout(mut self, timeout: Duration) -> Self {
        self.batch_collection_timeout = Some(timeout);
        self
    }

    /// Capture registry; defaults to the built-in `synthetic` and `file`
    /// backends.
    pub fn capture_registry(mut self, registry: CaptureRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Runtime settings; defaults to [`PipelineSettings::from_env`].
    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> Result<InferencePipeline, PipelineError> {
        if self.references.is_empty() {
            return Err(PipelineError::validation(
                "video_reference",
                "at least one video reference is required",
            ));
        }
        if let Some(max_fps) = self.max_fps {
            if !max_fps.is_finite() || max_fps <= 0.0 {
                return Err(PipelineError::validation(
                    "max_fps",
                    format!("must be positive and finite, got {max_fps}"),
                ));
            }
        }
        let on_video_frame = self.on_video_frame.ok_or_else(|| {
            PipelineError::validation("on_video_frame", "an inference function is required")
        })?;
        let settings = self.settings.unwrap_or_else(PipelineSettings::from_env);
        settings.validate()?;
        let registry = self.registry.unwrap_or_else(CaptureRegistry::with_defaults);
        let watchdog: Arc<dyn PipelineWatchdog> = self
            .watchdog
            .unwrap_or_else(|| Arc::new(NullPipelineWatchdog));

        let mut handlers = self.status_update_handlers;
        let watchdog_handler = Arc::clone(&watchdog);
        let watchdog_as_handler: StatusHandler = Arc::new(move |update: &crate::status::StatusUpdate| {
            watchdog_handler.on_status_update(update);
            Ok(())
        });
        handlers.push(watchdog_as_handler);
        let bus = StatusBus::new(handlers, settings.status_throttle);

        let source_count = self.references.len();
        let per_source_properties = match self.video_source_properties {
            PropertiesSpec::None => vec![HashMap::new(); source_count],
            PropertiesSpec::Shared(properties) => vec![properties; source_count],
            PropertiesSpec::PerSource(list) => {
                if list.len() != source_count {
                    return Err(PipelineError::validation(
                        "video_source_properties",
                        format!(
                            "property list length {} does not match {} video references",
                            list.len(),
                            source_count
                        ),
                    ));
                }
                list
            }
        };

        let sources: Vec<Arc<VideoSource>> = self
            .references
            .into_iter()
            .zip(per_source_properties)
            .enumerate()
            .map(|(source_id, (reference, properties))| {
                Arc::new(VideoSource::new(
                    source_id,
                    reference,
                    registry.clone(),
                    VideoSourceOptions {
                        buffer_filling_strategy: self.buffer_filling_strategy,
                        buffer_consumption_strategy: self.buffer_consumption_strategy,
                        properties,
                        restart_attempt_delay: settings.restart_attempt_delay,
                        frame_id_reset_on_restart: self.frame_id_reset_on_restart,
                    },
                    &bus,
                ))
            })
            .collect();

        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(InferencePipeline {
            sources,
            bus,
            watchdog,
            stop_tx,
            settings,
            max_fps: self.max_fps,
            sink_mode: self.sink_mode,
            batch_collection_timeout: self.batch_collection_timeout,
            inference_error_policy: self.inference_error_policy,
            startup: Mutex::new(Some(StartupState {
                on_video_frame,
                sink: self.on_prediction,
                on_pipeline_start: self.on_pipeline_start,
                stop_rx,
            })),
            inference_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            on_pipeline_end: Mutex::new(self.on_pipeline_end),
        })
    }
}

/// Pieces consumed exactly once, when the pipeline starts.
struct StartupState {
    on_video_frame: InferenceHandler,
    sink: Option<PredictionSink>,
    on_pipeline_start: Option<LifecycleCallback>,
    stop_rx: watch::Receiver<bool>,
}

/// A running (or startable) multi-source inference pipeline. All operations
/// take `&self`; wrap in `Arc` to control it from several tasks.
pub struct InferencePipeline {
    sources: Vec<Arc<VideoSource>>,
    bus: StatusBus,
    watchdog: Arc<dyn PipelineWatchdog>,
    stop_tx: watch::Sender<bool>,
    settings: PipelineSettings,
    max_fps: Option<f64>,
    sink_mode: SinkMode,
    batch_collection_timeout: Option<Duration>,
    inference_error_policy: InferenceErrorPolicy,
    startup: Mutex<Option<StartupState>>,
    inference_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    on_pipeline_end: Mutex<Option<LifecycleCallback>>,
}

impl InferencePipeline {
    pub fn builder<I, R>(references: I) -> InferencePipelineBuilder
    where
        I: IntoIterator<Item = R>,
        R: Into<VideoReference>,
    {
        InferencePipelineBuilder::new(references.into_iter().map(Into::into).collect())
    }

    /// Starts every source, the inference worker and the dispatcher.
    ///
    /// With `use_current_task` the dispatcher runs on the calling task and
    /// this method returns only when the pipeline has drained; otherwise the
    /// dispatcher is spawned and the method returns immediately.
    ///
    /// The only error surfaced here is a failed source connection (plus
    /// calling `start` twice); all later failures are reported as status
    /// events.
    pub async fn start(&self, use_current_task: bool) -> Result<(), PipelineError> {
        let startup = self
            .startup
            .lock()
            .expect("pipeline startup state poisoned")
            .take()
            .ok_or(PipelineError::AlreadyStarted)?;

        for (index, source) in self.sources.iter().enumerate() {
            if let Err(error) = source.start().await {
                // Fail fast, but do not leak producers already running.
                for started in &self.sources[..index] {
                    started.terminate(false).await;
                }
                return Err(error.into());
            }
        }

        let multiplexer = Multiplexer::new(
            self.sources.clone(),
            self.max_fps,
            self.batch_collection_timeout,
            startup.stop_rx,
            self.bus.clone(),
        );
        let (envelope_tx, envelope_rx) =
            mpsc::channel::<PredictionEnvelope>(self.settings.predictions_queue_size);

        let worker = InferenceWorker {
            multiplexer,
            on_video_frame: startup.on_video_frame,
            envelope_tx,
            bus: self.bus.clone(),
            watchdog: Arc::clone(&self.watchdog),
            policy: self.inference_error_policy,
        };
        *self
            .inference_task
            .lock()
            .expect("inference task slot poisoned") = Some(tokio::spawn(worker.run()));

        if let Some(callback) = startup.on_pipeline_start {
            callback();
        }

        let dispatcher = Dispatcher {
            envelope_rx,
            sink: startup.sink,
            sink_mode: self.sink_mode,
            source_count: self.sources.len(),
            bus: self.bus.clone(),
        };
        if use_current_task {
            dispatcher.run().await;
        } else {
            *self
                .dispatch_task
                .lock()
                .expect("dispatch task slot poisoned") = Some(tokio::spawn(dispatcher.run()));
        }
        Ok(())
    }

    /// Requests cooperative shutdown: sets the stop signal and terminates
    /// every source. Safe to call repeatedly and from any task. An in-flight
    /// inference call is never interrupted; the worker finishes its batch
    /// and drains.
    pub async fn terminate(&self) {
        let _ = self.stop_tx.send(true);
        for source in &self.sources {
            source.terminate(false).await;
        }
    }

    /// Pauses matching sources; `None` applies to all of them.
    pub fn pause_stream(&self, source_id: Option<usize>) -> Result<(), VideoSourceError> {
        self.for_each_matching(source_id, |source| source.pause())
    }

    /// Mutes matching sources; `None` applies to all of them.
    pub fn mute_stream(&self, source_id: Option<usize>) -> Result<(), VideoSourceError> {
        self.for_each_matching(source_id, |source| source.mute())
    }

    /// Resumes matching sources; `None` applies to all of them.
    pub fn resume_stream(&self, source_id: Option<usize>) -> Result<(), VideoSourceError> {
        self.for_each_matching(source_id, |source| source.resume())
    }

    /// Blocks until the inference worker and dispatcher have exited, then
    /// fires `on_pipeline_end` (exactly once across all `join` calls).
    pub async fn join(&self) {
        let inference = self
            .inference_task
            .lock()
            .expect("inference task slot poisoned")
            .take();
        if let Some(handle) = inference {
            let _ = handle.await;
        }
        let dispatch = self
            .dispatch_task
            .lock()
            .expect("dispatch task slot poisoned")
            .take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }
        let callback = self
            .on_pipeline_end
            .lock()
            .expect("pipeline end callback poisoned")
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn sources(&self) -> &[Arc<VideoSource>] {
        &self.sources
    }

    fn for_each_matching(
        &self,
        source_id: Option<usize>,
        operation: impl Fn(&VideoSource) -> Result<(), VideoSourceError>,
    ) -> Result<(), VideoSourceError> {
        for source in &self.sources {
            if source_id.is_none_or(|id| id == source.source_id()) {
                operation(source)?;
            }
        }
        Ok(())
    }
}

struct InferenceWorker {
    multiplexer: Multiplexer,
    on_video_frame: InferenceHandler,
    envelope_tx: mpsc::Sender<PredictionEnvelope>,
    bus: StatusBus,
    watchdog: Arc<dyn PipelineWatchdog>,
    policy: InferenceErrorPolicy,
}

impl InferenceWorker {
    async fn run(mut self) {
        self.bus
            .emit(UpdateSeverity::Info, INFERENCE_THREAD_STARTED_EVENT, json!({}));
        info!("inference worker started");

        while let Some(frames) = self.multiplexer.next_batch().await {
            self.watchdog.on_model_inference_started(&frames);
            let predictions = match Self::infer(&mut self.on_video_frame, &frames) {
                Ok(predictions) => predictions,
                Err(inference_error) => {
                    error!(%inference_error, "inference failed");
                    self.bus.emit(
                        UpdateSeverity::Error,
                        INFERENCE_ERROR_EVENT,
                        json!({
                            "error_message": inference_error.to_string(),
                            "error_context": "inference_worker",
                        }),
                    );
                    match self.policy {
                        InferenceErrorPolicy::Terminate => break,
                        InferenceErrorPolicy::Skip => continue,
                    }
                }
            };
            self.watchdog.on_model_prediction_ready(&frames);

            let descriptors: Vec<_> = frames.iter().map(VideoFrame::descriptor).collect();
            // Blocks when the predictions queue is full; a closed channel
            // means the dispatcher is gone and there is no one left to feed.
            if self
                .envelope_tx
                .send(PredictionEnvelope { predictions, frames })
                .await
                .is_err()
            {
                warn!("predictions queue closed, stopping inference worker");
                break;
            }
            self.bus.emit(
                UpdateSeverity::Debug,
                INFERENCE_COMPLETED_EVENT,
                json!({ "frames": descriptors }),
            );
        }

        self.bus
            .emit(UpdateSeverity::Info, INFERENCE_THREAD_FINISHED_EVENT, json!({}));
        info!("inference worker finished");
        // Dropping `envelope_tx` here closes the queue, which is the
        // dispatcher's signal to drain and exit.
    }

    fn infer(
        on_video_frame: &mut InferenceHandler,
        frames: &[VideoFrame],
    ) -> anyhow::Result<Vec<Prediction>> {
        let predictions = on_video_frame(frames)?;
        ensure!(
            predictions.len() == frames.len(),
            "inference returned {} predictions for {} frames",
            predictions.len(),
            frames.len(),
        );
        Ok(predictions)
    }
}

struct Dispatcher {
    envelope_rx: mpsc::Receiver<PredictionEnvelope>,
    sink: Option<PredictionSink>,
    sink_mode: SinkMode,
    source_count: usize,
    bus: StatusBus,
}

impl Dispatcher {
    async fn run(mut self) {
        let batch_dispatch = match self.sink_mode {
            SinkMode::Batch => true,
            SinkMode::Sequential => false,
            SinkMode::Adaptive => self.source_count > 1,
        };
        while let Some(envelope) = self.envelope_rx.recv().await {
            let Some(sink) = self.sink.as_mut() else {
                continue;
            };
            if batch_dispatch {
                if let Err(error) = sink.deliver_batch(envelope.predictions, envelope.frames) {
                    report_dispatch_error(&self.bus, &error);
                }
            } else {
                for (prediction, frame) in
                    envelope.predictions.into_iter().zip(envelope.frames)
                {
                    if let Err(error) = sink.deliver_single(prediction, frame) {
                        report_dispatch_error(&self.bus, &error);
                    }
                }
            }
        }
    }
}

/// A failing sink never stops the pipeline; the error is reported and the
/// next item is processed.
fn report_dispatch_error(bus: &StatusBus, error: &anyhow::Error) {
    warn!(%error, "error in results dispatching");
    bus.emit(
        UpdateSeverity::Error,
        INFERENCE_RESULTS_DISPATCHING_ERROR_EVENT,
        json!({
            "error_message": error.to_string(),
            "error_context": "inference_results_dispatching",
        }),
    );
}
