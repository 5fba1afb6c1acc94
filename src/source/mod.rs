//! # Video Sources
//!
//! A [`VideoSource`] owns one capture handle, one producer task and one
//! [`FrameBuffer`]. The producer loops over the capture, stamps frames and
//! pushes them into the buffer; consumers read through
//! [`VideoSource::read_frame`]. All control surface goes through the state
//! machine: `start`, `pause`, `mute`, `resume`, `restart` and `terminate`
//! request transitions, and the producer observes them at its checkpoints
//! (after each read, before each push, between reconnect attempts).
//!
//! Live sources that lose their connection re-enter an endless reconnect
//! loop with a configurable backoff; finite sources reaching end of stream
//! settle in `Ended` until restarted or terminated.

pub mod buffer;
pub mod fps;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::capture::{Capture, CaptureRegistry, SourceProperties, VideoReference};
use crate::error::VideoSourceError;
use crate::frame::{ImageData, VideoFrame};
use crate::status::{
    SOURCE_CONNECTION_ATTEMPT_FAILED_EVENT, SOURCE_CONNECTION_LOST_EVENT, StatusBus,
    UpdateSeverity, VIDEO_SOURCE_STATE_CHANGED_EVENT,
};

pub use buffer::{BufferConsumptionStrategy, BufferFillingStrategy, FrameBuffer};
pub use fps::FpsMeter;

/// Buffer capacity for live streams: freshness wins, one frame is enough.
const LIVE_BUFFER_CAPACITY: usize = 1;
/// Buffer capacity for finite files: absorb consumer jitter, drop nothing.
const FILE_BUFFER_CAPACITY: usize = 64;

/// Lifecycle state of a video source. Transitions are the only mutation
/// surface; illegal requests fail with
/// [`VideoSourceError::OperationNotPermitted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoSourceState {
    NotStarted,
    Initialising,
    Running,
    Paused,
    Muted,
    Ended,
    Error,
    Restarting,
    Terminating,
    Terminated,
}

/// Construction options for a [`VideoSource`].
#[derive(Clone)]
pub struct VideoSourceOptions {
    /// Filling discipline; negotiated from the source type when unset.
    pub buffer_filling_strategy: Option<BufferFillingStrategy>,
    /// Consumption discipline; negotiated from the source type when unset.
    pub buffer_consumption_strategy: Option<BufferConsumptionStrategy>,
    /// Capture properties applied after every (re)connection.
    pub properties: HashMap<String, f64>,
    /// Backoff between reconnect attempts.
    pub restart_attempt_delay: Duration,
    /// Restart the frame counter at 1 after `restart()` instead of
    /// continuing monotonically.
    pub frame_id_reset_on_restart: bool,
}

impl Default for VideoSourceOptions {
    fn default() -> Self {
        Self {
            buffer_filling_strategy: None,
            buffer_consumption_strategy: None,
            properties: HashMap::new(),
            restart_attempt_delay: Duration::from_secs(1),
            frame_id_reset_on_restart: false,
        }
    }
}

/// Snapshot returned by [`VideoSource::describe_source`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceDescription {
    pub source_id: usize,
    pub reference: String,
    pub state: VideoSourceState,
    pub properties: Option<SourceProperties>,
    pub buffered_frames: usize,
}

struct ControlState {
    state: VideoSourceState,
    /// Whether the next teardown should drain the buffer first.
    drain: bool,
}

/// State record plus wakeup for the producer, the mutex/condvar pair of the
/// state machine.
struct SourceControl {
    inner: Mutex<ControlState>,
    changed: Notify,
}

impl SourceControl {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ControlState {
                state: VideoSourceState::NotStarted,
                drain: false,
            }),
            changed: Notify::new(),
        }
    }

    fn state(&self) -> VideoSourceState {
        self.inner.lock().expect("source control poisoned").state
    }

    fn set(&self, new: VideoSourceState) -> VideoSourceState {
        let previous = {
            let mut guard = self.inner.lock().expect("source control poisoned");
            std::mem::replace(&mut guard.state, new)
        };
        self.changed.notify_waiters();
        previous
    }

    /// Validates and applies a transition atomically.
    fn guard_transition(
        &self,
        operation: &'static str,
        allowed: &[VideoSourceState],
        new: VideoSourceState,
        drain: Option<bool>,
    ) -> Result<VideoSourceState, VideoSourceError> {
        let previous = {
            let mut guard = self.inner.lock().expect("source control poisoned");
            if !allowed.contains(&guard.state) {
                return Err(VideoSourceError::OperationNotPermitted {
                    operation,
                    state: guard.state,
                });
            }
            if let Some(drain) = drain {
                guard.drain = drain;
            }
            std::mem::replace(&mut guard.state, new)
        };
        self.changed.notify_waiters();
        Ok(previous)
    }

    fn take_drain_flag(&self) -> bool {
        let mut guard = self.inner.lock().expect("source control poisoned");
        std::mem::take(&mut guard.drain)
    }

    /// Resolves once the state is no longer one of `states`.
    async fn wait_leave(&self, states: &[VideoSourceState]) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !states.contains(&self.state()) {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the state equals `target`.
    async fn wait_for(&self, target: VideoSourceState) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == target {
                return;
            }
            notified.await;
        }
    }
}

/// Everything shared between the handle and its producer task.
struct SourceShared {
    source_id: usize,
    reference: VideoReference,
    registry: CaptureRegistry,
    property_overrides: HashMap<String, f64>,
    restart_attempt_delay: Duration,
    frame_id_reset_on_restart: bool,
    control: SourceControl,
    buffer: FrameBuffer,
    bus: StatusBus,
    properties: Mutex<Option<SourceProperties>>,
    next_frame_id: AtomicU64,
    producer_fps: FpsMeter,
}

impl SourceShared {
    fn switch_state(&self, new: VideoSourceState) {
        let previous = self.control.set(new);
        self.report_state_change(previous, new);
    }

    fn guarded_transition(
        &self,
        operation: &'static str,
        allowed: &[VideoSourceState],
        new: VideoSourceState,
        drain: Option<bool>,
    ) -> Result<(), VideoSourceError> {
        let previous = self.control.guard_transition(operation, allowed, new, drain)?;
        self.report_state_change(previous, new);
        Ok(())
    }

    /// Producer-side state change. A termination request always wins: once
    /// the control side has set `Terminating`, the producer must not
    /// overwrite it or `terminate()` would wait forever.
    fn producer_switch(&self, new: VideoSourceState) {
        let previous = {
            let mut guard = self
                .control
                .inner
                .lock()
                .expect("source control poisoned");
            if matches!(
                guard.state,
                VideoSourceState::Terminating | VideoSourceState::Terminated
            ) {
                return;
            }
            std::mem::replace(&mut guard.state, new)
        };
        self.control.changed.notify_waiters();
        self.report_state_change(previous, new);
    }

    fn report_state_change(&self, previous: VideoSourceState, new: VideoSourceState) {
        if previous == new {
            return;
        }
        debug!(source_id = self.source_id, ?previous, ?new, "video source state changed");
        // DEBUG so the bus throttle caps the stream from a source that
        // oscillates rapidly, e.g. a flaky reconnect loop.
        self.bus.emit(
            UpdateSeverity::Debug,
            VIDEO_SOURCE_STATE_CHANGED_EVENT,
            json!({"previous_state": previous, "new_state": new}),
        );
    }

    fn apply_overrides(&self, capture: &mut dyn Capture) {
        for (name, value) in &self.property_overrides {
            if let Err(error) = capture.set_property(name, *value) {
                warn!(
                    source_id = self.source_id,
                    property = name.as_str(),
                    %error,
                    "capture rejected source property",
                );
            }
        }
    }

    fn is_file(&self) -> bool {
        self.properties
            .lock()
            .expect("source properties poisoned")
            .map(|p| p.is_file)
            .unwrap_or(false)
    }
}

/// A single video source within a pipeline. All operations take `&self` and
/// are safe to call from any task.
pub struct VideoSource {
    shared: Arc<SourceShared>,
    explicit_filling: Option<BufferFillingStrategy>,
    explicit_consumption: Option<BufferConsumptionStrategy>,
    producer: Mutex<Option<JoinHandle<()>>>,
    consumer_fps: FpsMeter,
}

impl VideoSource {
    pub fn new(
        source_id: usize,
        reference: VideoReference,
        registry: CaptureRegistry,
        options: VideoSourceOptions,
        bus: &StatusBus,
    ) -> Self {
        let scoped_bus = bus.with_sub_context(&format!("video_source.{source_id}"));
        let shared = SourceShared {
            source_id,
            reference,
            registry,
            property_overrides: options.properties,
            restart_attempt_delay: options.restart_attempt_delay,
            frame_id_reset_on_restart: options.frame_id_reset_on_restart,
            control: SourceControl::new(),
            buffer: FrameBuffer::new(
                LIVE_BUFFER_CAPACITY,
                BufferFillingStrategy::DropOldest,
                BufferConsumptionStrategy::Latest,
                scoped_bus.clone(),
            ),
            bus: scoped_bus,
            properties: Mutex::new(None),
            next_frame_id: AtomicU64::new(1),
            producer_fps: FpsMeter::new(),
        };
        Self {
            shared: Arc::new(shared),
            explicit_filling: options.buffer_filling_strategy,
            explicit_consumption: options.buffer_consumption_strategy,
            producer: Mutex::new(None),
            consumer_fps: FpsMeter::new(),
        }
    }

    pub fn source_id(&self) -> usize {
        self.shared.source_id
    }

    pub fn state(&self) -> VideoSourceState {
        self.shared.control.state()
    }

    pub fn reference(&self) -> &VideoReference {
        &self.shared.reference
    }

    /// Properties of the connected capture; `None` before the first
    /// successful connection.
    pub fn properties(&self) -> Option<SourceProperties> {
        *self.shared.properties.lock().expect("source properties poisoned")
    }

    pub(crate) fn buffer(&self) -> &FrameBuffer {
        &self.shared.buffer
    }

    /// Connects the capture and spawns the producer.
    ///
    /// Permitted from `NotStarted` and `Ended`; starting a finished source
    /// goes through the restart path. If the first connection attempt fails
    /// the source is left in `Error` and the failure is returned: callers
    /// decide whether to retry via [`VideoSource::restart`].
    pub async fn start(&self) -> Result<(), VideoSourceError> {
        match self.state() {
            VideoSourceState::NotStarted => {}
            VideoSourceState::Ended => return self.restart(false),
            state => {
                return Err(VideoSourceError::OperationNotPermitted {
                    operation: "start",
                    state,
                });
            }
        }
        self.shared.switch_state(VideoSourceState::Initialising);
        let mut capture = match self.shared.registry.open(&self.shared.reference).await {
            Ok(capture) => capture,
            Err(error) => {
                self.shared.switch_state(VideoSourceState::Error);
                return Err(VideoSourceError::SourceConnection {
                    reference: self.shared.reference.to_string(),
                    attempts: 1,
                    reason: error.to_string(),
                });
            }
        };
        self.shared.apply_overrides(&mut *capture);
        let properties = capture.properties();
        *self.shared.properties.lock().expect("source properties poisoned") = Some(properties);

        // Buffer disciplines default per source type: files process every
        // frame in order, live streams prioritize freshness.
        let filling = self.explicit_filling.unwrap_or(if properties.is_file {
            BufferFillingStrategy::Wait
        } else {
            BufferFillingStrategy::DropOldest
        });
        let consumption = self.explicit_consumption.unwrap_or(if properties.is_file {
            BufferConsumptionStrategy::Eager
        } else {
            BufferConsumptionStrategy::Latest
        });
        let capacity = if properties.is_file {
            FILE_BUFFER_CAPACITY
        } else {
            LIVE_BUFFER_CAPACITY
        };
        self.shared.buffer.reconfigure(capacity, filling, consumption);

        self.shared.switch_state(VideoSourceState::Running);
        self.spawn_producer(Some(capture));
        Ok(())
    }

    /// `Running -> Paused`. The producer stops reading; buffered frames
    /// remain readable.
    pub fn pause(&self) -> Result<(), VideoSourceError> {
        self.shared.guarded_transition(
            "pause",
            &[VideoSourceState::Running],
            VideoSourceState::Paused,
            None,
        )
    }

    /// `Running -> Muted`. The producer keeps reading, so the transport does
    /// not back up, but every frame is discarded.
    pub fn mute(&self) -> Result<(), VideoSourceError> {
        self.shared.guarded_transition(
            "mute",
            &[VideoSourceState::Running],
            VideoSourceState::Muted,
            None,
        )
    }

    /// `Paused | Muted -> Running`.
    pub fn resume(&self) -> Result<(), VideoSourceError> {
        self.shared.guarded_transition(
            "resume",
            &[VideoSourceState::Paused, VideoSourceState::Muted],
            VideoSourceState::Running,
            None,
        )
    }

    /// Requests a teardown-and-reconnect cycle. With
    /// `wait_on_frames_consumption` the buffer is drained by the consumer
    /// before teardown; otherwise buffered frames are dropped immediately.
    pub fn restart(&self, wait_on_frames_consumption: bool) -> Result<(), VideoSourceError> {
        self.shared.guarded_transition(
            "restart",
            &[
                VideoSourceState::Running,
                VideoSourceState::Paused,
                VideoSourceState::Muted,
                VideoSourceState::Error,
                VideoSourceState::Ended,
            ],
            VideoSourceState::Restarting,
            Some(wait_on_frames_consumption),
        )?;
        // A source whose start() failed has no producer to carry out the
        // reconnect; give it one.
        self.ensure_producer();
        Ok(())
    }

    /// Stops the producer and releases the capture. Idempotent and permitted
    /// from any state; returns once the source reaches `Terminated`.
    pub async fn terminate(&self, wait_on_frames_consumption: bool) {
        enum Request {
            AlreadyDone,
            InFlight,
            Proceed,
        }
        let request = {
            let mut guard = self
                .shared
                .control
                .inner
                .lock()
                .expect("source control poisoned");
            match guard.state {
                VideoSourceState::Terminated => Request::AlreadyDone,
                VideoSourceState::Terminating => Request::InFlight,
                _ => {
                    guard.drain = wait_on_frames_consumption;
                    let previous =
                        std::mem::replace(&mut guard.state, VideoSourceState::Terminating);
                    drop(guard);
                    self.shared.control.changed.notify_waiters();
                    self.shared
                        .report_state_change(previous, VideoSourceState::Terminating);
                    Request::Proceed
                }
            }
        };
        match request {
            Request::AlreadyDone => {}
            Request::InFlight => {
                self.shared.control.wait_for(VideoSourceState::Terminated).await;
            }
            Request::Proceed => {
                let handle = self.producer.lock().expect("producer slot poisoned").take();
                match handle {
                    Some(handle) => {
                        let _ = handle.await;
                    }
                    None => {
                        // Never started or already failed: settle directly.
                        self.shared.buffer.drop_all();
                        self.shared.switch_state(VideoSourceState::Terminated);
                    }
                }
            }
        }
    }

    /// Reads the next frame under the consumption discipline, waiting up to
    /// `timeout` for one to arrive.
    pub async fn read_frame(&self, timeout: Duration) -> Option<VideoFrame> {
        let mut frame = self.shared.buffer.get(timeout).await?;
        frame.measured_fps = self.consumer_fps.tick();
        Some(frame)
    }

    /// Non-blocking read used by the multiplexer's collection round.
    pub fn try_read_frame(&self) -> Option<VideoFrame> {
        let mut frame = self.shared.buffer.try_get()?;
        frame.measured_fps = self.consumer_fps.tick();
        Some(frame)
    }

    /// Resolves once at least one frame is buffered; used by the
    /// multiplexer's idle wait.
    pub(crate) async fn wait_frame_available(&self) {
        self.shared.buffer.wait_not_empty().await;
    }

    pub fn describe_source(&self) -> SourceDescription {
        SourceDescription {
            source_id: self.shared.source_id,
            reference: self.shared.reference.to_string(),
            state: self.state(),
            properties: self.properties(),
            buffered_frames: self.shared.buffer.len(),
        }
    }

    fn spawn_producer(&self, capture: Option<Box<dyn Capture>>) {
        let worker = Producer {
            shared: Arc::clone(&self.shared),
            capture,
        };
        *self.producer.lock().expect("producer slot poisoned") = Some(tokio::spawn(worker.run()));
    }

    fn ensure_producer(&self) {
        let alive = self
            .producer
            .lock()
            .expect("producer slot poisoned")
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if !alive {
            self.spawn_producer(None);
        }
    }
}

/// The per-source worker: reads frames, honors the state machine, handles
/// reconnects and teardown.
struct Producer {
    shared: Arc<SourceShared>,
    capture: Option<Box<dyn Capture>>,
}

impl Producer {
    async fn run(mut self) {
        loop {
            match self.shared.control.state() {
                VideoSourceState::Running | VideoSourceState::Muted => self.step_decode().await,
                VideoSourceState::Paused => {
                    self.shared
                        .control
                        .wait_leave(&[VideoSourceState::Paused])
                        .await;
                }
                VideoSourceState::Ended => {
                    self.shared
                        .control
                        .wait_leave(&[VideoSourceState::Ended])
                        .await;
                }
                VideoSourceState::Error => {
                    self.shared.producer_switch(VideoSourceState::Restarting);
                }
                VideoSourceState::Restarting => self.step_restart().await,
                VideoSourceState::Terminating => {
                    self.step_terminate().await;
                    return;
                }
                VideoSourceState::Terminated => return,
                VideoSourceState::NotStarted | VideoSourceState::Initialising => {
                    self.shared
                        .control
                        .wait_leave(&[VideoSourceState::NotStarted, VideoSourceState::Initialising])
                        .await;
                }
            }
        }
    }

    async fn step_decode(&mut self) {
        let Some(capture) = self.capture.as_mut() else {
            self.shared.producer_switch(VideoSourceState::Restarting);
            return;
        };
        let decoding = &[VideoSourceState::Running, VideoSourceState::Muted];
        let read = tokio::select! {
            result = capture.read() => result,
            _ = self.shared.control.wait_leave(decoding) => return,
        };
        match read {
            Ok(Some(image)) => {
                self.shared.producer_fps.tick();
                // Checkpoint between read and push: the state may have
                // changed while the frame was decoding.
                match self.shared.control.state() {
                    VideoSourceState::Running => {
                        let frame = self.stamp(image);
                        tokio::select! {
                            _ = self.shared.buffer.put(frame) => {}
                            _ = self.shared.control.wait_leave(&[VideoSourceState::Running]) => {}
                        }
                    }
                    VideoSourceState::Muted => {
                        // Decoded and discarded: muting keeps the transport
                        // drained without delivering frames.
                    }
                    _ => {}
                }
            }
            Ok(None) => self.handle_end_of_stream(),
            Err(error) => self.handle_read_error(error),
        }
    }

    fn handle_end_of_stream(&mut self) {
        if self.shared.is_file() {
            self.shared.producer_switch(VideoSourceState::Ended);
        } else {
            self.report_connection_lost("end_of_stream");
            self.shared.producer_switch(VideoSourceState::Error);
        }
    }

    fn handle_read_error(&mut self, error: anyhow::Error) {
        if self.shared.is_file() {
            warn!(
                source_id = self.shared.source_id,
                %error,
                "read error on file source, ending stream",
            );
            self.shared.producer_switch(VideoSourceState::Ended);
        } else {
            self.report_connection_lost(&error.to_string());
            self.shared.producer_switch(VideoSourceState::Error);
        }
    }

    fn report_connection_lost(&self, reason: &str) {
        self.shared.bus.emit(
            UpdateSeverity::Warning,
            SOURCE_CONNECTION_LOST_EVENT,
            json!({
                "reference": self.shared.reference.to_string(),
                "reason": reason,
            }),
        );
    }

    async fn step_restart(&mut self) {
        if self.shared.control.take_drain_flag() {
            tokio::select! {
                _ = self.shared.buffer.wait_empty() => {}
                _ = self.shared.control.wait_leave(&[VideoSourceState::Restarting]) => return,
            }
        } else {
            self.shared.buffer.drop_all();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.release().await;
        }
        self.shared.producer_switch(VideoSourceState::Initialising);
        if let Some(capture) = self.reconnect().await {
            let properties = capture.properties();
            *self
                .shared
                .properties
                .lock()
                .expect("source properties poisoned") = Some(properties);
            if self.shared.frame_id_reset_on_restart {
                self.shared.next_frame_id.store(1, Ordering::SeqCst);
            }
            self.shared.producer_fps.reset();
            self.capture = Some(capture);
            self.shared.producer_switch(VideoSourceState::Running);
        }
        // A `None` means termination was requested mid-reconnect; the main
        // loop dispatches it.
    }

    /// Reopens the capture, retrying forever with backoff until it succeeds
    /// or the source is terminated.
    async fn reconnect(&mut self) -> Option<Box<dyn Capture>> {
        let mut attempts: u32 = 0;
        loop {
            if self.shared.control.state() == VideoSourceState::Terminating {
                return None;
            }
            match self.shared.registry.open(&self.shared.reference).await {
                Ok(mut capture) => {
                    self.shared.apply_overrides(&mut *capture);
                    return Some(capture);
                }
                Err(error) => {
                    attempts += 1;
                    self.shared.bus.emit(
                        UpdateSeverity::Warning,
                        SOURCE_CONNECTION_ATTEMPT_FAILED_EVENT,
                        json!({
                            "reference": self.shared.reference.to_string(),
                            "attempts": attempts,
                            "reason": error.to_string(),
                        }),
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.shared.restart_attempt_delay) => {}
                        _ = self.shared.control.wait_for(VideoSourceState::Terminating) => {
                            return None;
                        }
                    }
                }
            }
        }
    }

    async fn step_terminate(&mut self) {
        if self.shared.control.take_drain_flag() {
            self.shared.buffer.wait_empty().await;
        } else {
            self.shared.buffer.drop_all();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.release().await;
        }
        self.shared.switch_state(VideoSourceState::Terminated);
    }

    fn stamp(&self, image: ImageData) -> VideoFrame {
        VideoFrame {
            image,
            frame_id: self.shared.next_frame_id.fetch_add(1, Ordering::SeqCst),
            frame_timestamp: SystemTime::now(),
            source_id: self.shared.source_id,
            fps: self.shared.producer_fps.rate(),
            measured_fps: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_transition_rejects_illegal_moves() {
        let control = SourceControl::new();
        let error = control
            .guard_transition(
                "pause",
                &[VideoSourceState::Running],
                VideoSourceState::Paused,
                None,
            )
            .unwrap_err();
        assert!(matches!(
            error,
            VideoSourceError::OperationNotPermitted {
                operation: "pause",
                state: VideoSourceState::NotStarted,
            }
        ));
        assert_eq!(control.state(), VideoSourceState::NotStarted);
    }

    #[test]
    fn guard_transition_applies_state_and_drain_flag() {
        let control = SourceControl::new();
        control.set(VideoSourceState::Running);
        control
            .guard_transition(
                "restart",
                &[VideoSourceState::Running],
                VideoSourceState::Restarting,
                Some(true),
            )
            .unwrap();
        assert_eq!(control.state(), VideoSourceState::Restarting);
        assert!(control.take_drain_flag());
        assert!(!control.take_drain_flag());
    }
}
