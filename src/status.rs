//! # Status Updates
//!
//! Push-based observability channel. Every component of the pipeline reports
//! lifecycle and error events through a [`StatusBus`], which fans each
//! [`StatusUpdate`] out to the handlers registered at construction time.
//!
//! Delivery is synchronous on the emitting task: handlers must be fast, and
//! a slow handler degrades pipeline throughput. Handler failures are logged
//! and swallowed so that observability can never take the pipeline down.
//! Repeated DEBUG-level events (frame drops, per-batch completions) are
//! throttled per event type and context to keep the bus from flooding
//! handlers on the hot path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Root context attached to every update emitted by a pipeline.
pub const INFERENCE_PIPELINE_CONTEXT: &str = "inference_pipeline";

pub const SOURCE_CONNECTION_ATTEMPT_FAILED_EVENT: &str = "SOURCE_CONNECTION_ATTEMPT_FAILED";
pub const SOURCE_CONNECTION_LOST_EVENT: &str = "SOURCE_CONNECTION_LOST";
pub const INFERENCE_THREAD_STARTED_EVENT: &str = "INFERENCE_THREAD_STARTED";
pub const INFERENCE_THREAD_FINISHED_EVENT: &str = "INFERENCE_THREAD_FINISHED";
pub const INFERENCE_COMPLETED_EVENT: &str = "INFERENCE_COMPLETED";
pub const INFERENCE_ERROR_EVENT: &str = "INFERENCE_ERROR";
pub const INFERENCE_RESULTS_DISPATCHING_ERROR_EVENT: &str = "INFERENCE_RESULTS_DISPATCHING_ERROR";
pub const FRAME_DROPPED_EVENT: &str = "FRAME_DROPPED";
pub const VIDEO_SOURCE_STATE_CHANGED_EVENT: &str = "VIDEO_SOURCE_STATE_CHANGED";

/// Severity attached to a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// A single timestamped event observed somewhere in the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub timestamp: SystemTime,
    pub severity: UpdateSeverity,
    pub event_type: &'static str,
    pub payload: Map<String, Value>,
    /// Dotted origin path, e.g. `inference_pipeline.video_source.3`.
    pub context: String,
}

/// Callback invoked for every emitted update. An `Err` return is logged at
/// warning level and otherwise ignored.
pub type StatusHandler = Arc<dyn Fn(&StatusUpdate) -> anyhow::Result<()> + Send + Sync>;

/// Fan-out bus for status updates.
///
/// The handler list is fixed at construction and shared by all clones, so
/// emission takes no lock on the handler path. Cloning is cheap; components
/// derive scoped handles with [`StatusBus::with_sub_context`].
#[derive(Clone)]
pub struct StatusBus {
    handlers: Arc<Vec<StatusHandler>>,
    context: String,
    throttle: Duration,
    last_debug: Arc<Mutex<HashMap<(&'static str, String), Instant>>>,
}

impl StatusBus {
    pub fn new(handlers: Vec<StatusHandler>, throttle: Duration) -> Self {
        Self {
            handlers: Arc::new(handlers),
            context: INFERENCE_PIPELINE_CONTEXT.to_string(),
            throttle,
            last_debug: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A bus with no handlers, for components constructed outside a pipeline.
    pub fn disconnected() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    /// Derives a handle whose context is `<base>.<sub_context>`. The handler
    /// list and throttle bookkeeping stay shared with the parent.
    pub fn with_sub_context(&self, sub_context: &str) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            context: format!("{}.{}", self.context, sub_context),
            throttle: self.throttle,
            last_debug: Arc::clone(&self.last_debug),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Builds an update and hands it to every registered handler.
    ///
    /// `payload` is expected to be a JSON object; any other value is replaced
    /// with an empty map. DEBUG-severity events are throttled per
    /// `(event_type, context)` key.
    pub fn emit(&self, severity: UpdateSeverity, event_type: &'static str, payload: Value) {
        if severity == UpdateSeverity::Debug && !self.debug_slot_open(event_type) {
            return;
        }
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let update = StatusUpdate {
            timestamp: SystemTime::now(),
            severity,
            event_type,
            payload,
            context: self.context.clone(),
        };
        for handler in self.handlers.iter() {
            if let Err(error) = handler(&update) {
                warn!(event_type, %error, "status handler failed, update dropped for this handler");
            }
        }
    }

    fn debug_slot_open(&self, event_type: &'static str) -> bool {
        if self.throttle.is_zero() {
            return true;
        }
        let mut last = self.last_debug.lock().expect("status throttle map poisoned");
        let key = (event_type, self.context.clone());
        let now = Instant::now();
        match last.get(&key) {
            Some(previous) if now.duration_since(*previous) < self.throttle => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }
}

impl std::fmt::Debug for StatusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBus")
            .field("handlers", &self.handlers.len())
            .field("context", &self.context)
            .field("throttle", &self.throttle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording_bus(throttle: Duration) -> (StatusBus, Arc<Mutex<Vec<StatusUpdate>>>) {
        let seen: Arc<Mutex<Vec<StatusUpdate>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: StatusHandler = Arc::new(move |update| {
            sink.lock().unwrap().push(update.clone());
            Ok(())
        });
        (StatusBus::new(vec![handler], throttle), seen)
    }

    #[test]
    fn emits_to_all_handlers_with_context() {
        let (bus, seen) = recording_bus(Duration::ZERO);
        let scoped = bus.with_sub_context("video_source.3");
        scoped.emit(
            UpdateSeverity::Warning,
            SOURCE_CONNECTION_LOST_EVENT,
            json!({"reference": "rtsp://cam"}),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].context, "inference_pipeline.video_source.3");
        assert_eq!(seen[0].payload["reference"], "rtsp://cam");
    }

    #[test]
    fn handler_errors_are_swallowed() {
        let failing: StatusHandler = Arc::new(|_| Err(anyhow::anyhow!("handler boom")));
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let recording: StatusHandler = Arc::new(move |update| {
            sink.lock().unwrap().push(update.event_type);
            Ok(())
        });

        let bus = StatusBus::new(vec![failing, recording], Duration::ZERO);
        bus.emit(UpdateSeverity::Info, INFERENCE_THREAD_STARTED_EVENT, json!({}));

        // The failing handler must not prevent delivery to the next one.
        assert_eq!(*seen.lock().unwrap(), vec![INFERENCE_THREAD_STARTED_EVENT]);
    }

    #[test]
    fn debug_events_are_throttled_per_event_and_context() {
        let (bus, seen) = recording_bus(Duration::from_secs(60));
        for _ in 0..5 {
            bus.emit(UpdateSeverity::Debug, FRAME_DROPPED_EVENT, json!({}));
        }
        // Different event type and different context each get their own slot.
        bus.emit(UpdateSeverity::Debug, INFERENCE_COMPLETED_EVENT, json!({}));
        bus.with_sub_context("video_source.0")
            .emit(UpdateSeverity::Debug, FRAME_DROPPED_EVENT, json!({}));

        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn non_debug_severities_are_never_throttled() {
        let (bus, seen) = recording_bus(Duration::from_secs(60));
        for _ in 0..4 {
            bus.emit(
                UpdateSeverity::Warning,
                SOURCE_CONNECTION_ATTEMPT_FAILED_EVENT,
                json!({}),
            );
        }
        assert_eq!(seen.lock().unwrap().len(), 4);
    }
}
