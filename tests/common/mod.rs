//! Shared fixtures for the integration suites: a status recorder, collecting
//! sinks, raw video files on disk and a capture backend with scripted
//! connection failures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use infermux::capture::{Capture, CaptureFactory, SourceProperties, VideoReference};
use infermux::frame::{FrameDescriptor, ImageData, Prediction, VideoFrame};
use infermux::pipeline::PredictionSink;
use infermux::status::{StatusHandler, StatusUpdate};
use infermux::PipelineSettings;

/// Settings tuned for tests: quick reconnects and no status throttling, so
/// event counts are deterministic.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        predictions_queue_size: 64,
        restart_attempt_delay: Duration::from_millis(20),
        status_throttle: Duration::ZERO,
    }
}

/// Records every status update it sees.
#[derive(Clone, Default)]
pub struct StatusRecorder {
    updates: Arc<Mutex<Vec<StatusUpdate>>>,
}

impl StatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> StatusHandler {
        let updates = Arc::clone(&self.updates);
        Arc::new(move |update: &StatusUpdate| {
            updates.lock().unwrap().push(update.clone());
            Ok(())
        })
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|update| update.event_type == event_type)
            .count()
    }

    pub fn total(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

/// Sequential sink that records each delivered pair.
pub fn collecting_sequential_sink()
-> (PredictionSink, Arc<Mutex<Vec<(Prediction, FrameDescriptor)>>>) {
    let seen: Arc<Mutex<Vec<(Prediction, FrameDescriptor)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink = PredictionSink::sequential(move |prediction, frame| {
        sink_seen
            .lock()
            .unwrap()
            .push((prediction, frame.descriptor()));
        Ok(())
    });
    (sink, seen)
}

/// Batch sink that records each delivered envelope as frame descriptors.
pub fn collecting_batch_sink() -> (PredictionSink, Arc<Mutex<Vec<Vec<FrameDescriptor>>>>) {
    let seen: Arc<Mutex<Vec<Vec<FrameDescriptor>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink = PredictionSink::batch(move |_predictions, frames| {
        sink_seen
            .lock()
            .unwrap()
            .push(frames.iter().map(VideoFrame::descriptor).collect());
        Ok(())
    });
    (sink, seen)
}

/// Identity inference: echoes each frame's id as its prediction.
pub fn identity_inference(frames: &[VideoFrame]) -> Result<Vec<Prediction>> {
    Ok(frames
        .iter()
        .map(|frame| serde_json::json!({ "frame_id": frame.frame_id, "source_id": frame.source_id }))
        .collect())
}

/// Writes a raw BGRA video of `frames` frames to a temp file and returns the
/// file (keep it alive) plus a `file://` reference for it.
pub fn write_raw_video(frames: usize, width: u32, height: u32) -> (tempfile::NamedTempFile, String) {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    let frame_size = (width * height * 4) as usize;
    for index in 0..frames {
        file.write_all(&vec![index as u8; frame_size]).expect("write frame");
    }
    file.flush().expect("flush");
    let uri = format!(
        "file://{}?width={width}&height={height}&fps=25",
        file.path().display()
    );
    (file, uri)
}

/// Capture backend with scripted failures: the first connection delivers
/// `frames_before_failure` frames and then drops; the next `failing_opens`
/// reconnection attempts fail; after that connections are healthy and
/// endless. Registered under a scheme of the caller's choice.
pub struct FlakyCaptureFactory {
    opens: AtomicU32,
    frames_before_failure: u64,
    failing_opens: u32,
    frame_interval: Duration,
}

impl FlakyCaptureFactory {
    pub fn new(frames_before_failure: u64, failing_opens: u32) -> Self {
        Self {
            opens: AtomicU32::new(0),
            frames_before_failure,
            failing_opens,
            frame_interval: Duration::from_millis(3),
        }
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureFactory for FlakyCaptureFactory {
    async fn open(&self, _reference: &VideoReference) -> Result<Box<dyn Capture>> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            Ok(Box::new(FlakyCapture {
                remaining: Some(self.frames_before_failure),
                frame_interval: self.frame_interval,
                released: false,
            }))
        } else if attempt <= self.failing_opens {
            Err(anyhow!("simulated connection refusal (attempt {attempt})"))
        } else {
            Ok(Box::new(FlakyCapture {
                remaining: None,
                frame_interval: self.frame_interval,
                released: false,
            }))
        }
    }
}

struct FlakyCapture {
    /// Frames left before the simulated drop; `None` means healthy forever.
    remaining: Option<u64>,
    frame_interval: Duration,
    released: bool,
}

#[async_trait]
impl Capture for FlakyCapture {
    async fn read(&mut self) -> Result<Option<ImageData>> {
        if self.released {
            bail!("capture already released");
        }
        tokio::time::sleep(self.frame_interval).await;
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                bail!("simulated mid-stream connection loss");
            }
            *remaining -= 1;
        }
        Ok(Some(Arc::new(vec![0u8; 16])))
    }

    fn properties(&self) -> SourceProperties {
        SourceProperties {
            width: 2,
            height: 2,
            declared_fps: 1.0 / self.frame_interval.as_secs_f64(),
            total_frames: -1,
            is_file: false,
        }
    }

    fn set_property(&mut self, _name: &str, _value: f64) -> Result<()> {
        Ok(())
    }

    fn get_property(&self, _name: &str) -> Option<f64> {
        None
    }

    async fn release(&mut self) {
        self.released = true;
    }
}

/// Per-source frame id collection out of batch descriptors.
pub fn ids_by_source(batches: &[Vec<FrameDescriptor>]) -> HashMap<usize, Vec<u64>> {
    let mut by_source: HashMap<usize, Vec<u64>> = HashMap::new();
    for batch in batches {
        for descriptor in batch {
            by_source
                .entry(descriptor.source_id)
                .or_default()
                .push(descriptor.frame_id);
        }
    }
    by_source
}

/// Asserts a strictly increasing sequence.
pub fn assert_strictly_increasing(ids: &[u64], context: &str) {
    for window in ids.windows(2) {
        assert!(
            window[0] < window[1],
            "{context}: frame ids not strictly increasing: {} then {}",
            window[0],
            window[1],
        );
    }
}
