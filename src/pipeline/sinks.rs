//! Prediction sinks and dispatch modes.
//!
//! A sink consumes inference results. Callers declare its shape explicitly:
//! [`PredictionSink::Batch`] receives parallel prediction/frame lists,
//! [`PredictionSink::Sequential`] receives one pair at a time. The
//! [`SinkMode`] chosen on the pipeline decides the dispatch granularity;
//! when granularity and sink shape disagree, the dispatcher adapts (a batch
//! sink gets singleton lists, a sequential sink gets the envelope pairwise),
//! so every combination is total.

use anyhow::Result;
use tracing::warn;

use crate::frame::{Prediction, VideoFrame};

/// Dispatch granularity applied by the pipeline's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkMode {
    /// Batch granularity with two or more sources, sequential otherwise.
    #[default]
    Adaptive,
    /// Always hand the sink whole envelopes.
    Batch,
    /// Always hand the sink one prediction/frame pair at a time.
    Sequential,
}

pub type BatchSinkFn = Box<dyn FnMut(Vec<Prediction>, Vec<VideoFrame>) -> Result<()> + Send>;
pub type SequentialSinkFn = Box<dyn FnMut(Prediction, VideoFrame) -> Result<()> + Send>;

/// User-supplied consumer of inference results.
pub enum PredictionSink {
    Batch(BatchSinkFn),
    Sequential(SequentialSinkFn),
}

impl PredictionSink {
    pub fn batch<F>(sink: F) -> Self
    where
        F: FnMut(Vec<Prediction>, Vec<VideoFrame>) -> Result<()> + Send + 'static,
    {
        Self::Batch(Box::new(sink))
    }

    pub fn sequential<F>(sink: F) -> Self
    where
        F: FnMut(Prediction, VideoFrame) -> Result<()> + Send + 'static,
    {
        Self::Sequential(Box::new(sink))
    }

    /// Delivers a whole envelope. A sequential sink receives the pairs in
    /// order; every pair is attempted even when an earlier one fails, and
    /// the failures are folded into one aggregate error.
    pub(crate) fn deliver_batch(
        &mut self,
        predictions: Vec<Prediction>,
        frames: Vec<VideoFrame>,
    ) -> Result<()> {
        match self {
            Self::Batch(sink) => sink(predictions, frames),
            Self::Sequential(sink) => {
                let total = predictions.len();
                let mut failures = 0usize;
                let mut first_error = None;
                for (prediction, frame) in predictions.into_iter().zip(frames) {
                    if let Err(error) = sink(prediction, frame) {
                        failures += 1;
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                }
                match first_error {
                    None => Ok(()),
                    Some(error) => Err(error
                        .context(format!("{failures} of {total} frame deliveries failed"))),
                }
            }
        }
    }

    /// Delivers a single pair. A batch sink receives singleton lists.
    pub(crate) fn deliver_single(
        &mut self,
        prediction: Prediction,
        frame: VideoFrame,
    ) -> Result<()> {
        match self {
            Self::Batch(sink) => sink(vec![prediction], vec![frame]),
            Self::Sequential(sink) => sink(prediction, frame),
        }
    }
}

impl std::fmt::Debug for PredictionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch(_) => f.write_str("PredictionSink::Batch"),
            Self::Sequential(_) => f.write_str("PredictionSink::Sequential"),
        }
    }
}

/// Combines several sinks into one. Each envelope is forwarded to every
/// inner sink; a failing sink is logged and does not stop delivery to the
/// remaining ones.
pub fn multi_sink(mut sinks: Vec<PredictionSink>) -> PredictionSink {
    PredictionSink::batch(move |predictions, frames| {
        for (index, sink) in sinks.iter_mut().enumerate() {
            if let Err(error) = sink.deliver_batch(predictions.clone(), frames.clone()) {
                warn!(sink = index, %error, "sink failed inside multi_sink, continuing");
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    fn frame(frame_id: u64, source_id: usize) -> VideoFrame {
        VideoFrame {
            image: Arc::new(Vec::new()),
            frame_id,
            frame_timestamp: SystemTime::now(),
            source_id,
            fps: None,
            measured_fps: None,
        }
    }

    #[test]
    fn sequential_sink_receives_batch_pairwise_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut sink = PredictionSink::sequential(move |_prediction, frame| {
            sink_seen.lock().unwrap().push(frame.frame_id);
            Ok(())
        });

        sink.deliver_batch(
            vec![json!({}), json!({}), json!({})],
            vec![frame(1, 0), frame(2, 0), frame(3, 0)],
        )
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn batch_sink_receives_single_pair_as_singleton_lists() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut sink = PredictionSink::batch(move |predictions, frames| {
            sink_seen
                .lock()
                .unwrap()
                .push((predictions.len(), frames.len()));
            Ok(())
        });

        sink.deliver_single(json!({"label": "cat"}), frame(7, 1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1)]);
    }

    #[test]
    fn sequential_delivery_attempts_every_pair_despite_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink_calls = Arc::clone(&calls);
        let mut sink = PredictionSink::sequential(move |_, _| {
            let call = sink_calls.fetch_add(1, Ordering::SeqCst);
            if call == 1 {
                anyhow::bail!("sink refused pair {call}")
            }
            Ok(())
        });

        let result = sink.deliver_batch(
            vec![json!({}), json!({}), json!({})],
            vec![frame(1, 0), frame(2, 0), frame(3, 0)],
        );
        // One pair failed but the remaining pairs were still delivered.
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("1 of 3"));
    }

    #[test]
    fn multi_sink_forwards_to_all_even_when_one_fails() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first_calls);
        let failing = PredictionSink::batch(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        });
        let counter = Arc::clone(&second_calls);
        let healthy = PredictionSink::batch(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut combined = multi_sink(vec![failing, healthy]);
        combined
            .deliver_batch(vec![json!({})], vec![frame(1, 0)])
            .unwrap();

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }
}
