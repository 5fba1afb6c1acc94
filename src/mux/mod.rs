//! # Multiplexer
//!
//! Interleaves N concurrent video sources into one lazy sequence of frame
//! batches. A batch holds at most one frame per source, ordered by
//! ascending `source_id`; the collection round-robin rotates its starting
//! source every batch so that no source can monopolize partial batches.
//!
//! The sequence ends when every source is terminated (or ended with an empty
//! buffer) or when the pipeline's stop signal fires. An optional
//! [`RateLimiter`] gates emission.

pub mod rate_limiter;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::select_all;
use serde_json::json;
use tokio::sync::watch;

use crate::frame::VideoFrame;
use crate::source::{VideoSource, VideoSourceState};
use crate::status::{FRAME_DROPPED_EVENT, StatusBus, UpdateSeverity};

pub use rate_limiter::{
    RateLimiter, RateLimiterStrategy, RateLimiterVerdict, negotiate_rate_limiter_strategy,
};

/// Bound on the idle wait when no source has data, so state changes that do
/// not touch any buffer (e.g. termination of a paused source) are observed.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Poll interval while giving late sources a chance to complete a batch.
const STRAGGLER_POLL: Duration = Duration::from_millis(2);

pub struct Multiplexer {
    sources: Vec<Arc<VideoSource>>,
    limiter: Option<RateLimiter>,
    batch_collection_timeout: Option<Duration>,
    stop: watch::Receiver<bool>,
    bus: StatusBus,
    next_start: usize,
}

impl Multiplexer {
    pub fn new(
        sources: Vec<Arc<VideoSource>>,
        max_fps: Option<f64>,
        batch_collection_timeout: Option<Duration>,
        stop: watch::Receiver<bool>,
        bus: StatusBus,
    ) -> Self {
        let limiter = max_fps.map(|fps| {
            let strategy =
                negotiate_rate_limiter_strategy(sources.iter().map(|s| s.properties()));
            RateLimiter::new(fps, strategy)
        });
        Self {
            sources,
            limiter,
            batch_collection_timeout,
            stop,
            bus,
            next_start: 0,
        }
    }

    /// Next batch of the sequence, or `None` once the stream of batches is
    /// over. Blocks while every source is idle, without busy-spinning.
    pub async fn next_batch(&mut self) -> Option<Vec<VideoFrame>> {
        loop {
            if *self.stop.borrow() {
                return None;
            }
            if self.sources.iter().all(|s| Self::exhausted(s)) {
                return None;
            }
            let mut batch = self.collect_round().await;
            if batch.is_empty() {
                self.wait_for_data().await;
                continue;
            }
            if let Some(limiter) = self.limiter.as_mut() {
                if limiter.throttle().await == RateLimiterVerdict::DropBatch {
                    self.report_rate_limited(&batch);
                    continue;
                }
            }
            batch.sort_by_key(|frame| frame.source_id);
            return Some(batch);
        }
    }

    /// One round-robin pass over the sources, starting at a rotating index,
    /// then an optional bounded grace wait for sources that had no frame
    /// ready yet.
    async fn collect_round(&mut self) -> Vec<VideoFrame> {
        let count = self.sources.len();
        let start = self.next_start;
        self.next_start = (self.next_start + 1) % count;

        let mut batch = Vec::new();
        let mut missing = Vec::new();
        for offset in 0..count {
            let index = (start + offset) % count;
            let source = &self.sources[index];
            if Self::exhausted(source) {
                continue;
            }
            match source.try_read_frame() {
                Some(frame) => batch.push(frame),
                None => missing.push(index),
            }
        }

        if let Some(grace) = self.batch_collection_timeout {
            if !batch.is_empty() && !missing.is_empty() {
                let deadline = Instant::now() + grace;
                while !missing.is_empty() && Instant::now() < deadline {
                    tokio::time::sleep(STRAGGLER_POLL).await;
                    missing.retain(|&index| {
                        let source = &self.sources[index];
                        if Self::exhausted(source) {
                            return false;
                        }
                        match source.try_read_frame() {
                            Some(frame) => {
                                batch.push(frame);
                                false
                            }
                            None => true,
                        }
                    });
                }
            }
        }
        batch
    }

    /// Bounded wait on any source signaling data, the stop channel, or the
    /// idle timeout.
    async fn wait_for_data(&mut self) {
        let sources = &self.sources;
        let waits: Vec<_> = sources
            .iter()
            .filter(|source| !Self::exhausted(source))
            .map(|source| Box::pin(source.wait_frame_available()))
            .collect();
        let stop = &mut self.stop;
        if waits.is_empty() {
            tokio::select! {
                _ = stop.changed() => {}
                _ = tokio::time::sleep(IDLE_WAIT) => {}
            }
            return;
        }
        tokio::select! {
            _ = select_all(waits) => {}
            _ = stop.changed() => {}
            _ = tokio::time::sleep(IDLE_WAIT) => {}
        }
    }

    fn exhausted(source: &VideoSource) -> bool {
        match source.state() {
            VideoSourceState::Terminated => true,
            VideoSourceState::Ended => source.buffer().is_empty(),
            _ => false,
        }
    }

    fn report_rate_limited(&self, batch: &[VideoFrame]) {
        let descriptors: Vec<_> = batch.iter().map(VideoFrame::descriptor).collect();
        self.bus.emit(
            UpdateSeverity::Debug,
            FRAME_DROPPED_EVENT,
            json!({
                "cause": "rate_limited",
                "frames": descriptors,
            }),
        );
    }
}
