//! Bounded frame buffer between a source's producer and its consumer.
//!
//! The buffer is the only hand-off point between the decode loop and the
//! multiplexer. It is strictly bounded; what happens at the bound is decided
//! by two strategies fixed at source start:
//!
//! - filling ([`BufferFillingStrategy`]): evict the oldest frame on overflow
//!   or suspend the producer until a slot frees;
//! - consumption ([`BufferConsumptionStrategy`]): read the newest frame and
//!   discard the backlog, or read strictly in order.
//!
//! Every discarded frame is reported as a `FRAME_DROPPED` status event.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use crate::frame::VideoFrame;
use crate::status::{FRAME_DROPPED_EVENT, StatusBus, UpdateSeverity};

/// Producer behavior on a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFillingStrategy {
    /// Evict the oldest buffered frame and store the new one.
    DropOldest,
    /// Suspend the producer until the consumer frees a slot.
    Wait,
}

/// Consumer behavior on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferConsumptionStrategy {
    /// Return the newest frame, discarding everything older.
    Latest,
    /// Return the oldest frame, processing the stream in order.
    Eager,
}

struct BufferState {
    queue: VecDeque<VideoFrame>,
    capacity: usize,
    filling: BufferFillingStrategy,
    consumption: BufferConsumptionStrategy,
}

enum PutOutcome {
    Stored,
    StoredEvicting(VideoFrame),
    MustWait(VideoFrame),
}

pub struct FrameBuffer {
    state: Mutex<BufferState>,
    not_full: Notify,
    not_empty: Notify,
    bus: StatusBus,
}

impl FrameBuffer {
    pub fn new(
        capacity: usize,
        filling: BufferFillingStrategy,
        consumption: BufferConsumptionStrategy,
        bus: StatusBus,
    ) -> Self {
        Self {
            state: Mutex::new(BufferState {
                queue: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                filling,
                consumption,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            bus,
        }
    }

    /// Replaces capacity and strategies. Only called between connection and
    /// producer start, while no frames are in flight.
    pub(crate) fn reconfigure(
        &self,
        capacity: usize,
        filling: BufferFillingStrategy,
        consumption: BufferConsumptionStrategy,
    ) {
        let mut state = self.state.lock().expect("frame buffer poisoned");
        state.capacity = capacity.max(1);
        state.filling = filling;
        state.consumption = consumption;
    }

    /// Stores a frame, applying the filling strategy at the bound. Suspends
    /// under [`BufferFillingStrategy::Wait`] until a slot frees.
    pub async fn put(&self, frame: VideoFrame) {
        let mut frame = frame;
        loop {
            // Register for the wakeup before checking, so a slot freed
            // between the check and the await is not missed.
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let outcome = {
                let mut state = self.state.lock().expect("frame buffer poisoned");
                if state.queue.len() < state.capacity {
                    state.queue.push_back(frame);
                    PutOutcome::Stored
                } else {
                    match state.filling {
                        BufferFillingStrategy::DropOldest => {
                            let evicted =
                                state.queue.pop_front().expect("full queue has a front");
                            state.queue.push_back(frame);
                            PutOutcome::StoredEvicting(evicted)
                        }
                        BufferFillingStrategy::Wait => PutOutcome::MustWait(frame),
                    }
                }
            };
            match outcome {
                PutOutcome::Stored => {
                    self.not_empty.notify_waiters();
                    return;
                }
                PutOutcome::StoredEvicting(evicted) => {
                    self.not_empty.notify_waiters();
                    self.report_drop(&evicted, "buffer_overflow");
                    return;
                }
                PutOutcome::MustWait(returned) => {
                    frame = returned;
                    notified.await;
                }
            }
        }
    }

    /// Non-blocking read under the consumption strategy.
    pub fn try_get(&self) -> Option<VideoFrame> {
        let (frame, discarded) = {
            let mut state = self.state.lock().expect("frame buffer poisoned");
            match state.consumption {
                BufferConsumptionStrategy::Eager => (state.queue.pop_front(), Vec::new()),
                BufferConsumptionStrategy::Latest => {
                    let mut discarded = Vec::new();
                    while state.queue.len() > 1 {
                        discarded.push(state.queue.pop_front().expect("len checked"));
                    }
                    (state.queue.pop_front(), discarded)
                }
            }
        };
        if frame.is_some() {
            self.not_full.notify_waiters();
        }
        for old in &discarded {
            self.report_drop(old, "superseded_by_newer_frame");
        }
        frame
    }

    /// Read with a bounded wait for data.
    pub async fn get(&self, timeout: Duration) -> Option<VideoFrame> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.not_empty.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(frame) = self.try_get() {
                    return frame;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    /// Resolves once at least one frame is buffered.
    pub async fn wait_not_empty(&self) {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the consumer has drained every buffered frame.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Discards all buffered frames without reporting drops; used on
    /// teardown, where the frames are intentionally abandoned.
    pub fn drop_all(&self) {
        self.state
            .lock()
            .expect("frame buffer poisoned")
            .queue
            .clear();
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("frame buffer poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn report_drop(&self, frame: &VideoFrame, cause: &str) {
        self.bus.emit(
            UpdateSeverity::Debug,
            FRAME_DROPPED_EVENT,
            json!({
                "frame_id": frame.frame_id,
                "source_id": frame.source_id,
                "cause": cause,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{StatusHandler, StatusUpdate};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::SystemTime;

    fn frame(frame_id: u64) -> VideoFrame {
        VideoFrame {
            image: Arc::new(Vec::new()),
            frame_id,
            frame_timestamp: SystemTime::now(),
            source_id: 0,
            fps: None,
            measured_fps: None,
        }
    }

    fn recording_bus() -> (StatusBus, Arc<StdMutex<Vec<StatusUpdate>>>) {
        let seen: Arc<StdMutex<Vec<StatusUpdate>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: StatusHandler = Arc::new(move |update| {
            sink.lock().unwrap().push(update.clone());
            Ok(())
        });
        (StatusBus::new(vec![handler], Duration::ZERO), seen)
    }

    #[tokio::test]
    async fn drop_oldest_evicts_front_and_reports_it() {
        let (bus, seen) = recording_bus();
        let buffer = FrameBuffer::new(
            2,
            BufferFillingStrategy::DropOldest,
            BufferConsumptionStrategy::Eager,
            bus,
        );
        for id in 1..=3 {
            buffer.put(frame(id)).await;
        }

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.try_get().unwrap().frame_id, 2);
        assert_eq!(buffer.try_get().unwrap().frame_id, 3);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, FRAME_DROPPED_EVENT);
        assert_eq!(seen[0].payload["frame_id"], 1);
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let (bus, _) = recording_bus();
        let buffer = FrameBuffer::new(
            3,
            BufferFillingStrategy::DropOldest,
            BufferConsumptionStrategy::Eager,
            bus,
        );
        for id in 1..=50 {
            buffer.put(frame(id)).await;
            assert!(buffer.len() <= 3);
        }
    }

    #[tokio::test]
    async fn wait_filling_suspends_producer_until_slot_frees() {
        let (bus, _) = recording_bus();
        let buffer = Arc::new(FrameBuffer::new(
            1,
            BufferFillingStrategy::Wait,
            BufferConsumptionStrategy::Eager,
            bus,
        ));
        buffer.put(frame(1)).await;

        let writer = Arc::clone(&buffer);
        let pending = tokio::spawn(async move { writer.put(frame(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        assert_eq!(buffer.try_get().unwrap().frame_id, 1);
        pending.await.unwrap();
        assert_eq!(buffer.try_get().unwrap().frame_id, 2);
    }

    #[tokio::test]
    async fn latest_consumption_returns_newest_and_reports_backlog() {
        let (bus, seen) = recording_bus();
        let buffer = FrameBuffer::new(
            4,
            BufferFillingStrategy::DropOldest,
            BufferConsumptionStrategy::Latest,
            bus,
        );
        for id in 1..=4 {
            buffer.put(frame(id)).await;
        }

        assert_eq!(buffer.try_get().unwrap().frame_id, 4);
        assert!(buffer.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn get_times_out_on_empty_buffer() {
        let (bus, _) = recording_bus();
        let buffer = FrameBuffer::new(
            1,
            BufferFillingStrategy::DropOldest,
            BufferConsumptionStrategy::Eager,
            bus,
        );
        assert!(buffer.get(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn drop_all_clears_without_drop_events() {
        let (bus, seen) = recording_bus();
        let buffer = FrameBuffer::new(
            4,
            BufferFillingStrategy::Wait,
            BufferConsumptionStrategy::Eager,
            bus,
        );
        for id in 1..=3 {
            buffer.put(frame(id)).await;
        }
        buffer.drop_all();
        assert!(buffer.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }
}
