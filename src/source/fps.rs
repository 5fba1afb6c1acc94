//! Sliding-window frame rate measurement.
//!
//! Both sides of a source's buffer are measured: the producer stamps
//! `VideoFrame.fps` with its decode rate, the consumer stamps
//! `measured_fps` at read time. The meter keeps the last N tick instants
//! and reports the rate over that window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

const DEFAULT_WINDOW: usize = 64;

pub struct FpsMeter {
    samples: Mutex<VecDeque<Instant>>,
    window: usize,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(2),
        }
    }

    /// Records an event and returns the current rate, once at least two
    /// samples exist in the window.
    pub fn tick(&self) -> Option<f64> {
        let mut samples = self.samples.lock().expect("fps meter poisoned");
        samples.push_back(Instant::now());
        while samples.len() > self.window {
            samples.pop_front();
        }
        Self::rate_of(&samples)
    }

    pub fn rate(&self) -> Option<f64> {
        Self::rate_of(&self.samples.lock().expect("fps meter poisoned"))
    }

    pub fn reset(&self) {
        self.samples.lock().expect("fps meter poisoned").clear();
    }

    fn rate_of(samples: &VecDeque<Instant>) -> Option<f64> {
        let first = samples.front()?;
        let last = samples.back()?;
        let elapsed = last.duration_since(*first).as_secs_f64();
        if samples.len() < 2 || elapsed <= 0.0 {
            return None;
        }
        Some((samples.len() - 1) as f64 / elapsed)
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}
