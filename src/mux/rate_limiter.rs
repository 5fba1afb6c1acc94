//! Batch emission rate limiting.
//!
//! Two strategies keep the multiplexer's output at or below `max_fps`:
//!
//! - [`RateLimiterStrategy::Strict`] holds an exact inter-batch interval by
//!   sleeping when a batch is ready early. Used whenever a finite file
//!   participates, so that every frame is processed and pacing follows the
//!   declared rate.
//! - [`RateLimiterStrategy::Adaptive`] never sleeps: early batches are
//!   dropped at the consumption boundary, landing near `max_fps` on average.
//!   Used when every source is live and over-provisioned, where sleeping
//!   would only grow frame age.

use std::time::{Duration, Instant};

use crate::capture::SourceProperties;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterStrategy {
    Strict,
    Adaptive,
}

/// Outcome of a limiter consultation for a collected batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterVerdict {
    /// Emit the batch (the limiter may have slept first).
    Proceed,
    /// Discard the batch and collect a fresh one.
    DropBatch,
}

/// Picks the strategy for a set of sources: any file forces `Strict`,
/// all-live negotiates `Adaptive`. Sources that never connected count as
/// live.
pub fn negotiate_rate_limiter_strategy(
    properties: impl IntoIterator<Item = Option<SourceProperties>>,
) -> RateLimiterStrategy {
    let any_file = properties
        .into_iter()
        .any(|p| p.map(|p| p.is_file).unwrap_or(false));
    if any_file {
        RateLimiterStrategy::Strict
    } else {
        RateLimiterStrategy::Adaptive
    }
}

pub struct RateLimiter {
    interval: Duration,
    strategy: RateLimiterStrategy,
    next_due: Option<Instant>,
}

impl RateLimiter {
    /// `max_fps` must be positive and finite; the builder validates this.
    pub fn new(max_fps: f64, strategy: RateLimiterStrategy) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / max_fps),
            strategy,
            next_due: None,
        }
    }

    pub fn strategy(&self) -> RateLimiterStrategy {
        self.strategy
    }

    /// Gates the next batch emission. Strict mode sleeps out the remainder
    /// of the interval and always proceeds; adaptive mode proceeds or asks
    /// the caller to drop, without ever sleeping.
    pub async fn throttle(&mut self) -> RateLimiterVerdict {
        match self.strategy {
            RateLimiterStrategy::Strict => {
                let due = self.next_due.unwrap_or_else(Instant::now);
                if due > Instant::now() {
                    tokio::time::sleep_until(due.into()).await;
                }
                // Anchor the next slot on the later of schedule and reality
                // so a slow consumer does not create a backlog of slots.
                self.next_due = Some(due.max(Instant::now()) + self.interval);
                RateLimiterVerdict::Proceed
            }
            RateLimiterStrategy::Adaptive => {
                let now = Instant::now();
                if let Some(due) = self.next_due {
                    if now < due {
                        return RateLimiterVerdict::DropBatch;
                    }
                }
                self.next_due = Some(now + self.interval);
                RateLimiterVerdict::Proceed
            }
        }
    }
}
