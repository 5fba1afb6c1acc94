//! # Runtime Settings
//!
//! Low-level tunables of the pipeline, read once from the environment at
//! construction time. Everything here has a sensible default; the
//! environment only needs touching when deploying many pipelines on one
//! machine or when debugging status floods.

use std::time::Duration;

use tracing::warn;

use crate::error::PipelineError;

/// Capacity of the predictions queue between inference and dispatch.
pub const PREDICTIONS_QUEUE_SIZE_ENV: &str = "INFERENCE_PIPELINE_PREDICTIONS_QUEUE_SIZE";
/// Seconds between reconnection attempts after a stream drop.
pub const RESTART_ATTEMPT_DELAY_ENV: &str = "INFERENCE_PIPELINE_RESTART_ATTEMPT_DELAY";
/// Minimum seconds between repeated DEBUG status emissions.
pub const STATUS_THROTTLE_SECONDS_ENV: &str = "STATUS_THROTTLE_SECONDS";

const DEFAULT_PREDICTIONS_QUEUE_SIZE: usize = 512;
const DEFAULT_RESTART_ATTEMPT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_STATUS_THROTTLE: Duration = Duration::from_secs(1);

/// Pipeline-wide runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Bound of the predictions queue; inference blocks when it is full.
    pub predictions_queue_size: usize,
    /// Backoff between reconnect attempts of a dropped source.
    pub restart_attempt_delay: Duration,
    /// Throttle window for high-frequency DEBUG status events.
    pub status_throttle: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            predictions_queue_size: DEFAULT_PREDICTIONS_QUEUE_SIZE,
            restart_attempt_delay: DEFAULT_RESTART_ATTEMPT_DELAY,
            status_throttle: DEFAULT_STATUS_THROTTLE,
        }
    }
}

impl PipelineSettings {
    /// Reads settings from process environment variables, falling back to
    /// defaults (with a warning) for missing or unparsable values.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`PipelineSettings::from_env`] but with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            predictions_queue_size: parse_var(
                PREDICTIONS_QUEUE_SIZE_ENV,
                lookup(PREDICTIONS_QUEUE_SIZE_ENV),
                defaults.predictions_queue_size,
            ),
            restart_attempt_delay: parse_seconds(
                RESTART_ATTEMPT_DELAY_ENV,
                lookup(RESTART_ATTEMPT_DELAY_ENV),
                defaults.restart_attempt_delay,
            ),
            status_throttle: parse_seconds(
                STATUS_THROTTLE_SECONDS_ENV,
                lookup(STATUS_THROTTLE_SECONDS_ENV),
                defaults.status_throttle,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.predictions_queue_size == 0 {
            return Err(PipelineError::validation(
                "predictions_queue_size",
                "queue capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(name, %value, "could not parse environment variable, using default");
                default
            }
        },
    }
}

fn parse_seconds(name: &str, raw: Option<String>, default: Duration) -> Duration {
    match raw {
        None => default,
        Some(value) => match value.parse::<f64>() {
            Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                Duration::from_secs_f64(seconds)
            }
            _ => {
                warn!(name, %value, "could not parse environment variable, using default");
                default
            }
        },
    }
}
