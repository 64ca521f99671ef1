use std::time::Duration;

use thiserror::Error;

use crate::{config::ConfigError, event::SynthesisError};

/// Errors that stop the pipeline.
///
/// Per-event problems never show up here: a retryable publish failure is
/// handled inside the [`crate::sink::PublisherSink`], and an event that runs
/// out of retries becomes a [`crate::sink::DeliveryFailure`] that is counted
/// and reported while the pipeline keeps going.
#[derive(Debug, Error)]
pub enum Error {
    /// The generator was configured with a rate, topic or limit it cannot run with.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The transport could not be reached before the first emission.
    #[error("transport unavailable for topic `{topic}`: {reason}")]
    TransportUnavailable { topic: String, reason: String },

    /// Timestamps or identifiers cannot be produced; the environment is broken.
    #[error("cannot synthesize events: {0}")]
    ClockOrRandomnessUnavailable(#[from] SynthesisError),

    /// Workers were still publishing when the shutdown grace period ran out.
    #[error("in-flight publishes did not resolve within {0:?} of shutdown")]
    ShutdownTimedOut(Duration),

    /// The pacer or a worker task panicked or was aborted.
    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}

impl Error {
    /// Whether the error points at the setup: configuration or a transport
    /// that cannot be reached. Clock and randomness failures are not counted
    /// here even when the startup probe raises them, since they can also
    /// surface mid-run.
    pub fn is_startup(&self) -> bool {
        matches!(self, Error::Config(_) | Error::TransportUnavailable { .. })
    }
}
