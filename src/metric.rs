use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How delivery of one event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum Outcome {
    Published,
    /// Dropped after a fatal failure or after the retry ceiling.
    Failed,
}

/// A `DeliveryMetric` is the single observation the sink produces per event.
///
/// Workers fold these into a [`crate::aggregate::DeliveryAggregate`]; nothing
/// else keeps them around.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct DeliveryMetric {
    /// From the first attempt to the final outcome, backoff sleeps included.
    pub latency: Duration,
    /// Publish calls made, first attempt included.
    pub attempts: u32,
    pub outcome: Outcome,
}

impl DeliveryMetric {
    pub fn published(latency: Duration, attempts: u32) -> Self {
        Self {
            latency,
            attempts,
            outcome: Outcome::Published,
        }
    }

    pub fn failed(latency: Duration, attempts: u32) -> Self {
        Self {
            latency,
            attempts,
            outcome: Outcome::Failed,
        }
    }

    pub fn is_published(&self) -> bool {
        self.outcome == Outcome::Published
    }
}
