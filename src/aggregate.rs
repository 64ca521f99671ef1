use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metric::DeliveryMetric;

/// Worker-local running totals of [`DeliveryMetric`]s.
///
/// Each worker keeps its own aggregate so the hot path never contends on a
/// shared counter; the generator merges them once the workers have drained.
/// Only raw sums are kept here. Ratios and averages are derived later by
/// [`crate::report::RunReport`].
///
/// `merge` is associative and commutative, so worker order does not matter.
#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct DeliveryAggregate {
    pub published: u64,
    pub failed: u64,
    /// Publish calls across all events, first attempts included.
    pub attempts: u64,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

impl DeliveryAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events that reached an outcome.
    pub fn count(&self) -> u64 {
        self.published + self.failed
    }

    /// Publish calls beyond the first attempt of each event.
    pub fn retries(&self) -> u64 {
        self.attempts.saturating_sub(self.count())
    }

    pub fn consume(&mut self, metric: &DeliveryMetric) {
        if metric.is_published() {
            self.published += 1;
        } else {
            self.failed += 1;
        }
        self.attempts += u64::from(metric.attempts);
        self.total_latency = self.total_latency.saturating_add(metric.latency);
        self.max_latency = self.max_latency.max(metric.latency);
    }

    pub fn aggregate(&mut self, metrics: &[DeliveryMetric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    pub fn merge(&mut self, other: Self) {
        self.published += other.published;
        self.failed += other.failed;
        self.attempts += other.attempts;
        self.total_latency = self.total_latency.saturating_add(other.total_latency);
        self.max_latency = self.max_latency.max(other.max_latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn consume_counts_outcomes() {
        let mut agg = DeliveryAggregate::new();
        agg.aggregate(&[
            DeliveryMetric::published(ms(10), 1),
            DeliveryMetric::published(ms(30), 3),
            DeliveryMetric::failed(ms(500), 6),
        ]);

        assert_eq!(agg.published, 2);
        assert_eq!(agg.failed, 1);
        assert_eq!(agg.count(), 3);
        assert_eq!(agg.attempts, 10);
        assert_eq!(agg.retries(), 7);
        assert_eq!(agg.total_latency, ms(540));
        assert_eq!(agg.max_latency, ms(500));
    }

    #[test]
    fn merge_is_order_independent() {
        let metrics = [
            DeliveryMetric::published(ms(5), 1),
            DeliveryMetric::failed(ms(80), 4),
            DeliveryMetric::published(ms(12), 2),
        ];
        let mut a = DeliveryAggregate::new();
        a.consume(&metrics[0]);
        let mut b = DeliveryAggregate::new();
        b.aggregate(&metrics[1..]);

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        let mut all = DeliveryAggregate::new();
        all.aggregate(&metrics);
        assert_eq!(ab, ba);
        assert_eq!(ab, all);
    }
}
