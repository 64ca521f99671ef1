//! End-of-run reporting.
//!
//! A [`RunReport`] is the processed form of a [`DeliveryAggregate`]: plain
//! data, no I/O. A [`Reporter`] is the I/O boundary that ships it somewhere.

use std::{future::Future, io::Write, time::Duration};

use serde::{Deserialize, Serialize};

use crate::aggregate::DeliveryAggregate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Events that reached an outcome.
    pub events: u64,
    pub published: u64,
    pub failed: u64,
    pub retries: u64,
    /// Percentage of events published, `100.0` for an empty run.
    pub success_ratio: f64,
    pub average_latency: Duration,
    pub max_latency: Duration,
}

impl From<DeliveryAggregate> for RunReport {
    fn from(agg: DeliveryAggregate) -> Self {
        let events = agg.count();
        let (success_ratio, average_latency) = if events == 0 {
            (100.0, Duration::ZERO)
        } else {
            (
                agg.published as f64 / events as f64 * 100.0,
                agg.total_latency.div_f64(events as f64),
            )
        };
        Self {
            events,
            published: agg.published,
            failed: agg.failed,
            retries: agg.retries(),
            success_ratio,
            average_latency,
            max_latency: agg.max_latency,
        }
    }
}

/// Sends a [`RunReport`] somewhere.
///
/// # Example
/// ```rust
/// use cadence::report::{Reporter, RunReport};
///
/// struct Silent;
///
/// impl Reporter for Silent {
///     async fn report(&self, _report: &RunReport) -> Result<(), Box<dyn std::error::Error>> {
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(
        &self,
        report: &RunReport,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error>>>;
}

/// Emits the report as one structured `tracing` event.
pub struct LogReporter;

impl Reporter for LogReporter {
    async fn report(&self, report: &RunReport) -> Result<(), Box<dyn std::error::Error>> {
        tracing::info!(
            events = report.events,
            published = report.published,
            failed = report.failed,
            retries = report.retries,
            success_ratio = report.success_ratio,
            average_latency = ?report.average_latency,
            max_latency = ?report.max_latency,
            "Run finished"
        );
        Ok(())
    }
}

/// Prints the report as a JSON document on stderr, keeping stdout for payloads.
pub struct JsonReporter;

impl Reporter for JsonReporter {
    async fn report(&self, report: &RunReport) -> Result<(), Box<dyn std::error::Error>> {
        let value = serde_json::to_string_pretty(report)?;
        writeln!(std::io::stderr().lock(), "{value}")?;
        Ok(())
    }
}
