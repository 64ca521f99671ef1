//! Cadence: a rate-controlled synthetic event publisher.
//!
//! Cadence emits a steady, configurable rate of small JSON events and publishes
//! them to a message-bus topic, so that whatever consumes that topic
//! (pipelines, alerting, storage sinks) can be exercised under controlled
//! traffic.
//!
//! # Architecture
//!
//! Three stages form a one-way pipeline:
//!
//! - [`Pacer`]: hands out sequence indices `0, 1, 2, …` at the target rate,
//!   evenly spread over each second, and never more than `max_in_flight`
//!   ahead of the downstream work.
//! - [`Synthesizer`]: turns one index into one [`Event`], stamping it with a
//!   timestamp from a [`event::Clock`] and identifiers from an
//!   [`event::IdSource`].
//! - [`PublisherSink`]: encodes the event, pushes it through a [`Transport`]
//!   and retries transient failures with bounded exponential backoff.
//!
//! The [`Generator`] runs the pacer as its own task and the other two stages in
//! a bounded worker pool. Each worker folds a [`metric::DeliveryMetric`] per
//! event into a [`DeliveryAggregate`], which becomes a [`report::RunReport`]
//! when the run ends.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use cadence::{
//!     Generator, GeneratorConfig, RateSpec,
//!     report::{LogReporter, Reporter, RunReport},
//!     transport::StdoutTransport,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GeneratorConfig::builder()
//!         .rate(RateSpec::new(50)?)
//!         .topic("projects/demo/topics/events")
//!         .run_for(Duration::from_secs(10))
//!         .build();
//!
//!     let totals = Generator::new(config, StdoutTransport::new())
//!         .run(CancellationToken::new())
//!         .await?;
//!
//!     LogReporter.report(&RunReport::from(totals)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//! - `internals`: exposes the pacer task and worker-pool plumbing behind
//!   [`Generator::run`] (unstable).

/// Worker-local delivery totals
pub mod aggregate;
/// Rate, topic and limits
pub mod config;
pub mod error;
/// Events and their synthesis
pub mod event;
/// Pipeline orchestration
pub mod generator;
/// Single delivery observations
pub mod metric;
/// Emission scheduling and backpressure
pub mod pacer;
/// Run reports and reporters
pub mod report;
pub mod retry;
/// Encoding, retries and failure reporting
pub mod sink;
/// Message-bus transports
pub mod transport;

pub use aggregate::DeliveryAggregate;
pub use config::{GeneratorConfig, RateSpec};
pub use error::Error;
pub use event::{Event, Synthesizer};
pub use generator::Generator;
pub use pacer::{Pacer, SequenceIndex};
pub use retry::RetryPolicy;
pub use sink::{DeliveryFailure, PublisherSink};
pub use transport::{Message, PublishError, Transport};
