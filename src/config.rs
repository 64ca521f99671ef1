use std::{collections::BTreeMap, num::NonZeroU64, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::retry::RetryPolicy;

/// Default bound on emitted-but-unfinished events.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
/// Upper limit accepted for `max_in_flight`.
pub const MAX_IN_FLIGHT_LIMIT: usize = 1024;

/// Reasons a [`GeneratorConfig`] is rejected before anything runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("events per second must be a positive integer")]
    ZeroRate,
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("max in-flight must be between 1 and {max}, got {0}", max = MAX_IN_FLIGHT_LIMIT)]
    MaxInFlight(usize),
    #[error("backoff multiplier must be a finite number >= 1, got {0}")]
    BackoffMultiplier(f64),
    #[error("initial backoff {initial:?} exceeds max backoff {max:?}")]
    BackoffBounds { initial: Duration, max: Duration },
    #[error("malformed attribute `{0}`, expected key=value")]
    Attribute(String),
}

/// Target throughput. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSpec {
    events_per_second: NonZeroU64,
}

impl RateSpec {
    pub fn new(events_per_second: u64) -> Result<Self, ConfigError> {
        NonZeroU64::new(events_per_second)
            .map(|events_per_second| Self { events_per_second })
            .ok_or(ConfigError::ZeroRate)
    }

    pub fn events_per_second(&self) -> NonZeroU64 {
        self.events_per_second
    }
}

/// Everything the generator needs to run.
///
/// ```rust
/// use cadence::{GeneratorConfig, RateSpec};
///
/// let config = GeneratorConfig::builder()
///     .rate(RateSpec::new(100).unwrap())
///     .topic("projects/demo/topics/events")
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, TypedBuilder, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub rate: RateSpec,
    /// Destination on the message bus.
    #[builder(setter(into))]
    pub topic: String,
    /// Bound on events emitted but not yet published or dropped; also the
    /// size of the worker pool.
    #[builder(default = DEFAULT_MAX_IN_FLIGHT)]
    pub max_in_flight: usize,
    #[builder(default)]
    pub retry: RetryPolicy,
    /// How long to wait for in-flight publishes after cancellation.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_grace: Duration,
    /// Stop on our own after this long. Runs until cancelled when unset.
    #[builder(default, setter(strip_option))]
    pub run_for: Option<Duration>,
    /// Attached to every published message. Empty unless configured.
    #[builder(default)]
    pub attributes: BTreeMap<String, String>,
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if !(1..=MAX_IN_FLIGHT_LIMIT).contains(&self.max_in_flight) {
            return Err(ConfigError::MaxInFlight(self.max_in_flight));
        }
        let multiplier = self.retry.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::BackoffMultiplier(multiplier));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::BackoffBounds {
                initial: self.retry.initial_delay,
                max: self.retry.max_delay,
            });
        }
        Ok(())
    }
}

/// Parses a `key=value` message attribute.
pub fn parse_attribute(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.to_owned()))
        }
        _ => Err(ConfigError::Attribute(raw.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GeneratorConfig {
        GeneratorConfig::builder()
            .rate(RateSpec::new(10).unwrap())
            .topic("t")
            .build()
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert_eq!(RateSpec::new(0), Err(ConfigError::ZeroRate));
        assert_eq!(RateSpec::new(3).unwrap().events_per_second().get(), 3);
    }

    #[test]
    fn defaults_are_valid() {
        let config = config();
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(config.run_for, None);
        assert!(config.attributes.is_empty());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn blank_topic_is_rejected() {
        let config = GeneratorConfig {
            topic: "   ".into(),
            ..config()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyTopic));
    }

    #[test]
    fn max_in_flight_bounds() {
        for bad in [0, MAX_IN_FLIGHT_LIMIT + 1] {
            let config = GeneratorConfig {
                max_in_flight: bad,
                ..config()
            };
            assert_eq!(config.validate(), Err(ConfigError::MaxInFlight(bad)));
        }
    }

    #[test]
    fn backoff_must_grow() {
        let mut config = config();
        config.retry.multiplier = 0.5;
        assert_eq!(config.validate(), Err(ConfigError::BackoffMultiplier(0.5)));

        config.retry.multiplier = 2.0;
        config.retry.initial_delay = Duration::from_secs(60);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffBounds { .. })
        ));
    }

    #[test]
    fn zero_rate_does_not_deserialize() {
        let parsed: Result<RateSpec, _> = serde_json::from_str(r#"{"events_per_second":0}"#);
        assert!(parsed.is_err());
        let parsed: RateSpec = serde_json::from_str(r#"{"events_per_second":7}"#).unwrap();
        assert_eq!(parsed.events_per_second().get(), 7);
    }

    #[test]
    fn attributes_parse() {
        assert_eq!(
            parse_attribute("source=cadence").unwrap(),
            ("source".to_owned(), "cadence".to_owned())
        );
        assert_eq!(
            parse_attribute("k=a=b").unwrap(),
            ("k".to_owned(), "a=b".to_owned())
        );
        assert!(parse_attribute("novalue").is_err());
        assert!(parse_attribute("=v").is_err());
    }
}
