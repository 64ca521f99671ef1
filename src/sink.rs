//! Publisher sink: encoding, retries and failure reporting.
//!
//! The sink takes one [`Event`] at a time, encodes it into the wire payload
//! and pushes it through a [`Transport`]. Delivery is at-least-once:
//!
//! - a retryable failure is retried after a delay from the event's own
//!   [`Backoff`](crate::retry::Backoff), up to the policy's ceiling;
//! - a fatal failure, or running out of retries, drops the event. The drop is
//!   logged, counted in the returned [`DeliveryMetric`] and forwarded as a
//!   [`DeliveryFailure`] on the failure channel when one is attached;
//! - once cancellation is observed no new retry is started.
//!
//! Attempts for one event are strictly sequential. The sink holds no
//! per-event state between calls, so any number of workers can share it.
//!
//! # Wire format
//!
//! ```text
//! {"eventId": "<uuid>", "producedAt": "<instant>", "actorId": "<uuid>", "eventName": "myEvent", "data": {"myInt": <index>}}
//! ```
//!
//! Key order and the `": "` / `", "` separators are part of the format.

use std::{collections::BTreeMap, io};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::Error,
    event::Event,
    metric::DeliveryMetric,
    pacer::SequenceIndex,
    retry::RetryPolicy,
    transport::{Message, PublishError, Transport},
};

/// An event that was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event {index} ({event_id}) dropped after {attempts} attempt(s): {reason}")]
pub struct DeliveryFailure {
    pub index: SequenceIndex,
    pub event_id: Uuid,
    pub attempts: u32,
    pub reason: String,
}

/// Delivery state of one event while the sink works on it.
#[derive(Debug)]
pub struct PublishAttempt {
    pub index: SequenceIndex,
    pub event_id: Uuid,
    pub message: Message,
    /// Publish calls made so far.
    pub attempts: u32,
    pub last_failure: Option<PublishError>,
}

impl PublishAttempt {
    fn new(event: &Event, message: Message) -> Self {
        Self {
            index: SequenceIndex::new(event.data.my_int),
            event_id: event.event_id,
            message,
            attempts: 0,
            last_failure: None,
        }
    }

    fn into_failure(self, abandoned: bool) -> DeliveryFailure {
        let mut reason = self
            .last_failure
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_owned());
        if abandoned {
            reason.push_str("; retries abandoned on shutdown");
        }
        DeliveryFailure {
            index: self.index,
            event_id: self.event_id,
            attempts: self.attempts,
            reason,
        }
    }
}

/// Writes `", "` between members and `": "` after keys.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Encodes an event into its UTF-8 JSON wire payload.
pub fn encode(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(192);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    event.serialize(&mut ser)?;
    Ok(buf)
}

pub struct PublisherSink<T> {
    transport: T,
    topic: String,
    retry: RetryPolicy,
    attributes: BTreeMap<String, String>,
    failures: Option<mpsc::Sender<DeliveryFailure>>,
}

impl<T: Transport> PublisherSink<T> {
    pub fn new(transport: T, topic: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            topic: topic.into(),
            retry,
            attributes: BTreeMap::new(),
            failures: None,
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Forward every dropped event to `failures`.
    ///
    /// Sending never blocks delivery: when the channel is full the report is
    /// logged and discarded.
    pub fn with_failure_channel(mut self, failures: mpsc::Sender<DeliveryFailure>) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Startup connectivity check.
    pub async fn check(&self) -> Result<(), Error> {
        self.transport
            .check(&self.topic)
            .await
            .map_err(|e| Error::TransportUnavailable {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })
    }

    /// Deliver one event, retrying as the policy allows.
    pub async fn deliver(&self, event: &Event, cancel: &CancellationToken) -> DeliveryMetric {
        let started = Instant::now();
        let data = match encode(event) {
            Ok(data) => data,
            Err(e) => {
                let mut attempt = PublishAttempt::new(event, Message::default());
                attempt.last_failure = Some(PublishError::Fatal(format!("encoding failed: {e}")));
                return self.give_up(attempt, false, started);
            }
        };
        let message = Message {
            data,
            attributes: self.attributes.clone(),
        };
        let mut attempt = PublishAttempt::new(event, message);
        let mut backoff = self.retry.backoff();

        let abandoned = loop {
            attempt.attempts += 1;
            let err = match self.transport.publish(&self.topic, &attempt.message).await {
                Ok(()) => {
                    if attempt.attempts > 1 {
                        tracing::debug!(
                            index = %attempt.index,
                            attempts = attempt.attempts,
                            "Published after retrying"
                        );
                    }
                    return DeliveryMetric::published(started.elapsed(), attempt.attempts);
                }
                Err(err) => err,
            };

            let retryable = err.is_retryable();
            attempt.last_failure = Some(err);
            if !retryable {
                break false;
            }
            if cancel.is_cancelled() {
                break true;
            }
            let Some(delay) = backoff.next_delay() else {
                break false;
            };

            tracing::warn!(
                index = %attempt.index,
                attempt = attempt.attempts,
                ?delay,
                error = ?attempt.last_failure,
                "Publish failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.give_up(attempt, abandoned, started)
    }

    fn give_up(
        &self,
        attempt: PublishAttempt,
        abandoned: bool,
        started: Instant,
    ) -> DeliveryMetric {
        let failure = attempt.into_failure(abandoned);
        tracing::error!(
            index = %failure.index,
            event_id = %failure.event_id,
            attempts = failure.attempts,
            reason = %failure.reason,
            "Dropping event"
        );
        let attempts = failure.attempts;
        if let Some(failures) = &self.failures {
            match failures.try_send(failure) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(failure)) => {
                    tracing::warn!(
                        index = %failure.index,
                        "Failure channel full, report discarded"
                    );
                }
            }
        }
        DeliveryMetric::failed(started.elapsed(), attempts)
    }
}
