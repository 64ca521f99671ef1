//! Transport, the single seam between the pipeline and a message bus.
//!
//! A transport knows how to put one [`Message`] on a topic and how to tell a
//! failure worth retrying from one that is not. Everything else (encoding,
//! retries, backoff, accounting) lives in the [`crate::sink::PublisherSink`].
//!
//! Two transports ship with the crate:
//! - [`StdoutTransport`] prints each payload on its own line.
//! - [`PubsubRestTransport`] publishes through the Pub/Sub REST API, which is
//!   what the emulator speaks.
//!
//! # Example
//! ```rust
//! use cadence::transport::{Message, PublishError, Transport};
//!
//! struct Discard;
//!
//! impl Transport for Discard {
//!     async fn publish(&self, _topic: &str, _message: &Message) -> Result<(), PublishError> {
//!         Ok(())
//!     }
//! }
//! ```

pub mod pubsub;
pub mod stdout;

pub use pubsub::PubsubRestTransport;
pub use stdout::StdoutTransport;

use std::{collections::BTreeMap, future::Future};

use thiserror::Error;

/// One message as handed to the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Encoded payload.
    pub data: Vec<u8>,
    /// String metadata. Empty unless configured.
    pub attributes: BTreeMap<String, String>,
}

/// How a publish call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Timeouts, throttling and other transient conditions.
    #[error("retryable publish failure: {0}")]
    Retryable(String),
    /// The message will never be accepted as sent.
    #[error("fatal publish failure: {0}")]
    Fatal(String),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Retryable(_))
    }
}

pub trait Transport
where
    Self: Send + Sync + 'static,
{
    /// Publish one message to `topic`.
    fn publish(
        &self,
        topic: &str,
        message: &Message,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Verify the bus is reachable before the first emission.
    fn check(&self, _topic: &str) -> impl Future<Output = Result<(), PublishError>> + Send {
        async { Ok(()) }
    }
}
