//! Pub/Sub over its REST API.
//!
//! Targets the Pub/Sub emulator or an authenticating proxy in front of the real
//! service; no credentials are attached here. `topic` is the full resource
//! name, e.g. `projects/my-project/topics/events`.

use std::{collections::BTreeMap, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::{Message, PublishError, Transport};

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: [WireMessage<'a>; 1],
}

#[derive(Serialize)]
struct WireMessage<'a> {
    data: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: &'a BTreeMap<String, String>,
}

impl<'a> PublishRequest<'a> {
    fn single(message: &'a Message) -> Self {
        Self {
            messages: [WireMessage {
                data: STANDARD.encode(&message.data),
                attributes: &message.attributes,
            }],
        }
    }
}

pub struct PubsubRestTransport {
    client: Client,
    endpoint: String,
}

impl PubsubRestTransport {
    /// `endpoint` may omit the scheme (`localhost:8085`, as found in
    /// `PUBSUB_EMULATOR_HOST`), in which case plain http is assumed.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Fatal(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: normalize_endpoint(endpoint),
        })
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/v1/{}", self.endpoint, topic.trim_start_matches('/'))
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("http://{endpoint}")
    }
}

/// 408, 429 and server errors are worth another try; other client errors are not.
fn classify_status(status: StatusCode) -> Result<(), PublishError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(PublishError::Retryable(format!("bus answered {status}")))
    } else {
        Err(PublishError::Fatal(format!("bus answered {status}")))
    }
}

fn classify_error(err: reqwest::Error) -> PublishError {
    if err.is_builder() {
        PublishError::Fatal(err.to_string())
    } else {
        PublishError::Retryable(err.to_string())
    }
}

impl Transport for PubsubRestTransport {
    async fn publish(&self, topic: &str, message: &Message) -> Result<(), PublishError> {
        let url = format!("{}:publish", self.topic_url(topic));
        let response = self
            .client
            .post(url)
            .json(&PublishRequest::single(message))
            .send()
            .await
            .map_err(classify_error)?;
        classify_status(response.status())
    }

    async fn check(&self, topic: &str) -> Result<(), PublishError> {
        let response = self
            .client
            .get(self.topic_url(topic))
            .send()
            .await
            .map_err(classify_error)?;
        classify_status(response.status())
    }
}
