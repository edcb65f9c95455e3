//! AMQP 0.9.1 backend driven through the broker's HTTP management API
//! (RabbitMQ style).
//!
//! Reads go through the management API: enumeration uses the requeueing
//! `ack_requeue_true` get, the drain pops single messages with
//! `ack_requeue_false`, and the census comes from the `/api/queues` list.
//! Because a popped message no longer exists broker-side, release and
//! redirect are both republishes over the wire protocol with publisher
//! confirms. Selection uses the scan strategy with a single message in
//! flight at a time: there is no persistent per-message handle to settle
//! later, and an interruption strands at most the one popped message.

use crate::adapter::{first_error, BrokerAdapter};
use crate::drain::{self, DrainSource, HeldMessage, RedirectSink};
use crate::endpoints;
use crate::error::BrokerError;
use crate::message::{Queue, StandardMessage};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const MANAGEMENT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound the management API applies to a single requeueing get.
const ENUMERATION_FETCH_LIMIT: u32 = 50_000;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Backend for AMQP 0.9.1 brokers with an HTTP management API.
pub struct RabbitMqBackend {
    amqp: Connection,
    management: ManagementApi,
}

impl RabbitMqBackend {
    /// Connect the publish side to the first reachable endpoint in the
    /// comma-separated `broker_urls` list and remember the console
    /// endpoints for management reads.
    pub async fn connect(
        broker_urls: &str,
        console_urls: &str,
        user: &str,
        pass: &str,
        vhost: &str,
    ) -> Result<Self, BrokerError> {
        let broker_endpoints = endpoints::split(broker_urls);

        let amqp = endpoints::first_success(
            &broker_endpoints,
            |endpoint| {
                let user = user.to_string();
                let pass = pass.to_string();
                async move {
                    let stripped = endpoint.trim_start_matches("amqp://");
                    let uri = format!("amqp://{user}:{pass}@{stripped}");
                    info!(endpoint = %endpoint, "Attempting to connect to broker");
                    Connection::connect(&uri, ConnectionProperties::default()).await
                }
            },
            |message| BrokerError::connect_failed(broker_urls, message),
        )
        .await?;

        Ok(Self {
            amqp,
            management: ManagementApi::new(console_urls, user, pass, vhost)?,
        })
    }

    /// Publish one message to `queue` over the wire protocol, waiting for
    /// a publisher confirm.
    async fn publish(&self, queue: &str, held: &RabbitHeld) -> Result<(), BrokerError> {
        let channel = self
            .amqp
            .create_channel()
            .await
            .map_err(|e| BrokerError::publish_failed(queue, format!("channel: {e}")))?;

        let result = publish_on_channel(&channel, queue, held).await;

        if let Err(e) = channel.close(200, "done").await {
            warn!(queue = %queue, error = %e, "Unable to close the publish channel");
        }
        result
    }

    fn source<'a>(&'a self, queue: &str) -> RabbitSource<'a> {
        RabbitSource {
            backend: self,
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl BrokerAdapter for RabbitMqBackend {
    async fn get_all_messages(&self, queue: &str) -> Result<Vec<StandardMessage>, BrokerError> {
        // The management API's requeueing get is the broker's native
        // non-destructive drain.
        let messages = self
            .management
            .get_from_queue(queue, &GetMessagesRequest::peek_all())
            .await?;
        Ok(messages.iter().map(project_message).collect())
    }

    async fn get_all_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        self.management.get_queues().await
    }

    async fn purge(&self, queue: &str) -> Result<(), BrokerError> {
        self.management.purge(queue).await
    }

    async fn delete_one(&self, queue: &str, message_id: &str) -> Result<(), BrokerError> {
        first_error(self.delete_many(queue, &[message_id.to_string()]).await)
    }

    async fn delete_many(&self, queue: &str, message_ids: &[String]) -> Vec<BrokerError> {
        let bound = match self.management.queue_length(queue).await {
            Ok(bound) => bound,
            Err(e) => return vec![e],
        };
        let mut source = self.source(queue);
        drain::scan_and_act(&mut source, queue, bound, message_ids, None).await
    }

    async fn move_one(
        &self,
        from_queue: &str,
        to_queue: &str,
        message_id: &str,
    ) -> Result<(), BrokerError> {
        first_error(
            self.move_many(from_queue, to_queue, &[message_id.to_string()])
                .await,
        )
    }

    async fn move_many(
        &self,
        from_queue: &str,
        to_queue: &str,
        message_ids: &[String],
    ) -> Vec<BrokerError> {
        let bound = match self.management.queue_length(from_queue).await {
            Ok(bound) => bound,
            Err(e) => return vec![e],
        };
        let mut source = self.source(from_queue);
        let mut sink = RabbitSink {
            backend: self,
            to_queue: to_queue.to_string(),
        };
        drain::scan_and_act(&mut source, from_queue, bound, message_ids, Some(&mut sink)).await
    }
}

// ============================================================================
// Management API client
// ============================================================================

/// HTTP client for the broker's management API, walking the configured
/// console endpoints with first-success fallback.
struct ManagementApi {
    endpoints: Vec<String>,
    user: String,
    pass: String,
    vhost: String,
    http: reqwest::Client,
}

impl ManagementApi {
    fn new(console_urls: &str, user: &str, pass: &str, vhost: &str) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(MANAGEMENT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::transport(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            endpoints: endpoints::split(console_urls),
            user: user.to_string(),
            pass: pass.to_string(),
            vhost: vhost.to_string(),
            http,
        })
    }

    /// POST to `/api/queues/{vhost}/{queue}/get`, the management API's
    /// combined peek/pop endpoint.
    async fn get_from_queue(
        &self,
        queue: &str,
        request: &GetMessagesRequest,
    ) -> Result<Vec<RabbitMessage>, BrokerError> {
        endpoints::first_success(
            &self.endpoints,
            |console| {
                let http = self.http.clone();
                let user = self.user.clone();
                let pass = self.pass.clone();
                let vhost = self.vhost.clone();
                let queue = queue.to_string();
                async move {
                    let url = format!("{console}/api/queues/{vhost}/{queue}/get");
                    debug!(url = %url, "Requesting messages from management API");
                    let response = http
                        .post(&url)
                        .basic_auth(&user, Some(&pass))
                        .json(request)
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if !response.status().is_success() {
                        return Err(format!("management status {}", response.status()));
                    }
                    response
                        .json::<Vec<RabbitMessage>>()
                        .await
                        .map_err(|e| format!("management payload: {e}"))
                }
            },
            BrokerError::management_unavailable,
        )
        .await
    }

    async fn get_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        endpoints::first_success(
            &self.endpoints,
            |console| {
                let http = self.http.clone();
                let user = self.user.clone();
                let pass = self.pass.clone();
                let vhost = self.vhost.clone();
                async move {
                    let url = format!("{console}/api/queues/{vhost}");
                    debug!(url = %url, "Requesting queue list from management API");
                    let response = http
                        .get(&url)
                        .basic_auth(&user, Some(&pass))
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if !response.status().is_success() {
                        return Err(format!("management status {}", response.status()));
                    }
                    let queues = response
                        .json::<Vec<RabbitQueue>>()
                        .await
                        .map_err(|e| format!("management payload: {e}"))?;
                    Ok(queues
                        .into_iter()
                        .map(|q| Queue::with_size(q.name, q.messages.max(0) as usize))
                        .collect::<Vec<_>>())
                }
            },
            BrokerError::management_unavailable,
        )
        .await
    }

    async fn purge(&self, queue: &str) -> Result<(), BrokerError> {
        endpoints::first_success(
            &self.endpoints,
            |console| {
                let http = self.http.clone();
                let user = self.user.clone();
                let pass = self.pass.clone();
                let vhost = self.vhost.clone();
                let queue = queue.to_string();
                async move {
                    let url = format!("{console}/api/queues/{vhost}/{queue}/contents");
                    info!(url = %url, "Purging queue through management API");
                    let response = http
                        .delete(&url)
                        .basic_auth(&user, Some(&pass))
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if !response.status().is_success() {
                        return Err(format!("management status {}", response.status()));
                    }
                    Ok(())
                }
            },
            BrokerError::management_unavailable,
        )
        .await
    }

    /// Census from the management API's queue list.
    async fn queue_length(&self, queue: &str) -> Result<usize, BrokerError> {
        let queues = self.get_queues().await?;
        Ok(queues
            .iter()
            .find(|q| q.name == queue)
            .and_then(Queue::size)
            .unwrap_or(0))
    }
}

// ============================================================================
// Wire publish with confirms
// ============================================================================

async fn publish_on_channel(
    channel: &lapin::Channel,
    queue: &str,
    held: &RabbitHeld,
) -> Result<(), BrokerError> {
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| BrokerError::publish_failed(queue, format!("confirm mode: {e}")))?;

    let timestamp = parse_timestamp(&held.timestamp).unwrap_or_else(Utc::now);

    let mut headers = FieldTable::default();
    headers.insert(
        "MessageID".into(),
        AMQPValue::LongString(held.message_id.clone().into()),
    );
    headers.insert(
        "CorrelationID".into(),
        AMQPValue::LongString(held.correlation_id.clone().into()),
    );
    headers.insert(
        "Timestamp".into(),
        AMQPValue::LongString(held.timestamp.clone().into()),
    );

    let properties = BasicProperties::default()
        .with_message_id(held.message_id.clone().into())
        .with_correlation_id(held.correlation_id.clone().into())
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_timestamp(timestamp.timestamp() as u64)
        .with_headers(headers);

    let confirm = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            held.payload.as_bytes(),
            properties,
        )
        .await
        .map_err(|e| BrokerError::publish_failed(queue, e.to_string()))?;

    let confirmation = match tokio::time::timeout(drain::PUBLISH_CONFIRM_TIMEOUT, confirm).await {
        Ok(Ok(confirmation)) => confirmation,
        Ok(Err(e)) => return Err(BrokerError::publish_failed(queue, e.to_string())),
        Err(_) => {
            return Err(BrokerError::publish_failed(
                queue,
                format!("Message ID: {}; confirm timeout", held.message_id),
            ))
        }
    };

    match confirmation {
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(_) => Err(BrokerError::publish_failed(
            queue,
            format!("Message ID: {}; Nack", held.message_id),
        )),
    }
}

// ============================================================================
// Drain plumbing
// ============================================================================

/// A message popped off the broker through the management API. The broker
/// has already forgotten it, so release republishes it.
pub struct RabbitHeld {
    message_id: String,
    correlation_id: String,
    timestamp: String,
    payload: String,
}

impl HeldMessage for RabbitHeld {
    fn native_id(&self) -> Option<String> {
        if self.message_id.is_empty() {
            None
        } else {
            Some(self.message_id.clone())
        }
    }

    fn to_standard(&self) -> StandardMessage {
        let mut headers = HashMap::new();
        headers.insert("CorrelationID".to_string(), self.correlation_id.clone());
        StandardMessage::new(
            self.message_id.clone(),
            parse_timestamp(&self.timestamp).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            headers,
            self.payload.clone(),
        )
    }
}

struct RabbitSource<'a> {
    backend: &'a RabbitMqBackend,
    queue: String,
}

#[async_trait]
impl DrainSource for RabbitSource<'_> {
    type Held = RabbitHeld;

    async fn receive(&mut self) -> Result<Option<RabbitHeld>, BrokerError> {
        let mut messages = self
            .backend
            .management
            .get_from_queue(&self.queue, &GetMessagesRequest::pop_one())
            .await?;
        match messages.len() {
            0 => Ok(None),
            1 => Ok(Some(messages.remove(0).into_held())),
            n => Err(BrokerError::management(format!(
                "expected 1 message from pop, got {n}"
            ))),
        }
    }

    async fn finalize(&mut self, _held: RabbitHeld) -> Result<(), BrokerError> {
        // The pop already removed the message broker-side.
        Ok(())
    }

    async fn release(&mut self, held: RabbitHeld) -> Result<(), BrokerError> {
        self.backend.publish(&self.queue, &held).await
    }
}

struct RabbitSink<'a> {
    backend: &'a RabbitMqBackend,
    to_queue: String,
}

#[async_trait]
impl RedirectSink<RabbitHeld> for RabbitSink<'_> {
    async fn redirect(&mut self, held: &RabbitHeld) -> Result<(), BrokerError> {
        self.backend.publish(&self.to_queue, held).await
    }
}

// ============================================================================
// Management API wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct GetMessagesRequest {
    count: String,
    ackmode: &'static str,
    encoding: &'static str,
    truncate: u32,
}

impl GetMessagesRequest {
    /// Requeueing read used for enumeration.
    fn peek_all() -> Self {
        Self {
            count: ENUMERATION_FETCH_LIMIT.to_string(),
            ackmode: "ack_requeue_true",
            encoding: "auto",
            truncate: ENUMERATION_FETCH_LIMIT,
        }
    }

    /// Destructive single-message pop used by the drain.
    fn pop_one() -> Self {
        Self {
            count: "1".to_string(),
            ackmode: "ack_requeue_false",
            encoding: "auto",
            truncate: ENUMERATION_FETCH_LIMIT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RabbitQueue {
    name: String,
    #[serde(default)]
    messages: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RabbitMessageHeaders {
    #[serde(rename = "correlationID", default)]
    correlation_id: String,
    #[serde(rename = "messageID", default)]
    message_id: String,
    #[serde(rename = "timestamp", default)]
    timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
struct RabbitMessageProperties {
    #[serde(default)]
    headers: RabbitMessageHeaders,
}

#[derive(Debug, Deserialize)]
struct RabbitMessage {
    #[serde(default)]
    properties: RabbitMessageProperties,
    #[serde(default)]
    payload: String,
}

impl RabbitMessage {
    fn into_held(self) -> RabbitHeld {
        RabbitHeld {
            message_id: self.properties.headers.message_id,
            correlation_id: self.properties.headers.correlation_id,
            timestamp: self.properties.headers.timestamp,
            payload: self.payload,
        }
    }
}

fn project_message(message: &RabbitMessage) -> StandardMessage {
    let mut headers = HashMap::new();
    headers.insert(
        "CorrelationID".to_string(),
        message.properties.headers.correlation_id.clone(),
    );
    StandardMessage::new(
        message.properties.headers.message_id.clone(),
        parse_timestamp(&message.properties.headers.timestamp)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        headers,
        message.payload.clone(),
    )
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[path = "rabbitmq_tests.rs"]
mod tests;
