//! AMQP 1.0 credit-flow backend (ActiveMQ style).
//!
//! Message access goes over AMQP 1.0 receiver links with a small credit
//! window; the census and queue listing come from the broker's admin
//! console (`/admin/xml/queues.jsp` for the queue list, the per-queue
//! `queueBrowse` RSS feed for the message count). Both the broker URL and
//! the console URL are ordered comma-separated lists walked with
//! first-success fallback.
//!
//! Mutations use the map-then-act selection strategy: the receiver link
//! keeps every drained delivery unsettled, so dispositions can be issued
//! after the whole target list has been resolved. Unsettled deliveries do
//! not replenish an automatic credit window, so each operation issues its
//! full census bound as link credit up front.

use crate::adapter::{first_error, BrokerAdapter};
use crate::drain::{self, DrainSource, HeldMessage, RedirectSink};
use crate::endpoints;
use crate::error::BrokerError;
use crate::message::{Queue, StandardMessage};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::link::{Receiver, Sender};
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::annotations::OwnedKey;
use fe2o3_amqp::types::messaging::{Body, Message, MessageId, Outcome};
use fe2o3_amqp::types::primitives::{SimpleValue, Value};
use fe2o3_amqp::{Connection, Session};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONSOLE_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Credit issued to a receiver link for a drain over `bound` messages.
/// The whole drain happens on the initial grant; deliveries stay
/// unsettled until after the receive loop, which never replenishes an
/// automatic window.
fn link_credit(bound: usize) -> u32 {
    u32::try_from(bound).unwrap_or(u32::MAX)
}

type AmqpMessage = Message<Body<Value>>;

/// Backend for AMQP 1.0 brokers with an admin-console management surface.
pub struct ActiveMqBackend {
    connection: Mutex<ConnectionHandle<()>>,
    console_endpoints: Vec<String>,
    console_user: String,
    console_pass: String,
    http: reqwest::Client,
}

impl ActiveMqBackend {
    /// Connect to the first reachable endpoint in the comma-separated
    /// `broker_urls` list. Fails with [`BrokerError::ConnectFailed`] when
    /// none accepts a connection.
    pub async fn connect(
        broker_urls: &str,
        user: &str,
        pass: &str,
        console_urls: &str,
        console_user: &str,
        console_pass: &str,
    ) -> Result<Self, BrokerError> {
        let broker_endpoints = endpoints::split(broker_urls);
        let console_endpoints = endpoints::split(console_urls);

        let connection = endpoints::first_success(
            &broker_endpoints,
            |endpoint| {
                let user = user.to_string();
                let pass = pass.to_string();
                async move {
                    info!(endpoint = %endpoint, "Attempting to connect to broker");
                    Connection::builder()
                        .container_id(format!("queue-warden-{}", uuid::Uuid::new_v4()))
                        .sasl_profile(SaslProfile::Plain {
                            username: user,
                            password: pass,
                        })
                        .open(&endpoint[..])
                        .await
                }
            },
            |message| BrokerError::connect_failed(broker_urls, message),
        )
        .await?;

        let http = reqwest::Client::builder()
            .timeout(CONSOLE_HTTP_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::transport(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            connection: Mutex::new(connection),
            console_endpoints,
            console_user: console_user.to_string(),
            console_pass: console_pass.to_string(),
            http,
        })
    }

    async fn begin_session(&self) -> Result<SessionHandle<()>, BrokerError> {
        let mut connection = self.connection.lock().await;
        Session::begin(&mut connection)
            .await
            .map_err(|e| BrokerError::transport(format!("Get new session failed: {e}")))
    }

    async fn attach_receiver(
        &self,
        session: &mut SessionHandle<()>,
        queue: &str,
        credit: u32,
    ) -> Result<Receiver, BrokerError> {
        let mut receiver = Receiver::builder()
            .name(format!("queue-warden-recv-{}", uuid::Uuid::new_v4()))
            .source(queue)
            .credit_mode(CreditMode::Manual)
            .attach(session)
            .await
            .map_err(|e| BrokerError::transport(format!("Attach receiver failed: {e}")))?;
        if let Err(e) = receiver.set_credit(credit).await {
            close_receiver(receiver, queue).await;
            return Err(BrokerError::transport(format!(
                "Issue link credit failed: {e}"
            )));
        }
        Ok(receiver)
    }

    async fn attach_sender(
        &self,
        session: &mut SessionHandle<()>,
        to_queue: &str,
    ) -> Result<Sender, BrokerError> {
        Sender::attach(
            session,
            format!("queue-warden-send-{}", uuid::Uuid::new_v4()),
            to_queue,
        )
        .await
        .map_err(|e| BrokerError::transport(format!("Attach sender failed: {e}")))
    }

    /// Advisory message count from the console's per-queue RSS feed.
    async fn census(&self, queue: &str) -> Result<usize, BrokerError> {
        endpoints::first_success(
            &self.console_endpoints,
            |console| {
                let http = self.http.clone();
                let user = self.console_user.clone();
                let pass = self.console_pass.clone();
                let queue = queue.to_string();
                async move {
                    let url =
                        format!("{console}/admin/queueBrowse/{queue}?view=rss&feedType=atom_1.0");
                    debug!(url = %url, "Requesting queue feed");
                    let response = http
                        .get(&url)
                        .basic_auth(&user, Some(&pass))
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if !response.status().is_success() {
                        return Err(format!("feed status {}", response.status()));
                    }
                    let body = response.text().await.map_err(|e| e.to_string())?;
                    parse_feed_item_count(&body).map_err(|e| e.to_string())
                }
            },
            BrokerError::management_unavailable,
        )
        .await
    }
}

#[async_trait]
impl BrokerAdapter for ActiveMqBackend {
    async fn get_all_messages(&self, queue: &str) -> Result<Vec<StandardMessage>, BrokerError> {
        let bound = self.census(queue).await?;

        let mut session = self.begin_session().await?;
        let receiver = match self
            .attach_receiver(&mut session, queue, link_credit(bound))
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                end_session(session).await;
                return Err(e);
            }
        };

        let mut source = AmqpSource { receiver };
        let result = drain::drain_peek(&mut source, queue, Some(bound)).await;

        close_receiver(source.receiver, queue).await;
        end_session(session).await;
        result
    }

    async fn get_all_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        endpoints::first_success(
            &self.console_endpoints,
            |console| {
                let http = self.http.clone();
                let user = self.console_user.clone();
                let pass = self.console_pass.clone();
                async move {
                    let url = format!("{console}/admin/xml/queues.jsp");
                    info!(url = %url, "Requesting queue list from console");
                    let response = http
                        .get(&url)
                        .basic_auth(&user, Some(&pass))
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    if !response.status().is_success() {
                        return Err(format!("console status {}", response.status()));
                    }
                    let body = response.text().await.map_err(|e| e.to_string())?;
                    parse_queues_xml(&body).map_err(|e| e.to_string())
                }
            },
            BrokerError::management_unavailable,
        )
        .await
    }

    async fn purge(&self, queue: &str) -> Result<(), BrokerError> {
        let bound = self.census(queue).await?;

        let mut session = self.begin_session().await?;
        let receiver = match self
            .attach_receiver(&mut session, queue, link_credit(bound))
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                end_session(session).await;
                return Err(e);
            }
        };

        let mut source = AmqpSource { receiver };
        let result = drain::drain_purge(&mut source, queue, bound).await;

        close_receiver(source.receiver, queue).await;
        end_session(session).await;
        result.map(|removed| debug!(queue = %queue, removed, "Purge finished"))
    }

    async fn delete_one(&self, queue: &str, message_id: &str) -> Result<(), BrokerError> {
        first_error(self.delete_many(queue, &[message_id.to_string()]).await)
    }

    async fn delete_many(&self, queue: &str, message_ids: &[String]) -> Vec<BrokerError> {
        let bound = match self.census(queue).await {
            Ok(bound) => bound,
            Err(e) => return vec![e],
        };

        let mut session = match self.begin_session().await {
            Ok(session) => session,
            Err(e) => return vec![e],
        };
        let receiver = match self
            .attach_receiver(&mut session, queue, link_credit(bound))
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                end_session(session).await;
                return vec![e];
            }
        };

        let mut source = AmqpSource { receiver };
        let errors = drain::select_and_act(&mut source, queue, bound, message_ids, None).await;

        close_receiver(source.receiver, queue).await;
        end_session(session).await;
        errors
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
        let bound = match self.census(from_queue).await {
            Ok(bound) => bound,
            Err(e) => return vec![e],
        };

        let mut session = match self.begin_session().await {
            Ok(session) => session,
            Err(e) => return vec![e],
        };
        let receiver = match self
            .attach_receiver(&mut session, from_queue, link_credit(bound))
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                end_session(session).await;
                return vec![e];
            }
        };
        let sender = match self.attach_sender(&mut session, to_queue).await {
            Ok(sender) => sender,
            Err(e) => {
                close_receiver(receiver, from_queue).await;
                end_session(session).await;
                return vec![e];
            }
        };

        let mut source = AmqpSource { receiver };
        let mut sink = AmqpSink {
            sender,
            destination: to_queue.to_string(),
        };
        let errors =
            drain::select_and_act(&mut source, from_queue, bound, message_ids, Some(&mut sink))
                .await;

        close_sender(sink.sender, to_queue).await;
        close_receiver(source.receiver, from_queue).await;
        end_session(session).await;
        errors
    }
}

// ============================================================================
// Drain plumbing
// ============================================================================

struct AmqpSource {
    receiver: Receiver,
}

#[async_trait]
impl DrainSource for AmqpSource {
    type Held = Delivery<Body<Value>>;

    async fn receive(&mut self) -> Result<Option<Self::Held>, BrokerError> {
        match tokio::time::timeout(drain::RECEIVE_TIMEOUT, self.receiver.recv::<Body<Value>>())
            .await
        {
            // Nothing arrived inside the window; the queue is drained.
            Err(_) => Ok(None),
            Ok(Ok(delivery)) => Ok(Some(delivery)),
            Ok(Err(e)) => Err(BrokerError::transport(format!("Receive failed: {e}"))),
        }
    }

    async fn finalize(&mut self, held: Self::Held) -> Result<(), BrokerError> {
        self.receiver
            .accept(&held)
            .await
            .map_err(|e| BrokerError::transport(format!("Accept failed: {e}")))
    }

    async fn release(&mut self, held: Self::Held) -> Result<(), BrokerError> {
        self.receiver
            .release(&held)
            .await
            .map_err(|e| BrokerError::transport(format!("Release failed: {e}")))
    }
}

impl HeldMessage for Delivery<Body<Value>> {
    fn native_id(&self) -> Option<String> {
        native_message_id(self.message())
    }

    fn to_standard(&self) -> StandardMessage {
        project_message(self.message())
    }
}

struct AmqpSink {
    sender: Sender,
    destination: String,
}

#[async_trait]
impl RedirectSink<Delivery<Body<Value>>> for AmqpSink {
    async fn redirect(&mut self, held: &Delivery<Body<Value>>) -> Result<(), BrokerError> {
        let message = held.message().clone();
        let outcome = tokio::time::timeout(drain::PUBLISH_CONFIRM_TIMEOUT, self.sender.send(message))
            .await
            .map_err(|_| {
                BrokerError::publish_failed(&self.destination, "publish confirmation timed out")
            })?
            .map_err(|e| BrokerError::publish_failed(&self.destination, e.to_string()))?;
        confirm_outcome(&self.destination, outcome)
    }
}

/// Only an accepted disposition counts as a confirmed publish. A rejected,
/// released, or modified outcome leaves the original in the source queue.
fn confirm_outcome(destination: &str, outcome: Outcome) -> Result<(), BrokerError> {
    match outcome {
        Outcome::Accepted(_) => Ok(()),
        other => Err(BrokerError::publish_failed(
            destination,
            format!("destination did not accept the message: {other:?}"),
        )),
    }
}

async fn close_receiver(receiver: Receiver, queue: &str) {
    match tokio::time::timeout(drain::CLOSE_TIMEOUT, receiver.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(queue = %queue, error = %e, "Unable to close the receiver"),
        Err(_) => warn!(queue = %queue, "Receiver close timed out"),
    }
}

async fn close_sender(sender: Sender, queue: &str) {
    match tokio::time::timeout(drain::CLOSE_TIMEOUT, sender.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(queue = %queue, error = %e, "Unable to close the sender"),
        Err(_) => warn!(queue = %queue, "Sender close timed out"),
    }
}

async fn end_session(mut session: SessionHandle<()>) {
    match tokio::time::timeout(drain::CLOSE_TIMEOUT, session.end()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Unable to end the session"),
        Err(_) => warn!("Session end timed out"),
    }
}

// ============================================================================
// Message projection
// ============================================================================

/// Selection only ever matches on string message IDs; other identifier
/// types cannot be targeted by the caller and stay in the queue.
fn native_message_id(message: &AmqpMessage) -> Option<String> {
    match message.properties.as_ref()?.message_id.as_ref()? {
        MessageId::String(id) => Some(id.clone()),
        _ => None,
    }
}

fn project_message(message: &AmqpMessage) -> StandardMessage {
    let mut headers = HashMap::new();

    if let Some(header) = &message.header {
        headers.insert("Durable".to_string(), header.durable.to_string());
        headers.insert("Priority".to_string(), header.priority.0.to_string());
        if let Some(ttl) = header.ttl {
            headers.insert("TTL".to_string(), ttl.to_string());
        }
        headers.insert(
            "First Acquirer".to_string(),
            header.first_acquirer.to_string(),
        );
        headers.insert(
            "Delivery Count".to_string(),
            header.delivery_count.to_string(),
        );
    }

    let mut timestamp = DateTime::<Utc>::UNIX_EPOCH;
    let mut message_id = String::new();

    if let Some(properties) = &message.properties {
        if let Some(id) = &properties.message_id {
            message_id = message_id_string(id);
        }
        if let Some(correlation_id) = &properties.correlation_id {
            headers.insert(
                "Correlation ID".to_string(),
                message_id_string(correlation_id),
            );
        }
        if let Some(to) = &properties.to {
            headers.insert("Destination".to_string(), to.clone());
        }
        if let Some(subject) = &properties.subject {
            headers.insert("Subject".to_string(), subject.clone());
        }
        if let Some(reply_to) = &properties.reply_to {
            headers.insert("Reply To".to_string(), reply_to.clone());
        }
        if let Some(content_type) = &properties.content_type {
            headers.insert("Type".to_string(), content_type.0.clone());
        }
        if let Some(group_id) = &properties.group_id {
            headers.insert("Group ID".to_string(), group_id.clone());
        }
        if let Some(group_sequence) = properties.group_sequence {
            headers.insert("Group Sequence".to_string(), group_sequence.to_string());
        }
        if let Some(creation_time) = &properties.creation_time {
            timestamp = Utc
                .timestamp_millis_opt(creation_time.milliseconds())
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        }
    }

    if let Some(application_properties) = &message.application_properties {
        for (key, value) in application_properties.0.iter() {
            headers.insert(key.clone(), simple_value_string(value));
        }
    }

    if let Some(annotations) = &message.message_annotations {
        for (key, value) in annotations.0.iter() {
            headers.insert(annotation_key_string(key), value_string(value));
        }
    }

    if let Some(annotations) = &message.delivery_annotations {
        for (key, value) in annotations.0.iter() {
            headers.insert(annotation_key_string(key), value_string(value));
        }
    }

    StandardMessage::new(message_id, timestamp, headers, body_string(&message.body))
}

fn message_id_string(id: &MessageId) -> String {
    match id {
        MessageId::String(s) => s.clone(),
        MessageId::Ulong(n) => n.to_string(),
        MessageId::Uuid(u) => format!("{u:?}"),
        MessageId::Binary(b) => hex::encode(&b[..]),
    }
}

fn body_string(body: &Body<Value>) -> String {
    match body {
        Body::Value(value) => value_string(&value.0),
        Body::Data(batch) => batch
            .iter()
            .map(|data| String::from_utf8_lossy(&data.0).into_owned())
            .collect::<Vec<_>>()
            .join(""),
        Body::Sequence(_) => "<unknown body structure>".to_string(),
        Body::Empty => String::new(),
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

fn simple_value_string(value: &SimpleValue) -> String {
    match value {
        SimpleValue::String(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

fn annotation_key_string(key: &OwnedKey) -> String {
    match key {
        OwnedKey::Symbol(symbol) => symbol.0.clone(),
        OwnedKey::Ulong(n) => n.to_string(),
    }
}

// ============================================================================
// Console XML parsing
// ============================================================================

fn parse_queues_xml(xml: &str) -> Result<Vec<Queue>, BrokerError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut queues: Vec<Queue> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"queue" => {
                    if let Some(name) = attribute_value(e, "name")? {
                        queues.push(Queue::new(name, HashMap::new()));
                    }
                }
                b"stats" => {
                    if let (Some(queue), Some(size)) =
                        (queues.last_mut(), attribute_value(e, "size")?)
                    {
                        queue.info.insert("Size".to_string(), size);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(BrokerError::management(format!(
                    "queue list XML parse error: {e}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(queues)
}

/// Count the `<item>` entries in the console's per-queue browse feed. One
/// item per queued message.
fn parse_feed_item_count(xml: &str) -> Result<usize, BrokerError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut count = 0usize;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = e.name();
                if name.as_ref() == b"item" || name.as_ref() == b"entry" {
                    count += 1;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(BrokerError::management(format!(
                    "queue feed XML parse error: {e}"
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(count)
}

fn attribute_value(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, BrokerError> {
    match element.try_get_attribute(name) {
        Ok(Some(attribute)) => attribute
            .unescape_value()
            .map(|value| Some(value.into_owned()))
            .map_err(|e| BrokerError::management(format!("bad '{name}' attribute: {e}"))),
        Ok(None) => Ok(None),
        Err(e) => Err(BrokerError::management(format!(
            "bad '{name}' attribute: {e}"
        ))),
    }
}

#[cfg(test)]
#[path = "activemq_tests.rs"]
mod tests;
