//! Polling cloud queue backend (AWS SQS), read-only.
//!
//! Talks to the SQS REST API directly with hand-rolled Signature V4
//! signing so the HTTP layer stays mockable in tests. The transport has
//! no random-access delete or relocate: enumeration is a visibility-
//! timeout-bounded poll, queue listing maps queue URLs, and every
//! mutating operation reports `NotImplemented`.

use crate::adapter::BrokerAdapter;
use crate::error::BrokerError;
use crate::message::{Queue, StandardMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const SQS_API_VERSION: &str = "2012-11-05";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// SQS caps a single receive at ten messages.
const RECEIVE_MAX_MESSAGES: u32 = 10;
/// Long-poll window for the enumeration receive.
const RECEIVE_WAIT_SECONDS: u32 = 3;
/// Polled messages reappear on their own once this lease lapses, so the
/// enumeration never acknowledges anything.
const RECEIVE_VISIBILITY_SECONDS: u32 = 20;

type HmacSha256 = Hmac<Sha256>;

/// Read-only backend for SQS-style cloud queues.
pub struct SqsBackend {
    http: HttpClient,
    signer: SigV4Signer,
    endpoint: String,
}

impl SqsBackend {
    /// Build a backend for `region` with static credentials. The service
    /// endpoint can be overridden for emulators and tests.
    pub fn new(region: &str, access_key: &str, secret_key: &str) -> Result<Self, BrokerError> {
        Self::with_endpoint(
            region,
            access_key,
            secret_key,
            &format!("https://sqs.{region}.amazonaws.com"),
        )
    }

    pub fn with_endpoint(
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: &str,
    ) -> Result<Self, BrokerError> {
        if region.is_empty() {
            return Err(BrokerError::connect_failed(
                endpoint,
                "region cannot be empty",
            ));
        }
        if access_key.is_empty() || secret_key.is_empty() {
            return Err(BrokerError::connect_failed(
                endpoint,
                "access key and secret key are required",
            ));
        }

        let http = HttpClient::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::transport(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            http,
            signer: SigV4Signer::new(access_key, secret_key, region),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// POST one signed Query-API action and return the raw XML body.
    async fn request(&self, params: &HashMap<String, String>) -> Result<String, BrokerError> {
        let host = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .unwrap_or(&self.endpoint);

        let auth_headers = self
            .signer
            .sign_request("POST", host, "/", params, "", &Utc::now());

        let query_string = canonical_query(params);
        let url = format!("{}/?{}", self.endpoint, query_string);
        debug!(url = %url, "Issuing signed SQS request");

        let mut request = self.http.post(&url);
        for (key, value) in auth_headers {
            request = request.header(&key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BrokerError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(BrokerError::management(format!(
                "SQS status {status}: {}",
                parse_error_message(&body)
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl BrokerAdapter for SqsBackend {
    /// One polled batch, released back by the visibility timeout. A
    /// queue holding more than one receive's worth of messages is only
    /// partially visible per call.
    async fn get_all_messages(&self, queue: &str) -> Result<Vec<StandardMessage>, BrokerError> {
        let mut params = HashMap::new();
        params.insert("Action".to_string(), "ReceiveMessage".to_string());
        params.insert("Version".to_string(), SQS_API_VERSION.to_string());
        params.insert("QueueUrl".to_string(), queue.to_string());
        params.insert(
            "MaxNumberOfMessages".to_string(),
            RECEIVE_MAX_MESSAGES.to_string(),
        );
        params.insert(
            "WaitTimeSeconds".to_string(),
            RECEIVE_WAIT_SECONDS.to_string(),
        );
        params.insert(
            "VisibilityTimeout".to_string(),
            RECEIVE_VISIBILITY_SECONDS.to_string(),
        );
        params.insert("AttributeName.1".to_string(), "All".to_string());
        params.insert("MessageAttributeName.1".to_string(), "All".to_string());

        let body = self.request(&params).await?;
        parse_receive_response(&body)
    }

    /// Queue names on this transport are the full queue URLs.
    async fn get_all_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        let mut params = HashMap::new();
        params.insert("Action".to_string(), "ListQueues".to_string());
        params.insert("Version".to_string(), SQS_API_VERSION.to_string());

        let body = self.request(&params).await?;
        let urls = parse_list_queues_response(&body)?;
        Ok(urls
            .into_iter()
            .map(|url| Queue::new(url, HashMap::new()))
            .collect())
    }

    async fn purge(&self, _queue: &str) -> Result<(), BrokerError> {
        Err(BrokerError::not_implemented("purge"))
    }

    async fn delete_one(&self, _queue: &str, _message_id: &str) -> Result<(), BrokerError> {
        Err(BrokerError::not_implemented("delete"))
    }

    async fn delete_many(&self, _queue: &str, message_ids: &[String]) -> Vec<BrokerError> {
        message_ids
            .iter()
            .map(|_| BrokerError::not_implemented("delete"))
            .collect()
    }

    async fn move_one(
        &self,
        _from_queue: &str,
        _to_queue: &str,
        _message_id: &str,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::not_implemented("move"))
    }

    async fn move_many(
        &self,
        _from_queue: &str,
        _to_queue: &str,
        message_ids: &[String],
    ) -> Vec<BrokerError> {
        message_ids
            .iter()
            .map(|_| BrokerError::not_implemented("move"))
            .collect()
    }
}

// ============================================================================
// AWS Signature V4
// ============================================================================

/// Signature V4 signer for Query-API requests.
///
/// Canonical request, string-to-sign, and the four-level HMAC key chain
/// per the published signing process; only `host` and `x-amz-date` are
/// signed headers.
#[derive(Clone)]
struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl SigV4Signer {
    fn new(access_key: &str, secret_key: &str, region: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            region: region.to_string(),
            service: "sqs".to_string(),
        }
    }

    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> HashMap<String, String> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_query_string = canonical_query(query_params);
        let canonical_headers = format!("host:{host}\nx-amz-date:{amz_date}\n");
        let signed_headers = "host;x-amz-date";
        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{method}\n{path}\n{canonical_query_string}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign =
            format!("{algorithm}\n{amz_date}\n{credential_scope}\n{canonical_request_hash}");

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);
        let authorization = format!(
            "{algorithm} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        headers
    }

    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encoded query string in sorted key order, as both the signed
/// canonical form and the transmitted form.
fn canonical_query(params: &HashMap<String, String>) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// Query-API XML parsing
// ============================================================================

fn parse_list_queues_response(xml: &str) -> Result<Vec<String>, BrokerError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut urls = Vec::new();
    let mut in_queue_url = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"QueueUrl" => in_queue_url = true,
            Ok(Event::Text(e)) if in_queue_url => {
                let url = e
                    .unescape()
                    .map_err(|e| BrokerError::management(format!("SQS payload: {e}")))?;
                urls.push(url.into_owned());
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"QueueUrl" => in_queue_url = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(BrokerError::management(format!("SQS payload: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(urls)
}

fn parse_receive_response(xml: &str) -> Result<Vec<StandardMessage>, BrokerError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();

    let mut in_message = false;
    let mut in_message_id = false;
    let mut in_body = false;
    let mut in_name = false;
    let mut in_value = false;
    let mut in_string_value = false;

    let mut message_id = String::new();
    let mut body = String::new();
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut attribute_name: Option<String> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    message_id.clear();
                    body.clear();
                    headers.clear();
                    attribute_name = None;
                }
                b"MessageId" if in_message => in_message_id = true,
                b"Body" if in_message => in_body = true,
                b"Name" if in_message => in_name = true,
                b"Value" if in_message => in_value = true,
                b"StringValue" if in_message => in_string_value = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| BrokerError::management(format!("SQS payload: {e}")))?
                    .into_owned();
                if in_message_id {
                    message_id = text;
                    in_message_id = false;
                } else if in_body {
                    body = text;
                    in_body = false;
                } else if in_name {
                    attribute_name = Some(text);
                    in_name = false;
                } else if in_value || in_string_value {
                    if let Some(name) = attribute_name.take() {
                        headers.insert(name, text);
                    }
                    in_value = false;
                    in_string_value = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                in_message = false;
                let timestamp = headers
                    .get("SentTimestamp")
                    .and_then(|millis| millis.parse::<i64>().ok())
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                messages.push(StandardMessage::new(
                    message_id.clone(),
                    timestamp,
                    headers.clone(),
                    body.clone(),
                ));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(BrokerError::management(format!("SQS payload: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

fn parse_error_message(xml: &str) -> String {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut code = None;
    let mut message = None;
    let mut in_code = false;
    let mut in_message = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Code" => in_code = true,
                b"Message" => in_message = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().ok().map(|s| s.into_owned());
                if in_code {
                    code = text;
                    in_code = false;
                } else if in_message {
                    message = text;
                    in_message = false;
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    match (code, message) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code,
        (None, Some(message)) => message,
        (None, None) => "unrecognized error response".to_string(),
    }
}

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;
