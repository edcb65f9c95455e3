//! Transport-neutral projections of broker-side state.
//!
//! A [`StandardMessage`] is a read-only snapshot of one message as seen
//! during a drain; it has no lifecycle of its own. [`Queue`] and [`Broker`]
//! mirror broker-side state and are stale the instant they are read.
//!
//! Serialized field names keep the capitalized casing the existing UI
//! clients were built against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read-only, transport-neutral projection of one queued message.
///
/// `headers` is the union of transport headers, annotations, and
/// application properties; keys are not unique across those sources and
/// later writes overwrite earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardMessage {
    /// Transport-native message identifier. Empty when the backend did not
    /// supply one or supplied one of an unexpected type.
    #[serde(rename = "MessageID")]
    pub message_id: String,

    /// Creation time as reported by the backend.
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "Headers")]
    pub headers: HashMap<String, String>,

    /// Message body. Binary bodies are decoded to their string form where
    /// possible and flagged as unknown otherwise.
    #[serde(rename = "Body")]
    pub body: String,
}

impl StandardMessage {
    pub fn new(
        message_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        headers: HashMap<String, String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp,
            headers,
            body: body.into(),
        }
    }
}

/// A broker-side queue as reported by the management surface.
///
/// `info` carries whatever attributes the management surface exposed,
/// currently a `"Size"` entry with the approximate message count at census
/// time. Unsupported attributes are simply absent, never synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Info")]
    pub info: HashMap<String, String>,
}

impl Queue {
    pub fn new(name: impl Into<String>, info: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            info,
        }
    }

    /// Approximate message count at census time, when the management
    /// surface reported one.
    pub fn size(&self) -> Option<usize> {
        self.info.get("Size").and_then(|s| s.parse().ok())
    }

    pub fn with_size(name: impl Into<String>, size: usize) -> Self {
        let mut info = HashMap::new();
        info.insert("Size".to_string(), size.to_string());
        Self {
            name: name.into(),
            info,
        }
    }
}

/// A configured broker binding, as listed to upstream callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Info")]
    pub info: HashMap<String, String>,
}

impl Broker {
    pub fn new(name: impl Into<String>, info: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            info,
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
