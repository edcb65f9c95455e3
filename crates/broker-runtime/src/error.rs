//! Error types for broker operations.

use thiserror::Error;

/// Error type covering every broker operation.
///
/// Multi-item operations (`DeleteMany`, `Move`) report one of these per
/// failed target instead of a single terminal error; see
/// [`crate::adapter::BrokerAdapter`].
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No configured broker endpoint accepted a connection. Fatal to
    /// adapter construction.
    #[error("Connect failed, no endpoint reachable out of [{endpoints}]: {message}")]
    ConnectFailed { endpoints: String, message: String },

    /// Every configured management/console endpoint refused the census or
    /// enumeration read.
    #[error("Management surface unavailable: {message}")]
    ManagementUnavailable { message: String },

    /// Too many consecutive receive errors while draining; the operation
    /// was aborted. Messages finalized before the abort stay finalized.
    #[error("Drain of queue '{queue}' failed after {errors} consecutive receive errors")]
    DrainFailed { queue: String, errors: u32 },

    /// A requested target ID was never observed during the bounded drain.
    #[error("Did not find message {message_id} in queue '{queue}'")]
    NotFound { queue: String, message_id: String },

    /// The destination broker did not confirm the redirect publish; the
    /// original message was returned to its source queue.
    #[error("Publish to '{destination}' was not confirmed: {message}")]
    PublishFailed {
        destination: String,
        message: String,
    },

    /// The backend does not support this capability.
    #[error("Not implemented: {operation}")]
    NotImplemented { operation: String },

    /// Session, link, or channel level transport failure.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The management surface answered but the payload could not be
    /// understood.
    #[error("Malformed management response: {message}")]
    Management { message: String },
}

impl BrokerError {
    pub fn connect_failed(endpoints: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            endpoints: endpoints.into(),
            message: message.into(),
        }
    }

    pub fn management_unavailable(message: impl Into<String>) -> Self {
        Self::ManagementUnavailable {
            message: message.into(),
        }
    }

    pub fn drain_failed(queue: impl Into<String>, errors: u32) -> Self {
        Self::DrainFailed {
            queue: queue.into(),
            errors,
        }
    }

    pub fn not_found(queue: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::NotFound {
            queue: queue.into(),
            message_id: message_id.into(),
        }
    }

    pub fn publish_failed(destination: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PublishFailed {
            destination: destination.into(),
            message: message.into(),
        }
    }

    pub fn not_implemented(operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            operation: operation.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn management(message: impl Into<String>) -> Self {
        Self::Management {
            message: message.into(),
        }
    }

    /// Check if the error is transient and a retry could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } => true,
            Self::ManagementUnavailable { .. } => true,
            Self::DrainFailed { .. } => true,
            Self::NotFound { .. } => false,
            Self::PublishFailed { .. } => true,
            Self::NotImplemented { .. } => false,
            Self::Transport { .. } => true,
            Self::Management { .. } => false,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
