//! Drain cursor, selection engine, and redistribution sink.
//!
//! None of the supported transports can delete or relocate "the message
//! with ID X" directly; they hand out messages one at a time. This module
//! emulates random access on top of that: a bounded, timeout-guarded
//! sequential drain where every held message ends in exactly one of two
//! terminal actions, finalize-removal or return-to-queue, and a selection
//! pass that decides which, per message, from the caller's target-ID set.
//!
//! Backends plug in through [`DrainSource`] (receive / finalize / release)
//! and, for moves, [`RedirectSink`] (confirmed publish to the destination).
//! The engine guarantees that every message drained on any exit path,
//! including abort, is either finalized or returned to its source queue.

use crate::error::BrokerError;
use crate::message::StandardMessage;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-message receive timeout; an elapsed timeout means the queue has no
/// more messages to offer right now and ends the drain.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on session, link, and channel close operations.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for a destination broker to confirm a redirect publish.
pub const PUBLISH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive receive errors tolerated before the drain aborts.
pub const MAX_CONSECUTIVE_RECEIVE_ERRORS: u32 = 10;

/// A message drained but not yet finalized.
pub trait HeldMessage {
    /// The transport-native message identifier, when present and of a
    /// usable type. `None` means the message can never be matched and
    /// will only ever be returned to its queue.
    fn native_id(&self) -> Option<String>;

    /// Project into the transport-neutral read-only record.
    fn to_standard(&self) -> StandardMessage;
}

/// Sequential consume access to one queue within one operation's session.
///
/// `finalize` and `release` take the held message by value: once either
/// has been called no further terminal action is possible.
#[async_trait]
pub trait DrainSource: Send {
    type Held: HeldMessage + Send + Sync;

    /// Receive the next message, waiting at most [`RECEIVE_TIMEOUT`].
    /// `Ok(None)` means the timeout elapsed with nothing available.
    async fn receive(&mut self) -> Result<Option<Self::Held>, BrokerError>;

    /// Permanently remove the message from the queue.
    async fn finalize(&mut self, held: Self::Held) -> Result<(), BrokerError>;

    /// Return the message to the queue; redelivery order is broker-defined.
    async fn release(&mut self, held: Self::Held) -> Result<(), BrokerError>;
}

/// Confirmed publish of a held message to a destination queue.
///
/// Implementations wait for a positive delivery acknowledgment, bounded by
/// [`PUBLISH_CONFIRM_TIMEOUT`], and report [`BrokerError::PublishFailed`]
/// otherwise.
#[async_trait]
pub trait RedirectSink<M: Send + Sync>: Send {
    async fn redirect(&mut self, held: &M) -> Result<(), BrokerError>;
}

/// Non-destructive enumeration: drain, project, return everything.
///
/// `bound` limits the number of drain iterations when the caller has a
/// census; `None` drains until the receive timeout elapses.
pub async fn drain_peek<S: DrainSource>(
    source: &mut S,
    queue: &str,
    bound: Option<usize>,
) -> Result<Vec<StandardMessage>, BrokerError> {
    let mut messages = Vec::new();
    let mut held = Vec::new();
    let mut consecutive_errors = 0u32;

    loop {
        if let Some(bound) = bound {
            if held.len() >= bound {
                break;
            }
        }

        match source.receive().await {
            Ok(Some(message)) => {
                consecutive_errors = 0;
                messages.push(message.to_standard());
                held.push(message);
            }
            Ok(None) => break,
            Err(e) => {
                consecutive_errors += 1;
                warn!(queue = %queue, error = %e, "Receive failed during enumeration");
                if consecutive_errors > MAX_CONSECUTIVE_RECEIVE_ERRORS {
                    release_all(source, queue, held).await;
                    return Err(BrokerError::drain_failed(queue, consecutive_errors));
                }
            }
        }
    }

    debug!(queue = %queue, count = messages.len(), "Enumeration drain complete");
    release_all(source, queue, held).await;
    Ok(messages)
}

/// Finalize-remove every message drained within `bound` iterations.
/// Returns the number of messages removed.
pub async fn drain_purge<S: DrainSource>(
    source: &mut S,
    queue: &str,
    bound: usize,
) -> Result<usize, BrokerError> {
    let mut removed = 0usize;
    let mut consecutive_errors = 0u32;

    for _ in 0..bound {
        match source.receive().await {
            Ok(Some(message)) => {
                consecutive_errors = 0;
                source.finalize(message).await?;
                removed += 1;
            }
            Ok(None) => break,
            Err(e) => {
                consecutive_errors += 1;
                warn!(queue = %queue, error = %e, "Receive failed during purge");
                if consecutive_errors > MAX_CONSECUTIVE_RECEIVE_ERRORS {
                    return Err(BrokerError::drain_failed(queue, consecutive_errors));
                }
            }
        }
    }

    debug!(queue = %queue, removed, "Purge drain complete");
    Ok(removed)
}

/// Map-then-act selection: drain up to `bound` messages into an
/// identifier-keyed map, act on each target ID, return everything else.
///
/// With `sink == None` matched messages are finalize-removed (delete);
/// with a sink they are redirected first and finalized only after the
/// destination confirmed the publish (move). A failed redirect returns the
/// original to the source queue and records the error; a target ID never
/// observed records [`BrokerError::NotFound`]. Duplicate target IDs are
/// collapsed. Errors come back one per failed target, in the order
/// attempted; an empty vector means full success.
pub async fn select_and_act<S: DrainSource>(
    source: &mut S,
    queue: &str,
    bound: usize,
    targets: &[String],
    mut sink: Option<&mut dyn RedirectSink<S::Held>>,
) -> Vec<BrokerError> {
    let mut errors = Vec::new();
    let mut held: HashMap<String, S::Held> = HashMap::new();
    // Messages without a usable identifier are never acted on, only
    // returned to the queue.
    let mut anonymous: Vec<S::Held> = Vec::new();
    let mut consecutive_errors = 0u32;

    for _ in 0..bound {
        match source.receive().await {
            Ok(Some(message)) => {
                consecutive_errors = 0;
                match message.native_id() {
                    Some(id) => {
                        if let Some(previous) = held.insert(id, message) {
                            anonymous.push(previous);
                        }
                    }
                    None => anonymous.push(message),
                }
            }
            Ok(None) => break,
            Err(e) => {
                consecutive_errors += 1;
                warn!(queue = %queue, error = %e, "Receive failed during selection drain");
                if consecutive_errors > MAX_CONSECUTIVE_RECEIVE_ERRORS {
                    errors.push(BrokerError::drain_failed(queue, consecutive_errors));
                    let remaining = held.into_values().chain(anonymous).collect();
                    release_all(source, queue, remaining).await;
                    return errors;
                }
            }
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for target in targets {
        if !seen.insert(target.as_str()) {
            continue;
        }

        let Some(message) = held.remove(target) else {
            errors.push(BrokerError::not_found(queue, target));
            continue;
        };

        match sink.as_deref_mut() {
            Some(sink) => match sink.redirect(&message).await {
                Ok(()) => {
                    if let Err(e) = source.finalize(message).await {
                        errors.push(e);
                    }
                }
                Err(e) => {
                    errors.push(e);
                    if let Err(release_error) = source.release(message).await {
                        warn!(
                            queue = %queue,
                            message_id = %target,
                            error = %release_error,
                            "Failed to return message to queue after failed redirect"
                        );
                    }
                }
            },
            None => {
                if let Err(e) = source.finalize(message).await {
                    errors.push(e);
                }
            }
        }
    }

    let remaining = held.into_values().chain(anonymous).collect();
    release_all(source, queue, remaining).await;
    errors
}

/// Scan-and-act selection for sources with no persistent per-message
/// handle to settle later: receive one message, classify it against the
/// target set, act on it or return it, then move on. At most one message
/// is in flight at any point, so an interruption strands at most one
/// message instead of the whole drained queue.
///
/// Action semantics match [`select_and_act`]: with `sink == None` matched
/// messages are finalize-removed, with a sink they are redirected first
/// and finalized only after the destination confirmed; a target never
/// observed within `bound` iterations records [`BrokerError::NotFound`];
/// duplicate target IDs are collapsed. The scan stops as soon as every
/// target has been acted on.
pub async fn scan_and_act<S: DrainSource>(
    source: &mut S,
    queue: &str,
    bound: usize,
    targets: &[String],
    mut sink: Option<&mut dyn RedirectSink<S::Held>>,
) -> Vec<BrokerError> {
    let mut remaining: Vec<&str> = Vec::new();
    for target in targets {
        if !remaining.contains(&target.as_str()) {
            remaining.push(target.as_str());
        }
    }

    let mut errors = Vec::new();
    let mut consecutive_errors = 0u32;

    for _ in 0..bound {
        if remaining.is_empty() {
            break;
        }

        let message = match source.receive().await {
            Ok(Some(message)) => {
                consecutive_errors = 0;
                message
            }
            Ok(None) => break,
            Err(e) => {
                consecutive_errors += 1;
                warn!(queue = %queue, error = %e, "Receive failed during selection scan");
                if consecutive_errors > MAX_CONSECUTIVE_RECEIVE_ERRORS {
                    errors.push(BrokerError::drain_failed(queue, consecutive_errors));
                    return errors;
                }
                continue;
            }
        };

        let position = message
            .native_id()
            .and_then(|id| remaining.iter().position(|target| *target == id));
        let Some(position) = position else {
            if let Err(e) = source.release(message).await {
                warn!(queue = %queue, error = %e, "Failed to return message to queue");
            }
            continue;
        };
        let target = remaining.remove(position);

        match sink.as_deref_mut() {
            Some(sink) => match sink.redirect(&message).await {
                Ok(()) => {
                    if let Err(e) = source.finalize(message).await {
                        errors.push(e);
                    }
                }
                Err(e) => {
                    errors.push(e);
                    if let Err(release_error) = source.release(message).await {
                        warn!(
                            queue = %queue,
                            message_id = %target,
                            error = %release_error,
                            "Failed to return message to queue after failed redirect"
                        );
                    }
                }
            },
            None => {
                if let Err(e) = source.finalize(message).await {
                    errors.push(e);
                }
            }
        }
    }

    for target in remaining {
        errors.push(BrokerError::not_found(queue, target));
    }
    errors
}

/// Return every remaining held message to the queue, best effort. Release
/// failures are logged; the broker's redelivery policy covers messages we
/// could not hand back ourselves.
async fn release_all<S: DrainSource>(source: &mut S, queue: &str, held: Vec<S::Held>) {
    for message in held {
        if let Err(e) = source.release(message).await {
            warn!(queue = %queue, error = %e, "Failed to return message to queue");
        }
    }
}

#[cfg(test)]
#[path = "drain_tests.rs"]
mod tests;
