//! In-process backend with full queue-management semantics.
//!
//! Backs the `test` broker binding and the engine-level tests. Goes
//! through the same drain engine as the network backends so the
//! selection and redistribution paths are exercised without a broker.

use crate::adapter::{first_error, BrokerAdapter};
use crate::drain::{self, DrainSource, HeldMessage, RedirectSink};
use crate::error::BrokerError;
use crate::message::{Queue, StandardMessage};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

type QueueMap = HashMap<String, VecDeque<StandardMessage>>;

/// In-memory broker: named queues of [`StandardMessage`] records.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    queues: Arc<Mutex<QueueMap>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-seeded with two sample queues, used for the built-in
    /// `test` broker binding.
    pub fn seeded() -> Self {
        let backend = Self::new();
        for queue in ["test_queue_1", "test_queue_2"] {
            for n in 1..=2 {
                let mut headers = HashMap::new();
                headers.insert("origin".to_string(), "seed".to_string());
                backend.publish(
                    queue,
                    StandardMessage::new(
                        uuid::Uuid::new_v4().to_string(),
                        Utc::now(),
                        headers,
                        format!("Sample message {n} on {queue}"),
                    ),
                );
            }
        }
        backend
    }

    /// Append a message to the tail of a queue, creating the queue on
    /// first use.
    pub fn publish(&self, queue: &str, message: StandardMessage) {
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }

    /// Current message count, `None` for a queue never written to.
    pub fn len(&self, queue: &str) -> Option<usize> {
        self.lock().get(queue).map(VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue).unwrap_or(0) == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueMap> {
        // A poisoned lock only means a test thread panicked mid-mutation;
        // the map itself is still structurally sound.
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn census(&self, queue: &str) -> usize {
        self.len(queue).unwrap_or(0)
    }

    fn source(&self, queue: &str) -> MemorySource {
        MemorySource {
            queues: Arc::clone(&self.queues),
            queue: queue.to_string(),
        }
    }

    fn sink(&self, to_queue: &str) -> MemorySink {
        MemorySink {
            queues: Arc::clone(&self.queues),
            to_queue: to_queue.to_string(),
        }
    }
}

#[async_trait]
impl BrokerAdapter for MemoryBackend {
    async fn get_all_messages(&self, queue: &str) -> Result<Vec<StandardMessage>, BrokerError> {
        let mut source = self.source(queue);
        drain::drain_peek(&mut source, queue, None).await
    }

    async fn get_all_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        let map = self.lock();
        let mut queues: Vec<Queue> = map
            .iter()
            .map(|(name, messages)| Queue::with_size(name, messages.len()))
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn purge(&self, queue: &str) -> Result<(), BrokerError> {
        let bound = self.census(queue);
        let mut source = self.source(queue);
        drain::drain_purge(&mut source, queue, bound).await?;
        Ok(())
    }

    async fn delete_one(&self, queue: &str, message_id: &str) -> Result<(), BrokerError> {
        first_error(self.delete_many(queue, &[message_id.to_string()]).await)
    }

    async fn delete_many(&self, queue: &str, message_ids: &[String]) -> Vec<BrokerError> {
        let bound = self.census(queue);
        let mut source = self.source(queue);
        drain::select_and_act(&mut source, queue, bound, message_ids, None).await
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
        let bound = self.census(from_queue);
        let mut source = self.source(from_queue);
        let mut sink = self.sink(to_queue);
        drain::select_and_act(&mut source, from_queue, bound, message_ids, Some(&mut sink)).await
    }
}

// ============================================================================
// Drain plumbing
// ============================================================================

/// One message popped from an in-memory queue, held until a terminal
/// action.
pub struct MemoryHeld {
    message: StandardMessage,
}

impl HeldMessage for MemoryHeld {
    fn native_id(&self) -> Option<String> {
        if self.message.message_id.is_empty() {
            None
        } else {
            Some(self.message.message_id.clone())
        }
    }

    fn to_standard(&self) -> StandardMessage {
        self.message.clone()
    }
}

struct MemorySource {
    queues: Arc<Mutex<QueueMap>>,
    queue: String,
}

impl MemorySource {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueMap> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DrainSource for MemorySource {
    type Held = MemoryHeld;

    async fn receive(&mut self) -> Result<Option<MemoryHeld>, BrokerError> {
        let mut map = self.lock();
        let message = map.get_mut(&self.queue).and_then(VecDeque::pop_front);
        Ok(message.map(|message| MemoryHeld { message }))
    }

    async fn finalize(&mut self, _held: MemoryHeld) -> Result<(), BrokerError> {
        // Dropping the held message completes the removal.
        Ok(())
    }

    async fn release(&mut self, held: MemoryHeld) -> Result<(), BrokerError> {
        self.lock()
            .entry(self.queue.clone())
            .or_default()
            .push_back(held.message);
        Ok(())
    }
}

struct MemorySink {
    queues: Arc<Mutex<QueueMap>>,
    to_queue: String,
}

#[async_trait]
impl RedirectSink<MemoryHeld> for MemorySink {
    async fn redirect(&mut self, held: &MemoryHeld) -> Result<(), BrokerError> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.to_queue.clone())
            .or_default()
            .push_back(held.message.clone());
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
