//! The per-backend capability contract.

use crate::error::BrokerError;
use crate::message::{Queue, StandardMessage};
use async_trait::async_trait;

/// Uniform queue-management operations over one broker binding.
///
/// None of the supported transports offers random-access deletion or
/// relocation of a message identified by an application-level ID, so every
/// mutating operation here is emulated by a bounded sequential drain (see
/// [`crate::drain`]). Two consequences callers must accept:
///
/// - A move re-publishes a new message to the destination and only then
///   finalizes the original; it is not a transactional relocation, and
///   ordering relative to other producers on the destination is not
///   preserved.
/// - Concurrent mutating operations with overlapping target IDs on the same
///   queue are not mutually excluded; the broker's own session isolation is
///   the only synchronization relied upon.
///
/// Multi-item operations return one [`BrokerError`] per failed target, in
/// the order attempted; an empty vector means every target succeeded. A
/// backend without a capability returns [`BrokerError::NotImplemented`]
/// from every call to it.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Non-destructive enumeration: every drained message is returned to
    /// the queue. The queue's membership is unchanged by this call.
    async fn get_all_messages(&self, queue: &str) -> Result<Vec<StandardMessage>, BrokerError>;

    /// List queues from the broker's management surface.
    async fn get_all_queues(&self) -> Result<Vec<Queue>, BrokerError>;

    /// Finalize-remove every message drained within the census bound. A
    /// producer racing with the purge may leave residual messages.
    async fn purge(&self, queue: &str) -> Result<(), BrokerError>;

    /// Delete the message with the given ID. Reports
    /// [`BrokerError::NotFound`] when the ID was never observed during the
    /// bounded drain.
    async fn delete_one(&self, queue: &str, message_id: &str) -> Result<(), BrokerError>;

    /// Delete every message in `message_ids`, attempting all targets even
    /// after individual failures.
    async fn delete_many(&self, queue: &str, message_ids: &[String]) -> Vec<BrokerError>;

    /// Move the message with the given ID from `from_queue` to `to_queue`.
    /// A failed move is a no-op on the source: the original is returned to
    /// `from_queue` when the destination publish is not confirmed.
    async fn move_one(
        &self,
        from_queue: &str,
        to_queue: &str,
        message_id: &str,
    ) -> Result<(), BrokerError>;

    /// Move every message in `message_ids` from `from_queue` to `to_queue`,
    /// attempting all targets even after individual failures.
    async fn move_many(
        &self,
        from_queue: &str,
        to_queue: &str,
        message_ids: &[String],
    ) -> Vec<BrokerError>;
}

/// Collapse a multi-item result into a single-item one.
///
/// Single-target operations reuse the multi-target drain path; the first
/// reported error becomes the terminal error.
pub(crate) fn first_error(mut errors: Vec<BrokerError>) -> Result<(), BrokerError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.remove(0))
    }
}
