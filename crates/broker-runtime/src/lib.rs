//! # Broker Runtime
//!
//! Multi-broker queue management runtime. Exposes a uniform set of
//! queue-management operations (enumerate, purge, delete, move) over
//! transports that only support sequential consume-and-acknowledge:
//! an AMQP 1.0 credit-flow broker, an AMQP 0.9.1 broker driven through
//! its HTTP management API, and a polling cloud queue.
//!
//! The heart of the crate is the drain engine in [`drain`]: a bounded,
//! timeout-guarded consume cursor where every held message has exactly
//! two terminal actions (finalize-removal or return-to-queue), plus a
//! selection layer that emulates "delete message X" and
//! "move message X from A to B" on top of it.
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for all broker operations
//! - [`message`] - Transport-neutral message and queue projections
//! - [`adapter`] - The per-backend capability trait
//! - [`drain`] - Drain cursor, selection engine, and redistribution sink
//! - [`endpoints`] - Comma-separated endpoint lists with first-success fallback
//! - [`backends`] - The concrete backends

// Module declarations
pub mod adapter;
pub mod backends;
pub mod drain;
pub mod endpoints;
pub mod error;
pub mod message;

// Re-export commonly used types at crate root for convenience
pub use adapter::BrokerAdapter;
pub use backends::{ActiveMqBackend, MemoryBackend, RabbitMqBackend, SqsBackend};
pub use drain::{DrainSource, HeldMessage, RedirectSink};
pub use error::BrokerError;
pub use message::{Broker, Queue, StandardMessage};
