//! Concrete broker backends.
//!
//! - [`activemq`] - AMQP 1.0 credit-flow broker with an admin-console
//!   management surface (map-then-act selection)
//! - [`rabbitmq`] - AMQP 0.9.1 broker driven through its HTTP management
//!   API, confirmed publish over the wire protocol (scan-and-act selection)
//! - [`sqs`] - polling cloud queue, read-only (mutations are
//!   `NotImplemented`)
//! - [`memory`] - in-process backend with full semantics

pub mod activemq;
pub mod memory;
pub mod rabbitmq;
pub mod sqs;

pub use activemq::ActiveMqBackend;
pub use memory::MemoryBackend;
pub use rabbitmq::RabbitMqBackend;
pub use sqs::SqsBackend;
