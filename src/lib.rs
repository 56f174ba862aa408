//! Message-consumer runtime with worker supervision, retry backoff, and
//! dead-letter escalation.
//!
//! Types implementing [`message::QueueMessage`] map to queues on a
//! [`transport::QueueTransport`]. Register a handler per type on a
//! [`service::Service`], start it, and the service fans each type out
//! across supervised workers. Failures reschedule the message with a
//! growing delay and dead-letter it once the retry budget is spent.
//! [`publisher::Publisher`] is the matching producer path.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod handler;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod service;
pub mod status;
pub mod transport;
pub mod worker;
