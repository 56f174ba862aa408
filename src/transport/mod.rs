//! Queue transport contract.
//!
//! The runtime never talks to a broker directly; everything goes through the
//! traits in this module. A transport hands out per-queue clients, a client
//! sends and receives raw messages, and a raw message settles exactly once
//! by being acknowledged, abandoned, or dead-lettered. The settle operations
//! consume the message, so a worker cannot hold one past its
//! receive-process cycle.
//!
//! Implementations own all durability and wire concerns. The crate ships an
//! in-memory implementation for tests and demos in [`memory`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tracing::debug;

pub mod memory;

/// Property-bag keys the runtime stamps on raw messages.
pub mod properties {
    /// Redelivery count; authoritative during retry accounting.
    pub const RETRY_COUNT: &str = "RetryCount";
    /// Dead-letter reason code.
    pub const ERROR_CODE: &str = "ErrorCode";
    /// Failure description from the attempt that rescheduled the message.
    pub const ERROR_MESSAGE: &str = "ErrorMessage";
    /// Cause chain of that failure.
    pub const STACK_TRACE: &str = "StackTrace";
}

/// Suffix appended to a queue name to address its dead-letter sibling.
pub const DEAD_LETTER_SUFFIX: &str = "/$deadletter";

/// Dead-letter queue name for `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Provisioning parameters applied when a queue is created on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub max_size_mb: u64,
    pub message_ttl: Duration,
    pub max_delivery_count: u32,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            max_size_mb: 5120,
            message_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_delivery_count: 10,
        }
    }
}

/// A message on its way out: payload plus scheduling and metadata.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub payload: String,
    /// Scheduled-visibility delay; the message stays hidden until it elapses.
    pub delay: Option<Duration>,
    pub properties: HashMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Hands out clients bound to named queues.
pub trait QueueTransport: Send + Sync + 'static {
    /// Returns a client for `queue`. When `provision` is set, the backing
    /// queue is created with those parameters if it does not exist yet.
    fn client<'a>(
        &'a self,
        queue: &'a str,
        provision: Option<QueueSpec>,
    ) -> BoxFuture<'a, eyre::Result<Arc<dyn QueueClient>>>;
}

/// Sends to and receives from one queue.
pub trait QueueClient: Send + Sync + 'static {
    /// Queue this client is bound to.
    fn queue(&self) -> &str;

    fn send(&self, outgoing: OutgoingMessage) -> BoxFuture<'_, eyre::Result<()>>;

    /// Blocks up to `timeout` for the next message. `None` means the queue
    /// had nothing to deliver, which is a normal outcome, not an error.
    fn receive(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, eyre::Result<Option<Box<dyn TransportMessage>>>>;
}

/// One received message, exclusively owned until settled.
pub trait TransportMessage: Send + Sync {
    fn payload(&self) -> &str;

    fn properties(&self) -> &HashMap<String, String>;

    /// Redelivery count recorded on the property bag, zero when absent.
    fn retry_count(&self) -> u32 {
        self.properties()
            .get(properties::RETRY_COUNT)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Removes the message from the queue for good.
    fn acknowledge(self: Box<Self>) -> BoxFuture<'static, eyre::Result<()>>;

    /// Returns the message to the queue for immediate redelivery.
    fn abandon(self: Box<Self>) -> BoxFuture<'static, eyre::Result<()>>;

    /// Moves the message to the queue's dead-letter sibling.
    fn dead_letter(
        self: Box<Self>,
        reason: String,
        description: String,
    ) -> BoxFuture<'static, eyre::Result<()>>;
}

/// Builds a client, retrying once on failure. Provisioning races (such as a
/// create against a queue deleted moments ago) are the usual transient cause;
/// a second failure propagates.
pub async fn client_with_retry(
    transport: &dyn QueueTransport,
    queue: &str,
    provision: Option<QueueSpec>,
) -> eyre::Result<Arc<dyn QueueClient>> {
    match transport.client(queue, provision).await {
        Ok(client) => Ok(client),
        Err(error) => {
            debug!(%queue, %error, "client creation failed, retrying once");
            transport.client(queue, provision).await
        }
    }
}
