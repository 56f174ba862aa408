//! Message envelope types and queue naming.
//!
//! This module defines the typed wrapper handlers operate on. The envelope
//! travels as the payload of a raw transport message and carries identity,
//! correlation, and retry metadata alongside the user's body.
//!
//! # Envelope Lifecycle
//!
//! 1. A publisher wraps a body in a fresh envelope and sends it
//! 2. A worker receives the raw message and decodes the envelope
//! 3. On handler failure the same payload is redelivered with the retry
//!    count incremented on the raw message's property bag
//! 4. Once the retry budget is exhausted the message lands in the
//!    dead-letter queue, where retrieval reattaches the recorded error
//!
//! The `retry_attempts` field inside the envelope is a snapshot from publish
//! time; during redelivery the property bag on the raw message is
//! authoritative.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Structured failure information recovered from a dead-lettered message.
///
/// Populated only by the dead-letter retrieval path; live messages carry
/// their failure metadata on the transport property bag instead.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageError {
    /// Dead-letter reason code, e.g. `RetryCountOver3`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable description of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Cause chain recorded when the failing attempt was rescheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// The unit of work handlers receive: a typed body plus delivery metadata.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope<T> {
    /// Unique identifier, assigned at creation.
    pub id: Uuid,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// The typed payload.
    pub body: T,
    /// Number of redeliveries this message has been through.
    #[serde(default)]
    pub retry_attempts: u32,
    /// Carried for consumers that want it; the runtime does not schedule by it.
    #[serde(default)]
    pub priority: i64,
    /// Correlation: queue a reply should be sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Correlation: id of the message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<Uuid>,
    /// Failure details, present only on envelopes read back from a
    /// dead-letter queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
}

impl<T> Envelope<T> {
    /// Wraps a body in a fresh envelope with a new id and the current time.
    pub fn new(body: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            body,
            retry_attempts: 0,
            priority: 0,
            reply_to: None,
            reply_id: None,
            error: None,
        }
    }
}

/// A type that can be published to and consumed from a queue.
///
/// The queue name defaults to the lowercased final segment of the type name,
/// so `orders::ShipOrder` lands on the `shiporder` queue. Override
/// [`QueueMessage::queue_name`] to route elsewhere.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the queue messages of this type travel on.
    fn queue_name() -> String {
        short_type_name(std::any::type_name::<Self>()).to_lowercase()
    }
}

fn short_type_name(full: &str) -> &str {
    let bare = full.split('<').next().unwrap_or(full);
    bare.rsplit("::").next().unwrap_or(bare)
}
