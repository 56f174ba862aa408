//! Administrative dead-letter retrieval.
//!
//! A read-only path over a type's dead-letter queue, callable without a
//! running service. Messages come back as envelopes with their retry count
//! and failure details restored from the property bag. Nothing here retries
//! or redelivers.

use std::time::Duration;

use snafu::ResultExt;
use tracing::debug;

use crate::{
    error::{DecodeSnafu, Error},
    message::{Envelope, MessageError, QueueMessage},
    transport::{dead_letter_queue, properties, QueueTransport, TransportMessage},
};

/// How long each batched read waits once the dead-letter queue runs dry.
const DRAIN_WAIT: Duration = Duration::from_millis(200);

/// Reads up to `max_count` dead-lettered envelopes for `T`.
///
/// With `delete_after` set the drained messages are acknowledged and gone;
/// otherwise the whole batch is abandoned after collection and remains
/// retrievable. Settling happens only after the full batch is read, so a
/// drain never re-receives its own abandoned messages.
pub async fn dead_lettered_messages<T: QueueMessage>(
    transport: &dyn QueueTransport,
    max_count: usize,
    delete_after: bool,
) -> Result<Vec<Envelope<T>>, Error> {
    let queue = dead_letter_queue(&T::queue_name());
    let client = transport
        .client(&queue, None)
        .await
        .map_err(Error::transport)?;

    let mut raw: Vec<Box<dyn TransportMessage>> = Vec::new();
    while raw.len() < max_count {
        match client.receive(DRAIN_WAIT).await.map_err(Error::transport)? {
            Some(message) => raw.push(message),
            None => break,
        }
    }

    // Decode the whole batch before settling anything; a bad payload leaves
    // every lock to lapse on its own.
    let mut envelopes = Vec::with_capacity(raw.len());
    for message in &raw {
        envelopes.push(reconstruct::<T>(&queue, message.as_ref())?);
    }

    for message in raw {
        if delete_after {
            message.acknowledge().await.map_err(Error::transport)?;
        } else {
            message.abandon().await.map_err(Error::transport)?;
        }
    }

    debug!(
        queue = %queue,
        count = envelopes.len(),
        deleted = delete_after,
        "dead-letter batch drained"
    );
    Ok(envelopes)
}

fn reconstruct<T: QueueMessage>(
    queue: &str,
    message: &dyn TransportMessage,
) -> Result<Envelope<T>, Error> {
    let mut envelope: Envelope<T> =
        serde_json::from_str(message.payload()).context(DecodeSnafu { queue })?;

    envelope.retry_attempts = message.retry_count();

    let bag = message.properties();
    if bag.contains_key(properties::ERROR_CODE) || bag.contains_key(properties::ERROR_MESSAGE) {
        envelope.error = Some(MessageError {
            error_code: bag.get(properties::ERROR_CODE).cloned(),
            message: bag.get(properties::ERROR_MESSAGE).cloned(),
            stack_trace: bag.get(properties::STACK_TRACE).cloned(),
        });
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::transport::{memory::InMemoryTransport, OutgoingMessage, QueueSpec};

    #[derive(Serialize, Deserialize, Debug)]
    struct Note {
        text: String,
    }

    impl QueueMessage for Note {}

    /// Runs a message through receive + dead_letter so it lands on the
    /// sibling queue the way a handler would put it there.
    async fn bury(transport: &InMemoryTransport, text: &str, retries: u32) {
        let client = transport
            .client("note", Some(QueueSpec::default()))
            .await
            .unwrap();
        let payload = serde_json::to_string(&Envelope::new(Note {
            text: text.to_owned(),
        }))
        .unwrap();
        client
            .send(
                OutgoingMessage::new(payload)
                    .with_property(properties::RETRY_COUNT, retries.to_string())
                    .with_property(properties::STACK_TRACE, "handler: boom"),
            )
            .await
            .unwrap();

        let raw = client
            .receive(Duration::from_millis(300))
            .await
            .unwrap()
            .unwrap();
        raw.dead_letter(format!("RetryCountOver{retries}"), "boom".to_owned())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restores_retry_count_and_failure_details() {
        let transport = InMemoryTransport::new();
        bury(&transport, "first", 2).await;

        let drained = dead_lettered_messages::<Note>(&transport, 10, true)
            .await
            .unwrap();

        assert_eq!(drained.len(), 1);
        let envelope = &drained[0];
        assert_eq!(envelope.body.text, "first");
        assert_eq!(envelope.retry_attempts, 2);
        let error = envelope.error.as_ref().unwrap();
        assert_eq!(error.error_code.as_deref(), Some("RetryCountOver2"));
        assert_eq!(error.message.as_deref(), Some("boom"));
        assert_eq!(error.stack_trace.as_deref(), Some("handler: boom"));
    }

    #[tokio::test]
    async fn delete_after_removes_the_batch() {
        let transport = InMemoryTransport::new();
        bury(&transport, "gone", 1).await;

        let first = dead_lettered_messages::<Note>(&transport, 10, true)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = dead_lettered_messages::<Note>(&transport, 10, true)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn peeked_batches_stay_retrievable() {
        let transport = InMemoryTransport::new();
        bury(&transport, "kept", 1).await;

        let first = dead_lettered_messages::<Note>(&transport, 10, false)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let again = dead_lettered_messages::<Note>(&transport, 10, false)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body.text, "kept");
    }

    #[tokio::test]
    async fn respects_max_count() {
        let transport = InMemoryTransport::new();
        for i in 0..3 {
            bury(&transport, &format!("n{i}"), 1).await;
        }

        let drained = dead_lettered_messages::<Note>(&transport, 2, true)
            .await
            .unwrap();
        assert_eq!(drained.len(), 2);

        let rest = dead_lettered_messages::<Note>(&transport, 10, true)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn unknown_parent_queue_is_an_error() {
        let transport = InMemoryTransport::new();

        let result = dead_lettered_messages::<Note>(&transport, 10, true).await;
        assert!(result.is_err());
    }
}
