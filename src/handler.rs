//! Per-type message handlers.
//!
//! A handler owns the full fate of one received message: decode the
//! envelope, run the user function, then settle the raw message according to
//! the outcome. Success acknowledges. Failure either abandons (no retry
//! interval configured), reschedules a delayed copy with the retry count
//! stamped on its property bag, or dead-letters once the budget is spent.
//!
//! One handler instance is shared by all of a type's workers, so everything
//! here is immutable or internally synchronized. Retry state never lives on
//! the handler; it travels with the message.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::{
    error::{DecodeSnafu, Error},
    message::{Envelope, QueueMessage},
    retry,
    transport::{
        client_with_retry, properties, OutgoingMessage, QueueClient, QueueTransport,
        TransportMessage,
    },
};

/// Concurrency and retry configuration for one registered message type.
///
/// Immutable once the handler is registered.
#[derive(Debug, Clone, bon::Builder)]
pub struct HandlerSettings {
    /// Number of workers receiving for this type.
    #[builder(default = 1)]
    pub workers: usize,
    /// Redeliveries allowed before a failing message is dead-lettered.
    #[builder(default = 1)]
    pub max_retries: u32,
    /// Base redelivery delay. When absent, failed messages are abandoned for
    /// the transport's own redelivery policy instead of rescheduled.
    pub retry_interval: Option<Duration>,
    /// Cap on the computed redelivery delay.
    pub max_retry_interval: Option<Duration>,
    /// Doubles the delay on each successive retry.
    #[builder(default)]
    pub double_retry_interval: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 1,
            retry_interval: None,
            max_retry_interval: None,
            double_retry_interval: false,
        }
    }
}

/// Hook composed around every handler invocation, across all message types.
///
/// Runs against the envelope as decoded JSON, before the typed decode, so a
/// single filter can observe or adjust traffic for every registered type.
pub trait MessageFilter: Send + Sync {
    /// Runs before the typed decode; may adjust the envelope.
    fn before_process(&self, envelope: &mut serde_json::Value) {
        let _ = envelope;
    }

    /// Runs after the user function returns successfully.
    fn after_process(&self, envelope: &serde_json::Value) {
        let _ = envelope;
    }
}

/// What became of one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// User function succeeded and the message was acknowledged.
    Completed,
    /// User function failed; the failure was routed through the retry policy.
    Failed,
}

/// User processing function for envelopes of `T`.
pub type ProcessFn<T> =
    Arc<dyn Fn(Envelope<T>) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Optional callback observing each failed attempt.
pub type ExceptionFn<T> = Arc<dyn Fn(&Envelope<T>, &eyre::Report) + Send + Sync>;

/// Type-erased handler contract the worker loop dispatches through.
pub(crate) trait MessageHandler: Send + Sync {
    fn queue(&self) -> &str;

    /// Consumes one raw message. `Err` is reserved for decode failures,
    /// which leave the message unsettled; user failures resolve to
    /// [`Outcome::Failed`] after retry bookkeeping.
    fn process<'a>(&'a self, raw: Box<dyn TransportMessage>)
        -> BoxFuture<'a, Result<Outcome, Error>>;
}

/// Builds the shared handler instance for a registered type at init time.
pub(crate) type HandlerFactory = Box<
    dyn Fn(Arc<dyn QueueTransport>, Option<Arc<dyn MessageFilter>>) -> Arc<dyn MessageHandler>
        + Send
        + Sync,
>;

/// The concrete handler for message type `T`.
pub(crate) struct TypedHandler<T: QueueMessage> {
    queue: String,
    transport: Arc<dyn QueueTransport>,
    process_fn: ProcessFn<T>,
    exception_fn: Option<ExceptionFn<T>>,
    settings: HandlerSettings,
    filter: Option<Arc<dyn MessageFilter>>,
    // Lazily created once; redelivery sends go through it.
    redelivery_client: Mutex<Option<Arc<dyn QueueClient>>>,
}

impl<T: QueueMessage> TypedHandler<T> {
    pub(crate) fn new(
        transport: Arc<dyn QueueTransport>,
        process_fn: ProcessFn<T>,
        exception_fn: Option<ExceptionFn<T>>,
        settings: HandlerSettings,
        filter: Option<Arc<dyn MessageFilter>>,
    ) -> Self {
        Self {
            queue: T::queue_name(),
            transport,
            process_fn,
            exception_fn,
            settings,
            filter,
            redelivery_client: Mutex::new(None),
        }
    }

    fn decode(&self, payload: &str) -> Result<(Envelope<T>, Option<serde_json::Value>), Error> {
        match &self.filter {
            None => {
                let envelope = serde_json::from_str(payload).context(DecodeSnafu {
                    queue: self.queue.as_str(),
                })?;
                Ok((envelope, None))
            }
            Some(filter) => {
                let mut raw: serde_json::Value =
                    serde_json::from_str(payload).context(DecodeSnafu {
                        queue: self.queue.as_str(),
                    })?;
                filter.before_process(&mut raw);
                let envelope = serde_json::from_value(raw.clone()).context(DecodeSnafu {
                    queue: self.queue.as_str(),
                })?;
                Ok((envelope, Some(raw)))
            }
        }
    }

    async fn redelivery_client(&self) -> eyre::Result<Arc<dyn QueueClient>> {
        let mut slot = self.redelivery_client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let client = client_with_retry(self.transport.as_ref(), &self.queue, None).await?;
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Settles a failed message: abandon, reschedule delayed, or dead-letter.
    ///
    /// The reschedule is a send-then-acknowledge pair with no transactional
    /// guarantee; a crash between the two redelivers the original alongside
    /// the copy. At-least-once delivery absorbs that.
    async fn apply_retry_policy(
        &self,
        raw: Box<dyn TransportMessage>,
        payload: &str,
        failure: &eyre::Report,
    ) -> eyre::Result<()> {
        let Some(base) = self.settings.retry_interval else {
            debug!(queue = %self.queue, "no retry interval configured, abandoning message");
            return raw.abandon().await;
        };

        let attempt = raw.retry_count() + 1;
        if attempt > self.settings.max_retries {
            let reason = format!("RetryCountOver{}", self.settings.max_retries);
            warn!(queue = %self.queue, attempt, "retry budget exhausted, dead-lettering");
            return raw.dead_letter(reason, format!("{failure:#}")).await;
        }

        let delay = retry::next_delay(
            base,
            attempt,
            self.settings.double_retry_interval,
            self.settings.max_retry_interval,
        );

        debug!(
            queue = %self.queue,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "rescheduling failed message"
        );

        let outgoing = OutgoingMessage::new(payload)
            .delayed_by(delay)
            .with_property(properties::RETRY_COUNT, attempt.to_string())
            .with_property(properties::ERROR_MESSAGE, failure.to_string())
            .with_property(properties::STACK_TRACE, format!("{failure:#}"));

        let client = self.redelivery_client().await?;
        client.send(outgoing).await?;
        raw.acknowledge().await
    }

    async fn resolve_failure(
        &self,
        raw: Box<dyn TransportMessage>,
        payload: &str,
        failure: &eyre::Report,
    ) {
        let attempts = raw.retry_count();

        // Bookkeeping failures must never escape into the worker loop.
        if let Err(error) = self.apply_retry_policy(raw, payload, failure).await {
            warn!(
                queue = %self.queue,
                %error,
                "retry bookkeeping failed, message left to transport redelivery"
            );
        }

        if let Some(callback) = &self.exception_fn {
            if let Ok(mut envelope) = serde_json::from_str::<Envelope<T>>(payload) {
                envelope.retry_attempts = attempts;
                callback(&envelope, failure);
            }
        }
    }
}

impl<T: QueueMessage> MessageHandler for TypedHandler<T> {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn process<'a>(
        &'a self,
        raw: Box<dyn TransportMessage>,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        Box::pin(async move {
            let payload = raw.payload().to_owned();

            let (mut envelope, filtered) = match self.decode(&payload) {
                Ok(decoded) => decoded,
                Err(source) => {
                    error!(queue = %self.queue, error = %source, "unable to decode message");
                    return Err(source);
                }
            };
            // The payload always carries the count it was first published
            // with; the live count travels in the property bag.
            envelope.retry_attempts = raw.retry_count();

            match (self.process_fn)(envelope).await {
                Ok(()) => {
                    if let Err(error) = raw.acknowledge().await {
                        warn!(queue = %self.queue, %error, "failed to acknowledge completed message");
                    }
                    if let (Some(filter), Some(value)) = (&self.filter, &filtered) {
                        filter.after_process(value);
                    }
                    Ok(Outcome::Completed)
                }
                Err(failure) => {
                    self.resolve_failure(raw, &payload, &failure).await;
                    Ok(Outcome::Failed)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::transport::{dead_letter_queue, memory::InMemoryTransport, QueueSpec};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Ping {
        seq: u32,
    }

    impl QueueMessage for Ping {}

    fn ok_fn() -> ProcessFn<Ping> {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    fn failing_fn(reason: &'static str) -> ProcessFn<Ping> {
        Arc::new(move |_| Box::pin(async move { Err(eyre::eyre!(reason)) }))
    }

    async fn publish(transport: &InMemoryTransport, seq: u32) {
        let client = transport
            .client("ping", Some(QueueSpec::default()))
            .await
            .unwrap();
        let payload = serde_json::to_string(&Envelope::new(Ping { seq })).unwrap();
        client.send(OutgoingMessage::new(payload)).await.unwrap();
    }

    async fn next_raw(transport: &InMemoryTransport, queue: &str) -> Box<dyn TransportMessage> {
        let client = transport
            .client(queue, Some(QueueSpec::default()))
            .await
            .unwrap();
        client
            .receive(Duration::from_millis(300))
            .await
            .unwrap()
            .expect("expected a message")
    }

    fn handler(
        transport: &InMemoryTransport,
        process_fn: ProcessFn<Ping>,
        settings: HandlerSettings,
    ) -> TypedHandler<Ping> {
        TypedHandler::new(
            Arc::new(transport.clone()),
            process_fn,
            None,
            settings,
            None,
        )
    }

    #[tokio::test]
    async fn success_acknowledges_and_reports_completed() {
        let transport = InMemoryTransport::new();
        publish(&transport, 1).await;
        let handler = handler(&transport, ok_fn(), HandlerSettings::default());

        let raw = next_raw(&transport, "ping").await;
        let outcome = handler.process(raw).await.unwrap();

        assert_eq!(outcome, Outcome::Completed);

        let client = transport.client("ping", None).await.unwrap();
        assert!(
            client
                .receive(Duration::from_millis(50))
                .await
                .unwrap()
                .is_none(),
            "acknowledged message must not come back"
        );
    }

    #[tokio::test]
    async fn failure_without_interval_abandons_for_redelivery() {
        let transport = InMemoryTransport::new();
        publish(&transport, 2).await;
        let handler = handler(&transport, failing_fn("nope"), HandlerSettings::default());

        let raw = next_raw(&transport, "ping").await;
        let outcome = handler.process(raw).await.unwrap();

        assert_eq!(outcome, Outcome::Failed);

        let again = next_raw(&transport, "ping").await;
        assert_eq!(again.retry_count(), 0, "abandon must not stamp a retry count");
    }

    #[tokio::test]
    async fn failure_with_interval_reschedules_a_stamped_copy() {
        let transport = InMemoryTransport::new();
        publish(&transport, 3).await;
        let settings = HandlerSettings::builder()
            .max_retries(3)
            .retry_interval(Duration::from_millis(60))
            .build();
        let handler = handler(&transport, failing_fn("boom"), settings);

        let raw = next_raw(&transport, "ping").await;
        handler.process(raw).await.unwrap();

        let client = transport.client("ping", None).await.unwrap();
        assert!(
            client
                .receive(Duration::from_millis(20))
                .await
                .unwrap()
                .is_none(),
            "the copy must stay invisible for the retry interval"
        );

        let copy = client
            .receive(Duration::from_millis(400))
            .await
            .unwrap()
            .expect("rescheduled copy should surface after the delay");
        assert_eq!(copy.retry_count(), 1);
        assert_eq!(
            copy.properties().get(properties::ERROR_MESSAGE).unwrap(),
            "boom"
        );
        assert!(copy.properties().contains_key(properties::STACK_TRACE));
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_with_reason() {
        let transport = InMemoryTransport::new();
        let settings = HandlerSettings::builder()
            .max_retries(2)
            .retry_interval(Duration::from_millis(10))
            .build();
        let handler = handler(&transport, failing_fn("still broken"), settings);

        // A copy already on its final permitted attempt.
        let client = transport
            .client("ping", Some(QueueSpec::default()))
            .await
            .unwrap();
        let payload = serde_json::to_string(&Envelope::new(Ping { seq: 4 })).unwrap();
        client
            .send(OutgoingMessage::new(payload).with_property(properties::RETRY_COUNT, "2"))
            .await
            .unwrap();

        let raw = next_raw(&transport, "ping").await;
        handler.process(raw).await.unwrap();

        let dead = next_raw(&transport, &dead_letter_queue("ping")).await;
        assert_eq!(
            dead.properties().get(properties::ERROR_CODE).unwrap(),
            "RetryCountOver2"
        );
        assert!(dead
            .properties()
            .get(properties::ERROR_MESSAGE)
            .unwrap()
            .contains("still broken"));
    }

    #[tokio::test]
    async fn undecodable_payloads_error_without_settling() {
        let transport = InMemoryTransport::new();
        let client = transport
            .client("ping", Some(QueueSpec::default()))
            .await
            .unwrap();
        client
            .send(OutgoingMessage::new("not json at all"))
            .await
            .unwrap();
        let handler = handler(&transport, ok_fn(), HandlerSettings::default());

        let raw = next_raw(&transport, "ping").await;
        let outcome = handler.process(raw).await;

        assert!(matches!(outcome, Err(Error::Decode { .. })));
    }

    #[tokio::test]
    async fn exception_callback_sees_envelope_and_failure() {
        let transport = InMemoryTransport::new();
        publish(&transport, 5).await;

        let seen = Arc::new(AtomicU32::new(0));
        let callback: ExceptionFn<Ping> = Arc::new({
            let seen = Arc::clone(&seen);
            move |envelope, failure| {
                assert_eq!(envelope.body.seq, 5);
                assert!(failure.to_string().contains("observed"));
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let handler = TypedHandler::new(
            Arc::new(transport.clone()),
            failing_fn("observed"),
            Some(callback),
            HandlerSettings::default(),
            None,
        );

        let raw = next_raw(&transport, "ping").await;
        handler.process(raw).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn envelope_mirrors_the_transport_retry_count() {
        let transport = InMemoryTransport::new();
        let client = transport
            .client("ping", Some(QueueSpec::default()))
            .await
            .unwrap();
        let payload = serde_json::to_string(&Envelope::new(Ping { seq: 7 })).unwrap();
        client
            .send(OutgoingMessage::new(payload).with_property(properties::RETRY_COUNT, "2"))
            .await
            .unwrap();

        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let process: ProcessFn<Ping> = Arc::new({
            let seen = Arc::clone(&seen);
            move |envelope| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    seen.store(envelope.retry_attempts, Ordering::SeqCst);
                    Ok(())
                })
            }
        });
        let handler = TypedHandler::new(
            Arc::new(transport.clone()),
            process,
            None,
            HandlerSettings::default(),
            None,
        );

        let raw = next_raw(&transport, "ping").await;
        handler.process(raw).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn filter_adjustments_reach_the_user_function() {
        struct Bump;

        impl MessageFilter for Bump {
            fn before_process(&self, envelope: &mut serde_json::Value) {
                envelope["priority"] = serde_json::json!(9);
            }
        }

        let transport = InMemoryTransport::new();
        publish(&transport, 6).await;

        let saw_priority = Arc::new(AtomicU32::new(0));
        let process: ProcessFn<Ping> = Arc::new({
            let saw_priority = Arc::clone(&saw_priority);
            move |envelope| {
                let saw_priority = Arc::clone(&saw_priority);
                Box::pin(async move {
                    saw_priority.store(envelope.priority as u32, Ordering::SeqCst);
                    Ok(())
                })
            }
        });

        let handler = TypedHandler::new(
            Arc::new(transport.clone()),
            process,
            None,
            HandlerSettings::default(),
            Some(Arc::new(Bump)),
        );

        let raw = next_raw(&transport, "ping").await;
        handler.process(raw).await.unwrap();

        assert_eq!(saw_priority.load(Ordering::SeqCst), 9);
    }
}
