//! In-memory implementation of the queue transport.
//!
//! Backs the test suite and the demos. Supports everything the runtime
//! relies on from a real broker: scheduled visibility, peek-lock receive
//! with lock expiry, delivery counting with automatic dead-lettering past
//! the queue's max delivery count, and per-message TTL.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use super::{
    dead_letter_queue, properties, OutgoingMessage, QueueClient, QueueSpec, QueueTransport,
    TransportMessage,
};

/// How often an empty receive re-checks the queue before its timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Thread-safe in-memory transport.
///
/// Queues live in a concurrent map and are created on first provisioned use;
/// a queue's dead-letter sibling exists implicitly alongside it. Cloning the
/// transport shares the underlying queues.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    queues: papaya::HashMap<String, Arc<MemoryQueue>>,
    lock_duration: Duration,
}

struct MemoryQueue {
    spec: QueueSpec,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    scheduled: Vec<StoredMessage>,
    in_flight: HashMap<u64, InFlight>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: String,
    properties: HashMap<String, String>,
    available_at: Instant,
    expires_at: Instant,
    delivery_count: u32,
}

struct InFlight {
    message: StoredMessage,
    locked_until: Instant,
}

enum Taken {
    Ready {
        token: u64,
        payload: String,
        properties: HashMap<String, String>,
    },
    OverDelivered(StoredMessage),
    Empty,
}

static NEXT_LOCK_TOKEN: AtomicU64 = AtomicU64::new(1);

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_lock_duration(Duration::from_secs(30))
    }

    /// Same transport with a custom peek-lock duration; un-settled messages
    /// return to their queue once the lock lapses.
    pub fn with_lock_duration(lock_duration: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: papaya::HashMap::new(),
                lock_duration,
            }),
        }
    }

    fn get_or_create(&self, name: &str, spec: QueueSpec) -> Arc<MemoryQueue> {
        self.inner
            .queues
            .pin()
            .get_or_insert_with(name.to_owned(), || {
                Arc::new(MemoryQueue {
                    spec,
                    state: Mutex::new(QueueState::default()),
                })
            })
            .clone()
    }

    fn lookup(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.inner.queues.pin().get(name).cloned()
    }

    /// Resolves `name` without provisioning. Dead-letter siblings of existing
    /// queues are created on demand, mirroring brokers where the dead-letter
    /// location is a built-in subqueue.
    fn resolve(&self, name: &str) -> eyre::Result<Arc<MemoryQueue>> {
        if let Some(queue) = self.lookup(name) {
            return Ok(queue);
        }

        if let Some(parent) = name.strip_suffix(super::DEAD_LETTER_SUFFIX) {
            if let Some(parent_queue) = self.lookup(parent) {
                return Ok(self.get_or_create(name, parent_queue.spec));
            }
        }

        Err(eyre::eyre!("queue {name} does not exist"))
    }

    async fn push_dead_letter(
        &self,
        source_queue: &str,
        mut message: StoredMessage,
        reason: String,
        description: String,
    ) {
        message
            .properties
            .insert(properties::ERROR_CODE.to_owned(), reason);
        message
            .properties
            .insert(properties::ERROR_MESSAGE.to_owned(), description);
        message.delivery_count = 0;
        message.available_at = Instant::now();

        let source_spec = self
            .lookup(source_queue)
            .map(|queue| queue.spec)
            .unwrap_or_default();
        let sibling = self.get_or_create(&dead_letter_queue(source_queue), source_spec);
        sibling.state.lock().await.ready.push_back(message);
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    async fn enqueue(&self, outgoing: OutgoingMessage) {
        let now = Instant::now();
        let message = StoredMessage {
            payload: outgoing.payload,
            properties: outgoing.properties,
            available_at: now + outgoing.delay.unwrap_or(Duration::ZERO),
            expires_at: now + self.spec.message_ttl,
            delivery_count: 0,
        };

        let mut state = self.state.lock().await;
        match outgoing.delay {
            Some(_) => state.scheduled.push(message),
            None => state.ready.push_back(message),
        }
    }

    /// One receive attempt: promotes due messages, reaps expired locks, then
    /// pops the head of the ready queue under a fresh lock.
    async fn take_next(&self, lock_duration: Duration) -> Taken {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let mut idx = 0;
        while idx < state.scheduled.len() {
            if state.scheduled[idx].available_at <= now {
                let due = state.scheduled.swap_remove(idx);
                state.ready.push_back(due);
            } else {
                idx += 1;
            }
        }

        let lapsed: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, held)| held.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in lapsed {
            if let Some(held) = state.in_flight.remove(&token) {
                state.ready.push_front(held.message);
            }
        }

        while let Some(mut message) = state.ready.pop_front() {
            if message.expires_at <= now {
                continue;
            }

            message.delivery_count += 1;
            if message.delivery_count > self.spec.max_delivery_count {
                return Taken::OverDelivered(message);
            }

            let token = NEXT_LOCK_TOKEN.fetch_add(1, Ordering::Relaxed);
            let payload = message.payload.clone();
            let props = message.properties.clone();
            state.in_flight.insert(
                token,
                InFlight {
                    message,
                    locked_until: now + lock_duration,
                },
            );
            return Taken::Ready {
                token,
                payload,
                properties: props,
            };
        }

        Taken::Empty
    }

    async fn complete(&self, token: u64) -> eyre::Result<()> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| eyre::eyre!("message lock lapsed before settlement"))
    }

    async fn release(&self, token: u64) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        let held = state
            .in_flight
            .remove(&token)
            .ok_or_else(|| eyre::eyre!("message lock lapsed before settlement"))?;
        state.ready.push_front(held.message);
        Ok(())
    }

    async fn extract(&self, token: u64) -> eyre::Result<StoredMessage> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&token)
            .map(|held| held.message)
            .ok_or_else(|| eyre::eyre!("message lock lapsed before settlement"))
    }
}

impl QueueTransport for InMemoryTransport {
    fn client<'a>(
        &'a self,
        queue: &'a str,
        provision: Option<QueueSpec>,
    ) -> BoxFuture<'a, eyre::Result<Arc<dyn QueueClient>>> {
        Box::pin(async move {
            let backing = match provision {
                Some(spec) => self.get_or_create(queue, spec),
                None => self.resolve(queue)?,
            };

            Ok(Arc::new(InMemoryClient {
                name: queue.to_owned(),
                queue: backing,
                transport: self.clone(),
            }) as Arc<dyn QueueClient>)
        })
    }
}

struct InMemoryClient {
    name: String,
    queue: Arc<MemoryQueue>,
    transport: InMemoryTransport,
}

impl QueueClient for InMemoryClient {
    fn queue(&self) -> &str {
        &self.name
    }

    fn send(&self, outgoing: OutgoingMessage) -> BoxFuture<'_, eyre::Result<()>> {
        Box::pin(async move {
            self.queue.enqueue(outgoing).await;
            Ok(())
        })
    }

    fn receive(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, eyre::Result<Option<Box<dyn TransportMessage>>>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;

            loop {
                match self
                    .queue
                    .take_next(self.transport.inner.lock_duration)
                    .await
                {
                    Taken::Ready {
                        token,
                        payload,
                        properties,
                    } => {
                        return Ok(Some(Box::new(InMemoryMessage {
                            payload,
                            properties,
                            token,
                            queue_name: self.name.clone(),
                            queue: Arc::clone(&self.queue),
                            transport: self.transport.clone(),
                        }) as Box<dyn TransportMessage>));
                    }
                    Taken::OverDelivered(message) => {
                        debug!(queue = %self.name, "delivery count exhausted, dead-lettering");
                        self.transport
                            .push_dead_letter(
                                &self.name,
                                message,
                                "MaxDeliveryCountExceeded".to_owned(),
                                format!(
                                    "message exceeded {} deliveries",
                                    self.queue.spec.max_delivery_count
                                ),
                            )
                            .await;
                    }
                    Taken::Empty => {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
        })
    }
}

struct InMemoryMessage {
    payload: String,
    properties: HashMap<String, String>,
    token: u64,
    queue_name: String,
    queue: Arc<MemoryQueue>,
    transport: InMemoryTransport,
}

impl TransportMessage for InMemoryMessage {
    fn payload(&self) -> &str {
        &self.payload
    }

    fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    fn acknowledge(self: Box<Self>) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(async move { self.queue.complete(self.token).await })
    }

    fn abandon(self: Box<Self>) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(async move { self.queue.release(self.token).await })
    }

    fn dead_letter(
        self: Box<Self>,
        reason: String,
        description: String,
    ) -> BoxFuture<'static, eyre::Result<()>> {
        Box::pin(async move {
            let message = self.queue.extract(self.token).await?;
            self.transport
                .push_dead_letter(&self.queue_name, message, reason, description)
                .await;
            Ok(())
        })
    }
}
