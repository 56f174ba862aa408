//! Producer path.
//!
//! The publisher wraps bodies in envelopes and sends them to the queue their
//! type maps to. Queue clients are created lazily, provisioning the queue on
//! first use, and cached behind an async mutex so concurrent first-sends to
//! a new queue build exactly one client.

use std::{collections::HashMap, sync::Arc};

use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::{
    error::{EncodeSnafu, Error},
    message::{Envelope, QueueMessage},
    transport::{client_with_retry, OutgoingMessage, QueueClient, QueueSpec, QueueTransport},
};

/// Publishes envelopes to their type-derived queues.
///
/// Cheap to clone; clones share the client cache.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn QueueTransport>,
    clients: Mutex<HashMap<String, Arc<dyn QueueClient>>>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wraps `body` in a fresh envelope and publishes it.
    pub async fn publish<T: QueueMessage>(&self, body: T) -> Result<(), Error> {
        self.publish_envelope(Envelope::new(body)).await
    }

    /// Publishes a caller-built envelope, keeping its correlation fields and
    /// priority intact.
    pub async fn publish_envelope<T: QueueMessage>(
        &self,
        envelope: Envelope<T>,
    ) -> Result<(), Error> {
        let queue = T::queue_name();
        let payload = serde_json::to_string(&envelope).context(EncodeSnafu {
            queue: queue.as_str(),
        })?;

        let client = self.client(&queue).await?;
        client
            .send(OutgoingMessage::new(payload))
            .await
            .map_err(Error::transport)?;

        debug!(queue = %queue, id = %envelope.id, "message published");
        Ok(())
    }

    /// Publishes on a detached task; failures are logged instead of
    /// returned.
    pub fn publish_background<T: QueueMessage>(&self, body: T) {
        let publisher = self.clone();
        tokio::spawn(async move {
            if let Err(error) = publisher.publish(body).await {
                error!(queue = %T::queue_name(), %error, "background publish failed");
            }
        });
    }

    async fn client(&self, queue: &str) -> Result<Arc<dyn QueueClient>, Error> {
        let mut clients = self.inner.clients.lock().await;
        if let Some(client) = clients.get(queue) {
            return Ok(Arc::clone(client));
        }

        let client = client_with_retry(
            self.inner.transport.as_ref(),
            queue,
            Some(QueueSpec::default()),
        )
        .await
        .map_err(Error::transport)?;
        clients.insert(queue.to_owned(), Arc::clone(&client));
        Ok(client)
    }
}
