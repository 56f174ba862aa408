//! Queue workers.
//!
//! A worker is one receive loop bound to one queue, driving one shared
//! handler. Lifecycle moves through compare-and-swap transitions on a status
//! cell, so racing start/stop/dispose calls resolve to a single winner
//! without a lock around the state machine.
//!
//! Teardown is cooperative. Stopping cancels the loop's token and lets the
//! current message finish; only a task that ignores cancellation through
//! both grace windows gets aborted.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::{future::BoxFuture, FutureExt};
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    error::Error,
    handler::{MessageHandler, Outcome},
    status::{Status, StatusCell},
    transport::{client_with_retry, QueueSpec, QueueTransport},
};

/// Wait granted to an in-flight message when a stop request lands.
const COURTESY_WAIT: Duration = Duration::from_millis(100);

/// Invoked when a worker's loop dies; owns replacement policy.
pub(crate) type CrashHandler =
    Arc<dyn Fn(Arc<Worker>, eyre::Report) -> BoxFuture<'static, ()> + Send + Sync>;

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// One receive loop over one queue.
pub(crate) struct Worker {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    transport: Arc<dyn QueueTransport>,
    status: StatusCell,
    processing: AtomicBool,
    times_started: AtomicU64,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    last_processed_ms: AtomicI64,
    task: Mutex<Option<RunningTask>>,
    crash_handler: CrashHandler,
    receive_timeout: Duration,
    stop_grace: Duration,
    kill_grace: Duration,
}

impl Worker {
    pub(crate) fn new(
        handler: Arc<dyn MessageHandler>,
        transport: Arc<dyn QueueTransport>,
        crash_handler: CrashHandler,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: handler.queue().to_owned(),
            handler,
            transport,
            status: StatusCell::new(Status::Stopped),
            processing: AtomicBool::new(false),
            times_started: AtomicU64::new(0),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_processed_ms: AtomicI64::new(0),
            task: Mutex::new(None),
            crash_handler,
            receive_timeout: config.receive_timeout(),
            stop_grace: config.stop_grace(),
            kill_grace: config.kill_grace(),
        })
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn status(&self) -> Status {
        self.status.get()
    }

    /// Spawns the receive loop. A no-op while already running.
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), Error> {
        match self.status.get() {
            Status::Disposed => return Err(Error::Disposed),
            Status::Started | Status::Starting => return Ok(()),
            Status::Stopping => {
                // Let the previous loop wind down before spinning a new one.
                // An aborted task never runs its own settle transition.
                self.reap_task().await;
                self.status.transition(Status::Stopping, Status::Stopped);
            }
            Status::Stopped => {}
        }

        if !self.status.transition(Status::Stopped, Status::Starting) {
            // Lost the race to another caller.
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let worker = Arc::clone(&self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        *self.task.lock().await = Some(RunningTask { handle, cancel });
        Ok(())
    }

    /// Requests a graceful stop. The running loop observes the flipped
    /// status and cancelled token; a mid-message worker gets a short
    /// courtesy wait before control returns.
    pub(crate) async fn stop(&self) {
        if self.status.get() == Status::Disposed {
            return;
        }

        if self.status.transition(Status::Started, Status::Stopping) {
            info!(queue = %self.queue, "worker stopping");
            if let Some(task) = self.task.lock().await.as_ref() {
                task.cancel.cancel();
            }
            if self.processing.load(Ordering::Acquire) {
                tokio::time::sleep(COURTESY_WAIT).await;
            }
        }
    }

    /// Stops the loop and retires the worker for good.
    pub(crate) async fn dispose(&self) {
        if self.status.get() == Status::Disposed {
            return;
        }

        self.stop().await;

        if self.status.swap(Status::Disposed) == Status::Disposed {
            // Another caller won the teardown.
            return;
        }
        self.reap_task().await;
        info!(queue = %self.queue, "worker disposed");
    }

    /// Fresh worker with the same wiring, for replacing a crashed one.
    pub(crate) fn clone_slot(&self) -> Arc<Self> {
        Arc::new(Self {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            transport: Arc::clone(&self.transport),
            status: StatusCell::new(Status::Stopped),
            processing: AtomicBool::new(false),
            times_started: AtomicU64::new(0),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_processed_ms: AtomicI64::new(0),
            task: Mutex::new(None),
            crash_handler: Arc::clone(&self.crash_handler),
            receive_timeout: self.receive_timeout,
            stop_grace: self.stop_grace,
            kill_grace: self.kill_grace,
        })
    }

    pub(crate) fn stats(&self) -> WorkerStats {
        let last = self.last_processed_ms.load(Ordering::Relaxed);
        WorkerStats {
            queue: self.queue.clone(),
            status: self.status.get(),
            times_started: self.times_started.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_processed_at: (last > 0)
                .then(|| DateTime::from_timestamp_millis(last))
                .flatten(),
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.status.transition(Status::Starting, Status::Started) {
            // Torn down between spawn and first poll.
            return;
        }
        self.times_started.fetch_add(1, Ordering::Relaxed);
        info!(queue = %self.queue, "worker started");

        if let Err(error) = self.receive_loop(&cancel).await {
            error!(queue = %self.queue, error = %format!("{error:#}"), "worker loop failed");
            self.status.transition(Status::Started, Status::Stopping);
            (self.crash_handler)(Arc::clone(&self), error).await;
        }

        // Disposed is terminal; anything else settles to Stopped.
        self.status.transition(Status::Stopping, Status::Stopped);
    }

    async fn receive_loop(&self, cancel: &CancellationToken) -> eyre::Result<()> {
        let client = client_with_retry(
            self.transport.as_ref(),
            &self.queue,
            Some(QueueSpec::default()),
        )
        .await?;

        while self.status.get() == Status::Started {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = client.receive(self.receive_timeout) => received?,
            };

            let Some(message) = received else {
                // Receive window lapsed with nothing queued.
                continue;
            };

            self.received.fetch_add(1, Ordering::Relaxed);
            self.processing.store(true, Ordering::Release);
            let outcome = AssertUnwindSafe(self.handler.process(message))
                .catch_unwind()
                .await;
            self.processing.store(false, Ordering::Release);

            match outcome {
                Ok(Ok(Outcome::Completed)) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.last_processed_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                }
                Ok(Ok(Outcome::Failed)) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(error)) => {
                    // Poison payload. It stays unsettled until its lock
                    // lapses and the transport's delivery cap catches it.
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(queue = %self.queue, %error, "skipping undecodable message");
                }
                Err(panic) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(eyre::eyre!(
                        "message handler panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                }
            }
        }

        Ok(())
    }

    /// Joins the background task, escalating from cancellation to abort.
    async fn reap_task(&self) {
        let Some(RunningTask { handle, cancel }) = self.task.lock().await.take() else {
            return;
        };

        cancel.cancel();
        let mut handle = handle;

        if timeout(self.stop_grace, &mut handle).await.is_ok() {
            return;
        }
        warn!(queue = %self.queue, "worker task ignored cancellation, waiting before abort");

        if timeout(self.kill_grace, &mut handle).await.is_err() {
            warn!(queue = %self.queue, "worker task did not exit, aborting");
            handle.abort();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

/// Point-in-time snapshot of one worker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub queue: String,
    pub status: Status,
    pub times_started: u64,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATS for {}:", self.queue)?;
        writeln!(f, "  status:          {}", self.status)?;
        writeln!(f, "  times started:   {}", self.times_started)?;
        writeln!(f, "  received:        {}", self.received)?;
        writeln!(f, "  processed:       {}", self.processed)?;
        writeln!(f, "  failed:          {}", self.failed)?;
        match self.last_processed_at {
            Some(at) => write!(f, "  last processed:  {at}"),
            None => write!(f, "  last processed:  never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::transport::{
        memory::InMemoryTransport, OutgoingMessage, QueueClient, TransportMessage,
    };

    struct CountingHandler {
        queue: String,
        seen: Arc<AtomicU32>,
    }

    impl MessageHandler for CountingHandler {
        fn queue(&self) -> &str {
            &self.queue
        }

        fn process<'a>(
            &'a self,
            raw: Box<dyn TransportMessage>,
        ) -> BoxFuture<'a, Result<Outcome, Error>> {
            Box::pin(async move {
                raw.acknowledge().await.map_err(Error::transport)?;
                self.seen.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Completed)
            })
        }
    }

    struct PanickingHandler {
        queue: String,
    }

    impl MessageHandler for PanickingHandler {
        fn queue(&self) -> &str {
            &self.queue
        }

        fn process<'a>(
            &'a self,
            raw: Box<dyn TransportMessage>,
        ) -> BoxFuture<'a, Result<Outcome, Error>> {
            Box::pin(async move {
                drop(raw);
                panic!("handler blew up");
            })
        }
    }

    struct BrokenTransport;

    impl QueueTransport for BrokenTransport {
        fn client<'a>(
            &'a self,
            queue: &'a str,
            _provision: Option<QueueSpec>,
        ) -> BoxFuture<'a, eyre::Result<Arc<dyn QueueClient>>> {
            Box::pin(async move {
                Ok(Arc::new(BrokenClient {
                    queue: queue.to_owned(),
                }) as Arc<dyn QueueClient>)
            })
        }
    }

    struct BrokenClient {
        queue: String,
    }

    impl QueueClient for BrokenClient {
        fn queue(&self) -> &str {
            &self.queue
        }

        fn send(&self, _message: OutgoingMessage) -> BoxFuture<'_, eyre::Result<()>> {
            Box::pin(async { Err(eyre::eyre!("wire down")) })
        }

        fn receive(
            &self,
            _wait: Duration,
        ) -> BoxFuture<'_, eyre::Result<Option<Box<dyn TransportMessage>>>> {
            Box::pin(async { Err(eyre::eyre!("wire down")) })
        }
    }

    fn noop_crash_handler() -> CrashHandler {
        Arc::new(|_, _| Box::pin(async {}))
    }

    fn recording_crash_handler(hits: Arc<AtomicU32>) -> CrashHandler {
        Arc::new(move |_, _| {
            let hits = Arc::clone(&hits);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn publish(transport: &InMemoryTransport, queue: &str, body: &str) {
        let client = transport
            .client(queue, Some(QueueSpec::default()))
            .await
            .unwrap();
        client.send(OutgoingMessage::new(body)).await.unwrap();
    }

    fn worker_over(
        transport: &InMemoryTransport,
        queue: &str,
        seen: Arc<AtomicU32>,
    ) -> Arc<Worker> {
        Worker::new(
            Arc::new(CountingHandler {
                queue: queue.to_owned(),
                seen,
            }),
            Arc::new(transport.clone()),
            noop_crash_handler(),
            &Config::default(),
        )
    }

    #[tokio::test]
    async fn processes_published_messages() {
        let transport = InMemoryTransport::new();
        publish(&transport, "jobs", "one").await;
        publish(&transport, "jobs", "two").await;

        let seen = Arc::new(AtomicU32::new(0));
        let worker = worker_over(&transport, "jobs", Arc::clone(&seen));

        worker.clone().start().await.unwrap();
        wait_until(|| seen.load(Ordering::SeqCst) == 2).await;

        let stats = worker.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.times_started, 1);
        assert!(stats.last_processed_at.is_some());

        worker.dispose().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let transport = InMemoryTransport::new();
        let seen = Arc::new(AtomicU32::new(0));
        let worker = worker_over(&transport, "jobs", seen);

        worker.clone().start().await.unwrap();
        wait_until(|| worker.status() == Status::Started).await;
        worker.clone().start().await.unwrap();
        worker.clone().start().await.unwrap();

        assert_eq!(worker.stats().times_started, 1);
        worker.dispose().await;
    }

    #[tokio::test]
    async fn stop_settles_the_loop_to_stopped() {
        let transport = InMemoryTransport::new();
        let seen = Arc::new(AtomicU32::new(0));
        let worker = worker_over(&transport, "jobs", seen);

        worker.clone().start().await.unwrap();
        wait_until(|| worker.status() == Status::Started).await;

        worker.stop().await;
        wait_until(|| worker.status() == Status::Stopped).await;

        // A stopped worker can go again.
        worker.clone().start().await.unwrap();
        wait_until(|| worker.status() == Status::Started).await;
        assert_eq!(worker.stats().times_started, 2);

        worker.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_terminal() {
        let transport = InMemoryTransport::new();
        let seen = Arc::new(AtomicU32::new(0));
        let worker = worker_over(&transport, "jobs", seen);

        worker.clone().start().await.unwrap();
        worker.dispose().await;
        assert_eq!(worker.status(), Status::Disposed);

        let refused = worker.clone().start().await;
        assert!(matches!(refused, Err(Error::Disposed)));

        // Repeat disposal stays quiet.
        worker.dispose().await;
        assert_eq!(worker.status(), Status::Disposed);
    }

    #[tokio::test]
    async fn receive_failures_invoke_the_crash_handler() {
        let hits = Arc::new(AtomicU32::new(0));
        let worker = Worker::new(
            Arc::new(CountingHandler {
                queue: "jobs".to_owned(),
                seen: Arc::new(AtomicU32::new(0)),
            }),
            Arc::new(BrokenTransport),
            recording_crash_handler(Arc::clone(&hits)),
            &Config::default(),
        );

        worker.clone().start().await.unwrap();
        wait_until(|| hits.load(Ordering::SeqCst) == 1).await;
        wait_until(|| worker.status() == Status::Stopped).await;
    }

    #[tokio::test]
    async fn handler_panics_are_contained_and_crash_the_worker() {
        let transport = InMemoryTransport::new();
        publish(&transport, "jobs", "{}").await;

        let hits = Arc::new(AtomicU32::new(0));
        let worker = Worker::new(
            Arc::new(PanickingHandler {
                queue: "jobs".to_owned(),
            }),
            Arc::new(transport.clone()),
            recording_crash_handler(Arc::clone(&hits)),
            &Config::default(),
        );

        worker.clone().start().await.unwrap();
        wait_until(|| hits.load(Ordering::SeqCst) == 1).await;

        let stats = worker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn replacement_starts_from_a_clean_slate() {
        let transport = InMemoryTransport::new();
        publish(&transport, "jobs", "one").await;

        let seen = Arc::new(AtomicU32::new(0));
        let worker = worker_over(&transport, "jobs", Arc::clone(&seen));
        worker.clone().start().await.unwrap();
        wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
        worker.dispose().await;

        let replacement = worker.clone_slot();
        assert_eq!(replacement.status(), Status::Stopped);
        assert_eq!(replacement.stats().times_started, 0);
        assert_eq!(replacement.stats().processed, 0);

        publish(&transport, "jobs", "two").await;
        replacement.clone().start().await.unwrap();
        wait_until(|| seen.load(Ordering::SeqCst) == 2).await;
        replacement.dispose().await;
    }
}
