//! Service supervisor.
//!
//! The service owns handler registration, worker materialization, and the
//! service-level state machine. Each registered message type gets one shared
//! handler fanned out across its configured worker count. A crashed worker
//! is replaced in its slot; the failed instance is retired on a separate
//! task so the replacement keeps consuming while the old loop winds down.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::Error,
    handler::{
        ExceptionFn, HandlerFactory, HandlerSettings, MessageFilter, ProcessFn, TypedHandler,
    },
    message::{Envelope, QueueMessage},
    status::{Status, StatusCell},
    transport::QueueTransport,
    worker::{CrashHandler, Worker, WorkerStats},
};

/// Global callback observing startup failures and worker crashes.
pub type ErrorCallback = Arc<dyn Fn(&eyre::Report) + Send + Sync>;

struct Registration {
    workers: usize,
    factory: HandlerFactory,
}

struct ServiceCore {
    transport: Arc<dyn QueueTransport>,
    config: Config,
    status: StatusCell,
    registrations: papaya::HashMap<String, Registration>,
    workers: Mutex<Vec<Arc<Worker>>>,
    initialized: AtomicBool,
    times_started: AtomicU64,
    startup_failures: AtomicU32,
    error_callback: Option<ErrorCallback>,
    filter: Option<Arc<dyn MessageFilter>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Message-consumer service.
///
/// Cheap to clone; clones share the same supervisor state. Call
/// [`Service::dispose`] before dropping the last clone, otherwise started
/// workers keep their receive loops running.
#[derive(Clone)]
pub struct Service {
    core: Arc<ServiceCore>,
}

#[bon::bon]
impl Service {
    #[builder]
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        config: Option<Config>,
        error_callback: Option<ErrorCallback>,
        filter: Option<Arc<dyn MessageFilter>>,
    ) -> Self {
        Self {
            core: Arc::new(ServiceCore {
                transport,
                config: config.unwrap_or_default(),
                status: StatusCell::new(Status::Stopped),
                registrations: papaya::HashMap::new(),
                workers: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                times_started: AtomicU64::new(0),
                startup_failures: AtomicU32::new(0),
                error_callback,
                filter,
                supervisor: Mutex::new(None),
            }),
        }
    }
}

impl Service {
    /// Registers the handler for `T` with default settings.
    pub fn register_handler<T, F, Fut>(&self, process: F) -> Result<(), Error>
    where
        T: QueueMessage,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.register::<T>(wrap_process(process), None, HandlerSettings::default())
    }

    /// Registers the handler for `T` with explicit settings and an optional
    /// per-attempt failure callback.
    pub fn register_handler_with<T, F, Fut>(
        &self,
        process: F,
        exception: Option<ExceptionFn<T>>,
        settings: HandlerSettings,
    ) -> Result<(), Error>
    where
        T: QueueMessage,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.register::<T>(wrap_process(process), exception, settings)
    }

    fn register<T: QueueMessage>(
        &self,
        process_fn: ProcessFn<T>,
        exception_fn: Option<ExceptionFn<T>>,
        settings: HandlerSettings,
    ) -> Result<(), Error> {
        if self.core.status.get() == Status::Disposed {
            return Err(Error::Disposed);
        }
        if self.core.initialized.load(Ordering::Acquire) {
            return Err(Error::AlreadyInitialized);
        }

        let queue = T::queue_name();
        let workers = settings.workers.max(1);
        let factory: HandlerFactory = Box::new(move |transport, filter| {
            Arc::new(TypedHandler::new(
                transport,
                Arc::clone(&process_fn),
                exception_fn.clone(),
                settings.clone(),
                filter,
            ))
        });

        let registrations = self.core.registrations.pin();
        match registrations.try_insert(queue.clone(), Registration { workers, factory }) {
            Ok(_) => {
                debug!(queue = %queue, workers, "handler registered");
                Ok(())
            }
            Err(_) => Err(Error::already_registered(queue)),
        }
    }

    /// Materializes workers from the registrations. Idempotent; called by
    /// [`Service::start`] when needed.
    pub async fn init(&self) {
        if self.core.status.get() == Status::Disposed {
            return;
        }
        if self.core.initialized.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut workers = self.core.workers.lock().await;
        let crash_handler = ServiceCore::crash_handler(&self.core);
        let registrations = self.core.registrations.pin();
        for (queue, registration) in registrations.iter() {
            let handler = (registration.factory)(
                Arc::clone(&self.core.transport),
                self.core.filter.clone(),
            );
            debug!(queue = %queue, count = registration.workers, "materializing workers");
            for _ in 0..registration.workers {
                workers.push(Worker::new(
                    Arc::clone(&handler),
                    Arc::clone(&self.core.transport),
                    Arc::clone(&crash_handler),
                    &self.core.config,
                ));
            }
        }
        info!(workers = workers.len(), "service initialized");
    }

    /// Brings the service up. Startup failures are logged, counted, and
    /// surfaced to the error callback instead of returned; the service
    /// reverts to stopped and a later call tries again after a jittered
    /// backoff.
    pub async fn start(&self) -> Result<(), Error> {
        match self.core.status.get() {
            Status::Disposed => return Err(Error::Disposed),
            Status::Started => {
                // Revive workers that settled after an earlier stop request.
                let workers = self.core.workers.lock().await;
                for worker in workers.iter() {
                    if worker.status() == Status::Stopped {
                        if let Err(refused) = worker.clone().start().await {
                            warn!(queue = %worker.queue(), error = %refused, "worker refused to restart");
                        }
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        if !self.core.status.transition(Status::Stopped, Status::Starting) {
            // Another caller is mid-transition.
            return Ok(());
        }

        self.init().await;

        match self.start_workers().await {
            Ok(()) => {
                self.core.startup_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(failure) => {
                let failures = self.core.startup_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    failures,
                    error = %format!("{failure:#}"),
                    "service startup failed"
                );
                if let Some(callback) = &self.core.error_callback {
                    callback(&failure);
                }
                self.core.status.transition(Status::Starting, Status::Stopped);
                Ok(())
            }
        }
    }

    async fn start_workers(&self) -> eyre::Result<()> {
        let workers = self.core.workers.lock().await;
        if workers.is_empty() {
            warn!("no handlers registered, nothing to start");
            self.core.status.transition(Status::Starting, Status::Stopped);
            return Ok(());
        }

        self.backoff_on_failures().await;

        for worker in workers.iter() {
            worker.clone().start().await?;
        }
        drop(workers);

        // The flip to Started happens off the caller's stack.
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            if core.status.transition(Status::Starting, Status::Started) {
                core.times_started.fetch_add(1, Ordering::Relaxed);
                info!("service started");
            }
        });
        *self.core.supervisor.lock().await = Some(handle);
        Ok(())
    }

    /// Sleeps proportionally to the consecutive startup failures so a
    /// persistently broken transport is not hammered in a tight loop.
    async fn backoff_on_failures(&self) {
        let failures = u64::from(self.core.startup_failures.load(Ordering::Relaxed));
        if failures == 0 {
            return;
        }

        let millis =
            rand::thread_rng().gen_range(failures.saturating_pow(3)..=(failures + 1).saturating_pow(3));
        let delay = Duration::from_millis(millis).min(self.core.config.startup_backoff_cap());
        debug!(
            failures,
            delay_ms = delay.as_millis() as u64,
            "backing off before startup attempt"
        );
        tokio::time::sleep(delay).await;
    }

    /// Asks every worker to stop and settles the service to stopped.
    /// Workers settle their own status asynchronously.
    pub async fn stop(&self) -> Result<(), Error> {
        if self.core.status.get() == Status::Disposed {
            return Err(Error::Disposed);
        }

        if !self.core.status.transition(Status::Started, Status::Stopping) {
            return Ok(());
        }

        info!("service stopping");
        let workers = self.core.workers.lock().await;
        for worker in workers.iter() {
            worker.stop().await;
        }
        drop(workers);

        self.core.status.transition(Status::Stopping, Status::Stopped);
        Ok(())
    }

    /// Tears the service down permanently. Safe to call repeatedly and from
    /// any prior state.
    pub async fn dispose(&self) {
        if self.core.status.get() == Status::Disposed {
            return;
        }

        if let Err(error) = self.stop().await {
            debug!(%error, "stop during disposal");
        }

        if self.core.status.swap(Status::Disposed) == Status::Disposed {
            // Another caller won the teardown.
            return;
        }

        let mut workers = self.core.workers.lock().await;
        for worker in workers.iter() {
            worker.dispose().await;
        }
        workers.clear();
        drop(workers);

        if let Some(handle) = self.core.supervisor.lock().await.take() {
            handle.abort();
        }
        info!("service disposed");
    }

    pub fn status(&self) -> Status {
        self.core.status.get()
    }

    /// Combined counters across all workers.
    pub async fn stats(&self) -> ServiceStats {
        let workers = self.core.workers.lock().await;
        let mut stats = ServiceStats {
            status: self.core.status.get(),
            times_started: self.core.times_started.load(Ordering::Relaxed),
            workers: workers.len(),
            received: 0,
            processed: 0,
            failed: 0,
            last_processed_at: None,
        };

        for worker in workers.iter() {
            let snapshot = worker.stats();
            stats.received += snapshot.received;
            stats.processed += snapshot.processed;
            stats.failed += snapshot.failed;
            stats.last_processed_at = match (stats.last_processed_at, snapshot.last_processed_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        stats
    }

    /// Per-worker snapshots, in materialization order.
    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        self.core
            .workers
            .lock()
            .await
            .iter()
            .map(|worker| worker.stats())
            .collect()
    }

    /// Human-readable rendering: service header plus per-worker blocks.
    pub async fn stats_report(&self) -> String {
        let stats = self.worker_stats().await;
        let mut report = format!(
            "Service status: {} (started {} times)",
            self.core.status.get(),
            self.core.times_started.load(Ordering::Relaxed),
        );

        if stats.is_empty() {
            report.push_str("\nno workers materialized");
            return report;
        }

        for block in &stats {
            report.push_str("\n\n");
            report.push_str(&block.to_string());
        }
        report
    }
}

impl ServiceCore {
    fn crash_handler(core: &Arc<ServiceCore>) -> CrashHandler {
        let weak = Arc::downgrade(core);
        Arc::new(move |worker, error| {
            let weak = Weak::clone(&weak);
            Box::pin(async move {
                if let Some(core) = weak.upgrade() {
                    core.worker_crashed(worker, error).await;
                }
            })
        })
    }

    /// Swaps a fresh worker into the crashed worker's slot and retires the
    /// old one out-of-band. Runs on the crashed worker's own task, so the
    /// retirement must not join that task inline.
    async fn worker_crashed(&self, crashed: Arc<Worker>, error: eyre::Report) {
        let queue = crashed.queue().to_owned();
        let error = error.wrap_err(format!("worker for queue {queue} crashed"));
        error!(queue = %queue, error = %format!("{error:#}"), "replacing crashed worker");

        if let Some(callback) = &self.error_callback {
            callback(&error);
        }

        if !matches!(self.status.get(), Status::Starting | Status::Started) {
            // Mid-shutdown; the lifecycle calls own the teardown. A crash
            // in the startup window still gets its slot replaced.
            return;
        }

        let mut workers = self.workers.lock().await;
        let Some(slot) = workers.iter_mut().find(|w| Arc::ptr_eq(w, &crashed)) else {
            return;
        };

        let replacement = crashed.clone_slot();
        *slot = Arc::clone(&replacement);
        drop(workers);

        if let Err(refused) = replacement.clone().start().await {
            warn!(queue = %queue, error = %refused, "replacement worker failed to start");
        }

        tokio::spawn(async move { crashed.dispose().await });
    }
}

fn wrap_process<T, F, Fut>(process: F) -> ProcessFn<T>
where
    T: QueueMessage,
    F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(move |envelope| Box::pin(process(envelope)))
}

/// Aggregated service counters.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub status: Status,
    pub times_started: u64,
    pub workers: usize,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}
