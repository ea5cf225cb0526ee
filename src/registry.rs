//! Worker registry: routes fragments to per-flow workers.
//!
//! The registry owns the flow map and the collaborators every worker shares
//! (configuration, output sink, parser factory). A worker is created on the
//! first fragment of an unknown flow and removes itself when it terminates;
//! its removal callback holds only a weak reference back to the registry.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowstitch::{Fragment, TracingSink, WorkerConfig, WorkerRegistry};
//!
//! # #[tokio::main]
//! # async fn main() -> flowstitch::Result<()> {
//! let registry = WorkerRegistry::new(WorkerConfig::default(), Arc::new(TracingSink))?;
//! registry.dispatch(Fragment::new("flow-1", b"GET / HTTP/1.1\r\n\r\n".to_vec())).await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::parser::{BuiltinParsers, ParserFactory};
use crate::sink::OutputSink;
use crate::types::{FlowId, Fragment};
use crate::worker::{Deregister, EventWorker, WorkerContext, WorkerExit};
use crate::{ReassemblyError, Result};

/// Lifecycle notifications published by a registry.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Spawned { flow_id: FlowId, serial: u64 },
    Exited(WorkerExit),
}

/// Concurrent map of live flow workers.
///
/// Cloning is cheap; all clones share the same workers. Dropping the last
/// clone cancels every worker, which then flushes and exits.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    workers: DashMap<FlowId, EventWorker>,
    config: Arc<WorkerConfig>,
    sink: Arc<dyn OutputSink>,
    parsers: Arc<dyn ParserFactory>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    events: broadcast::Sender<WorkerEvent>,
    next_serial: AtomicU64,
}

impl WorkerRegistry {
    /// Create a registry using the built-in parsers
    pub fn new(config: WorkerConfig, sink: Arc<dyn OutputSink>) -> Result<Self> {
        Self::with_parsers(config, sink, Arc::new(BuiltinParsers))
    }

    /// Create a registry with a custom parser factory
    pub fn with_parsers(
        config: WorkerConfig,
        sink: Arc<dyn OutputSink>,
        parsers: Arc<dyn ParserFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        info!(
            queue_capacity = config.queue_capacity,
            idle_timeout_ms = u64::try_from(config.idle_timeout().as_millis()).unwrap_or(u64::MAX),
            hex_dump = config.hex_dump,
            "Flow registry created"
        );

        Ok(Self {
            inner: Arc::new(RegistryInner {
                workers: DashMap::new(),
                config: Arc::new(config),
                sink,
                parsers,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                events,
                next_serial: AtomicU64::new(0),
            }),
        })
    }

    /// Route a fragment to its flow's worker, creating the worker if needed.
    ///
    /// Waits while that worker's queue is full. A worker that closed between
    /// lookup and submission is replaced by a fresh one. Fails with
    /// `Cancelled` once the registry is shutting down.
    pub async fn dispatch(&self, fragment: Fragment) -> Result<()> {
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(ReassemblyError::cancelled("registry is shutting down"));
            }

            let worker = self.worker_for(fragment.flow_id());
            match worker.submit(fragment.clone()).await {
                Ok(()) => return Ok(()),
                Err(ReassemblyError::WorkerClosed { .. } | ReassemblyError::Cancelled { .. })
                    if !self.inner.cancel.is_cancelled() =>
                {
                    debug!(
                        flow_id = %worker.id(),
                        serial = worker.serial(),
                        "Worker closed before accepting fragment, replacing it"
                    );
                    self.inner.workers.remove_if(worker.id(), |_, current| current.serial() == worker.serial());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle of the live worker for `flow_id`
    pub fn worker(&self, flow_id: &FlowId) -> Option<EventWorker> {
        self.inner.workers.get(flow_id).map(|w| w.value().clone())
    }

    /// Number of live workers
    pub fn len(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.workers.is_empty()
    }

    pub fn flow_ids(&self) -> Vec<FlowId> {
        self.inner.workers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Receiver of lifecycle events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Lifecycle events as a stream; lagged events are skipped
    pub fn events(&self) -> impl Stream<Item = WorkerEvent> + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| async move { event.ok() })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel every worker and wait until each has flushed and deregistered.
    pub async fn shutdown(&self) {
        info!(workers = self.len(), "Shutting down flow registry");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Flow registry shut down");
    }

    fn worker_for(&self, flow_id: &FlowId) -> EventWorker {
        if let Some(worker) = self.inner.workers.get(flow_id) {
            return worker.value().clone();
        }
        self.inner
            .workers
            .entry(flow_id.clone())
            .or_insert_with(|| self.spawn_worker(flow_id.clone()))
            .value()
            .clone()
    }

    fn spawn_worker(&self, flow_id: FlowId) -> EventWorker {
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let ctx = WorkerContext {
            config: Arc::clone(&self.inner.config),
            sink: Arc::clone(&self.inner.sink),
            parsers: Arc::clone(&self.inner.parsers),
            cancel: self.inner.cancel.child_token(),
        };

        let registry = Arc::downgrade(&self.inner);
        let deregister: Deregister = Box::new(move |exit| {
            if let Some(inner) = registry.upgrade() {
                inner.deregister(exit);
            }
        });

        let (worker, task) = EventWorker::new(flow_id.clone(), serial, ctx, deregister);
        self.inner.tracker.spawn(task.run());

        debug!(flow_id = %flow_id, serial, "Spawned flow worker");
        let _ = self.inner.events.send(WorkerEvent::Spawned { flow_id, serial });
        worker
    }
}

impl RegistryInner {
    fn deregister(&self, exit: WorkerExit) {
        let removed = self.workers.remove_if(&exit.flow_id, |_, worker| worker.serial() == exit.serial);
        if removed.is_some() {
            debug!(flow_id = %exit.flow_id, serial = exit.serial, "Removed flow worker");
        }
        let _ = self.events.send(WorkerEvent::Exited(exit));
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        debug!("Dropping flow registry");
        self.cancel.cancel();
    }
}
