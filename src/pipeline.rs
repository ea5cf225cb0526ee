//! Ingestion pipeline: pulls fragments from a capture source into a registry.
//!
//! The capture mechanism itself lives outside this crate. Anything that can
//! yield [`Fragment`]s implements [`FragmentSource`]; [`Pipeline::spawn`] runs a
//! driver task that reads the source and dispatches every fragment to the
//! registry until the source ends or the pipeline is cancelled.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::registry::WorkerRegistry;
use crate::types::Fragment;
use crate::{ReassemblyError, Result};

/// Consecutive source errors tolerated before the driver gives up
const MAX_SOURCE_ERRORS: u32 = 10;

/// Producer of captured fragments.
#[async_trait::async_trait]
pub trait FragmentSource: Send + 'static {
    /// Get the next fragment
    ///
    /// Returns:
    /// - `Ok(Some(fragment))` - next captured fragment
    /// - `Ok(None)` - capture ended
    /// - `Err(e)` - transient capture failure
    async fn next_fragment(&mut self) -> Result<Option<Fragment>>;
}

/// Source fed through a bounded tokio channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<Fragment>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it
    pub fn new(capacity: usize) -> (mpsc::Sender<Fragment>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait::async_trait]
impl FragmentSource for ChannelSource {
    async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        Ok(self.rx.recv().await)
    }
}

/// Source backed by any stream of fragment results.
pub struct StreamSource<S> {
    stream: S,
}

impl<S> StreamSource<S>
where
    S: Stream<Item = Result<Fragment>> + Send + Unpin + 'static,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait::async_trait]
impl<S> FragmentSource for StreamSource<S>
where
    S: Stream<Item = Result<Fragment>> + Send + Unpin + 'static,
{
    async fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        self.stream.next().await.transpose()
    }
}

/// Spawns the ingestion driver.
pub struct Pipeline;

/// Control handle for a running pipeline.
pub struct PipelineHandle {
    registry: WorkerRegistry,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    fragments: Arc<AtomicU64>,
}

impl Pipeline {
    /// Start reading `source` into `registry`
    pub fn spawn<S>(source: S, registry: WorkerRegistry) -> PipelineHandle
    where
        S: FragmentSource,
    {
        let cancel = CancellationToken::new();
        let fragments = Arc::new(AtomicU64::new(0));

        let driver = tokio::spawn(Self::ingest_task(
            source,
            registry.clone(),
            cancel.clone(),
            Arc::clone(&fragments),
        ));

        PipelineHandle { registry, cancel, driver: Some(driver), fragments }
    }

    async fn ingest_task<S>(
        mut source: S,
        registry: WorkerRegistry,
        cancel: CancellationToken,
        fragments: Arc<AtomicU64>,
    ) where
        S: FragmentSource,
    {
        info!("Ingestion task started");
        let mut error_count = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Ingestion cancelled");
                    break;
                }
                result = source.next_fragment() => result,
            };

            match result {
                Ok(Some(fragment)) => {
                    error_count = 0;
                    trace!(flow_id = %fragment.flow_id(), length = fragment.len(), "Dispatching fragment");

                    let dispatched = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Ingestion cancelled during dispatch");
                            break;
                        }
                        dispatched = registry.dispatch(fragment) => dispatched,
                    };

                    match dispatched {
                        Ok(()) => {
                            fragments.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(ReassemblyError::Cancelled { .. }) => {
                            debug!("Registry shutting down, stopping ingestion");
                            break;
                        }
                        Err(e) => warn!("Failed to dispatch fragment: {}", e),
                    }
                }
                Ok(None) => {
                    info!("Fragment source ended");
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Source error ({}/{}): {}", error_count, MAX_SOURCE_ERRORS, e);

                    if error_count >= MAX_SOURCE_ERRORS {
                        error!("Too many source errors, stopping ingestion");
                        break;
                    }

                    // 100ms, 200ms, 400ms, ... capped at 1.6s
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!(fragments = fragments.load(Ordering::Relaxed), "Ingestion task ended");
    }
}

impl PipelineHandle {
    /// Fragments dispatched so far
    pub fn fragments(&self) -> u64 {
        self.fragments.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Stop reading from the source. Live flows keep running until idle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the source to end, then flush and close every flow.
    ///
    /// Returns the number of fragments dispatched.
    pub async fn finish(mut self) -> u64 {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!("Ingestion task failed: {}", e);
            }
        }
        self.registry.shutdown().await;
        self.fragments()
    }

    /// Cancel ingestion, then flush and close every flow.
    pub async fn stop(self) -> u64 {
        self.cancel();
        self.finish().await
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
