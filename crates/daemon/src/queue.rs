//! Serialized execution of filtering requests.
//!
//! Every hide, restore and switch goes through one unbounded channel with a
//! single consumer, so operations never interleave and run in the order they
//! were enqueued. Bursts are not coalesced.

use crate::filter::{FilterEngine, FilterError};
use i3pm_core::{Clock, EnvironmentSource, FilterMode, FilterResult, SwitchRequest, WindowManager};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the completed-operation broadcast.
pub const RESULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Something that can run a request. Implemented by the filtering engine.
pub trait SwitchExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: SwitchRequest,
    ) -> impl Future<Output = Result<FilterResult, FilterError>> + Send;
}

impl<M: WindowManager, E: EnvironmentSource> SwitchExecutor for FilterEngine<M, E> {
    async fn execute(&self, request: SwitchRequest) -> Result<FilterResult, FilterError> {
        self.run(&request).await
    }
}

type Responder = oneshot::Sender<Result<FilterResult, QueueError>>;

struct Job {
    request: SwitchRequest,
    responder: Option<Responder>,
}

/// Handle for submitting requests. Cheap to clone.
#[derive(Clone)]
pub struct SwitchQueue {
    tx: mpsc::UnboundedSender<Job>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SwitchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchQueue").finish_non_exhaustive()
    }
}

/// The running consumer.
pub struct QueueWorker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl SwitchQueue {
    /// Start the worker. Completed operations are published on `results`.
    pub fn spawn<X: SwitchExecutor>(
        executor: Arc<X>,
        results: broadcast::Sender<FilterResult>,
        clock: Arc<dyn Clock>,
    ) -> (Self, QueueWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(executor, rx, shutdown_rx, results, Arc::clone(&clock)));
        (
            Self { tx, clock },
            QueueWorker {
                handle,
                shutdown: shutdown_tx,
            },
        )
    }

    /// Build a request stamped with the current time.
    pub fn request(&self, mode: FilterMode, target: impl Into<String>) -> SwitchRequest {
        SwitchRequest {
            target_project: target.into(),
            mode,
            enqueue_time: self.clock.now(),
        }
    }

    /// Queue a project switch and return immediately.
    pub fn enqueue(&self, target: impl Into<String>) -> Result<(), QueueError> {
        let request = self.request(FilterMode::Switch, target);
        self.enqueue_request(request)
    }

    /// Queue any request and return immediately.
    pub fn enqueue_request(&self, request: SwitchRequest) -> Result<(), QueueError> {
        debug!(
            "Queued {:?} for '{}'",
            request.mode, request.target_project
        );
        self.tx
            .send(Job {
                request,
                responder: None,
            })
            .map_err(|_| QueueError::ShuttingDown)
    }

    /// Queue a request and wait for its result.
    pub async fn submit(&self, mode: FilterMode, target: impl Into<String>) -> Result<FilterResult, QueueError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let request = self.request(mode, target);
        self.tx
            .send(Job {
                request,
                responder: Some(resp_tx),
            })
            .map_err(|_| QueueError::ShuttingDown)?;
        resp_rx.await.unwrap_or(Err(QueueError::ShuttingDown))
    }
}

impl QueueWorker {
    /// Let the in-flight request finish, reject the rest, and stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Switch queue worker ended abnormally: {}", e);
        }
    }
}

async fn run_worker<X: SwitchExecutor>(
    executor: Arc<X>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    mut shutdown: watch::Receiver<bool>,
    results: broadcast::Sender<FilterResult>,
    clock: Arc<dyn Clock>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Job { request, responder } = job;
        let waited = clock.now().saturating_sub(request.enqueue_time);
        debug!(
            "Running {:?} for '{}' (queued {}s)",
            request.mode, request.target_project, waited
        );

        let outcome = executor.execute(request.clone()).await;
        match &outcome {
            Ok(result) => {
                // No subscribers is fine.
                let _ = results.send(result.clone());
            }
            Err(e) => warn!(
                "{:?} for '{}' failed: {}",
                request.mode, request.target_project, e
            ),
        }
        if let Some(responder) = responder {
            let _ = responder.send(outcome.map_err(QueueError::from));
        }
    }

    rx.close();
    let mut rejected = 0;
    while let Ok(job) = rx.try_recv() {
        rejected += 1;
        if let Some(responder) = job.responder {
            let _ = responder.send(Err(QueueError::ShuttingDown));
        }
    }
    info!("Switch queue stopped ({} pending requests rejected)", rejected);
}
