//! Supervised repository workers.
//!
//! Each repository with pending messages is served by one task. Tasks are
//! cheap and many may exist at once, but delivery concurrency is bounded by
//! a semaphore: a worker holds one permit per message it dispatches. The
//! pool tracks live tasks so callers can wait for quiescence and shut down
//! within a deadline.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use herald_core::RepositoryId;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, Result};

/// Pool of per-repository worker tasks sharing a bounded number of
/// delivery slots.
#[derive(Debug)]
pub struct WorkerPool {
    worker_count: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    cancellation: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool allowing `worker_count` concurrent deliveries.
    pub fn new(worker_count: usize, cancellation: CancellationToken) -> Self {
        Self {
            worker_count,
            permits: Arc::new(Semaphore::new(worker_count)),
            tasks: Mutex::new(JoinSet::new()),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            cancellation,
        }
    }

    /// Maximum concurrent deliveries.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Starts a worker task for a repository.
    ///
    /// The task counts as active from this call until the future completes
    /// or panics.
    pub fn spawn<F>(&self, repository: RepositoryId, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard { active: self.active.clone(), idle: self.idle.clone() };

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = tasks.try_join_next() {
            if let Err(join_error) = finished {
                if join_error.is_panic() {
                    error!(error = %join_error, "repository worker panicked");
                }
            }
        }

        tasks.spawn(async move {
            let _guard = guard;
            debug!(repository = %repository, "repository worker starting");
            worker.await;
            debug!(repository = %repository, "repository worker finished");
        });
    }

    /// Waits for a delivery slot.
    ///
    /// Returns `None` once shutdown has been requested.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Worker tasks currently alive.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Deliveries currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.worker_count.saturating_sub(self.permits.available_permits())
    }

    /// Resolves once no worker task is alive.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active_workers() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Registers interest in the next transition to idle.
    pub(crate) fn idle_notify(&self) -> &Notify {
        &self.idle
    }

    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Signals shutdown and waits for workers to finish their in-flight
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still running when the
    /// deadline passes. Those tasks are aborted.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> Result<()> {
        info!(
            active_workers = self.active_workers(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation.cancel();

        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));

        let drain = async {
            let mut panics = 0_usize;
            while let Some(finished) = tasks.join_next().await {
                if let Err(join_error) = finished {
                    if join_error.is_panic() {
                        error!(error = %join_error, "repository worker panicked during shutdown");
                        panics += 1;
                    }
                }
            }
            panics
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(0) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(panics) => {
                warn!(panics, "worker pool shut down with panicked workers");
                Ok(())
            },
            Err(_elapsed) => {
                let remaining = tasks.len();
                error!(
                    timeout_seconds = timeout.as_secs(),
                    remaining, "worker shutdown timed out, aborting remaining workers"
                );
                tasks.abort_all();
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs(), remaining })
            },
        }
    }
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}
