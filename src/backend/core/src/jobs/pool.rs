//! Worker pool: a fixed number of worker slots plus the redelivery reaper.
//!
//! Each slot runs one [`Worker`] at a time. A worker that reaches its job
//! budget returns [`WorkerExit::Recycled`] and the slot starts a fresh one.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Broker, UnitRegistry, Worker, WorkerExit, WorkerSettings, WorkerStats};
use crate::observability::metrics::{record_redelivered, record_worker_recycled, set_queue_depth};
use crate::store::JobStore;

/// Builder for a running pool.
pub struct WorkerPool {
    settings: WorkerSettings,
    concurrency: usize,
    reap_interval: Duration,
    broker: Arc<dyn Broker>,
    store: JobStore,
    registry: Arc<UnitRegistry>,
}

impl WorkerPool {
    pub fn new(
        settings: WorkerSettings,
        concurrency: usize,
        broker: Arc<dyn Broker>,
        store: JobStore,
        registry: Arc<UnitRegistry>,
    ) -> Self {
        Self {
            settings,
            concurrency: concurrency.max(1),
            reap_interval: Duration::from_secs(5),
            broker,
            store,
            registry,
        }
    }

    /// How often lapsed deliveries are returned to the queue.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Spawn the worker slots and the reaper.
    pub fn start(self) -> PoolHandle {
        let shutdown = CancellationToken::new();
        let stats = WorkerStats::new();
        let mut tasks = Vec::with_capacity(self.concurrency + 1);

        for slot in 0..self.concurrency {
            tasks.push(self.spawn_slot(slot, stats.clone(), shutdown.clone()));
        }
        tasks.push(spawn_reaper(
            self.broker.clone(),
            self.reap_interval,
            shutdown.clone(),
        ));

        tracing::info!(
            concurrency = self.concurrency,
            max_jobs_per_worker = self.settings.max_jobs,
            soft_limit_secs = self.settings.limits.soft.as_secs(),
            hard_limit_secs = self.settings.limits.hard.as_secs(),
            "Worker pool started"
        );

        PoolHandle {
            shutdown,
            tasks,
            stats,
        }
    }

    fn spawn_slot(
        &self,
        slot: usize,
        stats: WorkerStats,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let settings = self
            .settings
            .clone()
            .with_name(format!("{}-{}", self.settings.name, slot));
        let broker = self.broker.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let mut generation: u64 = 0;
            loop {
                let worker = Worker::new(
                    settings.clone(),
                    broker.clone(),
                    store.clone(),
                    registry.clone(),
                )
                .with_stats(stats.clone());

                match worker.run(shutdown.clone()).await {
                    WorkerExit::Shutdown => break,
                    WorkerExit::Recycled => {
                        generation += 1;
                        record_worker_recycled();
                        tracing::debug!(worker = %settings.name, generation, "Worker recycled");
                    }
                }
            }
        })
    }
}

fn spawn_reaper(
    broker: Arc<dyn Broker>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match broker.requeue_expired().await {
                        Ok(0) => {}
                        Ok(count) => {
                            record_redelivered(count as u64);
                            tracing::warn!(count, "Requeued deliveries whose visibility timeout lapsed");
                        }
                        Err(e) => e.log(),
                    }
                    if let Ok(stats) = broker.stats().await {
                        set_queue_depth(stats.queued as u64);
                    }
                }
            }
        }
    })
}

/// Handle for controlling a running pool.
pub struct PoolHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: WorkerStats,
}

impl PoolHandle {
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Token that stops the pool when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming, let in-progress jobs finish, and abort whatever is still
    /// running after `timeout`. Aborted jobs stay unacked and are redelivered.
    pub async fn shutdown(self, timeout: Duration) {
        self.shutdown.cancel();
        let aborts: Vec<_> = self.tasks.iter().map(|t| t.abort_handle()).collect();

        if tokio::time::timeout(timeout, futures::future::join_all(self.tasks))
            .await
            .is_err()
        {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Worker pool shutdown timed out, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!(
            processed = self.stats.processed(),
            succeeded = self.stats.succeeded(),
            failed = self.stats.failed(),
            "Worker pool stopped"
        );
    }
}
