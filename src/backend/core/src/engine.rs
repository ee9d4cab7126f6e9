//! Wires the store, broker, units of work and query services together.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchAggregator, BatchDispatchUnit, BatchOrchestrator};
use crate::config::Config;
use crate::convert::{CommandConverter, ConvertUnit, Converter};
use crate::error::{ErrorCode, Result, TransmuteError};
use crate::jobs::{
    Broker, ConversionOptions, InMemoryBroker, JobSubmitter, OutputFormat, PoolHandle,
    RedisBroker, StatusQuery, UnitRegistry, WorkerPool, WorkerSettings,
};
use crate::store::{connect_manager, InMemoryStore, JobStore, RedisStore};

/// Everything a server or worker process needs, built once at startup.
#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    store: JobStore,
    broker: Arc<dyn Broker>,
    converter: Arc<dyn Converter>,
    registry: Arc<UnitRegistry>,
    submitter: JobSubmitter,
    status: StatusQuery,
    batches: BatchOrchestrator,
    /// Present in single-process mode, where expiry needs a sweep
    memory_store: Option<Arc<InMemoryStore>>,
}

impl Engine {
    /// Connect to Redis when a URL is configured, otherwise run in memory.
    pub async fn connect(config: Config) -> Result<Self> {
        let converter = Arc::new(CommandConverter::from_config(&config.converter));
        Self::connect_with(config, converter).await
    }

    pub async fn connect_with(config: Config, converter: Arc<dyn Converter>) -> Result<Self> {
        let Some(url) = config.redis.url.clone() else {
            tracing::warn!("No Redis URL configured; using in-process store and broker");
            return Ok(Self::in_memory(config, converter));
        };

        let conn = connect_manager(&config.redis, &url).await?;
        let store = Arc::new(
            RedisStore::from_connection(conn.clone(), config.redis.key_prefix.clone()).await?,
        );
        let broker = Arc::new(RedisBroker::new(
            conn,
            &config.redis.key_prefix,
            &config.queue.name,
            config.queue.visibility_timeout,
        ));
        tracing::info!(queue = %config.queue.name, "Using Redis store and broker");

        let job_store = JobStore::new(store, config.store.result_ttl);
        Ok(Self::assemble(config, job_store, broker, converter, None))
    }

    /// Single-process engine with in-memory store and broker.
    pub fn in_memory(config: Config, converter: Arc<dyn Converter>) -> Self {
        let memory = Arc::new(InMemoryStore::new());
        let store = JobStore::new(memory.clone(), config.store.result_ttl);
        let broker = Arc::new(InMemoryBroker::new(config.queue.visibility_timeout));
        Self::assemble(config, store, broker, converter, Some(memory))
    }

    fn assemble(
        config: Config,
        store: JobStore,
        broker: Arc<dyn Broker>,
        converter: Arc<dyn Converter>,
        memory_store: Option<Arc<InMemoryStore>>,
    ) -> Self {
        let registry = UnitRegistry::new()
            .with(Arc::new(ConvertUnit::new(converter.clone())))
            .with(Arc::new(BatchDispatchUnit::new(
                broker.clone(),
                config.batch.max_items,
            )));

        let submitter = JobSubmitter::new(broker.clone());
        let status = StatusQuery::new(store.clone(), broker.clone());
        let batches = BatchOrchestrator::new(
            submitter.clone(),
            BatchAggregator::new(status.clone()),
            config.batch.max_items,
        );

        Self {
            config: Arc::new(config),
            store,
            broker,
            converter,
            registry: Arc::new(registry),
            submitter,
            status,
            batches,
            memory_store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn converter(&self) -> &Arc<dyn Converter> {
        &self.converter
    }

    pub fn submitter(&self) -> &JobSubmitter {
        &self.submitter
    }

    pub fn status(&self) -> &StatusQuery {
        &self.status
    }

    pub fn batches(&self) -> &BatchOrchestrator {
        &self.batches
    }

    pub fn is_distributed(&self) -> bool {
        self.memory_store.is_none()
    }

    /// Options applied when a request leaves them out.
    pub fn default_options(&self, output_format: OutputFormat) -> ConversionOptions {
        ConversionOptions {
            output_format,
            quality: self.config.converter.default_quality,
            lossless: false,
        }
    }

    pub fn worker_pool(&self) -> WorkerPool {
        let settings = WorkerSettings::from_config(&self.config.worker, &self.config.queue);
        WorkerPool::new(
            settings,
            self.config.worker.concurrency,
            self.broker.clone(),
            self.store.clone(),
            self.registry.clone(),
        )
    }

    pub fn start_workers(&self) -> PoolHandle {
        self.worker_pool().start()
    }

    /// Periodic expiry sweep for the in-memory store. Redis expires keys itself.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.memory_store.as_ref().map(|store| {
            store
                .clone()
                .spawn_cleanup(self.config.store.cleanup_interval, shutdown)
        })
    }

    /// Fail fast when a standalone worker would have nobody to share a queue with.
    pub fn require_distributed(&self) -> Result<()> {
        if self.is_distributed() {
            Ok(())
        } else {
            Err(TransmuteError::new(
                ErrorCode::ConfigurationError,
                "A standalone worker needs TRANSMUTE__REDIS__URL to reach the shared queue",
            ))
        }
    }
}
