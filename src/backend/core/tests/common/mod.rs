//! Shared fixtures for integration tests.
//!
//! `ScriptedConverter` decides what to do from the input filename:
//!
//! - `bad*`   rejects the input
//! - `flaky*` faults with a retryable error
//! - `slow*`  never finishes in time
//! - `panic*` panics
//! - `gate*`  waits until the test opens the gate
//! - anything else converts to `"{format}:{filename}"`

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use transmute_core::batch::BatchView;
use transmute_core::config::Config;
use transmute_core::convert::{ConvertError, Converter};
use transmute_core::engine::Engine;
use transmute_core::jobs::{ConversionOptions, ConvertRequest, JobId, JobStatus};

pub struct ScriptedConverter {
    calls: DashMap<String, usize>,
    gate: Semaphore,
}

impl ScriptedConverter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: DashMap::new(),
            gate: Semaphore::new(0),
        })
    }

    pub fn calls(&self, filename: &str) -> usize {
        self.calls.get(filename).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|c| *c.value()).sum()
    }

    /// Let `n` gated conversions through.
    pub fn open_gate(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl Converter for ScriptedConverter {
    async fn convert(
        &self,
        _data: &[u8],
        filename: &str,
        options: &ConversionOptions,
    ) -> Result<Vec<u8>, ConvertError> {
        *self.calls.entry(filename.to_string()).or_insert(0) += 1;

        if filename.starts_with("bad") {
            return Err(ConvertError::Rejected("not a valid image".into()));
        }
        if filename.starts_with("flaky") {
            return Err(ConvertError::Fault {
                message: "converter busy".into(),
                retryable: true,
            });
        }
        if filename.starts_with("slow") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if filename.starts_with("panic") {
            panic!("decoder crashed on {}", filename);
        }
        if filename.starts_with("gate") {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        Ok(format!("{}:{}", options.output_format, filename).into_bytes())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Short limits and fast polling so lifecycle tests finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.worker.concurrency = 4;
    config.worker.soft_time_limit = Duration::from_millis(150);
    config.worker.hard_time_limit = Duration::from_millis(300);
    config.worker.retry_backoff_base = Duration::from_millis(5);
    config.worker.retry_backoff_max = Duration::from_millis(20);
    config.worker.shutdown_timeout = Duration::from_secs(2);
    config.queue.poll_interval = Duration::from_millis(10);
    config
}

/// Limits long enough that gated conversions can be held open.
pub fn patient_config() -> Config {
    let mut config = test_config();
    config.worker.soft_time_limit = Duration::from_secs(20);
    config.worker.hard_time_limit = Duration::from_secs(30);
    config
}

pub fn engine(config: Config, converter: Arc<ScriptedConverter>) -> Engine {
    Engine::in_memory(config, converter)
}

pub fn request(filename: &str) -> ConvertRequest {
    ConvertRequest {
        data: b"raw image bytes".to_vec(),
        filename: filename.to_string(),
        options: ConversionOptions::default(),
    }
}

const WAIT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(10);

/// Poll until the job reaches a terminal state.
pub async fn wait_for_job(engine: &Engine, id: JobId) -> JobStatus {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = engine.status().status(id).await.unwrap();
        if status.is_terminal() {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} still {} after {:?}",
            id,
            status.name(),
            WAIT
        );
        tokio::time::sleep(TICK).await;
    }
}

/// Poll until `done` accepts the batch view.
pub async fn wait_for_batch(
    engine: &Engine,
    id: JobId,
    done: impl Fn(&BatchView) -> bool,
) -> BatchView {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let view = engine.batches().view(id).await.unwrap();
        if done(&view) {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch {} never reached the expected state: {:?}",
            id,
            view
        );
        tokio::time::sleep(TICK).await;
    }
}

/// Poll until the broker holds nothing, queued or in flight.
pub async fn wait_for_drained_queue(engine: &Engine) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stats = engine.broker().stats().await.unwrap();
        if stats.queued == 0 && stats.in_flight == 0 {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue never drained: {:?}", stats);
        tokio::time::sleep(TICK).await;
    }
}
