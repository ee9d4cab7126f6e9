//! Broker with visibility-timeout delivery and late acknowledgement.
//!
//! A claimed message stays owned by the broker, invisible to other workers,
//! until the worker acks it after committing the terminal state. Deliveries
//! that are never acked return to the queue once their visibility timeout
//! lapses, which makes delivery at-least-once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{JobId, TaskPayload};
use crate::error::{ErrorCode, Result, TransmuteError};

/// A unit of work waiting in, or owned by, the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub payload: TaskPayload,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(id: JobId, payload: TaskPayload) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// A claimed message. Must be acked once its terminal state is stored.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueuedJob,
    /// 1 on first delivery
    pub delivery_count: u32,
}

impl Delivery {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// What the broker knows about a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Waiting to be claimed
    Queued,
    /// Claimed and not yet acked
    InFlight,
    /// Acked, or never enqueued
    Unknown,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
}

/// Message broker used by job submission and the worker pool.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Accept one message. Re-enqueueing a known id is a no-op.
    async fn enqueue(&self, job: QueuedJob) -> Result<()>;

    /// Accept all messages or none of them.
    async fn enqueue_many(&self, jobs: Vec<QueuedJob>) -> Result<()>;

    /// Claim the next message, hiding it from other consumers.
    async fn claim(&self) -> Result<Option<Delivery>>;

    /// Forget a claimed message for good.
    async fn ack(&self, id: JobId) -> Result<()>;

    async fn visibility(&self, id: JobId) -> Result<Visibility>;

    /// Return deliveries whose visibility timeout lapsed to the queue.
    async fn requeue_expired(&self) -> Result<usize>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Wait up to `timeout` for new work to arrive.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Broker
// ═══════════════════════════════════════════════════════════════════════════════

struct StoredMessage {
    job: QueuedJob,
    deliveries: u32,
}

#[derive(Default)]
struct BrokerState {
    messages: HashMap<JobId, StoredMessage>,
    ready: VecDeque<JobId>,
    in_flight: HashMap<JobId, Instant>,
}

impl BrokerState {
    fn push(&mut self, job: QueuedJob) -> bool {
        if self.messages.contains_key(&job.id) {
            return false;
        }
        self.ready.push_back(job.id);
        self.messages.insert(job.id, StoredMessage { job, deliveries: 0 });
        true
    }
}

/// Single-process broker.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    visibility_timeout: Duration,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            visibility_timeout,
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let id = job.id;
        if self.state.lock().push(job) {
            tracing::debug!(job_id = %id, "Job enqueued");
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn enqueue_many(&self, jobs: Vec<QueuedJob>) -> Result<()> {
        let added = {
            let mut state = self.state.lock();
            jobs.into_iter().filter(|job| state.push(job.clone())).count()
        };
        for _ in 0..added {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Delivery>> {
        let mut state = self.state.lock();
        while let Some(id) = state.ready.pop_front() {
            let deadline = Instant::now() + self.visibility_timeout;
            let Some(message) = state.messages.get_mut(&id) else {
                continue;
            };
            message.deliveries += 1;
            let delivery = Delivery {
                job: message.job.clone(),
                delivery_count: message.deliveries,
            };
            state.in_flight.insert(id, deadline);
            return Ok(Some(delivery));
        }
        Ok(None)
    }

    async fn ack(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(&id);
        state.messages.remove(&id);
        Ok(())
    }

    async fn visibility(&self, id: JobId) -> Result<Visibility> {
        let state = self.state.lock();
        Ok(if state.in_flight.contains_key(&id) {
            Visibility::InFlight
        } else if state.messages.contains_key(&id) {
            Visibility::Queued
        } else {
            Visibility::Unknown
        })
    }

    async fn requeue_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<JobId> = state
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            state.in_flight.remove(id);
            state.ready.push_front(*id);
        }
        drop(state);

        for _ in 0..expired.len() {
            self.notify.notify_one();
        }
        Ok(expired.len())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock();
        Ok(QueueStats {
            queued: state.ready.len(),
            in_flight: state.in_flight.len(),
        })
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Broker
// ═══════════════════════════════════════════════════════════════════════════════

const ENQUEUE_SCRIPT: &str = r#"
local added = 0
for i = 1, #ARGV, 2 do
  if redis.call('HSETNX', KEYS[2], ARGV[i], ARGV[i + 1]) == 1 then
    redis.call('RPUSH', KEYS[1], ARGV[i])
    added = added + 1
  end
end
return added
"#;

const CLAIM_SCRIPT: &str = r#"
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local body = redis.call('HGET', KEYS[2], id)
  if body then
    redis.call('ZADD', KEYS[3], ARGV[1], id)
    local count = redis.call('HINCRBY', KEYS[4], id, 1)
    return {body, count}
  end
end
"#;

const REQUEUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #ids
"#;

/// Broker shared by every process through Redis.
///
/// Layout under the key prefix: a list of ready ids, a hash of message
/// bodies, a sorted set of in-flight ids scored by visibility deadline, and
/// a hash of delivery counts.
pub struct RedisBroker {
    conn: ConnectionManager,
    queue_key: String,
    messages_key: String,
    in_flight_key: String,
    deliveries_key: String,
    visibility_timeout: Duration,
    enqueue_script: redis::Script,
    claim_script: redis::Script,
    requeue_script: redis::Script,
}

fn queue_error(error: redis::RedisError) -> TransmuteError {
    let code = if error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
        || error.is_io_error()
    {
        ErrorCode::QueueUnavailable
    } else {
        ErrorCode::QueueError
    };
    TransmuteError::with_internal(code, "Broker operation failed", error.to_string())
        .with_source(error)
}

impl RedisBroker {
    pub fn new(
        conn: ConnectionManager,
        key_prefix: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Self {
        let base = format!("{}queue:{}", key_prefix, queue_name);
        Self {
            conn,
            queue_key: base.clone(),
            messages_key: format!("{}:messages", base),
            in_flight_key: format!("{}:in_flight", base),
            deliveries_key: format!("{}:deliveries", base),
            visibility_timeout,
            enqueue_script: redis::Script::new(ENQUEUE_SCRIPT),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            requeue_script: redis::Script::new(REQUEUE_SCRIPT),
        }
    }

    async fn push(&self, jobs: &[QueuedJob]) -> Result<usize> {
        let mut invocation = self.enqueue_script.prepare_invoke();
        invocation.key(&self.queue_key).key(&self.messages_key);
        for job in jobs {
            invocation.arg(job.id.to_string()).arg(serde_json::to_string(job)?);
        }
        let mut conn = self.conn.clone();
        let added: usize = invocation.invoke_async(&mut conn).await.map_err(queue_error)?;
        Ok(added)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let added = self.push(std::slice::from_ref(&job)).await?;
        tracing::debug!(queue = %self.queue_key, job_id = %job.id, added, "Job enqueued");
        Ok(())
    }

    async fn enqueue_many(&self, jobs: Vec<QueuedJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let added = self.push(&jobs).await?;
        tracing::debug!(queue = %self.queue_key, count = jobs.len(), added, "Jobs enqueued");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Delivery>> {
        let deadline = Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
        let mut conn = self.conn.clone();
        let claimed: Option<(String, u32)> = self
            .claim_script
            .key(&self.queue_key)
            .key(&self.messages_key)
            .key(&self.in_flight_key)
            .key(&self.deliveries_key)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;

        match claimed {
            Some((body, delivery_count)) => {
                let job: QueuedJob = serde_json::from_str(&body)?;
                Ok(Some(Delivery {
                    job,
                    delivery_count,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, id: JobId) -> Result<()> {
        let id = id.to_string();
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zrem(&self.in_flight_key, &id)
            .ignore()
            .hdel(&self.messages_key, &id)
            .ignore()
            .hdel(&self.deliveries_key, &id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(queue_error)
    }

    async fn visibility(&self, id: JobId) -> Result<Visibility> {
        let id = id.to_string();
        let mut conn = self.conn.clone();
        let (score, exists): (Option<f64>, bool) = redis::pipe()
            .atomic()
            .zscore(&self.in_flight_key, &id)
            .hexists(&self.messages_key, &id)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;

        Ok(match (score, exists) {
            (Some(_), _) => Visibility::InFlight,
            (None, true) => Visibility::Queued,
            (None, false) => Visibility::Unknown,
        })
    }

    async fn requeue_expired(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = self
            .requeue_script
            .key(&self.in_flight_key)
            .key(&self.queue_key)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(count)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let (queued, in_flight): (usize, usize) = redis::pipe()
            .llen(&self.queue_key)
            .zcard(&self.in_flight_key)
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(QueueStats { queued, in_flight })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::{ConversionOptions, ConvertRequest};

    fn job() -> QueuedJob {
        QueuedJob::new(
            JobId::new(),
            TaskPayload::Convert(ConvertRequest {
                data: vec![1, 2, 3],
                filename: "a.heic".into(),
                options: ConversionOptions::default(),
            }),
        )
    }

    #[tokio::test]
    async fn test_claim_and_ack() {
        let broker = InMemoryBroker::default();
        let queued = job();
        let id = queued.id;

        broker.enqueue(queued).await.unwrap();
        assert_eq!(broker.visibility(id).await.unwrap(), Visibility::Queued);

        let delivery = broker.claim().await.unwrap().unwrap();
        assert_eq!(delivery.id(), id);
        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(broker.visibility(id).await.unwrap(), Visibility::InFlight);
        assert!(broker.claim().await.unwrap().is_none());

        broker.ack(id).await.unwrap();
        assert_eq!(broker.visibility(id).await.unwrap(), Visibility::Unknown);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = InMemoryBroker::default();
        let jobs: Vec<_> = (0..3).map(|_| job()).collect();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        broker.enqueue_many(jobs).await.unwrap();

        for id in ids {
            assert_eq!(broker.claim().await.unwrap().unwrap().id(), id);
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let broker = InMemoryBroker::default();
        let queued = job();
        broker.enqueue(queued.clone()).await.unwrap();
        broker.enqueue(queued).await.unwrap();

        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_is_redelivered() {
        let broker = InMemoryBroker::new(Duration::from_secs(30));
        let queued = job();
        let id = queued.id;
        broker.enqueue(queued).await.unwrap();

        let first = broker.claim().await.unwrap().unwrap();
        assert!(!first.is_redelivery());
        assert_eq!(broker.requeue_expired().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(broker.requeue_expired().await.unwrap(), 1);
        assert_eq!(broker.visibility(id).await.unwrap(), Visibility::Queued);

        let second = broker.claim().await.unwrap().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.delivery_count, 2);
        assert!(second.is_redelivery());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_work_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(InMemoryBroker::default());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                broker.wait_for_work(Duration::from_secs(60)).await;
                started.elapsed()
            })
        };
        tokio::task::yield_now().await;
        broker.enqueue(job()).await.unwrap();
        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(60));
    }
}
