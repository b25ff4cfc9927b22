use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{
    MAX_BATCH_SIZE, MAX_VISIBILITY_TIMEOUT_SECS, MAX_WAIT_TIME_SECS, WorkerConfig,
};
use crate::error::QueueError;
use crate::models::{LeaseHandle, QueueMessage};

/// Parameters of a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    max_messages: u32,
    lease: Duration,
    long_poll: Duration,
}

impl ReceiveOptions {
    /// Values outside what the queue accepts are clamped: 1..=10 messages, a
    /// lease of at most 12 hours and a long poll of at most 20 seconds.
    pub fn new(max_messages: u32, lease: Duration, long_poll: Duration) -> Self {
        Self {
            max_messages: max_messages.clamp(1, MAX_BATCH_SIZE),
            lease: lease.min(Duration::from_secs(MAX_VISIBILITY_TIMEOUT_SECS)),
            long_poll: long_poll.min(Duration::from_secs(MAX_WAIT_TIME_SECS)),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.batch_size, config.visibility_timeout, config.wait_time)
    }

    pub fn max_messages(&self) -> u32 {
        self.max_messages
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn long_poll(&self) -> Duration {
        self.long_poll
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::new(
            MAX_BATCH_SIZE,
            Duration::from_secs(120),
            Duration::from_secs(MAX_WAIT_TIME_SECS),
        )
    }
}

/// A work queue with at-least-once delivery and visibility timeouts.
///
/// Every received message must be resolved exactly once with either
/// [`WorkQueue::acknowledge`] or [`WorkQueue::release`]. Dead-lettering after
/// repeated releases is the queue's business.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Waits up to the long-poll duration for at least one message and returns
    /// at most `max_messages` of them, each hidden for the lease duration.
    async fn receive_batch(&self, options: &ReceiveOptions)
    -> Result<Vec<QueueMessage>, QueueError>;

    /// Permanently removes the message.
    async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), QueueError>;

    /// Makes the message visible again right away.
    async fn release(&self, lease: &LeaseHandle) -> Result<(), QueueError>;
}

pub struct SqsWorkQueue {
    client: Client,
    queue_url: String,
}

impl SqsWorkQueue {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }

    /// Looks up the queue URL for `queue_name`.
    pub async fn connect(client: Client, queue_name: &str) -> Result<Self, QueueError> {
        let output = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| QueueError::Resolve {
                name: queue_name.to_string(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        let queue_url = output
            .queue_url()
            .ok_or_else(|| QueueError::Resolve {
                name: queue_name.to_string(),
                reason: "response carried no queue URL".to_string(),
            })?
            .to_string();

        Ok(Self::new(client, queue_url))
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl WorkQueue for SqsWorkQueue {
    async fn receive_batch(
        &self,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(options.max_messages() as i32)
            .visibility_timeout(options.lease().as_secs() as i32)
            .wait_time_seconds(options.long_poll().as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        let mut messages = Vec::new();
        for message in output.messages.unwrap_or_default() {
            let Some(receipt) = message.receipt_handle() else {
                tracing::error!("Message missing receipt handle, skipping");
                continue;
            };
            messages.push(QueueMessage {
                message_id: message.message_id().map(str::to_string),
                lease: LeaseHandle::new(receipt),
                // An empty body still has to be released through its lease.
                body: message.body().unwrap_or_default().to_string(),
            });
        }
        Ok(messages)
    }

    async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(lease.as_str())
            .send()
            .await
            .map_err(|e| QueueError::Delete(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }

    async fn release(&self, lease: &LeaseHandle) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(lease.as_str())
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Release(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}

#[derive(Debug)]
struct StoredMessage {
    body: String,
    receive_count: u32,
    receipt: Option<String>,
    invisible_until: Option<Instant>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: BTreeMap<u64, StoredMessage>,
    dead_letters: Vec<String>,
}

/// Work queue kept in process memory, mirroring the redelivery and
/// dead-letter behaviour of a hosted queue.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    arrivals: Notify,
    max_receive_count: Option<u32>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received more than `max_receive_count` times are moved to the
    /// dead-letter list instead of being delivered again.
    pub fn with_dead_letter(max_receive_count: u32) -> Self {
        Self {
            max_receive_count: Some(max_receive_count),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn send(&self, body: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state().messages.insert(
            id,
            StoredMessage {
                body: body.into(),
                receive_count: 0,
                receipt: None,
                invisible_until: None,
            },
        );
        self.arrivals.notify_one();
        id
    }

    /// Messages still owned by the queue, visible or leased.
    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn visible_count(&self) -> usize {
        let now = Instant::now();
        self.state()
            .messages
            .values()
            .filter(|m| m.is_visible(now))
            .count()
    }

    pub fn receive_count(&self, id: u64) -> Option<u32> {
        self.state().messages.get(&id).map(|m| m.receive_count)
    }

    pub fn dead_letters(&self) -> Vec<String> {
        self.state().dead_letters.clone()
    }

    fn take_visible(&self, options: &ReceiveOptions) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut state = self.state();
        let QueueState {
            messages,
            dead_letters,
        } = &mut *state;

        if let Some(max) = self.max_receive_count {
            let exhausted: Vec<u64> = messages
                .iter()
                .filter(|(_, m)| m.is_visible(now) && m.receive_count >= max)
                .map(|(id, _)| *id)
                .collect();
            for id in exhausted {
                if let Some(message) = messages.remove(&id) {
                    dead_letters.push(message.body);
                }
            }
        }

        messages
            .iter_mut()
            .filter(|(_, m)| m.is_visible(now))
            .take(options.max_messages() as usize)
            .map(|(id, m)| {
                m.receive_count += 1;
                m.invisible_until = Some(now + options.lease());
                let receipt = format!("{}:{}", id, m.receive_count);
                m.receipt = Some(receipt.clone());
                QueueMessage {
                    message_id: Some(id.to_string()),
                    lease: LeaseHandle::new(receipt),
                    body: m.body.clone(),
                }
            })
            .collect()
    }

    /// Finds the message a lease belongs to, rejecting stale receipts.
    fn lease_id(state: &QueueState, lease: &LeaseHandle) -> Result<u64, QueueError> {
        lease
            .as_str()
            .split_once(':')
            .and_then(|(id, _)| id.parse::<u64>().ok())
            .filter(|id| {
                state
                    .messages
                    .get(id)
                    .is_some_and(|m| m.receipt.as_deref() == Some(lease.as_str()))
            })
            .ok_or_else(|| QueueError::UnknownLease(lease.to_string()))
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn receive_batch(
        &self,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + options.long_poll();
        loop {
            let batch = self.take_visible(options);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, self.arrivals.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), QueueError> {
        let mut state = self.state();
        let id = Self::lease_id(&state, lease)?;
        state.messages.remove(&id);
        Ok(())
    }

    async fn release(&self, lease: &LeaseHandle) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            let id = Self::lease_id(&state, lease)?;
            if let Some(message) = state.messages.get_mut(&id) {
                message.invisible_until = None;
            }
        }
        self.arrivals.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(max: u32) -> ReceiveOptions {
        ReceiveOptions::new(max, Duration::from_secs(120), Duration::from_millis(20))
    }

    #[test]
    fn test_receive_options_are_clamped() {
        let options = ReceiveOptions::new(50, Duration::from_secs(120), Duration::from_secs(60));
        assert_eq!(options.max_messages(), 10);
        assert_eq!(options.long_poll(), Duration::from_secs(20));
        assert_eq!(ReceiveOptions::new(0, Duration::ZERO, Duration::ZERO).max_messages(), 1);

        let options = ReceiveOptions::new(10, Duration::from_secs(u64::MAX), Duration::ZERO);
        assert_eq!(options.lease(), Duration::from_secs(43_200));
        assert!(i32::try_from(options.lease().as_secs()).is_ok());
    }

    #[tokio::test]
    async fn test_batch_never_exceeds_ten() {
        let queue = InMemoryWorkQueue::new();
        for i in 0..25 {
            queue.send(format!("message {}", i));
        }

        let batch = queue.receive_batch(&quick(50)).await.unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(queue.visible_count(), 15);
        assert_eq!(queue.len(), 25);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_after_long_poll() {
        let queue = InMemoryWorkQueue::new();
        let started = std::time::Instant::now();
        let batch = queue.receive_batch(&quick(10)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_arrival() {
        let queue = std::sync::Arc::new(InMemoryWorkQueue::new());
        let sender = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send("late");
        });

        let options = ReceiveOptions::new(10, Duration::from_secs(120), Duration::from_secs(5));
        let batch = queue.receive_batch(&options).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test]
    async fn test_acknowledge_removes_message() {
        let queue = InMemoryWorkQueue::new();
        queue.send("a");
        let batch = queue.receive_batch(&quick(10)).await.unwrap();
        queue.acknowledge(&batch[0].lease).await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.acknowledge(&batch[0].lease).await.is_err());
    }

    #[tokio::test]
    async fn test_release_makes_message_visible_with_new_receipt() {
        let queue = InMemoryWorkQueue::new();
        let id = queue.send("a");
        let first = queue.receive_batch(&quick(10)).await.unwrap();
        assert_eq!(queue.visible_count(), 0);

        queue.release(&first[0].lease).await.unwrap();
        assert_eq!(queue.visible_count(), 1);

        let second = queue.receive_batch(&quick(10)).await.unwrap();
        assert_eq!(queue.receive_count(id), Some(2));
        assert_ne!(first[0].lease, second[0].lease);
        assert!(matches!(
            queue.acknowledge(&first[0].lease).await,
            Err(QueueError::UnknownLease(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = InMemoryWorkQueue::new();
        queue.send("a");
        let options = ReceiveOptions::new(10, Duration::ZERO, Duration::from_millis(20));
        let first = queue.receive_batch(&options).await.unwrap();
        let second = queue.receive_batch(&options).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_receives() {
        let queue = InMemoryWorkQueue::with_dead_letter(2);
        queue.send("poison");

        for _ in 0..2 {
            let batch = queue.receive_batch(&quick(10)).await.unwrap();
            assert_eq!(batch.len(), 1);
            queue.release(&batch[0].lease).await.unwrap();
        }

        let batch = queue.receive_batch(&quick(10)).await.unwrap();
        assert!(batch.is_empty());
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters(), vec!["poison".to_string()]);
    }
}
