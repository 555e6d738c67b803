// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption and Acknowledgment Management
//!
//! This module wraps the broker's delivery stream and tracks per-message
//! acknowledgment state. Two modes are supported:
//!
//! - *blocking*: the ack/nack is sent inline and the caller observes the
//!   broker's answer (bounded by the ack timeout)
//! - *non-blocking*: the ack/nack is appended to a FIFO queue and flushed at
//!   the start of the next `next()` call, before a new message is requested,
//!   so a queued acknowledgment is never more than one retrieval cycle stale
//!
//! A queued acknowledgment that fails is logged instead of raised: the caller
//! has already moved on, and the broker will redeliver the message. That is
//! the at-least-once trade-off; the work being acknowledged must tolerate
//! duplicate processing.
//!
//! A `QueueConsumer` is constructed per consumer task, so a blocking ack is
//! always issued from the task that owns the channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicCancelOptions, BasicNackOptions},
    BasicProperties, Consumer,
};
use tracing::{debug, warn};

use crate::connection::ChannelLease;
use crate::errors::BrokerError;

/// Where acknowledgments are sent. The production implementation forwards to
/// the delivery's channel; tests substitute their own sink.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AckSink: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

struct LapinAckSink {
    acker: Acker,
}

#[async_trait]
impl AckSink for LapinAckSink {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(BrokerError::from)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(BrokerError::from)
    }
}

struct AckState {
    sink: Arc<dyn AckSink>,
    acknowledged: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
enum AckOp {
    Ack,
    Nack { requeue: bool },
}

/// Sends an ack/nack exactly once per message. A failed send re-arms the
/// state so the broker's eventual redelivery can be settled again.
async fn apply(state: &AckState, op: AckOp) -> Result<(), BrokerError> {
    if state.acknowledged.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let result = match op {
        AckOp::Ack => state.sink.ack().await,
        AckOp::Nack { requeue } => state.sink.nack(requeue).await,
    };

    if result.is_err() {
        state.acknowledged.store(false, Ordering::SeqCst);
    }
    result
}

/// A message received from a queue. Carries the physical queue it arrived
/// from and an opaque acknowledgment token.
pub struct MessageHandle {
    queue: String,
    payload: Vec<u8>,
    redelivered: bool,
    properties: BasicProperties,
    state: Arc<AckState>,
}

impl MessageHandle {
    fn from_delivery(queue: String, delivery: Delivery) -> Self {
        MessageHandle {
            queue,
            payload: delivery.data,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            state: Arc::new(AckState {
                sink: Arc::new(LapinAckSink {
                    acker: delivery.acker,
                }),
                acknowledged: AtomicBool::new(false),
            }),
        }
    }

    #[cfg(test)]
    fn with_sink(queue: &str, sink: Arc<dyn AckSink>) -> Self {
        MessageHandle {
            queue: queue.to_owned(),
            payload: Vec::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            state: Arc::new(AckState {
                sink,
                acknowledged: AtomicBool::new(false),
            }),
        }
    }

    /// The physical queue this message was delivered from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// Whether an ack or nack has been sent for this message.
    pub fn acknowledged(&self) -> bool {
        self.state.acknowledged.load(Ordering::SeqCst)
    }
}

/// Options for a single ack/nack call. Unset fields fall back to the
/// consumer-wide defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckOptions {
    /// Wait for the broker to take the acknowledgment before returning.
    pub block: Option<bool>,
    /// Upper bound on a blocking wait.
    pub timeout: Option<Duration>,
}

struct AckEntry {
    state: Arc<AckState>,
    op: AckOp,
}

/// FIFO queue of deferred acknowledgments.
struct AckQueue {
    entries: StdMutex<VecDeque<AckEntry>>,
}

impl AckQueue {
    fn new() -> Self {
        AckQueue {
            entries: StdMutex::new(VecDeque::new()),
        }
    }

    fn push(&self, state: Arc<AckState>, op: AckOp) {
        lock(&self.entries).push_back(AckEntry { state, op });
    }

    /// Settles every queued entry in order. Failures are logged, not raised;
    /// the messages will be redelivered by the broker.
    async fn flush(&self) {
        loop {
            let entry = lock(&self.entries).pop_front();
            let Some(entry) = entry else { break };

            if let Err(err) = apply(&entry.state, entry.op).await {
                warn!(
                    error = err.to_string(),
                    "failed to settle queued acknowledgment"
                );
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

async fn settle(
    pending: &AckQueue,
    state: &Arc<AckState>,
    op: AckOp,
    block: bool,
    timeout: Duration,
) -> Result<(), BrokerError> {
    if !block {
        pending.push(state.clone(), op);
        return Ok(());
    }

    match tokio::time::timeout(timeout, apply(state, op)).await {
        Err(_) => Err(BrokerError::AckTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Ok(result) => result,
    }
}

/// Iterator over the messages of one queue, with acknowledgment tracking.
pub struct QueueConsumer {
    queue: String,
    lease: ChannelLease,
    inner: Consumer,
    pending: AckQueue,
    blocking_acknowledge: bool,
    read_timeout: Duration,
    ack_timeout: Duration,
}

impl QueueConsumer {
    pub(crate) fn new(
        lease: ChannelLease,
        inner: Consumer,
        queue: String,
        blocking_acknowledge: bool,
        read_timeout: Duration,
        ack_timeout: Duration,
    ) -> Self {
        QueueConsumer {
            queue,
            lease,
            inner,
            pending: AckQueue::new(),
            blocking_acknowledge,
            read_timeout,
            ack_timeout,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Retrieves the next message, settling any queued acknowledgments
    /// first. Returns `Ok(None)` when the read timeout elapses with no
    /// delivery.
    pub async fn next(&mut self) -> Result<Option<MessageHandle>, BrokerError> {
        self.pending.flush().await;

        match tokio::time::timeout(self.read_timeout, self.inner.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BrokerError::Closed),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(Some(Ok(delivery))) => {
                debug!(queue = self.queue, "received message");
                Ok(Some(MessageHandle::from_delivery(
                    self.queue.clone(),
                    delivery,
                )))
            }
        }
    }

    /// Acknowledges a message.
    ///
    /// Blocking calls surface failures to the caller, leaving the message
    /// unacknowledged for redelivery; non-blocking calls return immediately
    /// and failures are logged during the next flush.
    pub async fn ack(
        &self,
        message: &MessageHandle,
        options: AckOptions,
    ) -> Result<(), BrokerError> {
        let block = options.block.unwrap_or(self.blocking_acknowledge);
        let timeout = options.timeout.unwrap_or(self.ack_timeout);
        settle(&self.pending, &message.state, AckOp::Ack, block, timeout).await
    }

    /// Rejects a message, optionally requeueing it on the broker.
    pub async fn nack(
        &self,
        message: &MessageHandle,
        requeue: bool,
        options: AckOptions,
    ) -> Result<(), BrokerError> {
        let block = options.block.unwrap_or(self.blocking_acknowledge);
        let timeout = options.timeout.unwrap_or(self.ack_timeout);
        settle(
            &self.pending,
            &message.state,
            AckOp::Nack { requeue },
            block,
            timeout,
        )
        .await
    }

    /// Cancels the consumer, settling queued acknowledgments first, and
    /// releases the channel back to the pool.
    pub async fn close(self) -> Result<(), BrokerError> {
        self.pending.flush().await;
        self.lease
            .basic_cancel(self.inner.tag().as_str(), BasicCancelOptions::default())
            .await?;
        Ok(())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends a label per settled message, preserving order.
    struct RecordingSink {
        label: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl AckSink for RecordingSink {
        async fn ack(&self) -> Result<(), BrokerError> {
            lock(&self.log).push(format!("ack:{}", self.label));
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
            lock(&self.log).push(format!("nack:{}:{}", self.label, requeue));
            Ok(())
        }
    }

    fn recording_handle(
        label: &'static str,
        log: &Arc<StdMutex<Vec<String>>>,
    ) -> MessageHandle {
        MessageHandle::with_sink(
            "orders",
            Arc::new(RecordingSink {
                label,
                log: log.clone(),
            }),
        )
    }

    #[tokio::test]
    async fn queued_acknowledgments_flush_in_fifo_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let m1 = recording_handle("m1", &log);
        let m2 = recording_handle("m2", &log);
        let pending = AckQueue::new();

        let timeout = Duration::from_secs(5);
        settle(&pending, &m1.state, AckOp::Ack, false, timeout)
            .await
            .unwrap();
        settle(
            &pending,
            &m2.state,
            AckOp::Nack { requeue: true },
            false,
            timeout,
        )
        .await
        .unwrap();

        // Nothing reaches the sink until the flush that precedes the next
        // message retrieval.
        assert!(lock(&log).is_empty());
        assert_eq!(pending.len(), 2);

        pending.flush().await;

        assert_eq!(*lock(&log), vec!["ack:m1", "nack:m2:true"]);
        assert!(m1.acknowledged());
        assert!(m2.acknowledged());
    }

    #[tokio::test]
    async fn blocking_ack_surfaces_sink_failures() {
        let mut sink = MockAckSink::new();
        sink.expect_ack().times(1).returning(|| Err(BrokerError::Closed));

        let handle = MessageHandle::with_sink("orders", Arc::new(sink));
        let pending = AckQueue::new();

        let result = settle(
            &pending,
            &handle.state,
            AckOp::Ack,
            true,
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(BrokerError::Closed)));
        // The message stays unacknowledged so the broker can redeliver it.
        assert!(!handle.acknowledged());
    }

    #[tokio::test]
    async fn queued_ack_failures_are_swallowed_by_flush() {
        let mut sink = MockAckSink::new();
        sink.expect_ack().times(1).returning(|| Err(BrokerError::Closed));

        let handle = MessageHandle::with_sink("orders", Arc::new(sink));
        let pending = AckQueue::new();

        settle(
            &pending,
            &handle.state,
            AckOp::Ack,
            false,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // Flush logs the failure instead of raising it.
        pending.flush().await;
        assert!(!handle.acknowledged());
    }

    #[tokio::test]
    async fn acknowledgment_is_idempotent_per_message() {
        let mut sink = MockAckSink::new();
        sink.expect_ack().times(1).returning(|| Ok(()));

        let handle = MessageHandle::with_sink("orders", Arc::new(sink));
        let pending = AckQueue::new();
        let timeout = Duration::from_secs(5);

        settle(&pending, &handle.state, AckOp::Ack, true, timeout)
            .await
            .unwrap();
        // The second settle is a no-op; the mock would panic on a second call.
        settle(&pending, &handle.state, AckOp::Ack, true, timeout)
            .await
            .unwrap();

        assert!(handle.acknowledged());
    }

    #[tokio::test]
    async fn nack_forwards_the_requeue_flag() {
        let mut sink = MockAckSink::new();
        sink.expect_nack()
            .times(1)
            .withf(|requeue| *requeue)
            .returning(|_| Ok(()));

        let handle = MessageHandle::with_sink("orders", Arc::new(sink));
        let pending = AckQueue::new();

        settle(
            &pending,
            &handle.state,
            AckOp::Nack { requeue: true },
            true,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(handle.acknowledged());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_ack_respects_its_timeout() {
        struct StuckSink;

        #[async_trait]
        impl AckSink for StuckSink {
            async fn ack(&self) -> Result<(), BrokerError> {
                futures_util::future::pending().await
            }

            async fn nack(&self, _requeue: bool) -> Result<(), BrokerError> {
                futures_util::future::pending().await
            }
        }

        let handle = MessageHandle::with_sink("orders", Arc::new(StuckSink));
        let pending = AckQueue::new();

        let result = settle(
            &pending,
            &handle.state,
            AckOp::Ack,
            true,
            Duration::from_secs(5),
        )
        .await;

        match result {
            Err(BrokerError::AckTimeout { timeout_ms }) => assert_eq!(timeout_ms, 5_000),
            other => panic!("expected AckTimeout, got {:?}", other),
        }
    }
}
