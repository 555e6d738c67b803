// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Pipeline
//!
//! This module turns an outgoing message into a wire publish. Delay
//! validation runs first so an oversized delay never touches the network.
//! Delayed messages are published to the delay queue with a per-message
//! expiration equal to the delay; the broker dead-letters them onward when
//! the TTL runs out. Every publish is persistent and mandatory, and when
//! publisher confirms are enabled the confirmation wait is bounded by a
//! timeout independent of the connection heartbeat, so a connection dying
//! mid-confirm surfaces as `ConfirmTimeout` instead of a hang.

use std::sync::Arc;
use std::time::Duration;

use lapin::{
    options::BasicPublishOptions, publisher_confirm::Confirmation, types::ShortString,
    BasicProperties,
};
use tracing::debug;
use uuid::Uuid;

use crate::connection::{retry_over_time, ConnectionHolder};
use crate::declare::TopologyDeclarer;
use crate::errors::BrokerError;
use crate::topology::Topology;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-message delivery options exposed to the task layer.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Delay in milliseconds before the message becomes consumable.
    pub delay: Option<u64>,
    /// Message priority; only honored on queues declared with max-priority.
    pub priority: Option<u8>,
    /// Expiration in milliseconds; set automatically for delayed messages.
    pub expiration: Option<u64>,
}

impl PublishOptions {
    pub fn delayed(delay_ms: u64) -> Self {
        PublishOptions {
            delay: Some(delay_ms),
            ..PublishOptions::default()
        }
    }
}

/// Publishes messages with at-least-once semantics and bounded retries.
pub struct PublishPipeline {
    holder: Arc<dyn ConnectionHolder>,
    topology: Arc<dyn Topology>,
    declarer: Arc<TopologyDeclarer>,
    confirm_delivery: bool,
    confirm_timeout: Duration,
    max_attempts: Option<u32>,
}

impl PublishPipeline {
    pub fn new(
        holder: Arc<dyn ConnectionHolder>,
        topology: Arc<dyn Topology>,
        declarer: Arc<TopologyDeclarer>,
        confirm_delivery: bool,
        confirm_timeout: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        PublishPipeline {
            holder,
            topology,
            declarer,
            confirm_delivery,
            confirm_timeout,
            max_attempts,
        }
    }

    /// Enqueues a message on the canonical queue, or on the delay queue when
    /// a delay is requested. Failures after validation are retried with a
    /// fresh resource up to the enqueue attempt budget; the last underlying
    /// error is surfaced unchanged when the budget runs out.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        let names = self.topology.name_set(queue_name);

        if let Some(delay) = options.delay {
            self.topology.validate_delay(queue_name, delay)?;
        }

        let (target, expiration) = match options.delay {
            Some(delay) => (names.delayed.clone(), Some(delay)),
            None => (names.canonical.clone(), options.expiration),
        };
        let canonical = names.canonical;

        let properties = build_properties(options, expiration);

        debug!(queue = target.as_str(), "enqueueing message");

        retry_over_time(self.max_attempts, "publish", || {
            let canonical = canonical.clone();
            let target = target.clone();
            let properties = properties.clone();
            async move {
                self.publish_once(&canonical, &target, payload, properties)
                    .await
            }
        })
        .await
    }

    async fn publish_once(
        &self,
        canonical: &str,
        target: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        self.declarer.declare(canonical, true).await?;

        let channel = self.holder.acquire_channel().await?;
        let confirm = channel
            .basic_publish(
                "",
                target,
                BasicPublishOptions {
                    // Reject instead of silently dropping unroutable messages.
                    mandatory: true,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await?;

        if self.confirm_delivery {
            if let Err(err) = wait_confirm(confirm, self.confirm_timeout, canonical).await {
                if matches!(err, BrokerError::Unroutable { .. }) {
                    // The queue may have been deleted under us; the retry
                    // path re-ensures the topology.
                    self.declarer.invalidate(canonical);
                }
                return Err(err);
            }
        }

        Ok(())
    }
}

fn build_properties(options: &PublishOptions, expiration: Option<u64>) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        // Messages are always persistent.
        .with_delivery_mode(2);

    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority);
    }

    // AMQP expirations are decimal strings of integer milliseconds.
    if let Some(expiration) = expiration {
        properties = properties.with_expiration(ShortString::from(expiration.to_string()));
    }

    properties
}

/// Awaits a publisher confirmation under a hard upper bound.
///
/// The heartbeat only detects a dead connection while it is idle; without
/// this timeout a publish whose connection dies mid-confirmation would block
/// forever.
pub(crate) async fn wait_confirm<F>(
    confirm: F,
    timeout: Duration,
    queue: &str,
) -> Result<(), BrokerError>
where
    F: std::future::Future<Output = Result<Confirmation, lapin::Error>>,
{
    let confirmation = tokio::time::timeout(timeout, confirm)
        .await
        .map_err(|_| BrokerError::ConfirmTimeout {
            queue: queue.to_owned(),
            timeout_ms: timeout.as_millis() as u64,
        })??;

    match confirmation {
        Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        // A returned message means no queue could route it.
        Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => Err(BrokerError::Unroutable {
            queue: queue.to_owned(),
        }),
        Confirmation::Nack(None) => Err(BrokerError::PublishRejected {
            queue: queue.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelLease;
    use crate::topology::{DirectTopology, TopologyConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHolder {
        acquisitions: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionHolder for CountingHolder {
        async fn acquire_channel(&self) -> Result<ChannelLease, BrokerError> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Closed)
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn pipeline_with_max_delay(
        max_delay: Option<u64>,
    ) -> (PublishPipeline, Arc<CountingHolder>) {
        let holder = Arc::new(CountingHolder {
            acquisitions: AtomicUsize::new(0),
        });
        let topology = Arc::new(DirectTopology::new(TopologyConfig {
            max_delay,
            ..TopologyConfig::default()
        }));
        let declarer = Arc::new(TopologyDeclarer::new(
            holder.clone(),
            topology.clone(),
            Some(1),
        ));
        let pipeline = PublishPipeline::new(
            holder.clone(),
            topology,
            declarer,
            true,
            Duration::from_secs(5),
            Some(1),
        );
        (pipeline, holder)
    }

    #[tokio::test]
    async fn oversized_delay_fails_before_any_network_call() {
        let (pipeline, holder) = pipeline_with_max_delay(Some(3_600_000));

        let result = pipeline
            .enqueue("orders", b"{}", &PublishOptions::delayed(7_200_000))
            .await;

        match result {
            Err(BrokerError::DelayTooLong {
                requested,
                max,
                queue,
            }) => {
                assert_eq!(requested, 7_200_000);
                assert_eq!(max, 3_600_000);
                assert_eq!(queue, "orders");
            }
            other => panic!("expected DelayTooLong, got {:?}", other),
        }
        assert_eq!(holder.acquisitions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn acceptable_delay_reaches_the_resource_pool() {
        let (pipeline, holder) = pipeline_with_max_delay(Some(3_600_000));

        let result = pipeline
            .enqueue("orders", b"{}", &PublishOptions::delayed(1_800_000))
            .await;

        // The test holder cannot hand out channels, but validation passed
        // and the pipeline went on to the declare step.
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(holder.acquisitions.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_retries_transient_failures_up_to_the_attempt_budget() {
        struct RefusingHolder {
            acquisitions: AtomicUsize,
        }

        #[async_trait]
        impl ConnectionHolder for RefusingHolder {
            async fn acquire_channel(&self) -> Result<ChannelLease, BrokerError> {
                self.acquisitions.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::Transport(lapin::Error::IOError(Arc::new(
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                ))))
            }

            async fn close(&self) -> Result<(), BrokerError> {
                Ok(())
            }
        }

        let holder = Arc::new(RefusingHolder {
            acquisitions: AtomicUsize::new(0),
        });
        let topology = Arc::new(DirectTopology::default());
        let declarer = Arc::new(TopologyDeclarer::new(
            holder.clone(),
            topology.clone(),
            Some(1),
        ));
        let pipeline = PublishPipeline::new(
            holder.clone(),
            topology,
            declarer,
            true,
            Duration::from_secs(5),
            Some(2),
        );

        let result = pipeline
            .enqueue("orders", b"{}", &PublishOptions::delayed(60_000))
            .await;

        // Each attempt re-runs declare-then-publish with a fresh checkout.
        assert!(matches!(result, Err(BrokerError::Transport(_))));
        assert_eq!(holder.acquisitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_wait_times_out_instead_of_hanging() {
        let result = wait_confirm(
            futures_util::future::pending(),
            Duration::from_secs(5),
            "orders",
        )
        .await;

        match result {
            Err(BrokerError::ConfirmTimeout { queue, timeout_ms }) => {
                assert_eq!(queue, "orders");
                assert_eq!(timeout_ms, 5_000);
            }
            other => panic!("expected ConfirmTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn confirm_ack_is_success() {
        let result = wait_confirm(
            std::future::ready(Ok(Confirmation::Ack(None))),
            Duration::from_secs(5),
            "orders",
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn confirm_nack_is_a_rejected_publish() {
        let result = wait_confirm(
            std::future::ready(Ok(Confirmation::Nack(None))),
            Duration::from_secs(5),
            "orders",
        )
        .await;
        assert!(matches!(result, Err(BrokerError::PublishRejected { .. })));
    }

    #[test]
    fn delayed_messages_carry_an_integer_expiration() {
        let options = PublishOptions::delayed(1_800_000);
        let properties = build_properties(&options, options.delay);

        assert_eq!(
            properties.expiration().as_ref().map(|e| e.as_str()),
            Some("1800000")
        );
        assert_eq!(*properties.delivery_mode(), Some(2));
    }

    #[test]
    fn priority_is_forwarded_when_set() {
        let options = PublishOptions {
            priority: Some(9),
            ..PublishOptions::default()
        };
        let properties = build_properties(&options, None);

        assert_eq!(*properties.priority(), Some(9));
        assert_eq!(*properties.expiration(), None);
    }
}
