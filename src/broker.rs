// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Facade
//!
//! This module assembles the engine: it builds the connection holder for the
//! configured pool strategy, wires the topology declarer and publish pipeline
//! on top of it, and exposes the queue-level operations task frameworks call:
//! declare, enqueue, consume, message counts, flush and delete.
//!
//! All resources are acquired lazily, so constructing a `Broker` performs no
//! network I/O.

use std::sync::Arc;

use lapin::{
    options::{
        BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
};
use tracing::debug;
use uuid::Uuid;

use crate::config::{BrokerConfig, PoolStrategy};
use crate::connection::{ConnectionHolder, PooledConnections, SharedConnection};
use crate::consumer::QueueConsumer;
use crate::declare::TopologyDeclarer;
use crate::errors::BrokerError;
use crate::publisher::{PublishOptions, PublishPipeline};
use crate::topology::Topology;

/// Task-queue engine over one AMQP broker.
pub struct Broker {
    config: BrokerConfig,
    holder: Arc<dyn ConnectionHolder>,
    topology: Arc<dyn Topology>,
    declarer: Arc<TopologyDeclarer>,
    pipeline: PublishPipeline,
}

impl Broker {
    /// Builds a broker for the given configuration and topology. Connections
    /// are not opened until the first operation needs one.
    pub fn new(config: BrokerConfig, topology: Arc<dyn Topology>) -> Self {
        let holder: Arc<dyn ConnectionHolder> = match config.pool.strategy {
            PoolStrategy::Pooled => Arc::new(PooledConnections::new(
                config.connection.clone(),
                config.pool.max_connections,
                config.confirm_delivery,
                config.acquire_timeout(),
            )),
            PoolStrategy::Shared => Arc::new(SharedConnection::new(
                config.connection.clone(),
                config.pool.max_channels,
                config.confirm_delivery,
                config.acquire_timeout(),
            )),
        };

        let declarer = Arc::new(TopologyDeclarer::new(
            holder.clone(),
            topology.clone(),
            config.max_declare_attempts,
        ));

        let pipeline = PublishPipeline::new(
            holder.clone(),
            topology.clone(),
            declarer.clone(),
            config.confirm_delivery,
            config.confirm_timeout(),
            config.max_enqueue_attempts,
        );

        Broker {
            config,
            holder,
            topology,
            declarer,
            pipeline,
        }
    }

    /// Declares the queue topology for a logical queue name. With `ensure`
    /// the delay, dead letter and canonical queues exist on the broker when
    /// this returns; without it the declare is deferred until first use.
    pub async fn declare_queue(&self, queue_name: &str, ensure: bool) -> Result<(), BrokerError> {
        self.declarer.declare(queue_name, ensure).await
    }

    /// Publishes a message to a logical queue, honoring the delay, priority
    /// and expiration in `options`.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        self.pipeline.enqueue(queue_name, payload, options).await
    }

    /// Starts consuming a logical queue's canonical queue with the given
    /// prefetch window. A missing queue is declared before consumption
    /// begins.
    pub async fn consume(
        &self,
        queue_name: &str,
        prefetch: u16,
    ) -> Result<QueueConsumer, BrokerError> {
        let names = self.topology.name_set(queue_name);
        self.ensure_exists(&names.canonical).await?;

        let lease = self.holder.acquire_channel().await?;
        lease
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("{}-{}", names.canonical, Uuid::new_v4());
        debug!(queue = names.canonical, tag, "starting consumer");
        let consumer = lease
            .basic_consume(
                &names.canonical,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(QueueConsumer::new(
            lease,
            consumer,
            names.canonical,
            self.config.blocking_acknowledge,
            self.config.read_timeout(),
            self.config.ack_timeout(),
        ))
    }

    /// Message counts of the canonical, delay and dead letter queues, in
    /// that order. A queue that does not exist counts as empty.
    pub async fn queue_message_counts(
        &self,
        queue_name: &str,
    ) -> Result<(u32, u32, u32), BrokerError> {
        let names = self.topology.name_set(queue_name);
        Ok((
            self.message_count(&names.canonical).await?,
            self.message_count(&names.delayed).await?,
            self.message_count(&names.dead_letter).await?,
        ))
    }

    /// Purges all messages from a logical queue's three physical queues.
    pub async fn flush(&self, queue_name: &str) -> Result<(), BrokerError> {
        let names = self.topology.name_set(queue_name);
        for physical in [&names.canonical, &names.delayed, &names.dead_letter] {
            self.purge(physical).await?;
        }
        Ok(())
    }

    /// Purges every queue declared through this broker.
    pub async fn flush_all(&self) -> Result<(), BrokerError> {
        for canonical in self.declarer.declared_queues() {
            self.flush(&canonical).await?;
        }
        Ok(())
    }

    /// Deletes a logical queue's three physical queues from the broker.
    pub async fn delete_queue(&self, queue_name: &str) -> Result<(), BrokerError> {
        let names = self.topology.name_set(queue_name);
        for physical in [&names.canonical, &names.delayed, &names.dead_letter] {
            self.delete(physical).await?;
        }
        self.declarer.invalidate(queue_name);
        Ok(())
    }

    /// Deletes every queue declared through this broker.
    pub async fn delete_all(&self) -> Result<(), BrokerError> {
        for canonical in self.declarer.declared_queues() {
            self.delete_queue(&canonical).await?;
        }
        Ok(())
    }

    /// Canonical queue names declared through this broker so far.
    pub fn declared_queues(&self) -> std::collections::HashSet<String> {
        self.declarer.declared_queues()
    }

    /// Closes every connection and channel; in-flight acquisitions fail with
    /// `Closed`.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.holder.close().await
    }

    /// Checks that a physical queue exists, declaring the full topology when
    /// it does not. The failed passive declare closes its channel, so the
    /// lease is dropped before declaring.
    async fn ensure_exists(&self, canonical: &str) -> Result<(), BrokerError> {
        let lease = self.holder.acquire_channel().await?;
        let result = lease
            .queue_declare(canonical, passive_options(), FieldTable::default())
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                drop(lease);
                debug!(queue = canonical, "queue missing, declaring before consume");
                // The queue was deleted out from under us; forget the earlier
                // ensure or the declare below would be a no-op.
                self.declarer.invalidate(canonical);
                self.declarer.declare(canonical, true).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn message_count(&self, physical: &str) -> Result<u32, BrokerError> {
        let lease = self.holder.acquire_channel().await?;
        match lease
            .queue_declare(physical, passive_options(), FieldTable::default())
            .await
        {
            Ok(queue) => Ok(queue.message_count()),
            Err(err) if is_not_found(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn purge(&self, physical: &str) -> Result<(), BrokerError> {
        let lease = self.holder.acquire_channel().await?;
        match lease
            .queue_purge(physical, QueuePurgeOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, physical: &str) -> Result<(), BrokerError> {
        let lease = self.holder.acquire_channel().await?;
        match lease
            .queue_delete(physical, QueueDeleteOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn passive_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: true,
        ..QueueDeclareOptions::default()
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}
