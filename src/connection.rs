// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Resource Pool
//!
//! This module owns the network connections and channels every other
//! component operates through. Two interchangeable strategies are provided:
//!
//! - `PooledConnections`: a bounded set of independent connections, each with
//!   its own channel, checked out and back in per operation
//! - `SharedConnection`: exactly one connection shared by all operations,
//!   with a bounded pool of channels layered on top
//!
//! Callers never see a connection object directly; they acquire a
//! `ChannelLease` which returns its resource to the pool when dropped, on
//! every exit path. A resource found dead at checkout or check-in is
//! discarded and replaced instead of being pooled again.

use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::errors::BrokerError;

const RETRY_INTERVAL_START: Duration = Duration::from_secs(2);
const RETRY_INTERVAL_STEP: Duration = Duration::from_secs(2);
// 2 + 2 * 14 caps the backoff at 30 seconds.
const RETRY_BACKOFF_CAP_STEPS: u32 = 14;

/// Scoped access to the broker's resources.
///
/// Acquisition blocks (bounded by the acquire timeout) when every resource is
/// checked out; `close` releases all live resources and fails any waiting
/// acquirer with `Closed` instead of leaving it hanging.
#[async_trait]
pub trait ConnectionHolder: Send + Sync {
    /// Checks a live channel out of the pool.
    async fn acquire_channel(&self) -> Result<ChannelLease, BrokerError>;

    /// Releases every live connection and channel.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A connection paired with the channel operations run on.
struct PooledConn {
    connection: Connection,
    channel: Channel,
}

impl PooledConn {
    fn is_live(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

enum LeaseSlot {
    Pooled {
        connection: Connection,
        idle: Arc<StdMutex<Vec<PooledConn>>>,
        permits: Arc<Semaphore>,
    },
    Shared {
        idle: Arc<StdMutex<Vec<Channel>>>,
        permits: Arc<Semaphore>,
    },
}

/// A checked-out channel. Dropping the lease returns the underlying resource
/// to its pool after a liveness check; a dead resource is discarded so the
/// next acquisition replaces it.
pub struct ChannelLease {
    channel: Channel,
    slot: Option<LeaseSlot>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for ChannelLease {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        match self.slot.take() {
            Some(LeaseSlot::Pooled {
                connection,
                idle,
                permits,
            }) => {
                let conn = PooledConn {
                    connection,
                    channel: self.channel.clone(),
                };
                if returnable(conn.is_live(), permits.is_closed()) {
                    lock(&idle).push(conn);
                }
            }
            Some(LeaseSlot::Shared { idle, permits }) => {
                if returnable(self.channel.status().connected(), permits.is_closed()) {
                    lock(&idle).push(self.channel.clone());
                }
            }
            None => {}
        }
    }
}

/// A resource returned by a lease goes back to the idle pool only while it is
/// live and the pool is still open; a lease outstanding during `close` drops
/// its resource instead of stranding it in an unreachable pool.
fn returnable(live: bool, pool_closed: bool) -> bool {
    live && !pool_closed
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens a (connection, channel) pair. The production connector dials the
/// broker; tests substitute their own to observe checkout behavior.
#[async_trait]
trait Connector: Send + Sync {
    async fn connect(&self, confirm_delivery: bool) -> Result<PooledConn, BrokerError>;
}

struct AmqpConnector {
    config: ConnectionConfig,
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, confirm_delivery: bool) -> Result<PooledConn, BrokerError> {
        debug!(host = self.config.host, "creating amqp connection...");

        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.config.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        let connection = Connection::connect(&self.config.amqp_uri(), properties).await?;

        debug!("creating amqp channel...");
        let channel = connection.create_channel().await?;
        if confirm_delivery {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
        }

        Ok(PooledConn { connection, channel })
    }
}

async fn acquire_permit(
    permits: &Arc<Semaphore>,
    timeout: Duration,
) -> Result<OwnedSemaphorePermit, BrokerError> {
    match tokio::time::timeout(timeout, permits.clone().acquire_owned()).await {
        Err(_) => Err(BrokerError::AcquireTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Ok(Err(_)) => Err(BrokerError::Closed),
        Ok(Ok(permit)) => Ok(permit),
    }
}

/// Pooled strategy: a fixed-size set of independent connections, each lazily
/// connected on first checkout and reused afterwards.
pub struct PooledConnections {
    connector: Arc<dyn Connector>,
    confirm_delivery: bool,
    acquire_timeout: Duration,
    idle: Arc<StdMutex<Vec<PooledConn>>>,
    permits: Arc<Semaphore>,
}

impl PooledConnections {
    pub fn new(
        config: ConnectionConfig,
        pool_size: usize,
        confirm_delivery: bool,
        acquire_timeout: Duration,
    ) -> Self {
        Self::with_connector(
            Arc::new(AmqpConnector { config }),
            pool_size,
            confirm_delivery,
            acquire_timeout,
        )
    }

    fn with_connector(
        connector: Arc<dyn Connector>,
        pool_size: usize,
        confirm_delivery: bool,
        acquire_timeout: Duration,
    ) -> Self {
        PooledConnections {
            connector,
            confirm_delivery,
            acquire_timeout,
            idle: Arc::new(StdMutex::new(Vec::with_capacity(pool_size))),
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }
}

#[async_trait]
impl ConnectionHolder for PooledConnections {
    async fn acquire_channel(&self) -> Result<ChannelLease, BrokerError> {
        let permit = acquire_permit(&self.permits, self.acquire_timeout).await?;

        // The guard must not be held across the connect await below.
        let pooled = lock(&self.idle).pop();
        let conn = match pooled {
            Some(conn) if conn.is_live() => conn,
            Some(_dead) => {
                warn!("pooled connection found dead on checkout, replacing it");
                self.connector.connect(self.confirm_delivery).await?
            }
            None => self.connector.connect(self.confirm_delivery).await?,
        };

        Ok(ChannelLease {
            channel: conn.channel,
            slot: Some(LeaseSlot::Pooled {
                connection: conn.connection,
                idle: self.idle.clone(),
                permits: self.permits.clone(),
            }),
            _permit: permit,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Fails blocked acquirers with Closed instead of hanging.
        self.permits.close();

        let idle: Vec<PooledConn> = {
            let mut guard = lock(&self.idle);
            guard.drain(..).collect()
        };

        for conn in idle {
            if let Err(err) = conn.connection.close(200, "closing").await {
                warn!(error = err.to_string(), "error closing pooled connection");
            }
        }

        Ok(())
    }
}

/// Shared strategy: one connection for every operation, with a bounded
/// channel pool on top. The lapin channel handle is safe for concurrent use,
/// which is what makes pooling channels over a single connection sound.
pub struct SharedConnection {
    connector: Arc<dyn Connector>,
    confirm_delivery: bool,
    acquire_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    idle: Arc<StdMutex<Vec<Channel>>>,
    permits: Arc<Semaphore>,
}

impl SharedConnection {
    pub fn new(
        config: ConnectionConfig,
        channel_pool_size: usize,
        confirm_delivery: bool,
        acquire_timeout: Duration,
    ) -> Self {
        Self::with_connector(
            Arc::new(AmqpConnector { config }),
            channel_pool_size,
            confirm_delivery,
            acquire_timeout,
        )
    }

    fn with_connector(
        connector: Arc<dyn Connector>,
        channel_pool_size: usize,
        confirm_delivery: bool,
        acquire_timeout: Duration,
    ) -> Self {
        SharedConnection {
            connector,
            confirm_delivery,
            acquire_timeout,
            connection: Mutex::new(None),
            idle: Arc::new(StdMutex::new(Vec::with_capacity(channel_pool_size))),
            permits: Arc::new(Semaphore::new(channel_pool_size)),
        }
    }

    /// Creates a channel on the shared connection, reconnecting first when
    /// the connection is missing or dead. A reconnect invalidates every
    /// channel derived from the previous connection.
    async fn create_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.connection.lock().await;

        let live = guard
            .as_ref()
            .map(|conn| conn.status().connected())
            .unwrap_or(false);

        if !live {
            if guard.take().is_some() {
                warn!("shared connection lost, discarding its pooled channels");
                lock(&self.idle).clear();
            }

            // The reconnect's first channel serves this acquisition.
            let conn = self.connector.connect(self.confirm_delivery).await?;
            *guard = Some(conn.connection);
            return Ok(conn.channel);
        }

        let connection = match guard.as_ref() {
            Some(conn) => conn,
            None => return Err(BrokerError::Closed),
        };

        let channel = connection.create_channel().await?;
        if self.confirm_delivery {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
        }
        Ok(channel)
    }
}

#[async_trait]
impl ConnectionHolder for SharedConnection {
    async fn acquire_channel(&self) -> Result<ChannelLease, BrokerError> {
        let permit = acquire_permit(&self.permits, self.acquire_timeout).await?;

        let pooled = lock(&self.idle).pop();
        let channel = match pooled {
            Some(channel) if channel.status().connected() => channel,
            // A stale channel is simply dropped; its permit covers the
            // replacement we create here.
            _ => self.create_channel().await?,
        };

        Ok(ChannelLease {
            channel,
            slot: Some(LeaseSlot::Shared {
                idle: self.idle.clone(),
                permits: self.permits.clone(),
            }),
            _permit: permit,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.permits.close();
        lock(&self.idle).clear();

        if let Some(connection) = self.connection.lock().await.take() {
            connection.close(200, "closing").await?;
        }

        Ok(())
    }
}

/// Retries a transient-failing operation with the same backoff schedule the
/// declare and publish pipelines share: start at 2s, grow by 2s per attempt,
/// cap at 30s. `max_attempts` of `None` retries forever.
pub(crate) async fn retry_over_time<T, F, Fut>(
    max_attempts: Option<u32>,
    what: &str,
    mut op: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && max_attempts.map_or(true, |max| attempts < max) => {
                let backoff = RETRY_INTERVAL_START
                    + RETRY_INTERVAL_STEP * (attempts - 1).min(RETRY_BACKOFF_CAP_STEPS);
                warn!(
                    error = err.to_string(),
                    "{} failed, trying again in {}s", what, backoff.as_secs()
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
