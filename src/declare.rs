// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declarer
//!
//! This module ensures the physical queues behind a logical queue name exist
//! on the broker. Declaring is lazy: a queue first becomes *pending* (known
//! but not yet declared on the wire) and moves to *ensured* once its delay,
//! dead letter and canonical queues have all been declared. The state never
//! regresses except through `invalidate`, which is invoked after the broker
//! reports a published message as unroutable.
//!
//! A declare rejected because the queue already exists with different
//! arguments is classified before deciding how to proceed: a known topology
//! variance is tolerated and logged, a genuinely invalid argument is fatal,
//! and anything transport-shaped is retried with a fresh resource.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use tracing::{debug, warn};

use crate::connection::{retry_over_time, ConnectionHolder};
use crate::errors::BrokerError;
use crate::topology::{QueueNameSet, Topology};

/// Outcome of classifying a failed queue declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictClass {
    /// Known topology variance; log and treat the declare as successful.
    Tolerated,
    /// Incompatible arguments; surface immediately, retrying cannot help.
    Fatal,
    /// Transport-level failure; retry with a fresh resource.
    Transient,
}

/// Classifies the broker's rejection of a queue declare.
pub(crate) fn classify_declare_error(err: &lapin::Error) -> ConflictClass {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                classify_precondition(amqp.get_message().as_str())
            }
            // Hard errors close the whole connection; a reconnect may succeed.
            AMQPErrorKind::Hard(_) => ConflictClass::Transient,
            _ => ConflictClass::Fatal,
        },
        _ => ConflictClass::Transient,
    }
}

/// Classifies a precondition-failed reply by its error text.
///
/// RabbitMQ reports an argument-value mismatch on an existing queue as
/// "inequivalent arg ..."; that is the acceptable drift case (for example a
/// dead-letter target that evolved between versions). Any other precondition
/// failure means the arguments themselves are invalid.
pub(crate) fn classify_precondition(message: &str) -> ConflictClass {
    if message.to_lowercase().contains("inequivalent arg") {
        ConflictClass::Tolerated
    } else {
        ConflictClass::Fatal
    }
}

#[derive(Default)]
struct DeclareState {
    /// Canonical names that have at least been announced.
    declared: HashSet<String>,
    /// Physical names still awaiting a declare on the wire.
    pending: HashSet<String>,
}

enum QueueRole {
    Canonical,
    Delayed,
    DeadLetter,
}

/// Declares and reconciles the queue topology on the broker.
pub struct TopologyDeclarer {
    holder: Arc<dyn ConnectionHolder>,
    topology: Arc<dyn Topology>,
    max_attempts: Option<u32>,
    state: StdMutex<DeclareState>,
}

impl TopologyDeclarer {
    pub fn new(
        holder: Arc<dyn ConnectionHolder>,
        topology: Arc<dyn Topology>,
        max_attempts: Option<u32>,
    ) -> Self {
        TopologyDeclarer {
            holder,
            topology,
            max_attempts,
            state: StdMutex::new(DeclareState::default()),
        }
    }

    /// Declares the canonical queue for `queue_name`, deferring the physical
    /// declares until an ensure pass. With `ensure` the delay, dead letter
    /// and canonical queues are declared on the wire before returning.
    pub async fn declare(&self, queue_name: &str, ensure: bool) -> Result<(), BrokerError> {
        let names = self.topology.name_set(queue_name);

        {
            let mut state = lock(&self.state);
            if !state.declared.contains(&names.canonical) {
                state.declared.insert(names.canonical.clone());
                state.pending.insert(names.canonical.clone());
            }
        }

        if ensure {
            self.ensure(&names).await?;
        }

        Ok(())
    }

    /// Forgets that a queue was declared so the next declare re-ensures it.
    pub fn invalidate(&self, queue_name: &str) {
        let names = self.topology.name_set(queue_name);
        let mut state = lock(&self.state);
        state.declared.remove(&names.canonical);
    }

    /// Canonical names announced so far.
    pub fn declared_queues(&self) -> HashSet<String> {
        lock(&self.state).declared.clone()
    }

    pub(crate) fn is_pending(&self, physical_name: &str) -> bool {
        lock(&self.state).pending.contains(physical_name)
    }

    async fn ensure(&self, names: &QueueNameSet) -> Result<(), BrokerError> {
        // Snapshot what still needs declaring; the network calls below run
        // without the lock held.
        let (need_delay, need_dead_letter, need_canonical) = {
            let mut state = lock(&self.state);
            if state.pending.contains(&names.canonical) {
                state.pending.insert(names.delayed.clone());
                state.pending.insert(names.dead_letter.clone());
            }
            (
                state.pending.contains(&names.delayed),
                state.pending.contains(&names.dead_letter),
                state.pending.contains(&names.canonical),
            )
        };

        // Delay and dead letter queues go first: the canonical declare names
        // them as dead-letter targets.
        if need_delay {
            self.declare_physical(names, QueueRole::Delayed).await?;
        }
        if need_dead_letter {
            self.declare_physical(names, QueueRole::DeadLetter).await?;
        }
        if need_canonical {
            self.declare_physical(names, QueueRole::Canonical).await?;
        }

        Ok(())
    }

    async fn declare_physical(
        &self,
        names: &QueueNameSet,
        role: QueueRole,
    ) -> Result<(), BrokerError> {
        let (physical, args) = match role {
            QueueRole::Canonical => (
                &names.canonical,
                self.topology.canonical_arguments(&names.canonical, true),
            ),
            QueueRole::Delayed => (&names.delayed, self.topology.delay_arguments(&names.canonical)),
            QueueRole::DeadLetter => (
                &names.dead_letter,
                self.topology.dead_letter_arguments(&names.canonical),
            ),
        };

        retry_over_time(self.max_attempts, "queue declare", || {
            let args = args.clone();
            async move { self.declare_once(physical, args).await }
        })
        .await?;

        let mut state = lock(&self.state);
        state.pending.remove(physical);
        state.declared.insert(physical.clone());
        Ok(())
    }

    async fn declare_once(&self, physical: &str, args: FieldTable) -> Result<(), BrokerError> {
        let channel = self.holder.acquire_channel().await?;

        debug!(queue = physical, "declaring queue");
        match channel
            .queue_declare(physical, self.topology.declare_options(), args)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match classify_declare_error(&err) {
                ConflictClass::Tolerated => {
                    warn!(
                        queue = physical,
                        error = err.to_string(),
                        "queue already exists with a different topology, skipping declare"
                    );
                    Ok(())
                }
                ConflictClass::Fatal => Err(BrokerError::TopologyConflict {
                    queue: physical.to_owned(),
                    reason: err.to_string(),
                }),
                ConflictClass::Transient => Err(BrokerError::from(err)),
            },
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelLease;
    use crate::topology::DirectTopology;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ClosedHolder {
        acquisitions: AtomicUsize,
    }

    impl ClosedHolder {
        fn new() -> Arc<Self> {
            Arc::new(ClosedHolder {
                acquisitions: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectionHolder for ClosedHolder {
        async fn acquire_channel(&self) -> Result<ChannelLease, BrokerError> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Closed)
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn declarer_with(holder: Arc<ClosedHolder>) -> TopologyDeclarer {
        TopologyDeclarer::new(holder, Arc::new(DirectTopology::default()), Some(1))
    }

    #[test]
    fn inequivalent_arguments_are_tolerated() {
        let class = classify_precondition(
            "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-routing-key' \
             for queue 'orders' in vhost '/'",
        );
        assert_eq!(class, ConflictClass::Tolerated);
    }

    #[test]
    fn invalid_argument_values_are_fatal() {
        let class = classify_precondition(
            "PRECONDITION_FAILED - invalid arg 'x-message-ttl' for queue 'orders': \
             {unacceptable_type,longstr}",
        );
        assert_eq!(class, ConflictClass::Fatal);
    }

    #[test]
    fn io_failures_are_transient() {
        let err = lapin::Error::IOError(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert_eq!(classify_declare_error(&err), ConflictClass::Transient);
    }

    #[tokio::test]
    async fn lazy_declare_makes_no_network_calls() {
        let holder = ClosedHolder::new();
        let declarer = declarer_with(holder.clone());

        declarer.declare("orders", false).await.unwrap();

        assert_eq!(holder.acquisitions.load(Ordering::SeqCst), 0);
        assert!(declarer.is_pending("orders"));
        assert!(declarer.declared_queues().contains("orders"));
    }

    #[tokio::test]
    async fn ensure_marks_the_whole_name_set_pending() {
        let holder = ClosedHolder::new();
        let declarer = declarer_with(holder.clone());

        declarer.declare("orders", false).await.unwrap();
        let result = declarer.declare("orders", true).await;

        // The first wire declare fails, but the full triplet was queued up.
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(declarer.is_pending("orders"));
        assert!(declarer.is_pending("orders.DQ"));
        assert!(declarer.is_pending("orders.XQ"));
        assert!(holder.acquisitions.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn externally_deleted_queue_is_redeclared_after_invalidate() {
        let holder = ClosedHolder::new();
        let declarer = declarer_with(holder.clone());

        // Simulate a completed ensure pass: the full triplet is declared and
        // nothing is pending.
        {
            let mut state = lock(&declarer.state);
            for name in ["orders", "orders.DQ", "orders.XQ"] {
                state.declared.insert(name.to_owned());
            }
        }

        // An ensure-declare in this state makes no wire calls, so recovering
        // a queue deleted behind our back requires invalidating first.
        declarer.declare("orders", true).await.unwrap();
        assert_eq!(holder.acquisitions.load(Ordering::SeqCst), 0);

        declarer.invalidate("orders");
        let result = declarer.declare("orders", true).await;

        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(holder.acquisitions.load(Ordering::SeqCst) > 0);
        assert!(declarer.is_pending("orders.DQ"));
        assert!(declarer.is_pending("orders.XQ"));
    }

    #[tokio::test]
    async fn invalidate_regresses_only_the_declared_flag() {
        let holder = ClosedHolder::new();
        let declarer = declarer_with(holder);

        declarer.declare("orders", false).await.unwrap();
        assert!(declarer.declared_queues().contains("orders"));

        declarer.invalidate("orders");
        assert!(!declarer.declared_queues().contains("orders"));

        // A later declare announces it again.
        declarer.declare("orders", false).await.unwrap();
        assert!(declarer.declared_queues().contains("orders"));
    }
}
