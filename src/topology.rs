// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology
//!
//! This module maps a logical queue name onto the physical queue layout the
//! engine maintains on the broker: the canonical queue workers consume from,
//! the delay queue that holds messages until their per-message TTL expires,
//! and the dead letter queue that collects expired or rejected messages.
//!
//! The main components are:
//! - `Topology` trait: capability set for deriving names and queue arguments
//! - `DirectTopology`: expired delay messages are routed straight back to the
//!   canonical queue
//! - `RoutedTopology`: expired delay messages are routed to the dead letter
//!   queue, optionally forwarded onward to the canonical queue
//!
//! Everything here is pure computation; no I/O happens in this module.

use std::collections::BTreeMap;

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};

use crate::errors::BrokerError;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify the maximum priority level
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// Suffix appended to a canonical queue name for its delay queue
pub const DELAY_QUEUE_SUFFIX: &str = ".DQ";
/// Suffix appended to a canonical queue name for its dead letter queue
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".XQ";

/// Default retention for dead-lettered messages: 7 days in milliseconds.
pub const DEFAULT_DEAD_LETTER_MESSAGE_TTL: u64 = 86_400_000 * 7;

/// The physical queue names derived from one logical queue name.
///
/// The mapping is a pure function of the logical name; the three names are
/// pairwise distinct by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueNameSet {
    /// The queue workers actually consume from.
    pub canonical: String,
    /// Holds messages until their per-message TTL expires.
    pub delayed: String,
    /// Destination for expired or rejected messages.
    pub dead_letter: String,
}

/// Returns the canonical queue name for a given queue name.
///
/// If the given name already belongs to a delay or dead letter queue, the
/// suffix is stripped so the mapping is idempotent.
pub fn canonical_queue_name(queue_name: &str) -> String {
    queue_name
        .strip_suffix(DELAY_QUEUE_SUFFIX)
        .or_else(|| queue_name.strip_suffix(DEAD_LETTER_QUEUE_SUFFIX))
        .unwrap_or(queue_name)
        .to_owned()
}

/// Returns the delay queue name for a given queue name.
pub fn delay_queue_name(queue_name: &str) -> String {
    format!("{}{}", canonical_queue_name(queue_name), DELAY_QUEUE_SUFFIX)
}

/// Returns the dead letter queue name for a given queue name.
pub fn dead_letter_queue_name(queue_name: &str) -> String {
    format!(
        "{}{}",
        canonical_queue_name(queue_name),
        DEAD_LETTER_QUEUE_SUFFIX
    )
}

/// Value object describing a topology instance. Created once at broker
/// construction and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Declare queues as durable, persisting across broker restarts.
    pub durable: bool,
    /// Auto-delete queues when no longer used.
    pub auto_delete: bool,
    /// Maximum priority level (0-255) the canonical queue should support.
    pub max_priority: Option<u8>,
    /// Retention TTL in milliseconds for dead-lettered messages.
    pub dead_letter_message_ttl: Option<u64>,
    /// Ceiling in milliseconds for per-message delays. `None` means
    /// unlimited; when set it is also applied as an `x-message-ttl` failsafe
    /// on the delay queue.
    pub max_delay: Option<u64>,
    /// Exchange dead-lettered messages are routed through. The default
    /// exchange (empty string) routes by queue name.
    pub dead_letter_exchange: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            durable: true,
            auto_delete: false,
            max_priority: None,
            dead_letter_message_ttl: Some(DEFAULT_DEAD_LETTER_MESSAGE_TTL),
            max_delay: None,
            dead_letter_exchange: "".to_owned(),
        }
    }
}

/// Capability set for topology implementations.
///
/// Implementations differ only in how the delay and dead letter queues are
/// chained; name derivation and delay validation are shared.
pub trait Topology: Send + Sync {
    /// The configuration this topology was constructed with.
    fn config(&self) -> &TopologyConfig;

    /// Derives all physical queue names for a logical queue name.
    fn name_set(&self, queue_name: &str) -> QueueNameSet {
        QueueNameSet {
            canonical: canonical_queue_name(queue_name),
            delayed: delay_queue_name(queue_name),
            dead_letter: dead_letter_queue_name(queue_name),
        }
    }

    /// Arguments for the canonical queue.
    ///
    /// Unless suppressed, the canonical queue dead-letters into its own dead
    /// letter queue. Max-priority is added when configured.
    fn canonical_arguments(&self, queue_name: &str, with_dead_letter: bool) -> FieldTable {
        let cfg = self.config();
        let mut args = BTreeMap::new();

        if with_dead_letter {
            insert_dead_letter_chain(
                &mut args,
                &cfg.dead_letter_exchange,
                &dead_letter_queue_name(queue_name),
            );
        }

        if let Some(max_priority) = cfg.max_priority {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
                AMQPValue::LongInt(i32::from(max_priority)),
            );
        }

        FieldTable::from(args)
    }

    /// Arguments for the delay queue.
    ///
    /// Dead-letter linkage out of the delay queue is mandatory; without it,
    /// expired messages would never leave the delay queue.
    fn delay_arguments(&self, queue_name: &str) -> FieldTable;

    /// Arguments for the dead letter queue.
    fn dead_letter_arguments(&self, queue_name: &str) -> FieldTable;

    /// Fails with `DelayTooLong` when a delay ceiling is configured and the
    /// requested delay exceeds it. Runs before any network call.
    fn validate_delay(&self, queue_name: &str, delay_ms: u64) -> Result<(), BrokerError> {
        match self.config().max_delay {
            Some(max) if delay_ms > max => Err(BrokerError::DelayTooLong {
                requested: delay_ms,
                max,
                queue: canonical_queue_name(queue_name),
            }),
            _ => Ok(()),
        }
    }

    /// Declare options shared by all three queues of a name set.
    fn declare_options(&self) -> QueueDeclareOptions {
        let cfg = self.config();
        QueueDeclareOptions {
            passive: false,
            durable: cfg.durable,
            exclusive: false,
            auto_delete: cfg.auto_delete,
            nowait: false,
        }
    }
}

fn insert_dead_letter_chain(
    args: &mut BTreeMap<ShortString, AMQPValue>,
    exchange: &str,
    routing_key: &str,
) {
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(exchange)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(routing_key)),
    );
}

// TTL arguments must be integers; RabbitMQ rejects float TTL values.
fn insert_message_ttl(args: &mut BTreeMap<ShortString, AMQPValue>, ttl_ms: u64) {
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongLongInt(ttl_ms as i64),
    );
}

/// Standard topology: a message expiring in the delay queue is dead-lettered
/// straight back to the canonical queue.
#[derive(Debug, Clone, Default)]
pub struct DirectTopology {
    config: TopologyConfig,
}

impl DirectTopology {
    pub fn new(config: TopologyConfig) -> Self {
        DirectTopology { config }
    }
}

impl Topology for DirectTopology {
    fn config(&self) -> &TopologyConfig {
        &self.config
    }

    fn delay_arguments(&self, queue_name: &str) -> FieldTable {
        let cfg = self.config();
        let mut args = BTreeMap::new();

        if let Some(max_priority) = cfg.max_priority {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
                AMQPValue::LongInt(i32::from(max_priority)),
            );
        }

        insert_dead_letter_chain(
            &mut args,
            &cfg.dead_letter_exchange,
            &canonical_queue_name(queue_name),
        );

        // Failsafe against messages stuck in the delay queue: the broker
        // expires anything older than the delay ceiling.
        if let Some(max_delay) = cfg.max_delay {
            insert_message_ttl(&mut args, max_delay);
        }

        FieldTable::from(args)
    }

    fn dead_letter_arguments(&self, _queue_name: &str) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.config.dead_letter_message_ttl {
            insert_message_ttl(&mut args, ttl);
        }

        FieldTable::from(args)
    }
}

/// Alternative topology: a message expiring in the delay queue is routed to
/// the dead letter queue instead of the canonical queue.
///
/// With `forward_to_canonical` the dead letter queue itself dead-letters back
/// to the canonical queue; without it messages stay in the dead letter queue
/// for manual processing. Both are deliberate configuration choices.
#[derive(Debug, Clone)]
pub struct RoutedTopology {
    config: TopologyConfig,
    forward_to_canonical: bool,
}

impl RoutedTopology {
    pub fn new(mut config: TopologyConfig, forward_to_canonical: bool) -> Self {
        if !forward_to_canonical {
            // The dead letter queue is a terminal store here; expiring its
            // messages would silently drop them.
            config.dead_letter_message_ttl = None;
        }
        RoutedTopology {
            config,
            forward_to_canonical,
        }
    }
}

impl Topology for RoutedTopology {
    fn config(&self) -> &TopologyConfig {
        &self.config
    }

    fn delay_arguments(&self, queue_name: &str) -> FieldTable {
        let cfg = self.config();
        let mut args = BTreeMap::new();

        if let Some(max_priority) = cfg.max_priority {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
                AMQPValue::LongInt(i32::from(max_priority)),
            );
        }

        insert_dead_letter_chain(
            &mut args,
            &cfg.dead_letter_exchange,
            &dead_letter_queue_name(queue_name),
        );

        if let Some(max_delay) = cfg.max_delay {
            insert_message_ttl(&mut args, max_delay);
        }

        FieldTable::from(args)
    }

    fn dead_letter_arguments(&self, queue_name: &str) -> FieldTable {
        let cfg = self.config();
        let mut args = BTreeMap::new();

        if self.forward_to_canonical {
            insert_dead_letter_chain(
                &mut args,
                &cfg.dead_letter_exchange,
                &canonical_queue_name(queue_name),
            );
        }

        if let Some(ttl) = cfg.dead_letter_message_ttl {
            insert_message_ttl(&mut args, ttl);
        }

        FieldTable::from(args)
    }
}
