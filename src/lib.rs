// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # taskmq
//!
//! AMQP task-queue engine: queue topology with per-queue delay and dead
//! letter queues, pooled connections and channels, confirmed publishes with
//! bounded retries, and consumption with blocking or deferred
//! acknowledgments.
//!
//! The entry point is [`broker::Broker`], configured through
//! [`config::BrokerConfig`] and one of the [`topology::Topology`]
//! implementations.

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod declare;
pub mod errors;
pub mod publisher;
pub mod topology;
