// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Task-Queue Engine
//!
//! This module provides the error taxonomy for broker operations. The
//! `BrokerError` enum covers validation failures (caught before any network
//! call), topology conflicts reported by the broker, bounded-wait timeouts,
//! and transport failures. Transient errors are retried by the declare and
//! publish pipelines up to their configured attempt budgets; everything else
//! is surfaced to the caller unchanged.

use thiserror::Error;

/// Represents errors that can occur during broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// A requested message delay exceeds the topology's configured ceiling.
    /// Raised before any network I/O and never retried.
    #[error("message delay {requested}ms exceeds max delay {max}ms for queue `{queue}`")]
    DelayTooLong {
        /// Requested delay in milliseconds
        requested: u64,
        /// Configured maximum delay in milliseconds
        max: u64,
        /// Logical queue the message was being enqueued on
        queue: String,
    },

    /// The broker rejected a queue declaration because the queue already
    /// exists with incompatible arguments. Not retried: the broker's declared
    /// state does not change between attempts.
    #[error("queue `{queue}` exists with incompatible arguments: {reason}")]
    TopologyConflict { queue: String, reason: String },

    /// Publisher confirmation was not received within the deadlock-protection
    /// window. Retryable within the enqueue attempt budget.
    #[error("no publisher confirm for queue `{queue}` within {timeout_ms}ms")]
    ConfirmTimeout { queue: String, timeout_ms: u64 },

    /// The broker returned a mandatory message as unroutable. Retryable: the
    /// destination queue is re-declared before the next attempt.
    #[error("message for queue `{queue}` could not be routed")]
    Unroutable { queue: String },

    /// The broker negatively confirmed a publish without returning it.
    #[error("publish to queue `{queue}` was rejected by the broker")]
    PublishRejected { queue: String },

    /// Resource-pool acquisition did not complete within the acquire timeout.
    #[error("no pooled resource became available within {timeout_ms}ms")]
    AcquireTimeout { timeout_ms: u64 },

    /// A blocking acknowledgment did not complete within the ack timeout.
    #[error("acknowledgment was not confirmed within {timeout_ms}ms")]
    AckTimeout { timeout_ms: u64 },

    /// The broker handle was closed; no further operations are possible.
    #[error("broker is closed")]
    Closed,

    /// Any transport-level failure (connection, channel or protocol error).
    /// Retried with a fresh resource up to the configured attempt budget.
    #[error("transport failure")]
    Transport(#[from] lapin::Error),
}

impl BrokerError {
    /// Whether a retry with a fresh resource can plausibly succeed.
    ///
    /// Validation errors and fatal topology conflicts are excluded: retrying
    /// cannot change the input or the broker's existing declared state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Transport(_)
                | BrokerError::ConfirmTimeout { .. }
                | BrokerError::Unroutable { .. }
                | BrokerError::PublishRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_too_long_is_not_transient() {
        let err = BrokerError::DelayTooLong {
            requested: 7_200_000,
            max: 3_600_000,
            queue: "orders".to_owned(),
        };
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "message delay 7200000ms exceeds max delay 3600000ms for queue `orders`"
        );
    }

    #[test]
    fn conflict_is_not_transient_but_confirm_timeout_is() {
        let conflict = BrokerError::TopologyConflict {
            queue: "orders".to_owned(),
            reason: "invalid arg 'x-message-ttl'".to_owned(),
        };
        assert!(!conflict.is_transient());

        let timeout = BrokerError::ConfirmTimeout {
            queue: "orders".to_owned(),
            timeout_ms: 5000,
        };
        assert!(timeout.is_transient());
    }
}
