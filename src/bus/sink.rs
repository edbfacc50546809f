// src/bus/sink.rs

use std::sync::{Mutex, PoisonError};
use tracing::{error, warn};

use super::errors::BusError;

/// One failure observed while a subscription was running.
#[derive(Debug)]
pub struct DispatchFailure {
    pub queue: String,
    /// Absent for transport faults that are not tied to a delivery.
    pub message_id: Option<String>,
    pub error: BusError,
}

impl DispatchFailure {
    /// A transport fault the broker may recover from without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(&self.error, BusError::Transport(err) if err.is_transient())
    }
}

/// The single `on_error` channel of every subscription.
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: DispatchFailure);
}

/// Logs every failure through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, failure: DispatchFailure) {
        match &failure.message_id {
            Some(message_id) => error!(
                queue = %failure.queue,
                message_id = %message_id,
                error = %failure.error,
                "Message dispatch failed"
            ),
            None if failure.is_transient() => warn!(
                queue = %failure.queue,
                error = %failure.error,
                "Subscription hit a transient transport fault"
            ),
            None => error!(
                queue = %failure.queue,
                error = %failure.error,
                "Subscription reported an error"
            ),
        }
    }
}

/// Keeps failures in memory; handy for tests and health probes.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    failures: Mutex<Vec<DispatchFailure>>,
}

impl CollectingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<DispatchFailure> {
        std::mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ErrorSink for CollectingErrorSink {
    fn report(&self, failure: DispatchFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}
