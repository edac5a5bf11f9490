//! Progress notifications emitted while an invocation runs.
//!
//! Sinks are called synchronously on the stdout-reading path, so they must
//! return quickly. [`BoundedSink`] hands events to another thread through a
//! bounded channel and drops them when the consumer falls behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use serde::Serialize;

use crate::core::types::TokenUsage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A stdout chunk arrived.
    Output {
        bytes: usize,
        tokens_used: TokenUsage,
        turns_used: u32,
        chunk: String,
    },
    /// Structured output failed validation and a continuation is being sent.
    SchemaRetry {
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    /// An auth failure was detected and the call is re-run with the API key.
    AuthFallback { reason: String },
    /// A rate-limited invocation is being retried after a delay.
    RateLimitBackoff { attempt: u32, delay_ms: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn notify(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn notify(&self, event: &ProgressEvent) {
        self(event);
    }
}

/// Fire-and-forget sink backed by a bounded channel.
#[derive(Debug)]
pub struct BoundedSink {
    tx: SyncSender<ProgressEvent>,
    dropped: AtomicUsize,
}

impl BoundedSink {
    pub fn new(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = sync_channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Events discarded because the channel was full or closed.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ProgressSink for BoundedSink {
    fn notify(&self, event: &ProgressEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
