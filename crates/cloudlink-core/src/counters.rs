//! # Dispatch Counters
//!
//! Process-wide running totals for the message dispatcher. Mutated only
//! inside the scheduler sweep; read externally (diagnostics resources,
//! tests) without synchronization stronger than the atomics themselves —
//! eventual consistency is the stated bar for these numbers.
//!
//! Reset only through the administrative reset resource.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals of dispatcher activity.
#[derive(Debug, Default)]
pub struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_retried: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Point-in-time copy of the counters, serializable for the diagnostics
/// resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_retried: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
}

impl Counters {
    pub fn new() -> Self {
        Counters::default()
    }

    pub fn add_sent(&self, messages: u64, bytes: u64) {
        self.messages_sent.fetch_add(messages, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, messages: u64, bytes: u64) {
        self.messages_received.fetch_add(messages, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_retried(&self, messages: u64) {
        self.messages_retried.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn add_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all totals.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_retried: self.messages_retried.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Administrative reset; the only way totals go backwards.
    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.messages_retried.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.protocol_errors.store(0, Ordering::Relaxed);
    }
}
