// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tuning of payload senders and the writers built on them.

use std::time::Duration;
use zstd::zstd_safe::CompressionLevel;

pub const DEFAULT_COMPRESSION_LEVEL: CompressionLevel = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct SenderConfig {
    /// Payloads waiting for delivery, not counting the one in flight.
    pub queue_capacity: usize,
    /// How long `send` waits for queue space before reporting the queue as full.
    pub enqueue_timeout: Duration,
    /// Retries after the first attempt before a retriable failure becomes final.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Events buffered per monitor subscriber before the oldest are dropped.
    pub monitor_capacity: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            enqueue_timeout: Duration::from_secs(1),
            max_retries: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(60),
            monitor_capacity: 1024,
        }
    }
}

impl SenderConfig {
    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatsWriterConfig {
    /// Entries (aggregation keys) per payload. Buckets larger than this are split.
    pub max_entries_per_payload: usize,
    pub compression_level: Option<CompressionLevel>,
    pub sender: SenderConfig,
}

impl Default for StatsWriterConfig {
    fn default() -> Self {
        Self {
            max_entries_per_payload: 12_000,
            compression_level: Some(DEFAULT_COMPRESSION_LEVEL),
            sender: SenderConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TraceWriterConfig {
    pub max_spans_per_payload: usize,
    pub flush_period: Duration,
    pub compression_level: Option<CompressionLevel>,
    pub sender: SenderConfig,
}

impl Default for TraceWriterConfig {
    fn default() -> Self {
        Self {
            max_spans_per_payload: 1_000,
            flush_period: Duration::from_secs(5),
            compression_level: Some(DEFAULT_COMPRESSION_LEVEL),
            sender: SenderConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceWriterConfig {
    pub flush_period: Duration,
    pub sender: SenderConfig,
}

impl Default for ServiceWriterConfig {
    fn default() -> Self {
        Self {
            flush_period: Duration::from_secs(5),
            sender: SenderConfig::default(),
        }
    }
}
