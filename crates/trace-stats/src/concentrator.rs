// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routes spans into fixed-size time buckets and flushes the buckets once their window
//! has elapsed.
//!
//! ```text
//! handle_span ──► [bucket set, one lock] ◄── flush (every bucket interval)
//!                                               │
//!                                               ▼
//!                                    mpsc::Sender<Vec<StatsBucket>>
//! ```
//!
//! A bucket covering `[start, start + interval)` is flushed once
//! `start + interval <= now - lateness`. Flushing closes every window up to that point:
//! spans arriving later for a closed window are dropped and counted, never re-opening a
//! bucket. Spans starting beyond the window after the current one are dropped and
//! counted as well, so skewed clocks cannot grow the bucket set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::StatsError;
use crate::span::Span;
use crate::stats_bucket::{AggregationKey, StatsBucket};

/// Default width of a stats bucket.
pub const DEFAULT_BUCKET_INTERVAL: Duration = Duration::from_secs(10);

/// Extra aggregator used when none is configured.
pub const DEFAULT_EXTRA_AGGREGATOR: &str = "http.status_code";

#[derive(Clone, Debug)]
pub struct ConcentratorConfig {
    /// Width of every bucket.
    pub bucket_interval: Duration,
    /// How long after its window ends a bucket stays open for late spans.
    pub lateness: Duration,
    /// Span tags added to service, name and resource to form the aggregation key.
    pub extra_aggregators: Vec<String>,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            bucket_interval: DEFAULT_BUCKET_INTERVAL,
            lateness: DEFAULT_BUCKET_INTERVAL,
            extra_aggregators: vec![DEFAULT_EXTRA_AGGREGATOR.to_string()],
        }
    }
}

#[derive(Default)]
struct ConcentratorState {
    buckets: BTreeMap<u64, StatsBucket>,
    /// Every window ending at or before this timestamp has been flushed.
    closed_until: u64,
    late_since_flush: u64,
    future_since_flush: u64,
}

pub struct Concentrator {
    bucket_interval: u64,
    lateness: u64,
    aggregators: Vec<String>,
    state: Mutex<ConcentratorState>,
    late_spans: AtomicU64,
    future_spans: AtomicU64,
}

impl Concentrator {
    pub fn new(config: ConcentratorConfig) -> Result<Self, StatsError> {
        let bucket_interval = duration_to_ns(config.bucket_interval);
        if bucket_interval == 0 {
            return Err(StatsError::InvalidInterval);
        }
        Ok(Self {
            bucket_interval,
            lateness: duration_to_ns(config.lateness),
            aggregators: config.extra_aggregators,
            state: Mutex::new(ConcentratorState::default()),
            late_spans: AtomicU64::new(0),
            future_spans: AtomicU64::new(0),
        })
    }

    pub fn bucket_interval(&self) -> Duration {
        Duration::from_nanos(self.bucket_interval)
    }

    /// Start of the window containing `timestamp` (ns since epoch).
    pub fn bucket_start(&self, timestamp: u64) -> u64 {
        timestamp - timestamp % self.bucket_interval
    }

    /// Aggregates `span` into the bucket of its start time, its duration being fed into the
    /// duration distribution with the extrapolation `weight`.
    ///
    /// Invalid input is rejected before the bucket set is touched. A span for an already
    /// flushed window is dropped and counted in [`Concentrator::late_spans`], one starting
    /// after the next window in [`Concentrator::future_spans`].
    pub fn handle_span(&self, span: &Span, weight: f64) -> Result<(), StatsError> {
        self.handle_span_at(span, weight, SystemTime::now())
    }

    fn handle_span_at(
        &self,
        span: &Span,
        weight: f64,
        now: SystemTime,
    ) -> Result<(), StatsError> {
        let start =
            u64::try_from(span.start).map_err(|_| StatsError::InvalidTimestamp(span.start))?;
        let weight = distribution_weight(weight)?;
        let key = AggregationKey::from_span(span, &self.aggregators)?;
        let bucket_start = self.bucket_start(start);
        let horizon = self
            .bucket_start(system_time_to_ns(now))
            .saturating_add(self.bucket_interval);

        let mut state = self.lock()?;
        if bucket_start > horizon {
            state.future_since_flush += 1;
            self.future_spans.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping span starting in bucket {bucket_start}, past {horizon} (service: {}, name: {})",
                span.service, span.name
            );
            return Ok(());
        }
        if bucket_start < state.closed_until {
            state.late_since_flush += 1;
            self.late_spans.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping late span for flushed bucket {bucket_start} (service: {}, name: {})",
                span.service, span.name
            );
            return Ok(());
        }
        let interval = self.bucket_interval;
        state
            .buckets
            .entry(bucket_start)
            .or_insert_with(|| StatsBucket::new(bucket_start, interval))
            .add(key, span, weight)
    }

    /// Removes and returns, oldest first, every bucket whose window ended before
    /// `now - lateness`.
    pub fn flush(&self, now: SystemTime) -> Result<Vec<StatsBucket>, StatsError> {
        let cutoff = system_time_to_ns(now).saturating_sub(self.lateness);
        let closed = self.bucket_start(cutoff);

        let mut state = self.lock()?;
        if state.late_since_flush > 0 {
            warn!(
                "Dropped {} spans arriving after their stats bucket was flushed",
                state.late_since_flush
            );
            state.late_since_flush = 0;
        }
        if state.future_since_flush > 0 {
            warn!(
                "Dropped {} spans starting too far in the future",
                state.future_since_flush
            );
            state.future_since_flush = 0;
        }
        if closed <= state.closed_until {
            return Ok(Vec::new());
        }
        let remaining = state.buckets.split_off(&closed);
        let flushed = std::mem::replace(&mut state.buckets, remaining);
        state.closed_until = closed;

        let buckets: Vec<StatsBucket> = flushed.into_values().collect();
        if !buckets.is_empty() {
            debug!("Flushing {} stats buckets", buckets.len());
        }
        Ok(buckets)
    }

    /// Removes and returns every bucket, including those still open. Used on shutdown.
    pub fn force_flush(&self) -> Result<Vec<StatsBucket>, StatsError> {
        let mut state = self.lock()?;
        let flushed = std::mem::take(&mut state.buckets);
        if let Some(last) = flushed.values().next_back() {
            state.closed_until = state.closed_until.max(last.end());
        }
        Ok(flushed.into_values().collect())
    }

    /// Total number of spans dropped because their bucket had already been flushed.
    pub fn late_spans(&self) -> u64 {
        self.late_spans.load(Ordering::Relaxed)
    }

    /// Total number of spans dropped because they started after the next window.
    pub fn future_spans(&self) -> u64 {
        self.future_spans.load(Ordering::Relaxed)
    }

    /// Window starts of the buckets currently open, oldest first.
    pub fn bucket_starts(&self) -> Result<Vec<u64>, StatsError> {
        Ok(self.lock()?.buckets.keys().copied().collect())
    }

    /// Flushes completed buckets to `out` on every bucket boundary until `cancel` fires,
    /// then force flushes whatever is left.
    pub async fn run(
        self: Arc<Self>,
        out: mpsc::Sender<Vec<StatsBucket>>,
        cancel: CancellationToken,
    ) {
        let period = self.bucket_interval();
        let first_tick = Instant::now() + self.until_next_boundary(SystemTime::now());
        let mut ticker = interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Stats concentrator started, bucket interval {period:?}");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    match self.force_flush() {
                        Ok(buckets) => {
                            Self::emit(&out, buckets).await;
                        }
                        Err(e) => error!("Failed to force flush stats buckets: {e}"),
                    }
                    break;
                }
                _ = ticker.tick() => {
                    match self.flush(SystemTime::now()) {
                        Ok(buckets) => {
                            if !Self::emit(&out, buckets).await {
                                break;
                            }
                        }
                        Err(e) => error!("Failed to flush stats buckets: {e}"),
                    }
                }
            }
        }
        debug!("Stats concentrator stopped");
    }

    async fn emit(out: &mpsc::Sender<Vec<StatsBucket>>, buckets: Vec<StatsBucket>) -> bool {
        if buckets.is_empty() {
            return true;
        }
        let count = buckets.len();
        if out.send(buckets).await.is_err() {
            error!("Stats writer channel closed, dropping {count} flushed buckets");
            return false;
        }
        true
    }

    fn until_next_boundary(&self, now: SystemTime) -> Duration {
        let elapsed = system_time_to_ns(now) % self.bucket_interval;
        Duration::from_nanos(self.bucket_interval - elapsed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConcentratorState>, StatsError> {
        self.state.lock().map_err(|_| StatsError::LockPoisoned)
    }
}

fn distribution_weight(weight: f64) -> Result<u64, StatsError> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(StatsError::InvalidWeight(weight));
    }
    if weight == 0.0 {
        return Ok(0);
    }
    Ok(weight.round().max(1.0) as u64)
}

fn duration_to_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn system_time_to_ns(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(duration_to_ns)
        .unwrap_or(0)
}
