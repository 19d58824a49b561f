// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching of sampled traces into trace payloads.
//!
//! Traces are buffered until `max_spans_per_payload` spans are waiting or
//! `flush_period` elapses, whichever comes first. On stop, traces still in the channel
//! are drained and flushed.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use trace_stats::span::Span;

use crate::config::TraceWriterConfig;
use crate::endpoint::Endpoint;
use crate::errors::WriterError;
use crate::payload::Payload;
use crate::sender::PayloadSender;

pub type Trace = Vec<Span>;

#[derive(Serialize)]
struct TracePayload<'a> {
    hostname: &'a str,
    env: &'a str,
    traces: &'a [Trace],
}

pub struct TraceWriter<E: Endpoint> {
    config: TraceWriterConfig,
    hostname: String,
    env: String,
    sender: Arc<PayloadSender<E>>,
    traces: Vec<Trace>,
    spans: usize,
}

impl<E: Endpoint> TraceWriter<E> {
    pub fn new(
        config: TraceWriterConfig,
        hostname: String,
        env: String,
        sender: Arc<PayloadSender<E>>,
    ) -> Self {
        Self {
            config,
            hostname,
            env,
            sender,
            traces: Vec::new(),
            spans: 0,
        }
    }

    pub async fn run(mut self, mut traces: mpsc::Receiver<Trace>, cancel: CancellationToken) {
        let period = self.config.flush_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                trace = traces.recv() => match trace {
                    Some(trace) => self.add(trace).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush_logged().await,
            }
        }

        traces.close();
        while let Ok(trace) = traces.try_recv() {
            self.add(trace).await;
        }
        self.flush_logged().await;
        debug!("Trace writer stopped");
    }

    /// Buffers `trace`, flushing when the span limit is reached.
    pub async fn add(&mut self, trace: Trace) {
        if trace.is_empty() {
            return;
        }
        self.spans += trace.len();
        self.traces.push(trace);
        if self.spans >= self.config.max_spans_per_payload {
            self.flush_logged().await;
        }
    }

    /// Spans currently buffered.
    pub fn buffered_spans(&self) -> usize {
        self.spans
    }

    /// Sends every buffered trace as one payload.
    pub async fn flush(&mut self) -> Result<(), WriterError> {
        if self.traces.is_empty() {
            return Ok(());
        }
        let traces = std::mem::take(&mut self.traces);
        let spans = std::mem::replace(&mut self.spans, 0);
        let body = TracePayload {
            hostname: &self.hostname,
            env: &self.env,
            traces: &traces,
        };
        let payload = Payload::json(&body, traces.len(), self.config.compression_level)?;
        debug!(
            "Flushing {} traces ({spans} spans, {} bytes)",
            traces.len(),
            payload.len()
        );
        self.sender.send(payload).await?;
        Ok(())
    }

    async fn flush_logged(&mut self) {
        if let Err(e) = self.flush().await {
            error!("Failed to flush traces: {e}");
        }
    }
}
