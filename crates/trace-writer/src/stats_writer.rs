// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use trace_stats::stats_bucket::StatsBucket;

use crate::config::StatsWriterConfig;
use crate::endpoint::Endpoint;
use crate::errors::WriterError;
use crate::payload::Payload;
use crate::sender::PayloadSender;

#[derive(Serialize)]
struct StatsPayload<'a> {
    hostname: &'a str,
    env: &'a str,
    stats: &'a [StatsBucket],
}

/// Serializes flushed stats buckets into payloads for the stats sender.
pub struct StatsWriter<E: Endpoint> {
    config: StatsWriterConfig,
    hostname: String,
    env: String,
    sender: Arc<PayloadSender<E>>,
}

impl<E: Endpoint> StatsWriter<E> {
    pub fn new(
        config: StatsWriterConfig,
        hostname: String,
        env: String,
        sender: Arc<PayloadSender<E>>,
    ) -> Self {
        Self {
            config,
            hostname,
            env,
            sender,
        }
    }

    /// Writes every batch received until the channel closes.
    pub async fn run(self, mut buckets: mpsc::Receiver<Vec<StatsBucket>>) {
        while let Some(batch) = buckets.recv().await {
            if let Err(e) = self.write(batch).await {
                error!("Failed to write stats: {e}");
            }
        }
        debug!("Stats writer stopped");
    }

    /// Sends `buckets` as one or more payloads, returning how many were queued.
    pub async fn write(&self, buckets: Vec<StatsBucket>) -> Result<usize, WriterError> {
        let payloads = self.build_payloads(buckets)?;
        let count = payloads.len();
        for payload in payloads {
            self.sender.send(payload).await?;
        }
        Ok(count)
    }

    /// Packs `buckets` into payloads of at most `max_entries_per_payload` entries,
    /// splitting buckets that do not fit on their own.
    pub fn build_payloads(&self, buckets: Vec<StatsBucket>) -> Result<Vec<Payload>, WriterError> {
        let max_entries = self.config.max_entries_per_payload.max(1);
        let mut payloads = Vec::new();
        let mut batch: Vec<StatsBucket> = Vec::new();
        let mut entries = 0;

        for bucket in buckets
            .into_iter()
            .filter(|b| !b.is_empty())
            .flat_map(|b| b.split(max_entries))
        {
            if entries + bucket.len() > max_entries && !batch.is_empty() {
                payloads.push(self.payload(&batch, entries)?);
                batch.clear();
                entries = 0;
            }
            entries += bucket.len();
            batch.push(bucket);
        }
        if !batch.is_empty() {
            payloads.push(self.payload(&batch, entries)?);
        }
        Ok(payloads)
    }

    fn payload(&self, buckets: &[StatsBucket], entries: usize) -> Result<Payload, WriterError> {
        let body = StatsPayload {
            hostname: &self.hostname,
            env: &self.env,
            stats: buckets,
        };
        debug!(
            "Built stats payload with {} buckets and {entries} entries",
            buckets.len()
        );
        Payload::json(&body, entries, self.config.compression_level)
    }
}
