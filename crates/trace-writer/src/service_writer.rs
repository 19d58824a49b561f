// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ServiceWriterConfig;
use crate::endpoint::Endpoint;
use crate::errors::WriterError;
use crate::payload::Payload;
use crate::sender::PayloadSender;

pub const APP_TYPE: &str = "app_type";

/// Metadata of every known service: service name to its attributes (`app_type`, ...).
pub type ServicesMetadata = BTreeMap<String, BTreeMap<String, String>>;

/// Publishes service metadata when it changes.
///
/// Updates are merged into the known metadata; the full metadata is sent on the next
/// period after any change.
pub struct ServiceWriter<E: Endpoint> {
    config: ServiceWriterConfig,
    sender: Arc<PayloadSender<E>>,
    services: ServicesMetadata,
    changed: bool,
}

impl<E: Endpoint> ServiceWriter<E> {
    pub fn new(config: ServiceWriterConfig, sender: Arc<PayloadSender<E>>) -> Self {
        Self {
            config,
            sender,
            services: ServicesMetadata::new(),
            changed: false,
        }
    }

    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<ServicesMetadata>,
        cancel: CancellationToken,
    ) {
        let period = self.config.flush_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => self.update(update),
                    None => break,
                },
                _ = ticker.tick() => self.flush_logged().await,
            }
        }

        updates.close();
        while let Ok(update) = updates.try_recv() {
            self.update(update);
        }
        self.flush_logged().await;
        debug!("Service writer stopped");
    }

    /// Merges `update` into the known metadata.
    pub fn update(&mut self, update: ServicesMetadata) {
        for (service, attributes) in update {
            let known = self.services.entry(service).or_default();
            for (key, value) in attributes {
                if known.get(&key) != Some(&value) {
                    known.insert(key, value);
                    self.changed = true;
                }
            }
        }
    }

    pub fn services(&self) -> &ServicesMetadata {
        &self.services
    }

    /// Sends the known metadata if it changed since the last flush.
    pub async fn flush(&mut self) -> Result<bool, WriterError> {
        if !self.changed {
            return Ok(false);
        }
        let payload = Payload::json(&self.services, self.services.len(), None)?;
        debug!("Flushing metadata of {} services", self.services.len());
        self.changed = false;
        self.sender.send(payload).await?;
        Ok(true)
    }

    async fn flush_logged(&mut self) {
        if let Err(e) = self.flush().await {
            error!("Failed to flush service metadata: {e}");
        }
    }
}
