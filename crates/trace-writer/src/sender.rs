// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reliable, retrying delivery of payloads to one endpoint.
//!
//! ```text
//! send() ──► [bounded queue] ──► delivery loop ──► Endpoint::write
//!   │ (waits up to enqueue_timeout)     │
//!   ▼                                   ▼
//! Failure{QueueFull}          broadcast ──► monitors
//! ```
//!
//! The delivery loop writes one payload at a time, in queue order. A retriable error is
//! retried `max_retries` times with exponential backoff, each retry announced by a
//! [`SenderEvent::Retry`]. Every payload accepted or refused by the sender ends in exactly
//! one [`SenderEvent::Success`] or [`SenderEvent::Failure`].

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::SenderConfig;
use crate::endpoint::Endpoint;
use crate::errors::SenderError;
use crate::event::{SendStats, SenderEvent};
use crate::payload::Payload;

pub struct PayloadSender<E: Endpoint> {
    config: SenderConfig,
    endpoint: Arc<E>,
    queue: mpsc::Sender<Payload>,
    /// Consumer side of the queue, moved into the delivery loop on `start`.
    pending: Mutex<Option<mpsc::Receiver<Payload>>>,
    events: broadcast::Sender<SenderEvent>,
    /// Payloads accepted and not yet reported as delivered or failed.
    outstanding: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Endpoint> PayloadSender<E> {
    pub fn new(endpoint: E, config: SenderConfig) -> Self {
        let (queue, pending) = mpsc::channel(config.queue_capacity.max(1));
        let (events, _) = broadcast::channel(config.monitor_capacity.max(1));
        let (outstanding, _) = watch::channel(0);
        let outstanding = Arc::new(outstanding);
        Self {
            config,
            endpoint: Arc::new(endpoint),
            queue,
            pending: Mutex::new(Some(pending)),
            events,
            outstanding,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Spawns the delivery loop. Calling it again, or after `stop`, does nothing.
    pub fn start(&self) {
        let Some(queue) = self.take_pending() else {
            return;
        };
        let delivery = Delivery {
            config: self.config.clone(),
            endpoint: Arc::clone(&self.endpoint),
            queue,
            events: self.events.clone(),
            outstanding: Arc::clone(&self.outstanding),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(delivery.run());
        match self.task.lock() {
            Ok(mut task) => *task = Some(handle),
            Err(_) => error!("Payload sender task lock poisoned, the sender cannot be stopped"),
        }
        debug!("Payload sender for {} started", self.endpoint.name());
    }

    /// Queues `payload` for delivery, waiting up to `enqueue_timeout` for space.
    ///
    /// A payload that cannot be queued is reported both to the caller and to monitors
    /// through a non-retriable [`SenderEvent::Failure`].
    pub async fn send(&self, payload: Payload) -> Result<(), SenderError> {
        if self.cancel.is_cancelled() {
            self.refuse(payload, SenderError::Stopped);
            return Err(SenderError::Stopped);
        }
        self.outstanding.send_modify(|n| *n += 1);
        let result = self
            .queue
            .send_timeout(payload, self.config.enqueue_timeout)
            .await;
        if result.is_err() {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
        match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(payload)) => {
                warn!(
                    "Payload queue for {} full after {:?}, dropping {} bytes",
                    self.endpoint.name(),
                    self.config.enqueue_timeout,
                    payload.len()
                );
                self.refuse(payload, SenderError::QueueFull);
                Err(SenderError::QueueFull)
            }
            Err(mpsc::error::SendTimeoutError::Closed(payload)) => {
                self.refuse(payload, SenderError::Stopped);
                Err(SenderError::Stopped)
            }
        }
    }

    /// Stops the sender and waits for the delivery loop to exit.
    ///
    /// A write in flight completes; a payload waiting for its next retry and every payload
    /// still queued are reported as failed with [`SenderError::Stopped`].
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Payload sender task failed: {e}");
            }
        }
        // never started: whatever was queued is abandoned here
        if let Some(mut queue) = self.take_pending() {
            abandon_queued(
                &mut queue,
                &self.events,
                &self.outstanding,
                self.endpoint.name(),
            );
        }
        debug!("Payload sender for {} stopped", self.endpoint.name());
    }

    /// Waits until every accepted payload has been delivered or has failed, for at most
    /// `timeout`. Returns whether the sender went idle.
    pub async fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let mut outstanding = self.outstanding.subscribe();
        tokio::time::timeout(timeout, outstanding.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|idle| idle.is_ok())
    }

    /// Payloads accepted and not yet reported as delivered or failed.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Subscribes to the lifecycle events of this sender.
    ///
    /// The channel is bounded: a receiver falling behind loses the oldest events and is
    /// told how many on its next `recv`. Delivery never waits for receivers.
    pub fn monitor(&self) -> broadcast::Receiver<SenderEvent> {
        self.events.subscribe()
    }

    fn take_pending(&self) -> Option<mpsc::Receiver<Payload>> {
        match self.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => {
                error!("Payload sender queue lock poisoned");
                None
            }
        }
    }

    fn refuse(&self, payload: Payload, error: SenderError) {
        let stats = SendStats {
            host: self.endpoint.name().to_string(),
            attempts: 0,
            elapsed: std::time::Duration::ZERO,
            bytes: payload.len(),
        };
        publish(
            &self.events,
            SenderEvent::Failure {
                payload,
                error,
                stats,
                retriable: false,
            },
        );
    }
}

struct Delivery<E: Endpoint> {
    config: SenderConfig,
    endpoint: Arc<E>,
    queue: mpsc::Receiver<Payload>,
    events: broadcast::Sender<SenderEvent>,
    outstanding: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
}

impl<E: Endpoint> Delivery<E> {
    async fn run(mut self) {
        loop {
            let payload = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                payload = self.queue.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            self.deliver(payload).await;
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
        abandon_queued(
            &mut self.queue,
            &self.events,
            &self.outstanding,
            self.endpoint.name(),
        );
    }

    async fn deliver(&self, payload: Payload) {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.endpoint.write(&payload).await;
            let stats = self.stats(&payload, attempt, started);
            let error = match result {
                Ok(()) => {
                    debug!(
                        "Sent {} bytes to {} after {attempt} attempt(s)",
                        payload.len(),
                        stats.host
                    );
                    publish(&self.events, SenderEvent::Success { payload, stats });
                    return;
                }
                Err(error) => error,
            };

            if !error.is_retriable() {
                error!("Failed to send payload to {}, dropping it: {error}", stats.host);
                publish(
                    &self.events,
                    SenderEvent::Failure {
                        payload,
                        error: error.into(),
                        stats,
                        retriable: false,
                    },
                );
                return;
            }
            if attempt > self.config.max_retries {
                error!(
                    "Failed to send payload to {} after {attempt} attempts, dropping it: {error}",
                    stats.host
                );
                publish(
                    &self.events,
                    SenderEvent::Failure {
                        payload,
                        error: error.into(),
                        stats,
                        retriable: true,
                    },
                );
                return;
            }

            let delay = self.config.backoff(attempt);
            warn!(
                "Failed to send payload to {} (attempt {attempt}), retrying in {delay:?}: {error}",
                stats.host
            );
            publish(
                &self.events,
                SenderEvent::Retry {
                    payload: payload.clone(),
                    error,
                    attempt,
                    stats,
                },
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let stats = self.stats(&payload, attempt, started);
                    publish(
                        &self.events,
                        SenderEvent::Failure {
                            payload,
                            error: SenderError::Stopped,
                            stats,
                            retriable: true,
                        },
                    );
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn stats(&self, payload: &Payload, attempts: u32, started: Instant) -> SendStats {
        SendStats {
            host: self.endpoint.name().to_string(),
            attempts,
            elapsed: started.elapsed(),
            bytes: payload.len(),
        }
    }
}

fn abandon_queued(
    queue: &mut mpsc::Receiver<Payload>,
    events: &broadcast::Sender<SenderEvent>,
    outstanding: &watch::Sender<usize>,
    host: &str,
) {
    queue.close();
    let mut abandoned = 0;
    while let Ok(payload) = queue.try_recv() {
        abandoned += 1;
        outstanding.send_modify(|n| *n = n.saturating_sub(1));
        let stats = SendStats {
            host: host.to_string(),
            attempts: 0,
            elapsed: std::time::Duration::ZERO,
            bytes: payload.len(),
        };
        publish(
            events,
            SenderEvent::Failure {
                payload,
                error: SenderError::Stopped,
                stats,
                retriable: true,
            },
        );
    }
    if abandoned > 0 {
        warn!("Payload sender for {host} stopped with {abandoned} queued payloads");
    }
}

fn publish(events: &broadcast::Sender<SenderEvent>, event: SenderEvent) {
    // an error only means nobody is subscribed
    let _ = events.send(event);
}
