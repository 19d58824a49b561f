// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::event::SenderEvent;
use crate::payload::Payload;

#[derive(Default)]
struct Counters {
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    lagged: AtomicU64,
}

#[derive(Default)]
struct Recorded {
    successes: Vec<SenderEvent>,
    failures: Vec<SenderEvent>,
    retries: Vec<SenderEvent>,
}

#[derive(Clone)]
struct Tally {
    name: Arc<str>,
    counters: Arc<Counters>,
    recorded: Option<Arc<Mutex<Recorded>>>,
}

impl Tally {
    fn record(&self, event: SenderEvent) {
        let (counter, kind) = match &event {
            SenderEvent::Success { .. } => (&self.counters.successes, "success"),
            SenderEvent::Failure { .. } => (&self.counters.failures, "failure"),
            SenderEvent::Retry { .. } => (&self.counters.retries, "retry"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{} | {kind} for {} bytes to {}",
            self.name,
            event.stats().bytes,
            event.stats().host
        );

        let Some(recorded) = &self.recorded else {
            return;
        };
        let Ok(mut recorded) = recorded.lock() else {
            error!("{} | event log lock poisoned", self.name);
            return;
        };
        match event {
            SenderEvent::Success { .. } => recorded.successes.push(event),
            SenderEvent::Failure { .. } => recorded.failures.push(event),
            SenderEvent::Retry { .. } => recorded.retries.push(event),
        }
    }

    fn lagged(&self, missed: u64) {
        self.counters.lagged.fetch_add(missed, Ordering::Relaxed);
        warn!("{} | fell behind, {missed} sender events lost", self.name);
    }

    async fn consume(self, mut events: broadcast::Receiver<SenderEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.record(event),
                    Err(RecvError::Lagged(missed)) => self.lagged(missed),
                    Err(RecvError::Closed) => return,
                },
            }
        }
        // events published before the stop are still tallied
        loop {
            match events.try_recv() {
                Ok(event) => self.record(event),
                Err(TryRecvError::Lagged(missed)) => self.lagged(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return,
            }
        }
    }
}

/// Tallies the events of one or more payload senders.
///
/// Monitors never slow delivery down: a monitor falling behind loses the oldest events,
/// which are counted in [`SenderMonitor::lagged`]. A recording monitor also keeps every
/// event it sees, for tests and introspection.
pub struct SenderMonitor {
    tally: Tally,
    waiting: Mutex<Vec<broadcast::Receiver<SenderEvent>>>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SenderMonitor {
    pub fn new(name: &str) -> Self {
        Self::with_recording(name, None)
    }

    pub fn recording(name: &str) -> Self {
        Self::with_recording(name, Some(Arc::default()))
    }

    fn with_recording(name: &str, recorded: Option<Arc<Mutex<Recorded>>>) -> Self {
        Self {
            tally: Tally {
                name: Arc::from(name),
                counters: Arc::default(),
                recorded,
            },
            waiting: Mutex::default(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::default(),
        }
    }

    /// Adds a sender's event stream, obtained from `PayloadSender::monitor`.
    pub fn watch(&self, events: broadcast::Receiver<SenderEvent>) {
        if self.started.load(Ordering::Acquire) {
            self.spawn(events);
            return;
        }
        match self.waiting.lock() {
            Ok(mut waiting) => waiting.push(events),
            Err(_) => error!("{} | receiver list lock poisoned", self.tally.name),
        }
    }

    /// Starts consuming every watched stream. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiting = match self.waiting.lock() {
            Ok(mut waiting) => std::mem::take(&mut *waiting),
            Err(_) => Vec::new(),
        };
        for events in waiting {
            self.spawn(events);
        }
    }

    /// Stops consuming after tallying the events already published.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("{} | monitor task failed: {e}", self.tally.name);
            }
        }
    }

    fn spawn(&self, events: broadcast::Receiver<SenderEvent>) {
        let task = tokio::spawn(self.tally.clone().consume(events, self.cancel.clone()));
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => error!("{} | task list lock poisoned", self.tally.name),
        }
    }

    pub fn successes(&self) -> u64 {
        self.tally.counters.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.tally.counters.failures.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.tally.counters.retries.load(Ordering::Relaxed)
    }

    /// Events lost because this monitor fell behind.
    pub fn lagged(&self) -> u64 {
        self.tally.counters.lagged.load(Ordering::Relaxed)
    }

    pub fn success_events(&self) -> Vec<SenderEvent> {
        self.recorded(|r| r.successes.clone())
    }

    pub fn failure_events(&self) -> Vec<SenderEvent> {
        self.recorded(|r| r.failures.clone())
    }

    pub fn retry_events(&self) -> Vec<SenderEvent> {
        self.recorded(|r| r.retries.clone())
    }

    /// Payloads of the recorded success events, in the order they were delivered.
    pub fn success_payloads(&self) -> Vec<Payload> {
        payloads(self.success_events())
    }

    pub fn failure_payloads(&self) -> Vec<Payload> {
        payloads(self.failure_events())
    }

    pub fn retry_payloads(&self) -> Vec<Payload> {
        payloads(self.retry_events())
    }

    fn recorded(&self, f: impl FnOnce(&Recorded) -> Vec<SenderEvent>) -> Vec<SenderEvent> {
        self.tally
            .recorded
            .as_ref()
            .and_then(|recorded| recorded.lock().ok().map(|r| f(&r)))
            .unwrap_or_default()
    }
}

fn payloads(events: Vec<SenderEvent>) -> Vec<Payload> {
    events
        .into_iter()
        .map(|event| match event {
            SenderEvent::Success { payload, .. }
            | SenderEvent::Failure { payload, .. }
            | SenderEvent::Retry { payload, .. } => payload,
        })
        .collect()
}
