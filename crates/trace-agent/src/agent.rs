// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the stats pipeline and the three payload senders.
//!
//! ```text
//! process(trace) -> sampler -> concentrator -> stats writer   -> stats sender
//!                           \-> trace writer                   -> traces sender
//!                           \-> service metadata -> service writer -> services sender
//! ```
//!
//! Every sender reports to one shared [`SenderMonitor`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use trace_stats::concentrator::Concentrator;
use trace_stats::errors::StatsError;
use trace_stats::stats_bucket::StatsBucket;
use trace_writer::endpoint::{
    Endpoint, HttpEndpoint, HttpEndpointConfig, SERVICES_PATH, STATS_PATH, TRACES_PATH,
};
use trace_writer::monitor::SenderMonitor;
use trace_writer::sender::PayloadSender;
use trace_writer::service_writer::{ServiceWriter, ServicesMetadata, APP_TYPE};
use trace_writer::stats_writer::StatsWriter;
use trace_writer::trace_writer::{Trace, TraceWriter};

use crate::config::Config;
use crate::sampler::{Decision, RateSampler, Sampler};

const STATS_CHANNEL_CAPACITY: usize = 16;
const TRACE_CHANNEL_CAPACITY: usize = 1024;
const SERVICE_CHANNEL_CAPACITY: usize = 64;

/// How long `stop` waits for queued payloads to be delivered before abandoning them.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to build the stats concentrator: {0}")]
    Concentrator(#[from] StatsError),
}

/// One endpoint per payload class.
pub struct Endpoints<E> {
    pub stats: E,
    pub traces: E,
    pub services: E,
}

/// Loops built by `new` and handed to the runtime by `run`.
struct Pipelines<E: Endpoint> {
    buckets_tx: mpsc::Sender<Vec<StatsBucket>>,
    buckets_rx: mpsc::Receiver<Vec<StatsBucket>>,
    trace_rx: mpsc::Receiver<Trace>,
    service_rx: mpsc::Receiver<ServicesMetadata>,
    stats_writer: StatsWriter<E>,
    trace_writer: TraceWriter<E>,
    service_writer: ServiceWriter<E>,
}

#[derive(Default)]
struct Tasks {
    concentrator: Option<JoinHandle<()>>,
    stats_writer: Option<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
}

pub struct Agent<E: Endpoint> {
    config: Arc<Config>,
    concentrator: Arc<Concentrator>,
    sampler: Box<dyn Sampler>,
    stats_sender: Arc<PayloadSender<E>>,
    trace_sender: Arc<PayloadSender<E>>,
    service_sender: Arc<PayloadSender<E>>,
    monitor: SenderMonitor,
    trace_tx: mpsc::Sender<Trace>,
    service_tx: mpsc::Sender<ServicesMetadata>,
    pending: Mutex<Option<Pipelines<E>>>,
    tasks: Mutex<Tasks>,
    concentrator_cancel: CancellationToken,
    writers_cancel: CancellationToken,
    drops: Drops,
}

/// Data the agent had to give up on before it reached a sender.
#[derive(Default)]
struct Drops {
    rejected_spans: AtomicU64,
    dropped_traces: AtomicU64,
    dropped_service_updates: AtomicU64,
}

impl Agent<HttpEndpoint> {
    /// Agent writing to the intake configured in `config`.
    pub fn with_http(config: Arc<Config>) -> Result<Self, AgentError> {
        let endpoint = |path: &str| {
            HttpEndpoint::new(HttpEndpointConfig {
                url: config.url(path),
                api_key: config.api_key.clone(),
                timeout: config.request_timeout,
                https_proxy: config.https_proxy.clone(),
            })
        };
        let endpoints = Endpoints {
            stats: endpoint(STATS_PATH),
            traces: endpoint(TRACES_PATH),
            services: endpoint(SERVICES_PATH),
        };
        Self::new(Arc::clone(&config), endpoints)
    }
}

impl<E: Endpoint> Agent<E> {
    pub fn new(config: Arc<Config>, endpoints: Endpoints<E>) -> Result<Self, AgentError> {
        let sampler = RateSampler::new(config.extra_sample_rate, config.pre_sample_rate);
        Self::with_sampler(config, endpoints, Box::new(sampler))
    }

    pub fn with_sampler(
        config: Arc<Config>,
        endpoints: Endpoints<E>,
        sampler: Box<dyn Sampler>,
    ) -> Result<Self, AgentError> {
        let concentrator = Arc::new(Concentrator::new(config.concentrator_config())?);

        let stats_sender = Arc::new(PayloadSender::new(
            endpoints.stats,
            config.stats_writer.sender.clone(),
        ));
        let trace_sender = Arc::new(PayloadSender::new(
            endpoints.traces,
            config.trace_writer.sender.clone(),
        ));
        let service_sender = Arc::new(PayloadSender::new(
            endpoints.services,
            config.service_writer.sender.clone(),
        ));

        let monitor = SenderMonitor::new("agent");
        monitor.watch(stats_sender.monitor());
        monitor.watch(trace_sender.monitor());
        monitor.watch(service_sender.monitor());

        let (buckets_tx, buckets_rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);
        let (trace_tx, trace_rx) = mpsc::channel(TRACE_CHANNEL_CAPACITY);
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);

        let pipelines = Pipelines {
            buckets_tx,
            buckets_rx,
            trace_rx,
            service_rx,
            stats_writer: StatsWriter::new(
                config.stats_writer.clone(),
                config.hostname.clone(),
                config.env.clone(),
                Arc::clone(&stats_sender),
            ),
            trace_writer: TraceWriter::new(
                config.trace_writer.clone(),
                config.hostname.clone(),
                config.env.clone(),
                Arc::clone(&trace_sender),
            ),
            service_writer: ServiceWriter::new(
                config.service_writer.clone(),
                Arc::clone(&service_sender),
            ),
        };

        Ok(Self {
            config,
            concentrator,
            sampler,
            stats_sender,
            trace_sender,
            service_sender,
            monitor,
            trace_tx,
            service_tx,
            pending: Mutex::new(Some(pipelines)),
            tasks: Mutex::new(Tasks::default()),
            concentrator_cancel: CancellationToken::new(),
            writers_cancel: CancellationToken::new(),
            drops: Drops::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn concentrator(&self) -> &Concentrator {
        &self.concentrator
    }

    pub fn monitor(&self) -> &SenderMonitor {
        &self.monitor
    }

    /// Spans of kept traces the concentrator refused as invalid.
    pub fn rejected_spans(&self) -> u64 {
        self.drops.rejected_spans.load(Ordering::Relaxed)
    }

    /// Kept traces dropped because the trace writer could not take them.
    pub fn dropped_traces(&self) -> u64 {
        self.drops.dropped_traces.load(Ordering::Relaxed)
    }

    /// Service metadata updates dropped because the service writer could not take them.
    pub fn dropped_service_updates(&self) -> u64 {
        self.drops.dropped_service_updates.load(Ordering::Relaxed)
    }

    /// Samples `trace`, then feeds kept traces to the concentrator and the trace and
    /// service writers.
    pub fn process(&self, trace: Trace) -> Decision {
        let decision = self.sampler.decide(&trace);
        if !decision.keep {
            debug!("Dropping trace of {} spans after sampling", trace.len());
            return decision;
        }

        for span in &trace {
            if let Err(e) = self.concentrator.handle_span(span, decision.weight) {
                self.drops.rejected_spans.fetch_add(1, Ordering::Relaxed);
                debug!("Span {} not aggregated: {e}", span.span_id);
            }
        }

        let services = service_metadata(&trace);
        if !services.is_empty() {
            if let Err(e) = self.service_tx.try_send(services) {
                self.drops.dropped_service_updates.fetch_add(1, Ordering::Relaxed);
                debug!("Service metadata not forwarded: {e}");
            }
        }

        match self.trace_tx.try_send(trace) {
            Ok(()) => {}
            Err(TrySendError::Full(trace)) => {
                self.drops.dropped_traces.fetch_add(1, Ordering::Relaxed);
                warn!("Trace writer is behind, dropping trace of {} spans", trace.len());
            }
            Err(TrySendError::Closed(_)) => {
                self.drops.dropped_traces.fetch_add(1, Ordering::Relaxed);
                debug!("Trace writer stopped, dropping trace");
            }
        }
        decision
    }

    /// Starts the senders, the monitor and every pipeline loop. Calling it again is a
    /// no-op.
    pub fn run(&self) {
        let Some(pipelines) = self.pending.lock().ok().and_then(|mut p| p.take()) else {
            return;
        };

        self.stats_sender.start();
        self.trace_sender.start();
        self.service_sender.start();
        self.monitor.start();

        let Pipelines {
            buckets_tx,
            buckets_rx,
            trace_rx,
            service_rx,
            stats_writer,
            trace_writer,
            service_writer,
        } = pipelines;

        let concentrator = tokio::spawn(
            Arc::clone(&self.concentrator).run(buckets_tx, self.concentrator_cancel.clone()),
        );
        let stats_writer = tokio::spawn(stats_writer.run(buckets_rx));
        let writers = vec![
            tokio::spawn(trace_writer.run(trace_rx, self.writers_cancel.clone())),
            tokio::spawn(service_writer.run(service_rx, self.writers_cancel.clone())),
        ];

        match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.concentrator = Some(concentrator);
                tasks.stats_writer = Some(stats_writer);
                tasks.writers = writers;
            }
            Err(_) => error!("Agent task registry poisoned, tasks will not be awaited on stop"),
        }
        debug!("Agent started");
    }

    /// Flushes every open bucket and buffered trace, waits up to a bounded time for the
    /// senders to deliver them, then stops the senders and the monitor.
    pub async fn stop(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Tasks::default(),
        };

        // the stats writer ends once the concentrator drops its channel
        self.concentrator_cancel.cancel();
        for handle in [tasks.concentrator, tasks.stats_writer].into_iter().flatten() {
            if let Err(e) = handle.await {
                error!("Stats pipeline task failed: {e}");
            }
        }

        self.writers_cancel.cancel();
        for handle in tasks.writers {
            if let Err(e) = handle.await {
                error!("Writer task failed: {e}");
            }
        }

        for sender in [&self.stats_sender, &self.trace_sender, &self.service_sender] {
            if !sender.wait_idle(SHUTDOWN_TIMEOUT).await {
                warn!(
                    "Abandoning {} payloads queued for {}",
                    sender.outstanding(),
                    sender.endpoint().name()
                );
            }
            sender.stop().await;
        }
        self.monitor.stop().await;
        debug!(
            "Agent stopped: {} payloads sent, {} failed, {} retries",
            self.monitor.successes(),
            self.monitor.failures(),
            self.monitor.retries()
        );
        let (rejected, traces, services) = (
            self.rejected_spans(),
            self.dropped_traces(),
            self.dropped_service_updates(),
        );
        if rejected + traces + services > 0 {
            warn!(
                "Agent dropped {rejected} invalid spans, {traces} traces and {services} service updates"
            );
        }
    }
}

/// Application type of every service in `trace`, as reported by the span type.
fn service_metadata(trace: &[trace_stats::span::Span]) -> ServicesMetadata {
    let mut services = ServicesMetadata::new();
    for span in trace {
        if span.service.is_empty() || span.r#type.is_empty() {
            continue;
        }
        services
            .entry(span.service.clone())
            .or_insert_with(|| BTreeMap::from([(APP_TYPE.to_string(), span.r#type.clone())]));
    }
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use trace_stats::span::Span;
    use trace_stats::test_utils::span_with_key;
    use trace_writer::endpoint::EndpointError;
    use trace_writer::payload::{Payload, ENCODING_ZSTD, HEADER_CONTENT_ENCODING};

    #[derive(Default)]
    struct MemoryEndpoint {
        name: String,
        payloads: Mutex<Vec<Payload>>,
    }

    impl MemoryEndpoint {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                payloads: Mutex::new(Vec::new()),
            })
        }

        fn bodies(&self) -> Vec<Value> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .map(|payload| {
                    let body = match payload.header(HEADER_CONTENT_ENCODING) {
                        Some(ENCODING_ZSTD) => zstd::decode_all(&payload.body()[..]).unwrap(),
                        _ => payload.body().to_vec(),
                    };
                    serde_json::from_slice(&body).unwrap()
                })
                .collect()
        }
    }

    #[async_trait]
    impl Endpoint for MemoryEndpoint {
        async fn write(&self, payload: &Payload) -> Result<(), EndpointError> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct DropAll;

    impl Sampler for DropAll {
        fn decide(&self, _trace: &[Span]) -> Decision {
            Decision {
                keep: false,
                weight: 0.0,
            }
        }
    }

    fn config() -> Arc<Config> {
        Arc::new(Config {
            api_key: "_not_a_real_key_".to_string(),
            hostname: "test-host".to_string(),
            env: "test".to_string(),
            ..Config::default()
        })
    }

    fn endpoints() -> (Endpoints<Arc<MemoryEndpoint>>, [Arc<MemoryEndpoint>; 3]) {
        let stats = MemoryEndpoint::named("stats");
        let traces = MemoryEndpoint::named("traces");
        let services = MemoryEndpoint::named("services");
        let endpoints = Endpoints {
            stats: Arc::clone(&stats),
            traces: Arc::clone(&traces),
            services: Arc::clone(&services),
        };
        (endpoints, [stats, traces, services])
    }

    fn web_trace(trace_id: u64) -> Trace {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64;
        let mut root = span_with_key("web", "http.request", "GET /users", now, 100);
        root.trace_id = trace_id;
        root.r#type = "web".to_string();
        let mut child = span_with_key("db", "postgres.query", "SELECT users", now + 10, 50);
        child.trace_id = trace_id;
        child.span_id = 2;
        child.parent_id = root.span_id;
        child.r#type = "sql".to_string();
        vec![root, child]
    }

    #[tokio::test]
    async fn test_traces_flow_to_every_endpoint() {
        let (endpoints, [stats, traces, services]) = endpoints();
        let agent = Agent::new(config(), endpoints).unwrap();
        agent.run();

        for trace_id in 1..=3 {
            assert!(agent.process(web_trace(trace_id)).keep);
        }
        agent.stop().await;

        let stats = stats.bodies();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0]["hostname"], "test-host");
        let entries = stats[0]["stats"][0]["stats"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry["hits"] == 3));

        let traces = traces.bodies();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["env"], "test");
        assert_eq!(traces[0]["traces"].as_array().unwrap().len(), 3);

        let services = services.bodies();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0]["web"][APP_TYPE], "web");
        assert_eq!(services[0]["db"][APP_TYPE], "sql");

        assert_eq!(agent.monitor().successes(), 3);
        assert_eq!(agent.monitor().failures(), 0);
    }

    #[tokio::test]
    async fn test_dropped_traces_are_not_aggregated() {
        let (endpoints, [stats, traces, _]) = endpoints();
        let agent = Agent::with_sampler(config(), endpoints, Box::new(DropAll)).unwrap();
        agent.run();

        assert!(!agent.process(web_trace(1)).keep);
        assert!(agent.concentrator().bucket_starts().unwrap().is_empty());
        agent.stop().await;

        assert!(stats.bodies().is_empty());
        assert!(traces.bodies().is_empty());
        assert_eq!(agent.monitor().successes(), 0);
    }

    #[test]
    fn test_invalid_spans_are_counted() {
        let (endpoints, _) = endpoints();
        let agent = Agent::new(config(), endpoints).unwrap();
        let mut trace = web_trace(1);
        trace[1].service = String::new();
        trace[1].name = String::new();

        assert!(agent.process(trace).keep);
        assert_eq!(agent.rejected_spans(), 1);
        assert_eq!(agent.concentrator().bucket_starts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_traces_beyond_writer_capacity_are_counted() {
        let (endpoints, _) = endpoints();
        let agent = Agent::new(config(), endpoints).unwrap();
        // not running: nothing drains the writer channels
        let extra = 5;
        for trace_id in 0..(TRACE_CHANNEL_CAPACITY + extra) as u64 {
            agent.process(web_trace(trace_id));
        }
        assert_eq!(agent.dropped_traces(), extra as u64);
        assert_eq!(
            agent.dropped_service_updates(),
            (TRACE_CHANNEL_CAPACITY + extra - SERVICE_CHANNEL_CAPACITY) as u64
        );
        assert_eq!(agent.rejected_spans(), 0);
    }

    #[tokio::test]
    async fn test_run_twice_and_stop_without_traffic() {
        let (endpoints, [stats, _, _]) = endpoints();
        let agent = Agent::new(config(), endpoints).unwrap();
        agent.run();
        agent.run();
        agent.stop().await;
        assert!(stats.bodies().is_empty());
    }

    #[test]
    fn test_invalid_bucket_interval_is_rejected() {
        let (endpoints, _) = endpoints();
        let config = Arc::new(Config {
            bucket_interval: Duration::ZERO,
            ..Config::default()
        });
        assert!(matches!(
            Agent::new(config, endpoints),
            Err(AgentError::Concentrator(StatsError::InvalidInterval))
        ));
    }

    #[test]
    fn test_service_metadata_keeps_first_type_per_service() {
        let mut trace = web_trace(1);
        let mut untyped = trace[1].clone();
        untyped.service = "cache".to_string();
        untyped.r#type = String::new();
        trace.push(untyped);
        let services = service_metadata(&trace);
        assert_eq!(services.len(), 2);
        assert_eq!(services["db"][APP_TYPE], "sql");
    }
}
