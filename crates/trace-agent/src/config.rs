// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use trace_stats::concentrator::{ConcentratorConfig, DEFAULT_EXTRA_AGGREGATOR};
use trace_writer::config::{ServiceWriterConfig, StatsWriterConfig, TraceWriterConfig};

use crate::watchdog::WatchdogConfig;

const DEFAULT_SITE: &str = "datadoghq.com";
const DEFAULT_ENV: &str = "none";

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("DD_API_KEY environment variable is not set")]
    MissingApiKey,

    #[error("could not determine the hostname, set DD_HOSTNAME")]
    MissingHostname,

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub api_key: String,
    pub site: String,
    /// Intake URL prefix, without the per-class path.
    pub api_endpoint: String,
    pub https_proxy: Option<String>,
    pub request_timeout: Duration,
    pub hostname: String,
    pub env: String,
    pub log_level: String,

    pub bucket_interval: Duration,
    pub lateness: Duration,
    pub extra_aggregators: Vec<String>,

    pub extra_sample_rate: f64,
    pub pre_sample_rate: f64,

    /// Resident memory, in bytes, above which the agent exits.
    pub max_memory: f64,
    /// Fraction of one CPU the agent may spend in user time.
    pub max_cpu: f64,
    /// Open connections above which the agent exits.
    pub max_connections: u64,
    pub watchdog_interval: Duration,

    pub stats_writer: StatsWriterConfig,
    pub trace_writer: TraceWriterConfig,
    pub service_writer: ServiceWriterConfig,
}

impl Default for Config {
    fn default() -> Self {
        let bucket_interval = Duration::from_secs(10);
        Self {
            api_key: String::new(),
            site: DEFAULT_SITE.to_string(),
            api_endpoint: intake_url(DEFAULT_SITE),
            https_proxy: None,
            request_timeout: Duration::from_secs(10),
            hostname: String::new(),
            env: DEFAULT_ENV.to_string(),
            log_level: "info".to_string(),
            bucket_interval,
            lateness: bucket_interval,
            extra_aggregators: vec![DEFAULT_EXTRA_AGGREGATOR.to_string()],
            extra_sample_rate: 1.0,
            pre_sample_rate: 1.0,
            max_memory: 5e8, // 500 MB, should rarely go above 50 MB
            max_cpu: 0.5,    // 50%, well behaving agents keep below 5%
            max_connections: 200,
            watchdog_interval: Duration::from_secs(60),
            stats_writer: StatsWriterConfig::default(),
            trace_writer: TraceWriterConfig::default(),
            service_writer: ServiceWriterConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let api_key = env::var("DD_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;
        let site = env::var("DD_SITE").unwrap_or_else(|_| DEFAULT_SITE.to_string());
        // DD_APM_DD_URL overrides the intake prefix, mostly for integration tests
        let api_endpoint = env::var("DD_APM_DD_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| intake_url(&site));

        let bucket_interval = Duration::from_secs(parse_var(
            "DD_APM_BUCKET_INTERVAL_SECS",
            defaults.bucket_interval.as_secs(),
        )?);
        if bucket_interval.is_zero() {
            return Err(invalid("DD_APM_BUCKET_INTERVAL_SECS", "0"));
        }
        let lateness = match env::var("DD_APM_BUCKET_LATENESS_SECS") {
            Ok(value) => Duration::from_secs(parse_value("DD_APM_BUCKET_LATENESS_SECS", &value)?),
            Err(_) => bucket_interval,
        };

        let extra_aggregators = match env::var("DD_APM_EXTRA_AGGREGATORS") {
            Ok(value) => value
                .replace(',', " ")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.extra_aggregators,
        };

        let extra_sample_rate = parse_rate("DD_APM_EXTRA_SAMPLE_RATE", defaults.extra_sample_rate)?;
        let pre_sample_rate = parse_rate("DD_APM_PRE_SAMPLE_RATE", defaults.pre_sample_rate)?;

        let max_memory = parse_var("DD_APM_MAX_MEMORY", defaults.max_memory)?;
        let max_cpu = parse_var("DD_APM_MAX_CPU", defaults.max_cpu)?;
        let max_connections = parse_var("DD_APM_MAX_CONNECTIONS", defaults.max_connections)?;
        let watchdog_interval = Duration::from_secs(parse_var(
            "DD_APM_WATCHDOG_INTERVAL_SECS",
            defaults.watchdog_interval.as_secs(),
        )?);

        let mut trace_writer = defaults.trace_writer;
        trace_writer.max_spans_per_payload = parse_var(
            "DD_APM_MAX_SPANS_PER_PAYLOAD",
            trace_writer.max_spans_per_payload,
        )?;
        let mut stats_writer = defaults.stats_writer;
        stats_writer.max_entries_per_payload = parse_var(
            "DD_APM_MAX_STATS_ENTRIES_PER_PAYLOAD",
            stats_writer.max_entries_per_payload,
        )?;

        Ok(Config {
            api_key,
            site,
            api_endpoint,
            https_proxy: env::var("DD_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            request_timeout: Duration::from_secs(parse_var(
                "DD_APM_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            hostname: hostname()?,
            env: env::var("DD_ENV").unwrap_or(defaults.env),
            log_level: env::var("DD_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
            bucket_interval,
            lateness,
            extra_aggregators,
            extra_sample_rate,
            pre_sample_rate,
            max_memory,
            max_cpu,
            max_connections,
            watchdog_interval,
            stats_writer,
            trace_writer,
            service_writer: defaults.service_writer,
        })
    }

    pub fn concentrator_config(&self) -> ConcentratorConfig {
        ConcentratorConfig {
            bucket_interval: self.bucket_interval,
            lateness: self.lateness,
            extra_aggregators: self.extra_aggregators.clone(),
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            max_memory: self.max_memory,
            max_cpu: self.max_cpu,
            max_connections: self.max_connections,
            interval: self.watchdog_interval,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_endpoint)
    }
}

fn intake_url(site: &str) -> String {
    format!("https://trace.agent.{site}")
}

/// `DD_HOSTNAME`, then `HOSTNAME`, then the hostname of the machine.
fn hostname() -> Result<String, ConfigError> {
    ["DD_HOSTNAME", "HOSTNAME"]
        .into_iter()
        .filter_map(|var| env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .or_else(system_hostname)
        .ok_or(ConfigError::MissingHostname)
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(name) => name
            .into_string()
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()),
        Err(e) => {
            warn!("Failed to get system hostname: {e}");
            None
        }
    }
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    }
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => parse_value(name, &value),
        Err(_) => Ok(default),
    }
}

/// Sample rates must lie in `(0, 1]`.
fn parse_rate(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let rate: f64 = parse_var(name, default)?;
    if rate > 0.0 && rate <= 1.0 {
        Ok(rate)
    } else {
        Err(invalid(name, &rate.to_string()))
    }
}
