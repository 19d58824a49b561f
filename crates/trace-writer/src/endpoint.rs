// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery targets for payloads.
//!
//! An [`Endpoint`] only reports what happened to one write. Deciding whether to retry is
//! the sender's job, driven by [`EndpointError::is_retriable`]:
//!
//! - **Network errors**: retried (connection refused, reset, timeout)
//! - **5xx, 408, 429**: retried, the intake is expected to recover
//! - **Other 4xx**: dropped, the payload itself is rejected
//! - **Payload errors**: dropped, the payload could not be prepared

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::payload::Payload;

pub const API_KEY_HEADER: &str = "DD-API-KEY";

pub const TRACES_PATH: &str = "/api/v0.2/traces";
pub const STATS_PATH: &str = "/api/v0.2/stats";
pub const SERVICES_PATH: &str = "/api/v0.2/services";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("network error: {0}")]
    Network(String),

    #[error("endpoint returned status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("invalid payload: {0}")]
    Payload(String),
}

impl EndpointError {
    pub fn is_retriable(&self) -> bool {
        match self {
            EndpointError::Network(_) => true,
            EndpointError::Status { code, .. } => *code >= 500 || *code == 408 || *code == 429,
            EndpointError::Payload(_) => false,
        }
    }
}

#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    async fn write(&self, payload: &Payload) -> Result<(), EndpointError>;

    /// Host label reported in send stats.
    fn name(&self) -> &str;
}

#[async_trait]
impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    async fn write(&self, payload: &Payload) -> Result<(), EndpointError> {
        (**self).write(payload).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[derive(Clone, Debug)]
pub struct HttpEndpointConfig {
    /// Full intake URL, path included.
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

/// Writes payloads to the Datadog intake over HTTP.
pub struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
    api_key: String,
    host: String,
}

impl HttpEndpoint {
    pub fn new(config: HttpEndpointConfig) -> Self {
        let host = reqwest::Url::parse(&config.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| config.url.clone());
        Self {
            client: get_client(&config),
            url: config.url,
            api_key: config.api_key,
            host,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    async fn write(&self, payload: &Payload) -> Result<(), EndpointError> {
        let mut request = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .body(payload.body().clone());
        for (name, value) in payload.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| EndpointError::Payload(format!("invalid header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| EndpointError::Payload(format!("invalid header value: {e}")))?;
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EndpointError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            debug!("Wrote {} bytes to {}", payload.len(), self.url);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(EndpointError::Status {
            code: status.as_u16(),
            body,
        })
    }

    fn name(&self) -> &str {
        &self.host
    }
}

fn get_client(config: &HttpEndpointConfig) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to parse proxy configuration: {e}, falling back to direct connection");
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!("Failed to build HTTP client: {inner}, using reqwest defaults");
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    config: &HttpEndpointConfig,
    allow_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));
    if allow_proxy {
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
    }
    builder.build()
}
