// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock endpoint recording every payload written to it

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};
use trace_writer::endpoint::{Endpoint, EndpointError};
use trace_writer::payload::Payload;

#[derive(Default)]
struct Recorded {
    error: Option<EndpointError>,
    script: VecDeque<EndpointError>,
    success: Vec<Payload>,
    errors: Vec<Payload>,
}

/// Replies with a configurable error and records successful and failed payloads.
///
/// Scripted errors (`fail_next`) are used first, then the standing error set with
/// `set_error`, if any. A blocked endpoint holds every write until `release` is called.
#[derive(Default)]
pub struct TestEndpoint {
    recorded: Mutex<Recorded>,
    gate: Option<Semaphore>,
    writing: Notify,
}

#[allow(dead_code)]
impl TestEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocked() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn set_error(&self, error: Option<EndpointError>) {
        self.recorded.lock().unwrap().error = error;
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = EndpointError>) {
        self.recorded.lock().unwrap().script.extend(errors);
    }

    /// Lets `writes` blocked writes through.
    pub fn release(&self, writes: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(writes);
        }
    }

    /// Resolves once a write has started.
    pub async fn wait_for_write(&self) {
        self.writing.notified().await;
    }

    pub fn success_payloads(&self) -> Vec<Payload> {
        self.recorded.lock().unwrap().success.clone()
    }

    pub fn error_payloads(&self) -> Vec<Payload> {
        self.recorded.lock().unwrap().errors.clone()
    }
}

#[async_trait]
impl Endpoint for TestEndpoint {
    async fn write(&self, payload: &Payload) -> Result<(), EndpointError> {
        self.writing.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let mut recorded = self.recorded.lock().unwrap();
        let error = recorded
            .script
            .pop_front()
            .or_else(|| recorded.error.clone());
        match error {
            Some(error) => {
                recorded.errors.push(payload.clone());
                Err(error)
            }
            None => {
                recorded.success.push(payload.clone());
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "testEndpoint"
    }
}
