// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload fixtures and event helpers

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use trace_writer::config::SenderConfig;
use trace_writer::endpoint::EndpointError;
use trace_writer::event::SenderEvent;
use trace_writer::payload::Payload;

/// A payload of `size` bytes whose content depends on `seed`.
pub fn sized_payload(size: usize, seed: u8) -> Payload {
    let body: Vec<u8> = (0..size)
        .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
        .collect();
    Payload::new(
        body,
        BTreeMap::from([("X-Seed".to_string(), seed.to_string())]),
    )
}

/// Sender settings with short backoffs.
pub fn fast_config(max_retries: u32) -> SenderConfig {
    SenderConfig {
        queue_capacity: 16,
        enqueue_timeout: Duration::from_millis(100),
        max_retries,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        monitor_capacity: 256,
    }
}

#[allow(dead_code)]
pub fn unavailable() -> EndpointError {
    EndpointError::Status {
        code: 503,
        body: "unavailable".to_string(),
    }
}

/// Receives the next `count` events, failing the test if they take too long.
pub async fn next_events(
    events: &mut broadcast::Receiver<SenderEvent>,
    count: usize,
) -> Vec<SenderEvent> {
    let mut received = Vec::with_capacity(count);
    for _ in 0..count {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for sender event")
            .expect("sender event channel failed");
        received.push(event);
    }
    received
}

/// Short name of an event kind, for order assertions.
pub fn kind(event: &SenderEvent) -> &'static str {
    match event {
        SenderEvent::Success { .. } => "success",
        SenderEvent::Failure { .. } => "failure",
        SenderEvent::Retry { .. } => "retry",
    }
}
