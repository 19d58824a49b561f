// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::endpoint::EndpointError;
use crate::errors::SenderError;
use crate::payload::Payload;

/// Delivery statistics of one payload, as of the event carrying them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendStats {
    pub host: String,
    /// Write attempts made so far. Zero when the payload never reached the endpoint.
    pub attempts: u32,
    /// Time since the first attempt.
    pub elapsed: Duration,
    pub bytes: usize,
}

/// Lifecycle notification published by a payload sender.
#[derive(Clone, Debug)]
pub enum SenderEvent {
    Success {
        payload: Payload,
        stats: SendStats,
    },
    Failure {
        payload: Payload,
        error: SenderError,
        stats: SendStats,
        retriable: bool,
    },
    Retry {
        payload: Payload,
        error: EndpointError,
        attempt: u32,
        stats: SendStats,
    },
}

impl SenderEvent {
    pub fn payload(&self) -> &Payload {
        match self {
            SenderEvent::Success { payload, .. }
            | SenderEvent::Failure { payload, .. }
            | SenderEvent::Retry { payload, .. } => payload,
        }
    }

    pub fn stats(&self) -> &SendStats {
        match self {
            SenderEvent::Success { stats, .. }
            | SenderEvent::Failure { stats, .. }
            | SenderEvent::Retry { stats, .. } => stats,
        }
    }
}
