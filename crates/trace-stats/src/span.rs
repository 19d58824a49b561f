// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metric key carrying the sampling rate applied upstream of the agent.
pub const SAMPLE_RATE_METRIC_KEY: &str = "_sample_rate";

/// One recorded unit of work within a distributed trace.
///
/// Spans are never mutated once they enter the pipeline; stages borrow them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    /// Start of the span, in nanoseconds since the unix epoch.
    pub start: i64,
    /// Duration of the span, in nanoseconds.
    pub duration: i64,
    /// Non-zero when the operation failed.
    pub error: i32,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default, rename = "type")]
    pub r#type: String,
}

impl Span {
    pub fn is_error(&self) -> bool {
        self.error != 0
    }

    /// End of the span, in nanoseconds since the unix epoch.
    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.duration.max(0))
    }

    /// Looks a tag up in `meta`, falling back to `metrics` rendered as a string.
    pub fn tag(&self, key: &str) -> Option<String> {
        if let Some(value) = self.meta.get(key) {
            return Some(value.clone());
        }
        self.metrics.get(key).map(|value| {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", *value as i64)
            } else {
                value.to_string()
            }
        })
    }

    /// Extrapolation weight of the span: the inverse of the upstream sample rate.
    ///
    /// Missing or out-of-range rates yield a weight of 1.
    pub fn weight(&self) -> f64 {
        match self.metrics.get(SAMPLE_RATE_METRIC_KEY) {
            Some(rate) if *rate > 0.0 && *rate <= 1.0 => 1.0 / rate,
            _ => 1.0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }
}
