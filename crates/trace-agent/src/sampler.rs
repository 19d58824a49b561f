// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use trace_stats::span::Span;

/// Multiplier of the Knuth hash spreading trace ids over the u64 range.
const KNUTH_FACTOR: u64 = 1_111_111_111_111_111_111;

/// Whether a trace is kept, and by how much its spans are extrapolated in stats.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub keep: bool,
    pub weight: f64,
}

pub trait Sampler: Send + Sync {
    fn decide(&self, trace: &[Span]) -> Decision;
}

/// Keeps a fixed fraction of traces, chosen deterministically from the trace id so every
/// span of a trace gets the same decision.
#[derive(Clone, Copy, Debug)]
pub struct RateSampler {
    rate: f64,
}

impl RateSampler {
    pub fn new(extra_sample_rate: f64, pre_sample_rate: f64) -> Self {
        Self {
            rate: (extra_sample_rate * pre_sample_rate).clamp(0.0, 1.0),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Sampler for RateSampler {
    fn decide(&self, trace: &[Span]) -> Decision {
        let Some(root) = trace.iter().find(|s| s.is_root()).or_else(|| trace.first()) else {
            return Decision {
                keep: false,
                weight: 0.0,
            };
        };
        if !sample_by_rate(root.trace_id, self.rate) {
            return Decision {
                keep: false,
                weight: 0.0,
            };
        }
        Decision {
            keep: true,
            // client side sampling already applied, on top of ours
            weight: root.weight() / self.rate,
        }
    }
}

fn sample_by_rate(trace_id: u64, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    trace_id.wrapping_mul(KNUTH_FACTOR) < (rate * u64::MAX as f64) as u64
}
