// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::distribution::DistributionError;

/// Errors returned synchronously on the aggregation path. The bucket set is left
/// untouched whenever one of them is returned.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum StatsError {
    #[error("span has neither service nor name, cannot build aggregation key")]
    MalformedKey,

    #[error("extrapolation weight must be a non-negative finite number, got {0}")]
    InvalidWeight(f64),

    #[error("span start must not be negative, got {0}")]
    InvalidTimestamp(i64),

    #[error("bucket interval must not be zero")]
    InvalidInterval,

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error("stats bucket set lock poisoned")]
    LockPoisoned,
}
