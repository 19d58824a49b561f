// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Trace Stats
//!
//! Aggregation of trace spans into time-bucketed statistics.
//!
//! - [`distribution`]: approximate quantile sketch with bounded relative error
//! - [`stats_bucket`]: per-key counters and distributions for one time window
//! - [`concentrator`]: routes spans to buckets and flushes completed windows

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]

pub mod concentrator;
pub mod distribution;
pub mod errors;
pub mod span;
pub mod stats_bucket;
pub mod tags;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
