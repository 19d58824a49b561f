// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Trace Writer
//!
//! Serialization of traces, stats and service metadata into payloads, and their
//! delivery to the intake.
//!
//! - [`sender`]: bounded queue, retries with backoff, lifecycle events
//! - [`monitor`]: tallies sender events
//! - [`endpoint`]: the delivery target abstraction and its HTTP implementation
//! - [`stats_writer`], [`trace_writer`], [`service_writer`]: per-class payload builders

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![deny(unused_extern_crates)]

pub mod config;
pub mod endpoint;
pub mod errors;
pub mod event;
pub mod monitor;
pub mod payload;
pub mod sender;
pub mod service_writer;
pub mod stats_writer;
pub mod trace_writer;
