// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::endpoint::EndpointError;

/// Why a payload left the sender without being delivered.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SenderError {
    #[error("payload queue is full")]
    QueueFull,

    #[error("sender is stopped")]
    Stopped,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Errors building payloads or handing them to a sender.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to compress payload: {0}")]
    Compression(std::io::Error),

    #[error(transparent)]
    Sender(#[from] SenderError),
}
