// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use zstd::zstd_safe::CompressionLevel;

use crate::errors::WriterError;

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_ENCODING: &str = "Content-Encoding";
/// Number of items (traces, stats entries, services) carried by a payload.
pub const HEADER_ITEM_COUNT: &str = "X-Datadog-Item-Count";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const ENCODING_ZSTD: &str = "zstd";

/// A serialized unit of data ready to be written to an endpoint.
///
/// The body is reference counted: cloning a payload for retries or events does not copy it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    body: Bytes,
    headers: BTreeMap<String, String>,
}

impl Payload {
    pub fn new(body: impl Into<Bytes>, headers: BTreeMap<String, String>) -> Self {
        Self {
            body: body.into(),
            headers,
        }
    }

    /// Serializes `value` as JSON, compressing it with zstd when `compression_level` is set.
    pub fn json<T: Serialize + ?Sized>(
        value: &T,
        items: usize,
        compression_level: Option<CompressionLevel>,
    ) -> Result<Self, WriterError> {
        let json = serde_json::to_vec(value)?;
        let mut headers = BTreeMap::from([
            (HEADER_CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string()),
            (HEADER_ITEM_COUNT.to_string(), items.to_string()),
        ]);
        let body = match compression_level {
            Some(level) => {
                headers.insert(
                    HEADER_CONTENT_ENCODING.to_string(),
                    ENCODING_ZSTD.to_string(),
                );
                zstd::encode_all(json.as_slice(), level).map_err(WriterError::Compression)?
            }
            None => json,
        };
        Ok(Self::new(body, headers))
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Body size in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
