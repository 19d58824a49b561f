// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span and bucket fixtures shared by unit and integration tests.

use std::collections::HashMap;

use crate::span::Span;
use crate::stats_bucket::StatsBucket;

const TEST_BUCKET_DURATION: u64 = 1_000_000_000;

/// A fixed span of a web request.
pub fn test_span() -> Span {
    Span {
        service: "django".to_string(),
        name: "django.controller".to_string(),
        resource: "GET /some/raclette".to_string(),
        trace_id: 42,
        span_id: 52,
        parent_id: 42,
        start: 1_448_466_874_000_000_000,
        duration: 10_000_000,
        error: 0,
        meta: HashMap::from([
            ("user".to_string(), "leo".to_string()),
            ("pool".to_string(), "fondue".to_string()),
        ]),
        metrics: HashMap::from([("cheese_weight".to_string(), 100_000.0)]),
        r#type: "http".to_string(),
    }
}

/// A span with the given identity, start (ns) and duration (ns).
pub fn span_with_key(service: &str, name: &str, resource: &str, start: i64, duration: i64) -> Span {
    Span {
        service: service.to_string(),
        name: name.to_string(),
        resource: resource.to_string(),
        trace_id: 1,
        span_id: 1,
        start,
        duration,
        ..Default::default()
    }
}

/// A one second bucket starting at 0 holding every given span with weight 1.
pub fn stats_bucket_with_spans(spans: &[Span]) -> StatsBucket {
    let mut bucket = StatsBucket::new(0, TEST_BUCKET_DURATION);
    for span in spans {
        #[allow(clippy::expect_used)]
        bucket
            .handle_span(span, 1, &[])
            .expect("fixture span must aggregate");
    }
    bucket
}
