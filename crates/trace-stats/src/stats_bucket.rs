// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::distribution::Distribution;
use crate::errors::StatsError;
use crate::span::Span;
use crate::tags::Tags;

/// Measure name of the span duration distribution.
pub const DURATION_MEASURE: &str = "duration";

const BASE_AGGREGATORS: [&str; 3] = ["service", "name", "resource"];

/// Grouping identity of a span within a bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationKey {
    pub service: String,
    pub name: String,
    pub resource: String,
    /// Values of the extra aggregators, in configuration order. A missing tag is part of
    /// the identity.
    pub extra: Vec<(String, Option<String>)>,
}

impl AggregationKey {
    pub fn from_span(span: &Span, aggregators: &[String]) -> Result<Self, StatsError> {
        if span.service.is_empty() && span.name.is_empty() {
            return Err(StatsError::MalformedKey);
        }
        let extra = aggregators
            .iter()
            .filter(|tag| !BASE_AGGREGATORS.contains(&tag.as_str()))
            .map(|tag| (tag.clone(), span.tag(tag)))
            .collect();
        Ok(Self {
            service: span.service.clone(),
            name: span.name.clone(),
            resource: span.resource.clone(),
            extra,
        })
    }

    pub fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        tags.insert("service", self.service.as_str());
        tags.insert("name", self.name.as_str());
        tags.insert("resource", self.resource.as_str());
        for (tag, value) in &self.extra {
            if let Some(value) = value {
                tags.insert(tag.as_str(), value.as_str());
            }
        }
        tags
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service:{},name:{},resource:{}",
            self.service, self.name, self.resource
        )?;
        for (tag, value) in &self.extra {
            if let Some(value) = value {
                write!(f, ",{tag}:{value}")?;
            }
        }
        Ok(())
    }
}

/// Counters and distributions of one aggregation key within a bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub hits: u64,
    /// Hits extrapolated by the span weights.
    pub weighted_hits: u64,
    pub errors: u64,
    /// Sum of span durations, in nanoseconds.
    pub duration_sum: u64,
    pub distributions: BTreeMap<String, Distribution>,
}

impl StatsEntry {
    fn new(key: &AggregationKey) -> Self {
        let duration = Distribution::new(
            DURATION_MEASURE,
            format!("{DURATION_MEASURE}|{key}"),
            key.tags(),
        );
        Self {
            hits: 0,
            weighted_hits: 0,
            errors: 0,
            duration_sum: 0,
            distributions: BTreeMap::from([(DURATION_MEASURE.to_string(), duration)]),
        }
    }

    pub fn distribution(&self, measure: &str) -> Option<&Distribution> {
        self.distributions.get(measure)
    }
}

/// Aggregated statistics of every span whose start falls in `[start, start + duration)`.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsBucket {
    start: u64,
    duration: u64,
    entries: HashMap<AggregationKey, StatsEntry>,
}

impl StatsBucket {
    pub fn new(start: u64, duration: u64) -> Self {
        Self {
            start,
            duration,
            entries: HashMap::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.duration)
    }

    /// Aggregates `span` under the key derived from `aggregators`, feeding its duration into
    /// the duration distribution `weight` times.
    pub fn handle_span(
        &mut self,
        span: &Span,
        weight: u64,
        aggregators: &[String],
    ) -> Result<(), StatsError> {
        let key = AggregationKey::from_span(span, aggregators)?;
        self.add(key, span, weight)
    }

    pub(crate) fn add(
        &mut self,
        key: AggregationKey,
        span: &Span,
        weight: u64,
    ) -> Result<(), StatsError> {
        let duration = u64::try_from(span.duration).unwrap_or(0);
        let entry = self
            .entries
            .entry(key)
            .or_insert_with_key(|key| StatsEntry::new(key));

        if let Some(distribution) = entry.distributions.get_mut(DURATION_MEASURE) {
            distribution.add(duration as f64, weight)?;
        }
        entry.hits += 1;
        entry.weighted_hits = entry.weighted_hits.saturating_add(weight);
        if span.is_error() {
            entry.errors += 1;
        }
        entry.duration_sum = entry.duration_sum.saturating_add(duration);
        Ok(())
    }

    pub fn get(&self, key: &AggregationKey) -> Option<&StatsEntry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&AggregationKey, &StatsEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Splits the bucket into buckets of the same window holding at most `max_entries`
    /// entries each, keys in ascending order.
    pub fn split(self, max_entries: usize) -> Vec<StatsBucket> {
        let max_entries = max_entries.max(1);
        if self.entries.len() <= max_entries {
            return vec![self];
        }
        let (start, duration) = (self.start, self.duration);
        let mut sorted: Vec<(AggregationKey, StatsEntry)> = self.entries.into_iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buckets = Vec::with_capacity(sorted.len().div_ceil(max_entries));
        let mut current = StatsBucket::new(start, duration);
        for (key, entry) in sorted {
            if current.entries.len() == max_entries {
                buckets.push(std::mem::replace(
                    &mut current,
                    StatsBucket::new(start, duration),
                ));
            }
            current.entries.insert(key, entry);
        }
        buckets.push(current);
        buckets
    }
}

#[derive(Serialize)]
struct GroupedStats<'a> {
    #[serde(flatten)]
    key: &'a AggregationKey,
    #[serde(flatten)]
    stats: &'a StatsEntry,
}

#[derive(Serialize)]
struct SerializedBucket<'a> {
    start: u64,
    duration: u64,
    stats: Vec<GroupedStats<'a>>,
}

impl Serialize for StatsBucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut stats: Vec<GroupedStats<'_>> = self
            .entries
            .iter()
            .map(|(key, stats)| GroupedStats { key, stats })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(b.key));
        SerializedBucket {
            start: self.start,
            duration: self.duration,
            stats,
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{span_with_key, stats_bucket_with_spans, test_span};

    fn aggregators() -> Vec<String> {
        vec!["http.status_code".to_string()]
    }

    #[test]
    fn test_identical_spans_share_one_entry() {
        let spans: Vec<Span> = (0..10)
            .map(|i| span_with_key("a", "b", "c", i * 1_000, 100))
            .collect();
        let bucket = stats_bucket_with_spans(&spans);

        assert_eq!(bucket.len(), 1);
        let (key, entry) = bucket.entries().next().unwrap();
        assert_eq!(key.to_string(), "service:a,name:b,resource:c");
        assert_eq!(entry.hits, 10);
        assert_eq!(entry.errors, 0);
        assert_eq!(entry.duration_sum, 1_000);
        assert_eq!(entry.distribution(DURATION_MEASURE).unwrap().count(), 10);
    }

    #[test]
    fn test_errors_and_weights() {
        let mut bucket = StatsBucket::new(0, 1_000_000_000);
        let mut failing = span_with_key("a", "b", "c", 0, 50);
        failing.error = 1;
        bucket.handle_span(&failing, 4, &[]).unwrap();
        bucket
            .handle_span(&span_with_key("a", "b", "c", 0, 150), 1, &[])
            .unwrap();

        let entry = bucket.entries().next().unwrap().1;
        assert_eq!(entry.hits, 2);
        assert_eq!(entry.weighted_hits, 5);
        assert_eq!(entry.errors, 1);
        assert_eq!(entry.duration_sum, 200);
        let duration = entry.distribution(DURATION_MEASURE).unwrap();
        assert_eq!(duration.count(), 5);
        assert_eq!(duration.tags().get("service"), Some("a"));
    }

    #[test]
    fn test_extra_aggregators_split_keys() {
        let mut bucket = StatsBucket::new(0, 1_000_000_000);
        let mut ok = span_with_key("a", "b", "c", 0, 10);
        ok.meta
            .insert("http.status_code".to_string(), "200".to_string());
        let mut not_found = ok.clone();
        not_found
            .meta
            .insert("http.status_code".to_string(), "404".to_string());
        let untagged = span_with_key("a", "b", "c", 0, 10);

        for span in [&ok, &ok, &not_found, &untagged] {
            bucket.handle_span(span, 1, &aggregators()).unwrap();
        }
        assert_eq!(bucket.len(), 3);

        let key = AggregationKey::from_span(&ok, &aggregators()).unwrap();
        assert_eq!(
            key.to_string(),
            "service:a,name:b,resource:c,http.status_code:200"
        );
        assert_eq!(bucket.get(&key).unwrap().hits, 2);
    }

    #[test]
    fn test_base_aggregators_are_not_duplicated() {
        let span = test_span();
        let key = AggregationKey::from_span(
            &span,
            &["service".to_string(), "name".to_string(), "resource".to_string()],
        )
        .unwrap();
        assert!(key.extra.is_empty());
    }

    #[test]
    fn test_malformed_key_leaves_bucket_untouched() {
        let mut bucket = StatsBucket::new(0, 10);
        let span = span_with_key("", "", "c", 0, 10);
        assert_eq!(
            bucket.handle_span(&span, 1, &[]),
            Err(StatsError::MalformedKey)
        );
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_negative_duration_counts_as_zero() {
        let mut bucket = StatsBucket::new(0, 10);
        bucket
            .handle_span(&span_with_key("a", "b", "c", 0, -20), 1, &[])
            .unwrap();
        assert_eq!(bucket.entries().next().unwrap().1.duration_sum, 0);
    }

    #[test]
    fn test_split() {
        let spans: Vec<Span> = (0..5)
            .map(|i| span_with_key("a", "b", &format!("r{i}"), 0, 10))
            .collect();
        let bucket = stats_bucket_with_spans(&spans);

        let parts = bucket.clone().split(2);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().map(StatsBucket::len).sum::<usize>(), 5);
        assert!(parts.iter().all(|b| b.start() == 0 && b.len() <= 2));

        assert_eq!(bucket.split(10).len(), 1);
    }

    #[test]
    fn test_serialized_entries_are_sorted() {
        let spans = vec![
            span_with_key("b", "op", "r", 0, 10),
            span_with_key("a", "op", "r", 0, 10),
        ];
        let json = serde_json::to_value(stats_bucket_with_spans(&spans)).unwrap();
        assert_eq!(json["start"], 0);
        assert_eq!(json["stats"][0]["service"], "a");
        assert_eq!(json["stats"][1]["service"], "b");
        assert_eq!(json["stats"][1]["hits"], 1);
        assert!(json["stats"][0]["distributions"]["duration"].is_object());
    }
}
