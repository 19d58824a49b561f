// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Approximate, mergeable quantile summary for weighted measures.
//!
//! Values are mapped onto logarithmically spaced bins: a positive value `v` lands in bin
//! `ceil(log_gamma(v))` with `gamma = (1 + a) / (1 - a)`, so every value of a bin is within a
//! relative distance `a` of the bin's representative value. Negative values use a mirrored
//! store and values too small to be indexed share a single zero bin.
//!
//! Memory is bounded by `max_bins` per store. When a store grows past it, its lowest bins
//! are folded into their neighbour, trading accuracy on the smallest values for a fixed
//! footprint. Latency distributions care about the tail, which is kept intact.
//!
//! Merging adds bin counts, so it is commutative and associative as long as no collapse
//! happens, and stays within the accuracy bound of the collapsed bins otherwise.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::tags::Tags;

/// Default relative accuracy of quantile estimates (1%).
pub const DEFAULT_RELATIVE_ACCURACY: f64 = 0.01;

/// Default upper bound on the number of bins kept per store.
pub const DEFAULT_MAX_BINS: usize = 2048;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DistributionError {
    #[error("cannot add non-finite value {0}")]
    NonFiniteValue(f64),

    #[error("weight must not be negative, got {0}")]
    NegativeWeight(i64),

    #[error("relative accuracy must be within (0, 1), got {0}")]
    InvalidAccuracy(f64),

    #[error("max bins must be at least 1")]
    InvalidMaxBins,

    #[error("cannot merge distributions of different accuracy ({0} and {1})")]
    IncompatibleAccuracy(f64, f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SketchConfig {
    pub relative_accuracy: f64,
    pub max_bins: usize,
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            relative_accuracy: DEFAULT_RELATIVE_ACCURACY,
            max_bins: DEFAULT_MAX_BINS,
        }
    }
}

impl SketchConfig {
    pub fn new(relative_accuracy: f64, max_bins: usize) -> Result<Self, DistributionError> {
        if !(relative_accuracy > 0.0 && relative_accuracy < 1.0) {
            return Err(DistributionError::InvalidAccuracy(relative_accuracy));
        }
        if max_bins == 0 {
            return Err(DistributionError::InvalidMaxBins);
        }
        Ok(Self {
            relative_accuracy,
            max_bins,
        })
    }

    fn gamma(&self) -> f64 {
        (1.0 + self.relative_accuracy) / (1.0 - self.relative_accuracy)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Store {
    bins: BTreeMap<i32, u64>,
}

impl Store {
    fn add(&mut self, index: i32, weight: u64) {
        let count = self.bins.entry(index).or_insert(0);
        *count = count.saturating_add(weight);
    }

    fn merge(&mut self, other: &Store) {
        for (index, count) in &other.bins {
            self.add(*index, *count);
        }
    }

    fn collapse_lowest(&mut self, max_bins: usize) {
        while self.bins.len() > max_bins {
            let Some((_, count)) = self.bins.pop_first() else {
                return;
            };
            if let Some(mut lowest) = self.bins.first_entry() {
                let merged = lowest.get().saturating_add(count);
                *lowest.get_mut() = merged;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Sketch {
    config: SketchConfig,
    gamma: f64,
    ln_gamma: f64,
    positive: Store,
    negative: Store,
    zero_count: u64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Sketch {
    fn new(config: SketchConfig) -> Self {
        let gamma = config.gamma();
        Self {
            config,
            gamma,
            ln_gamma: gamma.ln(),
            positive: Store::default(),
            negative: Store::default(),
            zero_count: 0,
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    fn index(&self, magnitude: f64) -> i32 {
        (magnitude.ln() / self.ln_gamma).ceil() as i32
    }

    /// Representative value of a bin, within the relative accuracy of every value it holds.
    fn value(&self, index: i32) -> f64 {
        2.0 * self.gamma.powi(index) / (1.0 + self.gamma)
    }

    fn add(&mut self, value: f64, weight: u64) {
        if value > f64::MIN_POSITIVE {
            let index = self.index(value);
            self.positive.add(index, weight);
            self.positive.collapse_lowest(self.config.max_bins);
        } else if value < -f64::MIN_POSITIVE {
            let index = self.index(-value);
            self.negative.add(index, weight);
            self.negative.collapse_lowest(self.config.max_bins);
        } else {
            self.zero_count = self.zero_count.saturating_add(weight);
        }

        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count = self.count.saturating_add(weight);
        self.sum += value * weight as f64;
    }

    fn merge(&mut self, other: &Sketch) {
        if other.count == 0 {
            return;
        }
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
        self.positive.collapse_lowest(self.config.max_bins);
        self.negative.collapse_lowest(self.config.max_bins);
        self.zero_count = self.zero_count.saturating_add(other.zero_count);

        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count = self.count.saturating_add(other.count);
        self.sum += other.sum;
    }

    fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let q = if q.is_nan() { 0.0 } else { q.clamp(0.0, 1.0) };
        if q == 0.0 {
            return self.min;
        }
        if q == 1.0 {
            return self.max;
        }

        let rank = q * (self.count - 1) as f64;
        let mut cumulative: u64 = 0;

        // most negative first: highest magnitude index of the negative store
        for (index, count) in self.negative.bins.iter().rev() {
            cumulative = cumulative.saturating_add(*count);
            if cumulative as f64 > rank {
                return self.clamp(-self.value(*index));
            }
        }
        cumulative = cumulative.saturating_add(self.zero_count);
        if cumulative as f64 > rank {
            return self.clamp(0.0);
        }
        for (index, count) in &self.positive.bins {
            cumulative = cumulative.saturating_add(*count);
            if cumulative as f64 > rank {
                return self.clamp(self.value(*index));
            }
        }
        self.max
    }

    fn clamp(&self, estimate: f64) -> f64 {
        estimate.clamp(self.min, self.max)
    }
}

/// Named, weighted approximate summary of a measure (e.g. span duration) for one
/// aggregation key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    measure: String,
    key: String,
    tags: Tags,
    sketch: Sketch,
}

impl Distribution {
    pub fn new(measure: impl Into<String>, key: impl Into<String>, tags: Tags) -> Self {
        Self::with_config(measure, key, tags, SketchConfig::default())
    }

    pub fn with_config(
        measure: impl Into<String>,
        key: impl Into<String>,
        tags: Tags,
        config: SketchConfig,
    ) -> Self {
        Self {
            measure: measure.into(),
            key: key.into(),
            tags,
            sketch: Sketch::new(config),
        }
    }

    /// Adds `value` observed `weight` times. A zero weight is a no-op.
    pub fn add(&mut self, value: f64, weight: u64) -> Result<(), DistributionError> {
        if !value.is_finite() {
            return Err(DistributionError::NonFiniteValue(value));
        }
        if weight == 0 {
            return Ok(());
        }
        self.sketch.add(value, weight);
        Ok(())
    }

    /// Same as [`Distribution::add`] for callers holding a signed weight; negative weights
    /// are rejected and leave the summary untouched.
    pub fn add_signed(&mut self, value: f64, weight: i64) -> Result<(), DistributionError> {
        let weight = u64::try_from(weight).map_err(|_| DistributionError::NegativeWeight(weight))?;
        self.add(value, weight)
    }

    /// Estimated value at quantile `q`, `q` being clamped into `[0, 1]`.
    ///
    /// Returns the exact minimum and maximum for `q = 0` and `q = 1`, and `0.0` when the
    /// distribution is empty.
    pub fn quantile(&self, q: f64) -> f64 {
        self.sketch.quantile(q)
    }

    pub fn merge(&mut self, other: &Distribution) -> Result<(), DistributionError> {
        let (ours, theirs) = (
            self.sketch.config.relative_accuracy,
            other.sketch.config.relative_accuracy,
        );
        if ours.to_bits() != theirs.to_bits() {
            return Err(DistributionError::IncompatibleAccuracy(ours, theirs));
        }
        self.sketch.merge(&other.sketch);
        Ok(())
    }

    pub fn measure(&self) -> &str {
        &self.measure
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Total weight added.
    pub fn count(&self) -> u64 {
        self.sketch.count
    }

    /// Weighted sum of the added values.
    pub fn sum(&self) -> f64 {
        self.sketch.sum
    }

    pub fn min(&self) -> f64 {
        self.sketch.min
    }

    pub fn max(&self) -> f64 {
        self.sketch.max
    }

    pub fn is_empty(&self) -> bool {
        self.sketch.count == 0
    }

    pub fn relative_accuracy(&self) -> f64 {
        self.sketch.config.relative_accuracy
    }

    /// Number of non-empty bins, the zero bin excluded.
    pub fn bin_count(&self) -> usize {
        self.sketch.positive.bins.len() + self.sketch.negative.bins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_relative(actual: f64, expected: f64, tolerance: f64) {
        let error = ((actual - expected) / expected).abs();
        assert!(
            error <= tolerance,
            "expected {expected} within {tolerance}, got {actual}"
        );
    }

    fn distribution() -> Distribution {
        let tags = Tags::from_string("service:X,name:Y,host:Z");
        Distribution::new("duration", "duration|service:X,name:Y,host:Z", tags)
    }

    fn filled<I: IntoIterator<Item = u64>>(values: I) -> Distribution {
        let mut d = distribution();
        for v in values {
            d.add(v as f64, 1).unwrap();
        }
        d
    }

    #[test]
    fn test_empty_distribution() {
        let d = distribution();
        assert!(d.is_empty());
        assert_eq!(d.quantile(0.5), 0.0);
        assert_eq!(d.measure(), "duration");
        assert_eq!(d.tags().get("host"), Some("Z"));
    }

    #[test]
    fn test_quantiles_within_relative_accuracy() {
        let d = filled(1..=10_000);
        assert_eq!(d.count(), 10_000);
        assert_eq!(d.quantile(0.0), 1.0);
        assert_eq!(d.quantile(1.0), 10_000.0);
        assert_relative(d.quantile(0.5), 5_000.0, 0.011);
        assert_relative(d.quantile(0.9), 9_000.0, 0.011);
        assert_relative(d.quantile(0.99), 9_900.0, 0.011);
        assert_eq!(d.sum(), 50_005_000.0);
    }

    #[test]
    fn test_weights_act_as_repetitions() {
        let mut d = distribution();
        d.add(10.0, 9).unwrap();
        d.add(1_000.0, 1).unwrap();
        assert_eq!(d.count(), 10);
        assert_relative(d.quantile(0.5), 10.0, 0.011);
        assert_eq!(d.quantile(1.0), 1_000.0);
    }

    #[test]
    fn test_zero_weight_is_noop() {
        let mut d = distribution();
        d.add(42.0, 0).unwrap();
        assert!(d.is_empty());
        assert_eq!(d.sum(), 0.0);
    }

    #[test]
    fn test_rejects_invalid_input() {
        let mut d = distribution();
        assert_eq!(
            d.add(f64::NAN, 1).unwrap_err().to_string(),
            "cannot add non-finite value NaN"
        );
        assert_eq!(
            d.add_signed(1.0, -3),
            Err(DistributionError::NegativeWeight(-3))
        );
        assert!(d.is_empty());
        d.add_signed(1.0, 3).unwrap();
        assert_eq!(d.count(), 3);
    }

    #[test]
    fn test_negative_and_zero_values() {
        let mut d = distribution();
        for v in [-100.0, -10.0, 0.0, 0.0, 10.0, 100.0] {
            d.add(v, 1).unwrap();
        }
        assert_eq!(d.quantile(0.0), -100.0);
        assert_relative(d.quantile(0.2), -10.0, 0.011);
        assert_eq!(d.quantile(0.5), 0.0);
        assert_relative(d.quantile(0.8), 10.0, 0.011);
        assert_eq!(d.quantile(1.0), 100.0);
    }

    #[test]
    fn test_memory_is_bounded() {
        let config = SketchConfig::new(0.01, 32).unwrap();
        let mut d = Distribution::with_config("duration", "k", Tags::new(), config);
        for v in 1..=100_000u64 {
            d.add(v as f64, 1).unwrap();
        }
        assert!(d.bin_count() <= 32, "{} bins", d.bin_count());
        assert_eq!(d.count(), 100_000);
        // collapsing folds the lowest bins, the tail keeps its accuracy
        assert_relative(d.quantile(0.99), 99_000.0, 0.011);
    }

    #[test]
    fn test_merge_is_commutative() {
        let odd = filled((1..=10_000).filter(|v| v % 2 == 1));
        let even = filled((1..=10_000).filter(|v| v % 2 == 0));

        let mut a = odd.clone();
        a.merge(&even).unwrap();
        let mut b = even.clone();
        b.merge(&odd).unwrap();

        let whole = filled(1..=10_000);
        for q in [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 0.99, 1.0] {
            assert_eq!(a.quantile(q), b.quantile(q));
            assert_eq!(a.quantile(q), whole.quantile(q));
        }
        assert_eq!(a.count(), 10_000);
    }

    #[test]
    fn test_merge_is_associative() {
        let x = filled(1..=300);
        let y = filled(301..=3_000);
        let z = filled(3_001..=50_000);

        let mut left = x.clone();
        left.merge(&y).unwrap();
        left.merge(&z).unwrap();

        let mut yz = y.clone();
        yz.merge(&z).unwrap();
        let mut right = x.clone();
        right.merge(&yz).unwrap();

        for q in [0.01, 0.5, 0.95, 0.999] {
            assert_eq!(left.quantile(q), right.quantile(q));
        }
    }

    #[test]
    fn test_merge_into_empty_takes_bounds() {
        let mut d = distribution();
        d.merge(&filled([5, 7, 9])).unwrap();
        assert_eq!(d.min(), 5.0);
        assert_eq!(d.max(), 9.0);
        d.merge(&distribution()).unwrap();
        assert_eq!(d.count(), 3);
    }

    #[test]
    fn test_merge_rejects_different_accuracy() {
        let config = SketchConfig::new(0.05, 128).unwrap();
        let mut coarse = Distribution::with_config("duration", "k", Tags::new(), config);
        assert!(matches!(
            coarse.merge(&distribution()),
            Err(DistributionError::IncompatibleAccuracy(_, _))
        ));
    }

    #[test]
    fn test_invalid_config() {
        assert_eq!(
            SketchConfig::new(1.5, 10),
            Err(DistributionError::InvalidAccuracy(1.5))
        );
        assert_eq!(
            SketchConfig::new(0.01, 0),
            Err(DistributionError::InvalidMaxBins)
        );
    }

    #[test]
    fn test_serializes() {
        let d = filled([1, 2, 3]);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["measure"], "duration");
        assert_eq!(json["sketch"]["count"], 3);
    }

    proptest! {
        #[test]
        fn prop_quantile_is_monotonic(
            values in prop::collection::vec((-1e9f64..1e9f64, 0u64..100), 1..200)
        ) {
            let mut d = distribution();
            for (v, w) in values {
                d.add(v, w).unwrap();
            }
            let qs = [0.0, 0.01, 0.1, 0.25, 0.5, 0.75, 0.9, 0.99, 1.0];
            for pair in qs.windows(2) {
                prop_assert!(d.quantile(pair[0]) <= d.quantile(pair[1]));
            }
        }

        #[test]
        fn prop_merge_order_does_not_matter(
            left in prop::collection::vec(1u64..1_000_000, 1..100),
            right in prop::collection::vec(1u64..1_000_000, 1..100),
        ) {
            let (a, b) = (filled(left), filled(right));
            let mut ab = a.clone();
            ab.merge(&b).unwrap();
            let mut ba = b.clone();
            ba.merge(&a).unwrap();
            for q in [0.0, 0.5, 0.9, 1.0] {
                prop_assert_eq!(ab.quantile(q), ba.quantile(q));
            }
        }
    }
}
