// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mergeable, time-bucketed indicator values.
//!
//! An [`Indicator`] is identified by `(entity_id, time_bucket)` and carries one
//! [`IndicatorValue`]. Every value shape implements [`IndicatorFunction`]:
//! `combine` folds another observation of the same identity into it and
//! `calculate` refreshes the derived value (average, percentage, percentile).
//! `combine` is commutative and associative; `calculate` is idempotent.

use crate::errors::IndicatorError;
use crate::time_bucket::{self, Downsampling};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use ustr::Ustr;

/// Scale of [`PercentValue::percentage`]: `10000` means 100%.
pub const PERCENTAGE_SCALE: i64 = 10_000;

/// Identity of an indicator within one indicator kind.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{time_bucket}_{entity_id}")]
pub struct IndicatorId {
    pub entity_id: Ustr,
    pub time_bucket: i64,
}

pub trait IndicatorFunction {
    /// Name of the shape, also used as the `function` column in storage rows.
    const NAME: &'static str;

    fn combine(&mut self, other: &Self) -> Result<(), IndicatorError>;

    fn calculate(&mut self);
}

/// Sum of observed counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountValue {
    pub value: i64,
}

impl IndicatorFunction for CountValue {
    const NAME: &'static str = "count";

    fn combine(&mut self, other: &Self) -> Result<(), IndicatorError> {
        self.value += other.value;
        Ok(())
    }

    fn calculate(&mut self) {}
}

/// Integer average over all observed samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongAvgValue {
    pub summation: i64,
    pub count: i64,
    pub value: i64,
}

impl IndicatorFunction for LongAvgValue {
    const NAME: &'static str = "long_avg";

    fn combine(&mut self, other: &Self) -> Result<(), IndicatorError> {
        self.summation += other.summation;
        self.count += other.count;
        Ok(())
    }

    fn calculate(&mut self) {
        self.value = if self.count == 0 {
            0
        } else {
            self.summation / self.count
        };
    }
}

/// Ratio of matching observations, e.g. successful calls over all calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentValue {
    pub total: i64,
    #[serde(rename = "match")]
    pub matched: i64,
    /// Ratio in [`PERCENTAGE_SCALE`] units.
    pub percentage: i32,
}

impl IndicatorFunction for PercentValue {
    const NAME: &'static str = "percent";

    fn combine(&mut self, other: &Self) -> Result<(), IndicatorError> {
        self.total += other.total;
        self.matched += other.matched;
        Ok(())
    }

    fn calculate(&mut self) {
        self.percentage = if self.total == 0 {
            0
        } else {
            (self.matched * PERCENTAGE_SCALE / self.total) as i32
        };
    }
}

/// One histogram bucket: `count` samples fell into `[bucket * precision, (bucket + 1) * precision)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    pub bucket: i32,
    pub count: i64,
}

/// Latency histogram with a running percentile estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentileValue {
    /// Width of one histogram bucket, in the unit of the observed samples.
    pub precision: i32,
    /// Percentile rank in `1..=100`.
    pub rank: u8,
    /// Buckets sorted by `bucket`, no duplicates.
    pub detail: Vec<BucketCount>,
    pub value: i32,
}

impl PercentileValue {
    pub fn observe(sample: i64, precision: i32, rank: u8) -> Self {
        let precision = precision.max(1);
        let bucket = (sample.max(0) / i64::from(precision)).min(i64::from(i32::MAX)) as i32;
        Self {
            precision,
            rank: rank.clamp(1, 100),
            detail: vec![BucketCount { bucket, count: 1 }],
            value: 0,
        }
    }

    fn add(&mut self, incoming: BucketCount) {
        match self
            .detail
            .binary_search_by_key(&incoming.bucket, |b| b.bucket)
        {
            Ok(index) => self.detail[index].count += incoming.count,
            Err(index) => self.detail.insert(index, incoming),
        }
    }
}

impl IndicatorFunction for PercentileValue {
    const NAME: &'static str = "percentile";

    fn combine(&mut self, other: &Self) -> Result<(), IndicatorError> {
        if self.precision != other.precision || self.rank != other.rank {
            return Err(IndicatorError::ShapeMismatch(format!(
                "p{}/{} vs p{}/{}",
                self.rank, self.precision, other.rank, other.precision
            )));
        }
        for incoming in &other.detail {
            self.add(*incoming);
        }
        Ok(())
    }

    fn calculate(&mut self) {
        let total: i64 = self.detail.iter().map(|b| b.count).sum();
        let roof = (total * i64::from(self.rank) + 50) / 100;
        let mut running = 0;
        for element in &self.detail {
            running += element.count;
            if running >= roof {
                self.value = element.bucket.saturating_mul(self.precision);
                return;
            }
        }
    }
}

/// Value shape of an indicator kind, fixed per storage model.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    #[display("count")]
    Count,
    #[display("long_avg")]
    LongAvg,
    #[display("percent")]
    Percent,
    #[display("percentile")]
    Percentile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum IndicatorValue {
    Count(CountValue),
    LongAvg(LongAvgValue),
    Percent(PercentValue),
    Percentile(PercentileValue),
}

impl IndicatorValue {
    pub fn function(&self) -> Function {
        match self {
            IndicatorValue::Count(_) => Function::Count,
            IndicatorValue::LongAvg(_) => Function::LongAvg,
            IndicatorValue::Percent(_) => Function::Percent,
            IndicatorValue::Percentile(_) => Function::Percentile,
        }
    }

    pub fn function_name(&self) -> &'static str {
        match self {
            IndicatorValue::Count(_) => CountValue::NAME,
            IndicatorValue::LongAvg(_) => LongAvgValue::NAME,
            IndicatorValue::Percent(_) => PercentValue::NAME,
            IndicatorValue::Percentile(_) => PercentileValue::NAME,
        }
    }

    /// The scalar a dashboard would read: count, average, percentage or percentile.
    pub fn value(&self) -> i64 {
        match self {
            IndicatorValue::Count(v) => v.value,
            IndicatorValue::LongAvg(v) => v.value,
            IndicatorValue::Percent(v) => i64::from(v.percentage),
            IndicatorValue::Percentile(v) => i64::from(v.value),
        }
    }

    fn combine(&mut self, other: &IndicatorValue) -> Result<(), IndicatorError> {
        match (self, other) {
            (IndicatorValue::Count(a), IndicatorValue::Count(b)) => a.combine(b),
            (IndicatorValue::LongAvg(a), IndicatorValue::LongAvg(b)) => a.combine(b),
            (IndicatorValue::Percent(a), IndicatorValue::Percent(b)) => a.combine(b),
            (IndicatorValue::Percentile(a), IndicatorValue::Percentile(b)) => a.combine(b),
            (existing, incoming) => Err(IndicatorError::FunctionMismatch {
                existing: existing.function_name(),
                incoming: incoming.function_name(),
            }),
        }
    }

    fn calculate(&mut self) {
        match self {
            IndicatorValue::Count(v) => v.calculate(),
            IndicatorValue::LongAvg(v) => v.calculate(),
            IndicatorValue::Percent(v) => v.calculate(),
            IndicatorValue::Percentile(v) => v.calculate(),
        }
    }
}

/// A time-bucketed aggregate for one monitored entity.
///
/// Equality and hashing follow the identity `(entity_id, time_bucket)` only, so
/// two observations of the same entity in the same window are interchangeable
/// keys. Compare [`Indicator::value`] to assert on aggregated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicator {
    pub entity_id: Ustr,
    pub time_bucket: i64,
    #[serde(flatten)]
    pub value: IndicatorValue,
}

impl Indicator {
    pub fn new(entity_id: &str, time_bucket: i64, value: IndicatorValue) -> Self {
        Self {
            entity_id: Ustr::from(entity_id),
            time_bucket,
            value,
        }
    }

    pub fn count(entity_id: &str, time_bucket: i64, value: i64) -> Self {
        Self::new(
            entity_id,
            time_bucket,
            IndicatorValue::Count(CountValue { value }),
        )
    }

    pub fn long_avg(entity_id: &str, time_bucket: i64, sample: i64) -> Self {
        Self::new(
            entity_id,
            time_bucket,
            IndicatorValue::LongAvg(LongAvgValue {
                summation: sample,
                count: 1,
                value: 0,
            }),
        )
    }

    pub fn percent(entity_id: &str, time_bucket: i64, matched: bool) -> Self {
        Self::new(
            entity_id,
            time_bucket,
            IndicatorValue::Percent(PercentValue {
                total: 1,
                matched: i64::from(matched),
                percentage: 0,
            }),
        )
    }

    pub fn percentile(
        entity_id: &str,
        time_bucket: i64,
        sample: i64,
        precision: i32,
        rank: u8,
    ) -> Self {
        Self::new(
            entity_id,
            time_bucket,
            IndicatorValue::Percentile(PercentileValue::observe(sample, precision, rank)),
        )
    }

    pub fn id(&self) -> IndicatorId {
        IndicatorId {
            entity_id: self.entity_id,
            time_bucket: self.time_bucket,
        }
    }

    pub fn value(&self) -> i64 {
        self.value.value()
    }

    pub fn function(&self) -> Function {
        self.value.function()
    }

    pub fn function_name(&self) -> &'static str {
        self.value.function_name()
    }

    /// Folds `other` into `self`. Both must share identity and value shape.
    pub fn combine(&mut self, other: &Indicator) -> Result<(), IndicatorError> {
        if self.id() != other.id() {
            return Err(IndicatorError::IdentityMismatch {
                existing: self.id().to_string(),
                incoming: other.id().to_string(),
            });
        }
        self.value.combine(&other.value)
    }

    pub fn calculate(&mut self) {
        self.value.calculate();
    }

    /// Copies the current state into the coarser time bucket `to`.
    pub fn rollup(&self, to: Downsampling) -> Result<Indicator, IndicatorError> {
        Ok(Indicator {
            entity_id: self.entity_id,
            time_bucket: time_bucket::widen(self.time_bucket, to)?,
            value: self.value.clone(),
        })
    }

    pub fn to_hour(&self) -> Result<Indicator, IndicatorError> {
        self.rollup(Downsampling::Hour)
    }

    pub fn to_day(&self) -> Result<Indicator, IndicatorError> {
        self.rollup(Downsampling::Day)
    }

    pub fn to_month(&self) -> Result<Indicator, IndicatorError> {
        self.rollup(Downsampling::Month)
    }

    /// Hash over the entity only; every bucket of an entity routes to the same peer.
    pub fn remote_hash(&self) -> u64 {
        let mut hasher = fnv::FnvHasher::default();
        self.entity_id.as_str().hash(&mut hasher);
        hasher.finish()
    }
}

impl PartialEq for Indicator {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Indicator {}

impl Hash for Indicator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: i64 = 202403151427;

    #[test]
    fn test_count_combines_by_sum() {
        let mut a = Indicator::count("svc", MINUTE, 1);
        let b = Indicator::count("svc", MINUTE, 1);
        a.combine(&b).unwrap();
        a.calculate();
        assert_eq!(a.value, IndicatorValue::Count(CountValue { value: 2 }));
    }

    #[test]
    fn test_long_avg_calculates_integer_mean() {
        let mut a = Indicator::long_avg("svc", MINUTE, 10);
        a.combine(&Indicator::long_avg("svc", MINUTE, 25)).unwrap();
        a.calculate();
        assert_eq!(a.value(), 17);
    }

    #[test]
    fn test_percent_in_basis_points() {
        let mut a = Indicator::percent("svc", MINUTE, true);
        a.combine(&Indicator::percent("svc", MINUTE, true)).unwrap();
        a.combine(&Indicator::percent("svc", MINUTE, false)).unwrap();
        a.calculate();
        assert_eq!(a.value(), 6666);

        let mut empty = Indicator::new("svc", MINUTE, IndicatorValue::Percent(Default::default()));
        empty.calculate();
        assert_eq!(empty.value(), 0);
    }

    #[test]
    fn test_percentile_picks_bucket_reaching_rank() {
        let mut p50 = Indicator::percentile("svc", MINUTE, 5, 10, 50);
        for latency in [15, 25, 35, 120] {
            p50.combine(&Indicator::percentile("svc", MINUTE, latency, 10, 50))
                .unwrap();
        }
        p50.calculate();
        // 5 samples, roof = 3, third bucket is [20, 30).
        assert_eq!(p50.value(), 20);

        let mut p99 = Indicator::percentile("svc", MINUTE, 5, 10, 99);
        p99.combine(&Indicator::percentile("svc", MINUTE, 120, 10, 99))
            .unwrap();
        p99.calculate();
        assert_eq!(p99.value(), 120);
    }

    #[test]
    fn test_percentile_detail_stays_sorted() {
        let mut p = Indicator::percentile("svc", MINUTE, 90, 10, 50);
        p.combine(&Indicator::percentile("svc", MINUTE, 10, 10, 50))
            .unwrap();
        p.combine(&Indicator::percentile("svc", MINUTE, 95, 10, 50))
            .unwrap();
        let IndicatorValue::Percentile(value) = &p.value else {
            panic!("expected percentile");
        };
        assert_eq!(
            value.detail,
            vec![
                BucketCount {
                    bucket: 1,
                    count: 1
                },
                BucketCount {
                    bucket: 9,
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn test_combine_rejects_mismatches() {
        let mut count = Indicator::count("svc", MINUTE, 1);
        assert_eq!(
            count.combine(&Indicator::percent("svc", MINUTE, true)),
            Err(IndicatorError::FunctionMismatch {
                existing: "count",
                incoming: "percent",
            })
        );
        assert!(matches!(
            count.combine(&Indicator::count("other", MINUTE, 1)),
            Err(IndicatorError::IdentityMismatch { .. })
        ));

        let mut p50 = Indicator::percentile("svc", MINUTE, 1, 10, 50);
        assert!(matches!(
            p50.combine(&Indicator::percentile("svc", MINUTE, 1, 20, 50)),
            Err(IndicatorError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_identity_equality_ignores_value() {
        let a = Indicator::count("svc", MINUTE, 1);
        let b = Indicator::count("svc", MINUTE, 7);
        assert_eq!(a, b);
        assert_ne!(a, Indicator::count("svc", MINUTE + 1, 1));
        assert_eq!(a.id().to_string(), "202403151427_svc");
    }

    #[test]
    fn test_rollup_rekeys_and_copies_value() {
        let mut minute = Indicator::long_avg("svc", MINUTE, 40);
        minute.calculate();
        let hour = minute.to_hour().unwrap();
        assert_eq!(hour.time_bucket, 2024031514);
        assert_eq!(hour.value, minute.value);
        assert_eq!(minute.to_day().unwrap().time_bucket, 20240315);
        assert_eq!(minute.to_month().unwrap().time_bucket, 202403);
        assert!(hour.rollup(Downsampling::Minute).is_err());
    }

    #[test]
    fn test_remote_hash_ignores_time_bucket() {
        let a = Indicator::count("svc", MINUTE, 1);
        let b = Indicator::count("svc", 2024031514, 1);
        assert_eq!(a.remote_hash(), b.remote_hash());
    }

    #[test]
    fn test_row_shape() {
        let mut sla = Indicator::percent("svc", MINUTE, true);
        sla.calculate();
        let row = serde_json::to_value(&sla).unwrap();
        assert_eq!(
            row,
            serde_json::json!({
                "entity_id": "svc",
                "time_bucket": MINUTE,
                "function": "percent",
                "total": 1,
                "match": 1,
                "percentage": 10000,
            })
        );
        let back: Indicator = serde_json::from_value(row).unwrap();
        assert_eq!(back.value, sla.value);
    }

    fn percentile_sample() -> impl Strategy<Value = i64> {
        0i64..2_000
    }

    fn fold(mut samples: Vec<Indicator>) -> Indicator {
        let mut acc = samples.remove(0);
        acc.calculate();
        for sample in &samples {
            acc.combine(sample).unwrap();
            acc.calculate();
        }
        acc
    }

    proptest! {
        #[test]
        fn combine_order_does_not_matter(
            latencies in prop::collection::vec(percentile_sample(), 1..40),
            seed in any::<u64>(),
        ) {
            let build = |l: &i64| {
                vec![
                    Indicator::count("svc", MINUTE, 1),
                    Indicator::long_avg("svc", MINUTE, *l),
                    Indicator::percent("svc", MINUTE, *l % 3 != 0),
                    Indicator::percentile("svc", MINUTE, *l, 10, 90),
                ]
            };
            let forward: Vec<Vec<Indicator>> = latencies.iter().map(build).collect();
            let mut shuffled = forward.clone();
            // Fisher-Yates driven by an LCG seeded from the input.
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                let j = ((state >> 33) % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }

            for shape in 0..4 {
                let a = fold(forward.iter().map(|s| s[shape].clone()).collect());
                let b = fold(shuffled.iter().map(|s| s[shape].clone()).collect());
                prop_assert_eq!(&a.value, &b.value);
            }
        }

        #[test]
        fn combine_is_associative(a in 0i64..1_000, b in 0i64..1_000, c in 0i64..1_000) {
            let make = |v: i64| Indicator::percentile("svc", MINUTE, v, 10, 50);
            // (a + b) + c
            let mut left = make(a);
            left.combine(&make(b)).unwrap();
            left.combine(&make(c)).unwrap();
            left.calculate();
            // a + (b + c)
            let mut bc = make(b);
            bc.combine(&make(c)).unwrap();
            let mut right = make(a);
            right.combine(&bc).unwrap();
            right.calculate();
            prop_assert_eq!(left.value, right.value);
        }

        #[test]
        fn calculate_is_idempotent(samples in prop::collection::vec(percentile_sample(), 1..20)) {
            let mut acc = fold(samples.iter().map(|s| Indicator::percentile("svc", MINUTE, *s, 10, 75)).collect());
            let once = acc.value.clone();
            acc.calculate();
            prop_assert_eq!(once, acc.value);
        }

        #[test]
        fn rollup_commutes_with_combine(
            minute_a in 0i64..60,
            minute_b in 0i64..60,
            x in 0i64..500,
            y in 0i64..500,
        ) {
            let hour = 2024031514_i64;
            let a = Indicator::long_avg("svc", hour * 100 + minute_a, x);
            let b = Indicator::long_avg("svc", hour * 100 + minute_b, y);

            // Roll both up, then combine.
            let mut rolled = a.to_hour().unwrap();
            rolled.combine(&b.to_hour().unwrap()).unwrap();
            rolled.calculate();

            // Combine as one minute record, then roll up.
            let mut merged = a.clone();
            merged.combine(&Indicator::long_avg("svc", a.time_bucket, y)).unwrap();
            merged.calculate();
            let merged = merged.to_hour().unwrap();

            prop_assert_eq!(rolled.time_bucket, hour);
            prop_assert_eq!(rolled.id(), merged.id());
            prop_assert_eq!(rolled.value, merged.value);
        }
    }
}
