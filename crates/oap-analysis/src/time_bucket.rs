// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time bucket encodings and the pure widening function used by rollups.
//!
//! A time bucket is a decimal encoding of a UTC wall-clock window:
//!
//! | granularity | encoding       | example        |
//! |-------------|----------------|----------------|
//! | minute      | `YYYYMMDDHHmm` | `202403151427` |
//! | hour        | `YYYYMMDDHH`   | `2024031514`   |
//! | day         | `YYYYMMDD`     | `20240315`     |
//! | month       | `YYYYMM`       | `202403`       |
//!
//! Each coarser level drops the two lowest digits, so widening is a division
//! by `100` per step and never depends on calendar arithmetic.

use crate::errors::TimeBucketError;
use chrono::{DateTime, Datelike, Timelike, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Downsampling {
    #[display("minute")]
    Minute,
    #[display("hour")]
    Hour,
    #[display("day")]
    Day,
    #[display("month")]
    Month,
}

impl Downsampling {
    pub const ALL: [Downsampling; 4] = [
        Downsampling::Minute,
        Downsampling::Hour,
        Downsampling::Day,
        Downsampling::Month,
    ];

    /// The next coarser granularity, `None` for month.
    pub fn coarser(self) -> Option<Downsampling> {
        match self {
            Downsampling::Minute => Some(Downsampling::Hour),
            Downsampling::Hour => Some(Downsampling::Day),
            Downsampling::Day => Some(Downsampling::Month),
            Downsampling::Month => None,
        }
    }

    /// Infers the granularity of an encoded bucket from its digit count.
    pub fn of(time_bucket: i64) -> Result<Downsampling, TimeBucketError> {
        match time_bucket {
            100_000_000_000..=999_999_999_999 => Ok(Downsampling::Minute),
            1_000_000_000..=9_999_999_999 => Ok(Downsampling::Hour),
            10_000_000..=99_999_999 => Ok(Downsampling::Day),
            100_000..=999_999 => Ok(Downsampling::Month),
            _ => Err(TimeBucketError::UnknownGranularity(time_bucket)),
        }
    }

    /// Suffix appended to a model name to build its table name. Minute tables
    /// carry the bare model name.
    pub fn table_suffix(self) -> Option<&'static str> {
        match self {
            Downsampling::Minute => None,
            Downsampling::Hour => Some("hour"),
            Downsampling::Day => Some("day"),
            Downsampling::Month => Some("month"),
        }
    }

    fn level(self) -> u32 {
        match self {
            Downsampling::Minute => 0,
            Downsampling::Hour => 1,
            Downsampling::Day => 2,
            Downsampling::Month => 3,
        }
    }
}

/// Re-encodes `time_bucket` at the coarser granularity `to`.
///
/// Widening to the bucket's own granularity returns it unchanged; widening to a
/// finer granularity is an error.
pub fn widen(time_bucket: i64, to: Downsampling) -> Result<i64, TimeBucketError> {
    let from = Downsampling::of(time_bucket)?;
    if to < from {
        return Err(TimeBucketError::NotCoarser {
            bucket: time_bucket,
            from,
            to,
        });
    }
    Ok(time_bucket / 100_i64.pow(to.level() - from.level()))
}

/// Minute bucket of a UTC timestamp expressed in epoch milliseconds.
pub fn minute_bucket(epoch_millis: i64) -> Result<i64, TimeBucketError> {
    let at: DateTime<Utc> = DateTime::from_timestamp_millis(epoch_millis)
        .ok_or(TimeBucketError::TimestampOutOfRange(epoch_millis))?;
    let bucket = i64::from(at.year()) * 100_000_000
        + i64::from(at.month()) * 1_000_000
        + i64::from(at.day()) * 10_000
        + i64::from(at.hour()) * 100
        + i64::from(at.minute());
    // Years outside 1000..=9999 do not fit the fixed-width encoding.
    Downsampling::of(bucket)
        .ok()
        .filter(|d| *d == Downsampling::Minute)
        .map(|_| bucket)
        .ok_or(TimeBucketError::TimestampOutOfRange(epoch_millis))
}
