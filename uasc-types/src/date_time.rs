// UASC for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `DateTime`.

use std::fmt;
use std::io::{Read, Write};
use std::ops::{Add, Sub};

use chrono::{Duration, TimeZone, Utc};

use crate::encoding::{
    read_i64, write_i64, DecodingOptions, EncodingResult, SimpleBinaryDecodable,
    SimpleBinaryEncodable,
};

const NANOS_PER_TICK: i64 = 100;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Minimum date in ticks, corresponds to 1601-01-01, the OPC-UA epoch.
const MIN_TICKS: i64 = 0;
/// Maximum date in ticks, corresponds to the end of 9999-12-31.
const MAX_TICKS: i64 = 2_650_467_743_999_999_999;

/// An OPC-UA `DateTime` - a wrapper around a UTC timestamp encoded on the
/// wire as the number of 100 nanosecond ticks since 1601-01-01.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTime {
    date_time: chrono::DateTime<Utc>,
}

impl DateTime {
    /// The current time.
    pub fn now() -> DateTime {
        DateTime {
            date_time: Utc::now(),
        }
    }

    /// The null date time, i.e. the epoch. Used where the field has no
    /// meaningful value.
    pub fn null() -> DateTime {
        DateTime::epoch()
    }

    /// The OPC-UA epoch, 1601-01-01 00:00:00 UTC.
    pub fn epoch() -> DateTime {
        DateTime {
            date_time: Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    /// `true` if this is the null / epoch date time.
    pub fn is_null(&self) -> bool {
        self.ticks() == 0
    }

    /// Create a date time from ticks since the OPC-UA epoch. Out of range
    /// values are clamped.
    pub fn from_ticks(ticks: i64) -> DateTime {
        let ticks = ticks.clamp(MIN_TICKS, MAX_TICKS);
        let secs = ticks / TICKS_PER_SECOND;
        let nanos = (ticks % TICKS_PER_SECOND) * NANOS_PER_TICK;
        DateTime {
            date_time: Self::epoch().date_time + Duration::seconds(secs) + Duration::nanoseconds(nanos),
        }
    }

    /// The number of 100 nanosecond ticks since the OPC-UA epoch, clamped
    /// into the valid range.
    pub fn ticks(&self) -> i64 {
        let delta = self.date_time - Self::epoch().date_time;
        let ticks = delta.num_seconds() * TICKS_PER_SECOND
            + delta.subsec_nanos() as i64 / NANOS_PER_TICK;
        ticks.clamp(MIN_TICKS, MAX_TICKS)
    }

    /// The inner chrono timestamp.
    pub fn as_chrono(&self) -> chrono::DateTime<Utc> {
        self.date_time
    }
}

impl From<chrono::DateTime<Utc>> for DateTime {
    fn from(date_time: chrono::DateTime<Utc>) -> Self {
        DateTime { date_time }
    }
}

impl From<std::time::SystemTime> for DateTime {
    fn from(value: std::time::SystemTime) -> Self {
        DateTime {
            date_time: value.into(),
        }
    }
}

impl Add<Duration> for DateTime {
    type Output = DateTime;

    fn add(self, rhs: Duration) -> Self::Output {
        DateTime {
            date_time: self.date_time + rhs,
        }
    }
}

impl Sub<DateTime> for DateTime {
    type Output = Duration;

    fn sub(self, rhs: DateTime) -> Self::Output {
        self.date_time - rhs.date_time
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date_time.to_rfc3339())
    }
}

impl SimpleBinaryEncodable for DateTime {
    fn byte_len(&self) -> usize {
        8
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_i64(stream, self.ticks())
    }
}

impl SimpleBinaryDecodable for DateTime {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(DateTime::from_ticks(read_i64(stream)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn epoch_is_zero() {
        assert_eq!(DateTime::epoch().ticks(), 0);
        assert!(DateTime::null().is_null());
        assert!(!DateTime::now().is_null());
    }

    #[test]
    fn round_trip() {
        let now = DateTime::now();
        let mut stream = Cursor::new(Vec::new());
        now.encode(&mut stream).unwrap();
        let mut stream = Cursor::new(stream.into_inner());
        let decoded = DateTime::decode(&mut stream, &DecodingOptions::test()).unwrap();
        // Encoding is at 100ns resolution so compare ticks, not instants
        assert_eq!(decoded.ticks(), now.ticks());
    }

    #[test]
    fn negative_ticks_clamp_to_epoch() {
        assert_eq!(DateTime::from_ticks(-1).ticks(), 0);
    }

    #[test]
    fn arithmetic() {
        let t0 = DateTime::now();
        let t1 = t0 + Duration::milliseconds(1500);
        assert_eq!((t1 - t0).num_milliseconds(), 1500);
    }
}
