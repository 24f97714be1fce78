#![warn(missing_docs)]

use serde::{de::Visitor, Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A logical cluster timestamp.
///
/// Writes are assigned one when they become durable, and causally consistent
/// or snapshot reads are pinned to one. Timestamps are totally ordered and
/// comparing two of them is the only thing the migration gate ever does.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Timestamp(pub u64);

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct TimestampVisitor;

        impl Visitor<'_> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a u64 integer or a decimal string")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Timestamp(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Timestamp::from_str(v).map_err(|e| E::custom(e))
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}

/// We tried to parse a timestamp from a string, but failed
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("TimestampParseError")]
pub struct TimestampParseError;

impl Timestamp {
    /// Maximum possible timestamp
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// A timestamp that no durable write is ever assigned
    pub const INVALID: Timestamp = Timestamp(0);

    /// Subtract a number, returning None on overflow.
    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Timestamp> {
        let other: u64 = other.into();
        self.0.checked_sub(other).map(Timestamp)
    }

    /// Add a number, returning None on overflow.
    pub fn checked_add<T: Into<u64>>(self, other: T) -> Option<Timestamp> {
        let other: u64 = other.into();
        self.0.checked_add(other).map(Timestamp)
    }

    /// The timestamp immediately following this one.
    pub fn next(self) -> Timestamp {
        self + 1
    }

    /// Return if the timestamp is valid
    pub fn is_valid(self) -> bool {
        self != Timestamp::INVALID
    }
}

impl From<u64> for Timestamp {
    fn from(n: u64) -> Self {
        Timestamp(n)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> u64 {
        ts.0
    }
}

impl FromStr for Timestamp {
    type Err = TimestampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Timestamp)
            .map_err(|_| TimestampParseError)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Self::Output {
        // panic if the addition overflows.
        Timestamp(self.0.checked_add(other).unwrap())
    }
}

/// A [`Timestamp`] that can be accessed atomically.
pub struct AtomicTimestamp {
    inner: AtomicU64,
}

impl AtomicTimestamp {
    /// Creates a new atomic `Timestamp`.
    pub fn new(val: u64) -> Self {
        AtomicTimestamp {
            inner: AtomicU64::new(val),
        }
    }

    /// Atomically retrieve the `Timestamp` value from memory.
    pub fn load(&self) -> Timestamp {
        Timestamp(self.inner.load(Ordering::Acquire))
    }

    /// Atomically advances to the next timestamp and returns it.
    ///
    /// This operation will panic on overflow.
    pub fn tick(&self) -> Timestamp {
        let prev = self.inner.fetch_add(1, Ordering::AcqRel);
        assert!(prev.checked_add(1).is_some(), "AtomicTimestamp overflow");
        Timestamp(prev + 1)
    }

    /// Atomically sets the timestamp to the max of old and new value, returning the old value.
    pub fn fetch_max(&self, ts: Timestamp) -> Timestamp {
        let prev = self.inner.fetch_max(ts.0, Ordering::AcqRel);
        Timestamp(prev)
    }
}

impl From<Timestamp> for AtomicTimestamp {
    fn from(ts: Timestamp) -> Self {
        Self::new(ts.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_strings() {
        assert_eq!("12345".parse(), Ok(Timestamp(12345)));
        assert_eq!(" 42 ".parse(), Ok(Timestamp(42)));
        assert_eq!("-1".parse::<Timestamp>(), Err(TimestampParseError));
        assert_eq!("abc".parse::<Timestamp>(), Err(TimestampParseError));
        assert_eq!(format!("{}", Timestamp(100)), "100");
        assert_eq!(format!("{:?}", Timestamp(100)), "Timestamp(100)");
    }

    #[test]
    fn test_timestamp_math() {
        assert_eq!(Timestamp(1234) + 11u64, Timestamp(1245));
        assert_eq!(Timestamp(1234).checked_sub(1233u64), Some(Timestamp(1)));
        assert_eq!(Timestamp(1234).checked_sub(1235u64), None);
        assert_eq!(Timestamp::MAX.checked_add(1u64), None);
        assert_eq!(Timestamp(7).next(), Timestamp(8));
        assert!(!Timestamp::INVALID.is_valid());
    }

    #[test]
    fn test_timestamp_serde() {
        let ts = Timestamp(150);
        let ser = serde_json::to_string(&ts).unwrap();
        assert_eq!(ser, "150");
        assert_eq!(serde_json::from_str::<Timestamp>(&ser).unwrap(), ts);
        assert_eq!(serde_json::from_str::<Timestamp>("\"150\"").unwrap(), ts);
    }

    #[test]
    fn test_atomic_timestamp() {
        let ts = AtomicTimestamp::new(10);
        assert_eq!(ts.tick(), Timestamp(11));
        assert_eq!(ts.fetch_max(Timestamp(5)), Timestamp(11));
        assert_eq!(ts.load(), Timestamp(11));
        assert_eq!(ts.fetch_max(Timestamp(100)), Timestamp(11));
        assert_eq!(ts.tick(), Timestamp(101));
    }
}
