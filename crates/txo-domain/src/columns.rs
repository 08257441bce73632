//! Typed column wrappers that realize the store's type-conversion rules
//! (spec §4.2) as ordinary Rust newtypes with custom (de)serialization,
//! rather than a dynamic, reflection-driven conversion layer.
//!
//! Each wrapper round-trips through `serde_json` the way it would round-trip
//! through a row decoder: `IntColumn` enforces the same safe-integer range a
//! fixed-width `INT64` column would, `BigIntColumn` preserves arbitrary
//! precision as a decimal string, `Timestamp` truncates to millisecond
//! precision on the way in, and `PreciseTimestamp` keeps full (nanosecond)
//! precision.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// The largest (and smallest, negated) integer a double can represent
/// exactly — the "safe range" spec §4.2 requires `isInt` columns to honor.
pub const SAFE_INTEGER_MAX: i64 = 9_007_199_254_740_991;
pub const SAFE_INTEGER_MIN: i64 = -SAFE_INTEGER_MAX;

/// A fixed-width `INT64` column value, range-checked against the safe
/// integer bound a non-bigint client type can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IntColumn(i64);

impl IntColumn {
    pub fn try_new(value: i64) -> Result<Self, RangeError> {
        if !(SAFE_INTEGER_MIN..=SAFE_INTEGER_MAX).contains(&value) {
            return Err(RangeError { value });
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

/// Raised when a value read from or written to an `isInt` column falls
/// outside the safe integer range (spec §8 boundary).
#[derive(Debug, thiserror::Error)]
#[error("integer value {value} is outside the safe integer range [{SAFE_INTEGER_MIN}, {SAFE_INTEGER_MAX}]")]
pub struct RangeError {
    pub value: i64,
}

impl Serialize for IntColumn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for IntColumn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        IntColumn::try_new(value).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// An arbitrary-precision `INT64` column value (`isBigInt`), preserved
/// exactly as a decimal string rather than coerced through a fixed-width
/// type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigIntColumn(String);

impl BigIntColumn {
    /// Parses and canonicalizes a decimal string (optional leading `-`,
    /// no superfluous leading zeros).
    pub fn parse(raw: &str) -> Result<Self, InvalidBigInt> {
        let (sign, digits) = match raw.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", raw),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidBigInt {
                raw: raw.to_string(),
            });
        }
        let trimmed = digits.trim_start_matches('0');
        let canonical_digits = if trimmed.is_empty() { "0" } else { trimmed };
        let canonical = if sign == "-" && canonical_digits != "0" {
            format!("-{canonical_digits}")
        } else {
            canonical_digits.to_string()
        };
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BigIntColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid bigint literal: {raw}")]
pub struct InvalidBigInt {
    pub raw: String,
}

impl Serialize for BigIntColumn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BigIntColumn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Accept either a JSON string or a JSON number, mirroring a store
        // driver that may decode a wide integer column as either.
        let value = serde_json::Value::deserialize(deserializer)?;
        let raw = match &value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => return Err(D::Error::custom(format!("expected bigint, got {other}"))),
        };
        BigIntColumn::parse(&raw).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// A `TIMESTAMP` column without the `isPreciseDate` flag: truncated to
/// millisecond precision on construction, even if a more precise value is
/// supplied (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at.trunc_subsecs(3))
    }

    pub fn get(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Self::new(at)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        DateTime::<Utc>::deserialize(deserializer).map(Timestamp::new)
    }
}

/// A `TIMESTAMP` column flagged `isPreciseDate`: full (nanosecond)
/// precision preserved through the round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreciseTimestamp(DateTime<Utc>);

impl PreciseTimestamp {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn get(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for PreciseTimestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Self::new(at)
    }
}

/// Converts a typed primary-key field into the string form the spec's
/// "primary-key composition" rule requires (§4.2): `toJSON()` for dates,
/// decimal string for integers, raw value otherwise.
pub trait KeyPart {
    fn key_part(&self) -> String;
}

impl KeyPart for String {
    fn key_part(&self) -> String {
        self.clone()
    }
}

impl KeyPart for &str {
    fn key_part(&self) -> String {
        self.to_string()
    }
}

impl KeyPart for uuid::Uuid {
    fn key_part(&self) -> String {
        self.to_string()
    }
}

impl KeyPart for IntColumn {
    fn key_part(&self) -> String {
        self.0.to_string()
    }
}

impl KeyPart for BigIntColumn {
    fn key_part(&self) -> String {
        self.0.clone()
    }
}

impl KeyPart for Timestamp {
    fn key_part(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

impl KeyPart for PreciseTimestamp {
    fn key_part(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
    }
}

/// Joins an ordered tuple of key parts into the single physical-storage
/// key used by the SQL and document backings.
pub fn join_key_tuple(parts: &[String]) -> String {
    parts.join("\u{1f}") // unit separator: never legal inside a key part
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_column_rejects_out_of_range_values() {
        assert!(IntColumn::try_new(SAFE_INTEGER_MAX).is_ok());
        assert!(IntColumn::try_new(SAFE_INTEGER_MAX + 1).is_err());
        assert!(IntColumn::try_new(SAFE_INTEGER_MIN).is_ok());
        assert!(IntColumn::try_new(SAFE_INTEGER_MIN - 1).is_err());
    }

    #[test]
    fn int_column_round_trips_through_json() {
        let col = IntColumn::try_new(42).unwrap();
        let json = serde_json::to_string(&col).unwrap();
        let back: IntColumn = serde_json::from_str(&json).unwrap();
        assert_eq!(col, back);
    }

    #[test]
    fn int_column_deserialize_rejects_out_of_range() {
        let json = (SAFE_INTEGER_MAX as i128 + 1).to_string();
        let result: Result<IntColumn, _> = serde_json::from_str(&json);
        assert!(result.is_err());
    }

    #[test]
    fn bigint_round_trips_exactly() {
        let huge = "123456789012345678901234567890";
        let col = BigIntColumn::parse(huge).unwrap();
        assert_eq!(col.as_str(), huge);
        let json = serde_json::to_string(&col).unwrap();
        let back: BigIntColumn = serde_json::from_str(&json).unwrap();
        assert_eq!(col, back);
    }

    #[test]
    fn bigint_canonicalizes_leading_zeros() {
        let col = BigIntColumn::parse("007").unwrap();
        assert_eq!(col.as_str(), "7");
        let col = BigIntColumn::parse("-000").unwrap();
        assert_eq!(col.as_str(), "0");
    }

    #[test]
    fn bigint_rejects_non_digits() {
        assert!(BigIntColumn::parse("12a3").is_err());
        assert!(BigIntColumn::parse("").is_err());
    }

    #[test]
    fn timestamp_truncates_sub_millisecond_precision() {
        let precise = "2024-01-01T00:00:00.123456789Z".parse().unwrap();
        let ts = Timestamp::new(precise);
        assert_eq!(ts.get().timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn precise_timestamp_keeps_nanosecond_precision() {
        let precise: DateTime<Utc> = "2024-01-01T00:00:00.123456789Z".parse().unwrap();
        let ts = PreciseTimestamp::new(precise);
        assert_eq!(ts.get().timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn key_tuple_join_is_unambiguous() {
        let a = vec!["a".to_string(), "b/c".to_string()];
        let b = vec!["a/b".to_string(), "c".to_string()];
        assert_ne!(join_key_tuple(&a), join_key_tuple(&b));
    }
}
