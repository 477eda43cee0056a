//! Database-native values and their JSON form.
//!
//! [`PgValue`] is the closed set of shapes a session can hand back;
//! [`serialize`] maps each one to a `serde_json::Value`. The mapping is total:
//! every input produces output, and already-JSON input comes back unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Containers nested deeper than this serialize as `null`.
pub const MAX_DEPTH: usize = 64;

/// One result row: column names paired with values, in select-list order.
pub type Row = Vec<(String, PgValue)>;

/// A serialized row, keyed by column name.
pub type JsonRow = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Interval(PgInterval),
    Decimal(Decimal),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    Array(Vec<PgValue>),
    Map(BTreeMap<String, PgValue>),
    /// Already JSON (json/jsonb columns).
    Json(Value),
}

/// Postgres interval: months, days and microseconds are kept apart because
/// their lengths vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PgInterval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

impl PgInterval {
    pub fn new(months: i32, days: i32, microseconds: i64) -> Self {
        Self {
            months,
            days,
            microseconds,
        }
    }
}

/// Renders the server's default (`postgres` IntervalStyle) output, e.g.
/// `1 year 2 mons 3 days 04:05:06.5`.
impl fmt::Display for PgInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let mut is_zero = true;
        let mut is_before = false;

        let years = self.months / 12;
        let months = self.months % 12;
        for (value, unit) in [(years, "year"), (months, "mon"), (self.days, "day")] {
            if value == 0 {
                continue;
            }
            if !is_zero {
                out.push(' ');
            }
            if is_before && value > 0 {
                out.push('+');
            }
            out.push_str(&format!(
                "{value} {unit}{}",
                if value != 1 { "s" } else { "" }
            ));
            is_before = value < 0;
            is_zero = false;
        }

        let micros = self.microseconds;
        if is_zero || micros != 0 {
            let hours = micros / 3_600_000_000;
            let minutes = (micros / 60_000_000) % 60;
            let seconds = (micros / 1_000_000) % 60;
            let fraction = micros % 1_000_000;
            if !is_zero {
                out.push(' ');
            }
            if micros < 0 {
                out.push('-');
            } else if is_before {
                out.push('+');
            }
            out.push_str(&format!(
                "{:02}:{:02}:{:02}",
                hours.abs(),
                minutes.abs(),
                seconds.abs()
            ));
            if fraction != 0 {
                let digits = format!("{:06}", fraction.abs());
                out.push('.');
                out.push_str(digits.trim_end_matches('0'));
            }
        }
        f.write_str(&out)
    }
}

/// Serialize one value into its JSON form.
pub fn serialize(value: &PgValue) -> Value {
    serialize_at(value, 0)
}

/// Serialize every cell of a row, keeping column order.
pub fn serialize_row(row: &Row) -> JsonRow {
    row.iter()
        .map(|(column, value)| (column.clone(), serialize(value)))
        .collect()
}

fn serialize_at(value: &PgValue, depth: usize) -> Value {
    match value {
        PgValue::Null => Value::Null,
        PgValue::Bool(b) => Value::Bool(*b),
        PgValue::Int(i) => Value::from(*i),
        PgValue::Float(f) => float(*f),
        PgValue::Text(s) => Value::String(s.clone()),
        PgValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        PgValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
        PgValue::Timestamp(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        PgValue::TimestampTz(ts) => {
            Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, false))
        }
        PgValue::Interval(interval) => Value::String(interval.to_string()),
        // Lossy for high-precision values.
        PgValue::Decimal(d) => d.to_f64().map_or(Value::Null, float),
        PgValue::Uuid(u) => Value::String(u.hyphenated().to_string()),
        PgValue::Bytes(bytes) => Value::String(hex::encode(bytes)),
        PgValue::Json(json) => json.clone(),
        PgValue::Array(items) => {
            if depth >= MAX_DEPTH {
                return too_deep();
            }
            Value::Array(
                items
                    .iter()
                    .map(|item| serialize_at(item, depth + 1))
                    .collect(),
            )
        }
        PgValue::Map(entries) => {
            if depth >= MAX_DEPTH {
                return too_deep();
            }
            Value::Object(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), serialize_at(item, depth + 1)))
                    .collect(),
            )
        }
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn too_deep() -> Value {
    tracing::warn!(max_depth = MAX_DEPTH, "value nesting too deep; emitting null");
    Value::Null
}

impl From<Value> for PgValue {
    fn from(value: Value) -> Self {
        PgValue::Json(value)
    }
}

impl From<Option<PgValue>> for PgValue {
    fn from(value: Option<PgValue>) -> Self {
        value.unwrap_or(PgValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").expect("timestamp")
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(serialize(&PgValue::Null), Value::Null);
        assert_eq!(serialize(&PgValue::Bool(true)), json!(true));
        assert_eq!(serialize(&PgValue::Int(-7)), json!(-7));
        assert_eq!(serialize(&PgValue::Float(1.5)), json!(1.5));
        assert_eq!(serialize(&PgValue::Text("hi".into())), json!("hi"));
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(serialize(&PgValue::Float(f64::NAN)), Value::Null);
        assert_eq!(serialize(&PgValue::Float(f64::INFINITY)), Value::Null);
    }

    #[test]
    fn temporal_values_are_iso_8601() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date");
        assert_eq!(serialize(&PgValue::Date(date)), json!("2024-01-01"));

        let time = NaiveTime::from_hms_micro_opt(12, 30, 5, 250_000).expect("time");
        assert_eq!(serialize(&PgValue::Time(time)), json!("12:30:05.250"));

        assert_eq!(
            serialize(&PgValue::Timestamp(ts("2024-01-01 12:00:00"))),
            json!("2024-01-01T12:00:00")
        );
        assert_eq!(
            serialize(&PgValue::Timestamp(ts("2024-01-01 12:00:00.123456"))),
            json!("2024-01-01T12:00:00.123456")
        );

        let aware = ts("2024-03-05 08:09:10").and_utc();
        assert_eq!(
            serialize(&PgValue::TimestampTz(aware)),
            json!("2024-03-05T08:09:10+00:00")
        );
    }

    #[test]
    fn decimal_becomes_float() {
        let d = Decimal::from_str("99.99").expect("decimal");
        assert_eq!(serialize(&PgValue::Decimal(d)), json!(99.99));
    }

    #[test]
    fn uuid_is_lowercase_hyphenated() {
        let u = Uuid::parse_str("A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11").expect("uuid");
        assert_eq!(
            serialize(&PgValue::Uuid(u)),
            json!("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11")
        );
    }

    #[test]
    fn bytes_are_lowercase_hex() {
        assert_eq!(serialize(&PgValue::Bytes(vec![0xDE, 0xAD])), json!("dead"));
        assert_eq!(serialize(&PgValue::Bytes(Vec::new())), json!(""));
    }

    #[test]
    fn containers_recurse() {
        let value = PgValue::Array(vec![
            PgValue::Int(1),
            PgValue::Null,
            PgValue::Map(BTreeMap::from([
                ("raw".to_string(), PgValue::Bytes(vec![0x0f])),
                (
                    "price".to_string(),
                    PgValue::Decimal(Decimal::from_str("2.5").expect("decimal")),
                ),
            ])),
        ]);
        assert_eq!(
            serialize(&value),
            json!([1, null, {"price": 2.5, "raw": "0f"}])
        );
    }

    #[test]
    fn json_is_idempotent() {
        let original = json!({"a": [1, 2.5, "x", null, {"b": true}], "c": {}});
        let once = serialize(&PgValue::from(original.clone()));
        assert_eq!(once, original);
        let twice = serialize(&PgValue::from(once.clone()));
        assert_eq!(twice, once);
    }

    #[test]
    fn deep_nesting_is_cut_off() {
        let mut value = PgValue::Int(1);
        for _ in 0..(MAX_DEPTH + 10) {
            value = PgValue::Array(vec![value]);
        }
        let mut out = serialize(&value);
        let mut depth = 0;
        while let Value::Array(mut items) = out {
            out = items.remove(0);
            depth += 1;
        }
        assert_eq!(depth, MAX_DEPTH);
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn row_keeps_column_order() {
        let row: Row = vec![
            ("z".to_string(), PgValue::Int(1)),
            ("a".to_string(), PgValue::Text("x".into())),
        ];
        let json = serialize_row(&row);
        let keys: Vec<&str> = json.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn interval_display_matches_server_output() {
        let cases = [
            (PgInterval::new(0, 0, 0), "00:00:00"),
            (PgInterval::new(14, 3, 14_706_500_000), "1 year 2 mons 3 days 04:05:06.5"),
            (PgInterval::new(0, 1, 0), "1 day"),
            (PgInterval::new(0, 0, 90_000_000), "00:01:30"),
            (PgInterval::new(0, -1, 7_200_000_000), "-1 days +02:00:00"),
            (PgInterval::new(0, 0, -3_600_000_001), "-01:00:00.000001"),
            (PgInterval::new(24, 0, 0), "2 years"),
        ];
        for (interval, expected) in cases {
            assert_eq!(interval.to_string(), expected);
        }
        assert_eq!(
            serialize(&PgValue::Interval(PgInterval::new(1, 0, 0))),
            json!("1 mon")
        );
    }
}
