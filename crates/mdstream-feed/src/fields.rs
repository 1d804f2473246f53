//! JSON field extraction shared by the adapters.
//!
//! Exchanges send prices as strings or numbers; both are accepted here.
//! Finiteness is checked later by the record constructors.

use mdstream_core::PriceLevel;
use mdstream_ws::FrameError;
use serde_json::Value;

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub(crate) fn num(obj: &Value, field: &'static str) -> Result<f64, FrameError> {
    let value = obj.get(field).ok_or(FrameError::MissingField(field))?;
    as_f64(value).ok_or_else(|| FrameError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

pub(crate) fn int(obj: &Value, field: &'static str) -> Result<i64, FrameError> {
    let value = obj.get(field).ok_or(FrameError::MissingField(field))?;
    as_i64(value).ok_or_else(|| FrameError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

pub(crate) fn text<'a>(obj: &'a Value, field: &'static str) -> Result<&'a str, FrameError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingField(field))
}

/// String or numeric identifier rendered as a string.
pub(crate) fn id(obj: &Value, field: &'static str) -> Result<String, FrameError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(FrameError::MissingField(field)),
    }
}

/// `[[price, size, ...], ...]` book side.
pub(crate) fn levels(obj: &Value, field: &'static str) -> Result<Vec<PriceLevel>, FrameError> {
    let rows = obj
        .get(field)
        .and_then(Value::as_array)
        .ok_or(FrameError::MissingField(field))?;
    rows.iter()
        .map(|row| {
            let price = row.get(0).and_then(as_f64);
            let size = row.get(1).and_then(as_f64);
            match (price, size) {
                (Some(price), Some(size)) => Ok(PriceLevel::new(price, size)),
                _ => Err(FrameError::InvalidNumber {
                    field,
                    value: row.to_string(),
                }),
            }
        })
        .collect()
}

/// Epoch timestamp in seconds, ms, µs or ns, normalised to ms.
///
/// Negative epochs are rejected.
pub(crate) fn epoch_to_ms(field: &'static str, raw: i64) -> Result<i64, FrameError> {
    let ms = match raw {
        r if r < 0 => None,
        r if r >= 100_000_000_000_000_000 => Some(r / 1_000_000),
        r if r >= 100_000_000_000_000 => Some(r / 1_000),
        r if r >= 100_000_000_000 => Some(r),
        r => r.checked_mul(1_000),
    };
    ms.ok_or_else(|| FrameError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_num_accepts_string_and_number() {
        let v = json!({"a": "1.5", "b": 2.25, "c": "abc"});
        assert_eq!(num(&v, "a").unwrap(), 1.5);
        assert_eq!(num(&v, "b").unwrap(), 2.25);
        assert!(matches!(num(&v, "c"), Err(FrameError::InvalidNumber { field: "c", .. })));
        assert!(matches!(num(&v, "d"), Err(FrameError::MissingField("d"))));
    }

    #[test]
    fn test_levels_parse_pairs() {
        let v = json!({"bids": [["100.5", "2"], ["100.0", "1", "extra"]]});
        let bids = levels(&v, "bids").unwrap();
        assert_eq!(bids, vec![PriceLevel::new(100.5, 2.0), PriceLevel::new(100.0, 1.0)]);

        let bad = json!({"bids": [["x", "1"]]});
        assert!(levels(&bad, "bids").is_err());
    }

    #[test]
    fn test_epoch_normalisation() {
        assert_eq!(epoch_to_ms("t", 1_700_000_000).unwrap(), 1_700_000_000_000);
        assert_eq!(epoch_to_ms("t", 1_700_000_000_123).unwrap(), 1_700_000_000_123);
        assert_eq!(epoch_to_ms("t", 1_700_000_000_123_456).unwrap(), 1_700_000_000_123);
        assert_eq!(epoch_to_ms("t", 1_700_000_000_123_456_789).unwrap(), 1_700_000_000_123);
        assert_eq!(epoch_to_ms("t", i64::MAX).unwrap(), i64::MAX / 1_000_000);
    }

    #[test]
    fn test_negative_epoch_rejected() {
        for raw in [-1, -9_223_372_036_854_775_807, i64::MIN] {
            assert!(matches!(
                epoch_to_ms("time", raw),
                Err(FrameError::InvalidNumber { field: "time", .. })
            ));
        }
    }
}
