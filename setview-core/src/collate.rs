//! JSON collation for view keys
//!
//! Total order over JSON values used as the default map-view row ordering.
//! Type classes sort `null < bool < number < string < array < object`;
//! within a class:
//!
//! - booleans: `false < true`
//! - numbers: numeric comparison (integers and floats compared as f64)
//! - strings: Unicode code point order
//! - arrays: element-wise, shorter prefix first
//! - objects: by sorted key, then by the corresponding values

use serde_json::Value;
use std::cmp::Ordering;

fn type_class(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two JSON values under the collation above.
pub fn json_cmp(a: &Value, b: &Value) -> Ordering {
    let (ca, cb) = (type_class(a), type_class(b));
    if ca != cb {
        return ca.cmp(&cb);
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(f64::NAN);
            let fy = y.as_f64().unwrap_or(f64::NAN);
            fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = json_cmp(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // serde_json's default map keeps keys sorted, so pairwise
            // iteration compares members in key order.
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let ord = kx.cmp(ky).then_with(|| json_cmp(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => unreachable!("type classes already matched"),
    }
}

/// Compare `(key, id)` pairs the way merged map-view rows are ordered.
pub fn key_id_cmp(
    key_a: &Value,
    id_a: Option<&str>,
    key_b: &Value,
    id_b: Option<&str>,
) -> Ordering {
    json_cmp(key_a, key_b).then_with(|| id_a.cmp(&id_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_class_order() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-10),
            json!(1.5),
            json!(2),
            json!(""),
            json!("a"),
            json!([]),
            json!([1]),
            json!({}),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_ne!(
                json_cmp(&pair[0], &pair[1]),
                Ordering::Greater,
                "{} should not sort after {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_array_prefix_sorts_first() {
        assert_eq!(json_cmp(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
        assert_eq!(json_cmp(&json!([1, 3]), &json!([1, 2, 0])), Ordering::Greater);
    }

    #[test]
    fn test_key_id_breaks_ties() {
        let key = json!("same");
        assert_eq!(
            key_id_cmp(&key, Some("a"), &key, Some("b")),
            Ordering::Less
        );
        assert_eq!(key_id_cmp(&key, None, &key, Some("a")), Ordering::Less);
    }
}
