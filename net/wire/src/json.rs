//! EEBUS-JSON canonical form.
//!
//! SHIP does not put plain JSON on the wire. Every object is rewritten as an
//! array of single-key objects so that member order becomes part of the
//! encoding: `{"a":1,"b":2}` travels as `[{"a":1},{"b":2}]`. Primitives and
//! arrays of primitives are unchanged.
//!
//! Both directions are pure transforms over [`serde_json::Value`], the frame
//! layer in [`frame`](crate::frame) decides when to apply them.

use serde_json::{Map, Value};

/// Rewrites standard JSON into the EEBUS canonical form.
pub fn into_eebus_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Array(
            map.iter()
                .map(|(key, inner)| {
                    let mut single = Map::with_capacity(1);
                    single.insert(key.clone(), into_eebus_json(inner));
                    Value::Object(single)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(into_eebus_json).collect()),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
    }
}

/// Rewrites the EEBUS canonical form back into standard JSON.
///
/// An array whose elements are all single-key objects is folded back into one
/// object. Anything else is left as an array, which matches the SHIP model
/// rules: genuine lists only ever contain primitives or further wrapped
/// objects.
pub fn from_eebus_json(value: &Value) -> Value {
    match value {
        // SHIP models never contain empty lists, an empty array can only be
        // the wrapped form of an empty object (e.g. `accessMethodsRequest`).
        Value::Array(items) if items.is_empty() => Value::Object(Map::new()),
        Value::Array(items) if is_wrapped_object(items) => {
            let mut map = Map::with_capacity(items.len());
            for item in items {
                let Value::Object(single) = item else {
                    unreachable!("is_wrapped_object checked every element");
                };
                for (key, inner) in single {
                    map.insert(key.clone(), from_eebus_json(inner));
                }
            }
            Value::Object(map)
        }
        Value::Array(items) => Value::Array(items.iter().map(from_eebus_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), from_eebus_json(inner)))
                .collect(),
        ),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
    }
}

fn is_wrapped_object(items: &[Value]) -> bool {
    !items.is_empty()
        && items.iter().all(|item| {
            if let Value::Object(map) = item {
                map.len() == 1
            } else {
                false
            }
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn objects_become_single_key_arrays() {
        let standard = json!({"a": 1, "b": 2});
        let eebus = into_eebus_json(&standard);

        assert_eq!(eebus, json!([{"a": 1}, {"b": 2}]));
        assert_eq!(from_eebus_json(&eebus), standard);
    }

    #[test]
    fn nesting_is_transformed_recursively() {
        let standard = json!({
            "connectionHello": {
                "phase": "pending",
                "waiting": 60_000
            }
        });
        let eebus = into_eebus_json(&standard);

        assert_eq!(
            eebus,
            json!([{"connectionHello": [{"phase": "pending"}, {"waiting": 60_000}]}])
        );
        assert_eq!(from_eebus_json(&eebus), standard);
    }

    #[test]
    fn primitives_and_primitive_arrays_are_untouched() {
        for value in [
            json!(null),
            json!(true),
            json!(42),
            json!("JSON-UTF8"),
            json!(["JSON-UTF8", "JSON-UTF16"]),
        ] {
            assert_eq!(into_eebus_json(&value), value);
            assert_eq!(from_eebus_json(&value), value);
        }
    }

    #[test]
    fn empty_object_round_trips() {
        let eebus = into_eebus_json(&json!({}));
        assert_eq!(eebus, json!([]));
        assert_eq!(from_eebus_json(&eebus), json!({}));
    }

    #[test]
    fn round_trips_for_ship_shaped_values() {
        let values = [
            json!({}),
            json!({"data": {"header": {"protocolId": "ee1.0"}}}),
            json!({"formats": {"format": ["JSON-UTF8"]}}),
            json!({"version": {"major": 1, "minor": 0}}),
        ];

        for value in values {
            assert_eq!(from_eebus_json(&into_eebus_json(&value)), value);
        }
    }
}
