//! Payload normalization.
//!
//! Handlers may hand back any JSON value; before transmission everything is
//! folded into one canonical key-value shape so the far side always receives
//! an object.

use serde_json::{Map, Value};

/// Canonical key-value payload carried by every envelope.
pub type Payload = Map<String, Value>;

/// Fold an arbitrary JSON value into a [`Payload`].
///
/// `Null` becomes an empty object, objects pass through unchanged, and any
/// other value is wrapped as `{"data": value}`.
pub fn normalize(value: Value) -> Payload {
    match value {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_becomes_empty_object() {
        assert!(normalize(Value::Null).is_empty());
    }

    #[test]
    fn objects_pass_through() {
        let p = normalize(json!({"t1": 12.5, "ok": true}));
        assert_eq!(p.get("t1"), Some(&json!(12.5)));
        assert_eq!(p.get("ok"), Some(&json!(true)));
    }

    #[test]
    fn scalars_and_arrays_are_wrapped() {
        assert_eq!(normalize(json!(42)).get("data"), Some(&json!(42)));
        assert_eq!(
            normalize(json!(["a", "b"])).get("data"),
            Some(&json!(["a", "b"]))
        );
        assert_eq!(normalize(json!("hi")).get("data"), Some(&json!("hi")));
    }
}
