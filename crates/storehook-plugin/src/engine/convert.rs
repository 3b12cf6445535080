//! Conversions between script values and JSON documents.

use rhai::{Array, Dynamic, FnPtr, Map};
use serde_json::{Number, Value};

/// Convert a script value to JSON. Function pointers and host types have
/// no JSON form and become `null`.
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    let value = value.flatten_clone();

    if value.is_unit() {
        Value::Null
    } else if value.is_bool() {
        Value::Bool(value.as_bool().unwrap_or(false))
    } else if value.is_int() {
        Value::from(value.as_int().unwrap_or(0))
    } else if value.is_float() {
        Number::from_f64(value.as_float().unwrap_or(0.0))
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if value.is_string() {
        Value::String(value.into_string().unwrap_or_default())
    } else if value.is_char() {
        Value::String(value.as_char().map(String::from).unwrap_or_default())
    } else if value.is_array() {
        let items = value.into_array().unwrap_or_default();
        Value::Array(items.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map = value.try_cast::<Map>().unwrap_or_default();
        Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        )
    } else if value.is::<FnPtr>() {
        Value::Null
    } else {
        Value::String(value.to_string())
    }
}

/// Convert a JSON document to a script value.
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else {
                Dynamic::from(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let array: Array = items.iter().map(json_to_dynamic).collect();
            Dynamic::from(array)
        }
        Value::Object(object) => {
            let mut map = Map::new();
            for (k, v) in object {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}
