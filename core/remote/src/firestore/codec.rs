//! Conversion between plain JSON and Firestore typed values.
//!
//! Firestore wraps every value in a single-key object naming its type, e.g.
//! `{"integerValue": "42"}` or `{"mapValue": {"fields": {...}}}`.

use serde_json::{json, Map, Number, Value};

use shopsync_common::{Error, Payload, Result};

/// Encode a JSON value as a Firestore `Value`.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or(0.0) }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Encode an object's fields as a Firestore `fields` map.
pub fn encode_fields(payload: &Payload) -> Map<String, Value> {
    payload
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect()
}

/// Decode a Firestore `Value` back into plain JSON.
pub fn decode_value(value: &Value) -> Result<Value> {
    let (kind, inner) = value
        .as_object()
        .and_then(|map| map.iter().next())
        .ok_or_else(|| Error::Serialization(format!("Malformed Firestore value: {}", value)))?;

    match (kind.as_str(), inner) {
        ("nullValue", _) => Ok(Value::Null),
        ("booleanValue", Value::Bool(b)) => Ok(Value::Bool(*b)),
        ("integerValue", Value::String(s)) => s
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| Error::Serialization(format!("Bad integerValue {}: {}", s, e))),
        ("integerValue", Value::Number(n)) => Ok(Value::Number(n.clone())),
        ("doubleValue", Value::Number(n)) => Ok(Value::Number(n.clone())),
        // NaN and Infinity arrive as strings and have no JSON form.
        ("doubleValue", Value::String(s)) => Ok(s
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number)),
        ("stringValue", Value::String(s))
        | ("timestampValue", Value::String(s))
        | ("referenceValue", Value::String(s))
        | ("bytesValue", Value::String(s)) => Ok(Value::String(s.clone())),
        ("geoPointValue", point) => Ok(point.clone()),
        ("arrayValue", array) => {
            let values: Vec<Value> = match array.get("values") {
                Some(Value::Array(values)) => values.iter().map(decode_value).collect::<Result<_>>()?,
                _ => Vec::new(),
            };
            Ok(Value::Array(values))
        }
        ("mapValue", map) => {
            let fields = match map.get("fields") {
                Some(Value::Object(fields)) => decode_fields(fields)?,
                _ => Payload::new(),
            };
            Ok(Value::Object(fields))
        }
        (kind, _) => Err(Error::Serialization(format!(
            "Unsupported Firestore value type: {}",
            kind
        ))),
    }
}

/// Decode a Firestore `fields` map.
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Payload> {
    fields
        .iter()
        .map(|(key, value)| decode_value(value).map(|decoded| (key.clone(), decoded)))
        .collect()
}
