//! Canonical JSON and YAML helpers shared by checkpoints and configs.

use std::collections::BTreeMap;
use std::iter::FromIterator;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::errors::{CalibError, ErrorInfo};

fn serde_error(code: &str, err: impl ToString) -> CalibError {
    CalibError::Serde(ErrorInfo::new(code, err.to_string()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered = map
                .into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect::<BTreeMap<_, _>>();
            Value::Object(Map::from_iter(ordered))
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Serializes a value into canonical JSON bytes with deterministic key order.
pub fn to_canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CalibError> {
    let value = serde_json::to_value(value).map_err(|err| serde_error("json_serialize", err))?;
    let canonical = canonicalize(value);
    let mut bytes = Vec::new();
    serde_json::to_writer(&mut bytes, &canonical).map_err(|err| serde_error("json_write", err))?;
    Ok(bytes)
}

/// Serializes a value into human readable JSON.
pub fn to_pretty_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CalibError> {
    serde_json::to_vec_pretty(value).map_err(|err| serde_error("json_serialize", err))
}

/// Deserializes a value from JSON bytes.
pub fn from_json_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, CalibError> {
    serde_json::from_slice(data).map_err(|err| serde_error("json_deserialize", err))
}

/// Converts a value into a JSON tree.
pub fn to_json_value<T: Serialize>(value: &T) -> Result<Value, CalibError> {
    serde_json::to_value(value).map_err(|err| serde_error("json_serialize", err))
}

/// Rebuilds a typed value from a JSON tree.
pub fn from_json_value<T: DeserializeOwned>(value: Value) -> Result<T, CalibError> {
    serde_json::from_value(value).map_err(|err| serde_error("json_deserialize", err))
}

/// Serializes a value into YAML.
pub fn to_yaml_string<T: Serialize>(value: &T) -> Result<String, CalibError> {
    serde_yaml::to_string(value).map_err(|err| serde_error("yaml_serialize", err))
}

/// Deserializes a YAML payload into the requested type.
pub fn from_yaml_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, CalibError> {
    serde_yaml::from_slice(data).map_err(|err| serde_error("yaml_deserialize", err))
}
