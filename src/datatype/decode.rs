//! Flattening of raw JSON payloads into typed values.

use serde_json::{Map, Value};

use super::{Conversion, DataContainer, DataType, Error, Mapper};

/// Flattens a raw JSON payload into a [`DataContainer`] using the mapper's
/// conversion rules.
///
/// Nested objects contribute their keys dot-joined with the parent path.
/// Leaves the mapper has no rule for fall back on shape: strings stay
/// strings, numbers become floats, numeric arrays become float lists, and
/// arrays under a GC-recognized key become GC pause lists. A leaf that fits
/// none of these records [`Error::UnidentifiedJason`] on the container and
/// is dropped; its siblings still decode.
pub fn decode(mapper: &Mapper, payload: &[u8]) -> DataContainer {
    let mut container = DataContainer::default();
    let root: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(err) => {
            container.set_error(Error::Payload(err.to_string()));
            return container;
        }
    };
    let Some(object) = root.as_object() else {
        container.set_error(Error::Payload("root value is not an object".to_string()));
        return container;
    };
    walk(mapper, "", object, &mut container);
    container
}

fn walk(mapper: &Mapper, prefix: &str, object: &Map<String, Value>, container: &mut DataContainer) {
    for (key, value) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) => walk(mapper, &path, nested, container),
            other => leaf(mapper, path, other, container),
        }
    }
}

fn leaf(mapper: &Mapper, key: String, value: &Value, container: &mut DataContainer) {
    let decoded = match mapper.lookup(&key) {
        Some(rule) => converted(rule, key.clone(), value),
        None => inferred(mapper, key.clone(), value),
    };
    match decoded {
        Some(data) => {
            super::count_decoded(&data);
            container.push(data);
        }
        None => {
            super::count_unidentified();
            container.set_error(Error::UnidentifiedJason(key));
        }
    }
}

fn converted(rule: Conversion, key: String, value: &Value) -> Option<DataType> {
    match rule {
        Conversion::String => value.as_str().map(|s| DataType::String {
            key,
            value: s.to_string(),
        }),
        Conversion::Float => value.as_f64().map(|value| DataType::Float { key, value }),
        Conversion::Bytes => value.as_f64().map(|value| DataType::Byte { key, value }),
        Conversion::KiloBytes => value.as_f64().map(|value| DataType::KiloByte { key, value }),
        Conversion::MegaBytes => value.as_f64().map(|value| DataType::MegaByte { key, value }),
        Conversion::GcList => value
            .as_array()
            .and_then(|items| gc_values(items))
            .map(|values| DataType::GcList { key, values }),
    }
}

fn inferred(mapper: &Mapper, key: String, value: &Value) -> Option<DataType> {
    match value {
        Value::String(s) => Some(DataType::String {
            key,
            value: s.clone(),
        }),
        Value::Number(_) => value.as_f64().map(|value| DataType::Float { key, value }),
        Value::Array(items) => {
            if items.is_empty() {
                return Some(DataType::FloatList {
                    key,
                    values: Vec::new(),
                });
            }
            if mapper.is_gc_key(&key) {
                return gc_values(items).map(|values| DataType::GcList { key, values });
            }
            float_values(items).map(|values| DataType::FloatList { key, values })
        }
        _ => None,
    }
}

fn float_values(items: &[Value]) -> Option<Vec<f64>> {
    items.iter().map(Value::as_f64).collect()
}

fn gc_values(items: &[Value]) -> Option<Vec<u64>> {
    items
        .iter()
        .map(|item| item.as_f64().map(|f| f as u64))
        .collect()
}
