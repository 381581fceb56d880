//! Minimal accessors over untyped objects.
//!
//! Only what the converge flow needs: reading, comparing and replacing a
//! value at a fixed path such as `spec.nodeTemplate`.

use serde_json::{Map, Value};

pub fn nested_field<'a>(object: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(object, |current, segment| current.as_object()?.get(*segment))
}

/// Sets `value` at `path`, creating intermediate maps as needed.
///
/// Fails when a non-map value sits in the middle of the path.
pub fn set_nested_field(object: &mut Value, path: &[&str], value: Value) -> Result<(), String> {
    let Some((last, parents)) = path.split_last() else {
        *object = value;
        return Ok(());
    };

    let mut current = object;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }

        current = current
            .as_object_mut()
            .ok_or_else(|| format!("'{segment}' parent is not a map"))?
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }

    current
        .as_object_mut()
        .ok_or_else(|| format!("'{last}' parent is not a map"))?
        .insert(last.to_string(), value);

    Ok(())
}
