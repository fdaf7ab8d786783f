//! Labels derived from an OSImage's provider specific image reference.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{label_value, Labels};

/// Flatten `image_ref` into `<image_type>-<key>` labels. Nested maps extend the key with
/// `-<subkey>`; scalars are stringified and sanitized, arrays and nulls are skipped.
///
/// `ova` with `{"version": "v1.23.5+vmware.1", "moid": {"id": 7}}` sets
/// `ova-version=v1.23.5---vmware.1` and `ova-moid-id=7`.
pub fn set_ref_labels(labels: &mut Labels, image_type: &str, image_ref: &BTreeMap<String, Value>) {
    for (k, v) in image_ref.iter() {
        set_value(labels, &format!("{}-{}", image_type, k), v);
    }
}

fn set_value(labels: &mut Labels, key: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter() {
                set_value(labels, &format!("{}-{}", key, k), v);
            }
        }
        Value::String(s) => {
            labels.insert(key.to_string(), label_value(s));
        }
        Value::Number(n) => {
            labels.insert(key.to_string(), label_value(&n.to_string()));
        }
        Value::Bool(b) => {
            labels.insert(key.to_string(), b.to_string());
        }
        Value::Array(_) | Value::Null => {}
    }
}
