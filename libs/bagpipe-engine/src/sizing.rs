use serde_json::Value;

const VALUE_OVERHEAD: usize = 8;
const CONTAINER_OVERHEAD: usize = 24;

/// Approximate in-memory footprint of a decoded value, in bytes.
///
/// Only needs to be stable and roughly proportional; cache accounting
/// compares estimates with each other and with raw payload lengths.
pub fn estimate_object_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => VALUE_OVERHEAD,
        Value::String(s) => CONTAINER_OVERHEAD + s.len(),
        Value::Array(items) => {
            CONTAINER_OVERHEAD + items.iter().map(estimate_object_size).sum::<usize>()
        }
        Value::Object(map) => {
            CONTAINER_OVERHEAD
                + map
                    .iter()
                    .map(|(k, v)| CONTAINER_OVERHEAD + k.len() + estimate_object_size(v))
                    .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(estimate_object_size(&json!(null)), 8);
        assert_eq!(estimate_object_size(&json!(1.5)), 8);
        assert_eq!(estimate_object_size(&json!("abcd")), 28);
    }

    #[test]
    fn test_nested_grows_with_content() {
        let small = json!({"x": 1});
        let large = json!({"x": 1, "y": [1, 2, 3], "name": "lidar"});
        assert_eq!(estimate_object_size(&small), 24 + 24 + 1 + 8);
        assert!(estimate_object_size(&large) > estimate_object_size(&small));
    }
}
