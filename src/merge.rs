//! Deep merge of configuration trees

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Merge `overlay` on top of `base`, returning a new tree.
///
/// Objects present on both sides are merged key by key; anything else in
/// `overlay` replaces what `base` had, including an object replaced by a
/// scalar or a scalar replaced by an object. Neither input is modified.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    let mut merged = base.clone();
    merge_into(&mut merged, overlay);
    merged
}

/// In-place form of [`merge`]
pub fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let both_objects =
                    value.is_object() && base_map.get(key).is_some_and(Value::is_object);

                if both_objects {
                    if let Some(existing) = base_map.get_mut(key) {
                        merge_into(existing, value);
                    }
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Merge two trees and deserialize the result
pub fn layer<T: DeserializeOwned>(base: &Value, overlay: &Value) -> serde_json::Result<T> {
    serde_json::from_value(merge(base, overlay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_merge() {
        let base = json!({"a": {"x": 1, "y": 2}});
        let overlay = json!({"a": {"y": 9, "z": 3}});

        assert_eq!(merge(&base, &overlay), json!({"a": {"x": 1, "y": 9, "z": 3}}));
    }

    #[test]
    fn test_overlay_wins_on_type_mismatch() {
        assert_eq!(merge(&json!({"a": 1}), &json!({"a": {"b": 2}})), json!({"a": {"b": 2}}));
        assert_eq!(merge(&json!({"a": {"b": 2}}), &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_inputs_untouched() {
        let base = json!({"keep": true, "headers": {"Accept": "json"}});
        let overlay = json!({"headers": {"Authorization": "Bearer t"}, "new": [1]});

        let merged = merge(&base, &overlay);

        assert_eq!(
            merged,
            json!({
                "keep": true,
                "headers": {"Accept": "json", "Authorization": "Bearer t"},
                "new": [1]
            })
        );
        assert_eq!(base, json!({"keep": true, "headers": {"Accept": "json"}}));
        assert_eq!(overlay, json!({"headers": {"Authorization": "Bearer t"}, "new": [1]}));
    }

    #[test]
    fn test_layer_deserializes() {
        #[derive(serde::Deserialize)]
        struct Conf {
            limit: u32,
            name: String,
        }

        let conf: Conf = layer(&json!({"limit": 10, "name": "a"}), &json!({"limit": 50})).unwrap();
        assert_eq!(conf.limit, 50);
        assert_eq!(conf.name, "a");
    }
}
