//! Layer merge
//!
//! - Objects: deep-merge by key
//! - Arrays: replace (last wins)
//! - Scalars and null: override (last wins)

use serde_json::Value;

/// Deep merge `overlay` onto `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        // Arrays never concatenate; an environment list in a repo file
        // replaces the built-in chain entirely.
        (_, overlay) => overlay,
    }
}

/// Merge layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_objects_merge() {
        let base = json!({"retry": {"max_attempts": 3, "jitter": true}});
        let overlay = json!({"retry": {"max_attempts": 5}});
        let result = deep_merge(base, overlay);
        assert_eq!(result["retry"]["max_attempts"], 5);
        assert_eq!(result["retry"]["jitter"], true);
    }

    #[test]
    fn test_environment_list_replaced() {
        let base = json!({"environments": [{"name": "dev"}, {"name": "staging"}, {"name": "prod"}]});
        let overlay = json!({"environments": [{"name": "test"}, {"name": "live"}]});
        let result = deep_merge(base, overlay);
        let envs = result["environments"].as_array().unwrap();
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0]["name"], "test");
    }

    #[test]
    fn test_null_overrides() {
        let result = deep_merge(json!({"authorization": {"separation_of_duties": true}}), json!({"authorization": null}));
        assert!(result["authorization"].is_null());
    }

    #[test]
    fn test_merge_layers_precedence() {
        let builtin = json!({"registry": "file://a", "cache": {"ttl_hours": 24, "enabled": true}});
        let host = json!({"registry": "file://b"});
        let repo = json!({"cache": {"ttl_hours": 6}});
        let cli = json!({"registry": "file://c"});

        let result = merge_layers(vec![builtin, host, repo, cli]);
        assert_eq!(result["registry"], "file://c");
        assert_eq!(result["cache"]["ttl_hours"], 6);
        assert_eq!(result["cache"]["enabled"], true);
    }
}
