//! Effective-input composition.
//!
//! Before `execute` is called the adapter merges, lowest to highest
//! priority: schema property defaults, the task's persisted `inputs`, and
//! the results of required dependencies projected under their declared
//! binding (pre-hooks run after this as the highest layer and may mutate
//! further). Required schema fields still unbound once the pre-hooks
//! have run fail resolution.

use serde_json::{Map, Value};

use trellis_db::models::Dependency;

/// Key the unbound dependency results are grouped under.
const DEPENDENCIES_KEY: &str = "dependencies";

/// Resolution failure: required fields missing after the merge.
#[derive(Debug, Clone, thiserror::Error)]
#[error("INPUT_RESOLUTION: required field(s) unbound: {}", missing.join(", "))]
pub struct InputResolutionError {
    pub missing: Vec<String>,
}

/// Merge the first three layers (schema defaults, persisted inputs,
/// required-dependency results) without validating. Pre-hooks mutate the
/// result afterwards as the highest-priority layer; only then does
/// [`validate_required`] run.
///
/// `dep_results` carries the declared dependencies in declaration order
/// with the dependency's persisted result (None when the dependency
/// produced nothing).
pub fn compose(
    input_schema: &Value,
    persisted: &Value,
    dep_results: &[(Dependency, Option<Value>)],
) -> Value {
    let mut inputs = schema_defaults(input_schema);

    merge_into(&mut inputs, persisted);

    for (dep, result) in dep_results {
        if !dep.required {
            continue;
        }
        let Some(result) = result else { continue };
        match &dep.bind {
            Some(key) => {
                inputs.insert(key.clone(), result.clone());
            }
            None => {
                let bucket = inputs
                    .entry(DEPENDENCIES_KEY.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(map) = bucket {
                    map.insert(dep.id.to_string(), result.clone());
                }
            }
        }
    }

    Value::Object(inputs)
}

/// Check the fully-composed inputs (pre-hook mutations included) against
/// the schema's `required` list.
pub fn validate_required(
    input_schema: &Value,
    inputs: &Value,
) -> Result<(), InputResolutionError> {
    let empty = Map::new();
    let inputs = inputs.as_object().unwrap_or(&empty);
    let missing = missing_required(input_schema, inputs);
    if !missing.is_empty() {
        return Err(InputResolutionError { missing });
    }
    Ok(())
}

/// [`compose`] and [`validate_required`] in one step, for callers with no
/// hook layer.
pub fn resolve(
    input_schema: &Value,
    persisted: &Value,
    dep_results: &[(Dependency, Option<Value>)],
) -> Result<Value, InputResolutionError> {
    let inputs = compose(input_schema, persisted, dep_results);
    validate_required(input_schema, &inputs)?;
    Ok(inputs)
}

/// Seed inputs from `properties.<name>.default` entries in the schema.
fn schema_defaults(schema: &Value) -> Map<String, Value> {
    let mut defaults = Map::new();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            if let Some(default) = prop.get("default") {
                defaults.insert(name.clone(), default.clone());
            }
        }
    }
    defaults
}

/// Shallow-merge an object layer over the accumulated inputs; objects
/// merge recursively, everything else overwrites.
fn merge_into(target: &mut Map<String, Value>, layer: &Value) {
    let Some(layer) = layer.as_object() else {
        return;
    };
    for (key, value) in layer {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(_)) => {
                merge_into(existing, value);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn missing_required(schema: &Value, inputs: &Map<String, Value>) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|required| {
            required
                .iter()
                .filter_map(Value::as_str)
                .filter(|field| !inputs.contains_key(*field))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn defaults_then_persisted_then_deps() {
        let schema = json!({
            "type": "object",
            "properties": {
                "retries": {"type": "integer", "default": 3},
                "url": {"type": "string", "default": "http://localhost"}
            }
        });
        let persisted = json!({"url": "http://example.com"});
        let dep = Dependency {
            id: Uuid::new_v4(),
            required: true,
            bind: Some("url".to_string()),
        };
        let deps = vec![(dep, Some(json!("http://upstream")))];

        let resolved = resolve(&schema, &persisted, &deps).unwrap();
        assert_eq!(resolved["retries"], 3);
        // Dependency binding is the highest layer.
        assert_eq!(resolved["url"], "http://upstream");
    }

    #[test]
    fn unbound_dep_results_grouped_by_id() {
        let dep_id = Uuid::new_v4();
        let dep = Dependency::required(dep_id);
        let resolved = resolve(&json!({}), &json!({}), &[(dep, Some(json!(42)))]).unwrap();
        assert_eq!(resolved["dependencies"][dep_id.to_string()], 42);
    }

    #[test]
    fn optional_dep_results_not_projected() {
        let dep = Dependency::optional(Uuid::new_v4());
        let resolved = resolve(&json!({}), &json!({}), &[(dep, Some(json!(1)))]).unwrap();
        assert!(resolved.get("dependencies").is_none());
    }

    #[test]
    fn missing_required_field_fails() {
        let schema = json!({
            "type": "object",
            "properties": {"target": {"type": "string"}},
            "required": ["target"]
        });
        let err = resolve(&schema, &json!({}), &[]).unwrap_err();
        assert_eq!(err.missing, vec!["target"]);
        assert!(err.to_string().starts_with("INPUT_RESOLUTION"));
    }

    #[test]
    fn required_field_satisfied_by_default() {
        let schema = json!({
            "type": "object",
            "properties": {"target": {"type": "string", "default": "x"}},
            "required": ["target"]
        });
        let resolved = resolve(&schema, &json!({}), &[]).unwrap();
        assert_eq!(resolved["target"], "x");
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let schema = json!({
            "properties": {
                "opts": {"default": {"a": 1, "b": 2}}
            }
        });
        let persisted = json!({"opts": {"b": 3}});
        let resolved = resolve(&schema, &persisted, &[]).unwrap();
        assert_eq!(resolved["opts"]["a"], 1);
        assert_eq!(resolved["opts"]["b"], 3);
    }
}
