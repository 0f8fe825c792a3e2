use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

/// Types whose JSON shape can be described to a model in the prompt.
///
/// `json_object` response mode does not enforce a schema, so the schema is
/// rendered into the system message instead. Refs are inlined and the
/// meta keys stripped to keep the prompt small.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn prompt_schema() -> serde_json::Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();

        inline_refs(&mut value);

        if let serde_json::Value::Object(map) = &mut value {
            map.remove("definitions");
            map.remove("$schema");
            map.remove("title");
        }

        value
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

fn inline_refs(value: &mut serde_json::Value) {
    let definitions = if let serde_json::Value::Object(map) = value {
        map.get("definitions").cloned()
    } else {
        None
    };

    if let Some(defs) = definitions {
        inline_refs_recursive(value, &defs);
    }
}

fn inline_refs_recursive(value: &mut serde_json::Value, definitions: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(ref_path)) = map.get("$ref").cloned() {
                let type_name = ref_path.trim_start_matches("#/definitions/");
                if let Some(def) = definitions.get(type_name) {
                    let mut inlined = def.clone();
                    inline_refs_recursive(&mut inlined, definitions);
                    *value = inlined;
                    return;
                }
            }
            for (_, v) in map.iter_mut() {
                inline_refs_recursive(v, definitions);
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                inline_refs_recursive(item, definitions);
            }
        }
        _ => {}
    }
}
