//! Static tool-name to JSON Schema registry (C3).
//!
//! Absence of a schema for a tool is not an error — only the tools named
//! here get an extra typed checkpoint before dispatch.

use std::collections::HashMap;

use jsonschema::Validator;
use serde_json::{json, Value};

pub struct SchemaRegistry {
    validators: HashMap<String, Validator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        let mut schemas: HashMap<String, Value> = HashMap::new();

        schemas.insert(
            "asset.batch_import".to_string(),
            json!({
                "type": "object",
                "required": ["sourcePaths", "destinationPath"],
                "properties": {
                    "sourcePaths": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                    "destinationPath": {"type": "string"},
                    "overwrite": {"type": "boolean"}
                }
            }),
        );

        schemas.insert(
            "sequence.create".to_string(),
            json!({
                "type": "object",
                "required": ["name", "path"],
                "properties": {
                    "name": {"type": "string", "minLength": 1},
                    "path": {"type": "string"},
                    "frameRate": {"type": "number", "exclusiveMinimum": 0}
                }
            }),
        );

        schemas.insert(
            "spawn_actor".to_string(),
            json!({
                "type": "object",
                "required": ["classPath", "location"],
                "properties": {
                    "classPath": {"type": "string"},
                    "location": {
                        "type": "object",
                        "required": ["x", "y", "z"],
                        "properties": {
                            "x": {"type": "number"},
                            "y": {"type": "number"},
                            "z": {"type": "number"}
                        }
                    }
                }
            }),
        );

        let validators = schemas
            .into_iter()
            .filter_map(|(tool, schema)| jsonschema::validator_for(&schema).ok().map(|v| (tool, v)))
            .collect();

        SchemaRegistry { validators }
    }

    /// `Ok(())` if there is no schema for `tool`, or the params validate. `Err` with
    /// a human-readable message otherwise.
    pub fn validate(&self, tool: &str, params: &Value) -> Result<(), String> {
        match self.validators.get(tool) {
            None => Ok(()),
            Some(validator) => {
                let errors: Vec<String> = validator
                    .iter_errors(params)
                    .map(|e| e.to_string())
                    .collect();
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors.join("; "))
                }
            }
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
