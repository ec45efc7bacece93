use crate::error::{HippoDbError, Result};
use super::types::SchemaDocument;
use std::path::Path;

/// Parse a schema document file. `.yaml`/`.yml` files are YAML, anything else JSON.
pub fn parse_schema(path: &Path) -> Result<SchemaDocument> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_schema_yaml(&content),
        _ => parse_schema_json(&content),
    }
}

/// Parse a JSON schema document
pub fn parse_schema_json(content: &str) -> Result<SchemaDocument> {
    let schema: SchemaDocument = serde_json::from_str(content)?;
    finish(schema)
}

/// Parse a YAML schema document
pub fn parse_schema_yaml(content: &str) -> Result<SchemaDocument> {
    let schema: SchemaDocument = serde_yaml::from_str(content)?;
    finish(schema)
}

/// Entries may omit `id`; the map key fills it in. A disagreeing `id` is an error.
fn finish(mut schema: SchemaDocument) -> Result<SchemaDocument> {
    for (key, descriptor) in schema.iter_mut() {
        if descriptor.id.is_empty() {
            descriptor.id = key.clone();
        } else if descriptor.id != *key {
            return Err(HippoDbError::Other(format!(
                "Schema entry '{key}' declares a different id '{}'",
                descriptor.id
            )));
        }
        if descriptor.name.is_empty() {
            descriptor.name = key.clone();
        }
    }
    Ok(schema)
}
