use super::types::SchemaDefinition;
use super::{validate_tables_schema, validate_values_schema};
use crate::error::{CellStoreError, Result};
use std::path::Path;

/// Parse a schema file (YAML, or JSON as a YAML subset) into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition.
///
/// A `tables` or `values` section with nothing valid left in it is an error,
/// since installing it would silently leave the store without that schema.
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    if let Some(tables) = schema.tables.as_ref().filter(|tables| !is_empty_section(tables)) {
        if validate_tables_schema(tables).is_none() {
            return Err(CellStoreError::Schema(
                "tables section has no valid cell schemas".to_string(),
            ));
        }
    }
    if let Some(values) = schema.values.as_ref().filter(|values| !is_empty_section(values)) {
        if validate_values_schema(values).is_none() {
            return Err(CellStoreError::Schema(
                "values section has no valid value schemas".to_string(),
            ));
        }
    }
    Ok(schema)
}

fn is_empty_section(section: &serde_json::Value) -> bool {
    section.is_null() || section.as_object().is_some_and(|section| section.is_empty())
}
