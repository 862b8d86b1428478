mod parser;
mod types;

pub use parser::{parse_schema, parse_schema_str};
pub use types::{
    CellSchema, SchemaDefinition, TableSchema, TablesSchema, ValueSchema, ValuesSchema,
};

use crate::types::{Scalar, ScalarType};

/// Structurally validate an untyped tables schema.
///
/// Invalid cell schemas are pruned, table schemas left empty by pruning are
/// pruned, and a default whose type does not match is dropped. Returns `None`
/// when nothing valid remains, in which case the schema must not be installed.
pub fn validate_tables_schema(candidate: &serde_json::Value) -> Option<TablesSchema> {
    let tables = candidate.as_object()?;
    let mut schema = TablesSchema::new();

    for (table_id, table_candidate) in tables {
        let Some(cells) = table_candidate.as_object() else {
            continue;
        };
        let table: TableSchema = cells
            .iter()
            .filter_map(|(cell_id, cell)| {
                validate_cell_schema(cell).map(|schema| (cell_id.clone(), schema))
            })
            .collect();
        if !table.is_empty() {
            schema.insert(table_id.clone(), table);
        }
    }

    (!schema.is_empty()).then_some(schema)
}

/// Structurally validate an untyped values schema. Same pruning rules as
/// [`validate_tables_schema`], one level shallower.
pub fn validate_values_schema(candidate: &serde_json::Value) -> Option<ValuesSchema> {
    let values = candidate.as_object()?;
    let schema: ValuesSchema = values
        .iter()
        .filter_map(|(value_id, value)| {
            validate_cell_schema(value).map(|schema| (value_id.clone(), schema))
        })
        .collect();

    (!schema.is_empty()).then_some(schema)
}

fn validate_cell_schema(candidate: &serde_json::Value) -> Option<CellSchema> {
    let fields = candidate.as_object()?;
    if fields.keys().any(|key| key != "type" && key != "default") {
        return None;
    }

    let scalar_type = fields.get("type")?.as_str().and_then(ScalarType::parse)?;
    let default = fields
        .get("default")
        .and_then(Scalar::from_json)
        .filter(|default| default.scalar_type() == scalar_type);

    Some(CellSchema {
        scalar_type,
        default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_tables_schema() {
        let schema = validate_tables_schema(&json!({
            "pets": {
                "species": {"type": "string"},
                "sold": {"type": "boolean", "default": false}
            }
        }))
        .unwrap();

        assert_eq!(schema["pets"].len(), 2);
        assert_eq!(schema["pets"]["sold"].default, Some(Scalar::Boolean(false)));
        assert_eq!(schema["pets"]["species"].default, None);
    }

    #[test]
    fn test_mismatched_default_is_dropped() {
        let schema = validate_tables_schema(&json!({
            "pets": {"legs": {"type": "number", "default": "four"}}
        }))
        .unwrap();
        assert_eq!(schema["pets"]["legs"], CellSchema::new(ScalarType::Number));
    }

    #[test]
    fn test_invalid_cell_schemas_are_pruned() {
        let schema = validate_tables_schema(&json!({
            "pets": {
                "species": {"type": "string"},
                "bad_type": {"type": "object"},
                "extra_key": {"type": "string", "required": true},
                "not_object": 3
            },
            "empty": {}
        }))
        .unwrap();

        assert_eq!(schema.len(), 1);
        assert_eq!(schema["pets"].keys().collect::<Vec<_>>(), vec!["species"]);
    }

    #[test]
    fn test_schema_rejected_when_nothing_valid() {
        assert!(validate_tables_schema(&json!({})).is_none());
        assert!(validate_tables_schema(&json!("pets")).is_none());
        assert!(validate_tables_schema(&json!({"pets": {"x": {"type": "date"}}})).is_none());
        assert!(validate_values_schema(&json!([])).is_none());
    }

    #[test]
    fn test_values_schema() {
        let schema = validate_values_schema(&json!({
            "open": {"type": "boolean", "default": true},
            "bad": {"default": 1}
        }))
        .unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema["open"].default, Some(Scalar::Boolean(true)));
    }
}
