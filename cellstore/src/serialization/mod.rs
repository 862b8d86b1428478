//! JSON text form of a store: `[tables, values]`, where tables is
//! `{tableId: {rowId: {cellId: cell}}}` and values is `{valueId: value}`.

use crate::error::{CellStoreError, Result};
use crate::store::Store;
use crate::types::{Content, Tables, Values};
use serde_json::{Map, Value};

pub fn tables_to_json(tables: &Tables) -> Value {
    let tables: Map<String, Value> = tables
        .iter()
        .map(|(table_id, rows)| {
            let rows: Map<String, Value> = rows
                .iter()
                .map(|(row_id, row)| {
                    let cells: Map<String, Value> = row
                        .iter()
                        .map(|(cell_id, cell)| (cell_id.clone(), cell.to_json()))
                        .collect();
                    (row_id.clone(), Value::Object(cells))
                })
                .collect();
            (table_id.clone(), Value::Object(rows))
        })
        .collect();
    Value::Object(tables)
}

pub fn values_to_json(values: &Values) -> Value {
    Value::Object(
        values
            .iter()
            .map(|(value_id, value)| (value_id.clone(), value.to_json()))
            .collect(),
    )
}

/// `[tables, values]` for typed content.
pub fn content_to_json((tables, values): &Content) -> Value {
    Value::Array(vec![tables_to_json(tables), values_to_json(values)])
}

/// Split serialized content into its untyped tables and values parts.
/// A bare object is the legacy form holding tables only.
pub fn parse_content(json: &str) -> Result<(Value, Value)> {
    match serde_json::from_str::<Value>(json)? {
        Value::Array(parts) if parts.len() == 2 => {
            let mut parts = parts.into_iter();
            let tables = parts.next().unwrap_or_default();
            let values = parts.next().unwrap_or_default();
            Ok((tables, values))
        }
        tables @ Value::Object(_) => Ok((tables, Value::Object(Map::new()))),
        other => Err(CellStoreError::Content(format!(
            "expected [tables, values] or a tables object, got {other}"
        ))),
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(Map::is_empty)
}

impl Store {
    pub fn get_tables_json(&self) -> String {
        tables_to_json(&self.get_tables()).to_string()
    }

    pub fn get_values_json(&self) -> String {
        values_to_json(&self.get_values()).to_string()
    }

    /// The whole store as `[tables, values]`.
    pub fn get_json(&self) -> String {
        content_to_json(&self.get_content()).to_string()
    }

    /// The installed schemas as `[tablesSchema, valuesSchema]`, with `{}` for
    /// a missing one.
    pub fn get_schema_json(&self) -> String {
        let tables = self
            .get_tables_schema()
            .and_then(|schema| serde_json::to_value(schema).ok())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let values = self
            .get_values_schema()
            .and_then(|schema| serde_json::to_value(schema).ok())
            .unwrap_or_else(|| Value::Object(Map::new()));
        Value::Array(vec![tables, values]).to_string()
    }

    /// Malformed JSON is logged and otherwise ignored.
    pub fn set_tables_json(&self, json: &str) -> &Self {
        match serde_json::from_str(json) {
            Ok(tables) => self.set_tables(tables),
            Err(e) => {
                log::warn!("Ignoring malformed tables JSON: {e}");
                self
            }
        }
    }

    /// Malformed JSON is logged and otherwise ignored.
    pub fn set_values_json(&self, json: &str) -> &Self {
        match serde_json::from_str(json) {
            Ok(values) => self.set_values(values),
            Err(e) => {
                log::warn!("Ignoring malformed values JSON: {e}");
                self
            }
        }
    }

    /// Replace the whole store from `[tables, values]`, or from a bare tables
    /// object. Malformed JSON is logged and otherwise ignored.
    pub fn set_json(&self, json: &str) -> &Self {
        match parse_content(json) {
            Ok(content) => self.set_content(content),
            Err(e) => {
                log::warn!("Ignoring malformed store JSON: {e}");
                self
            }
        }
    }

    /// Install schemas from `[tablesSchema, valuesSchema]`, or from a bare
    /// tables schema object. An empty part removes that schema.
    pub fn set_schema_json(&self, json: &str) -> &Self {
        let (tables, values) = match parse_content(json) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Ignoring malformed schema JSON: {e}");
                return self;
            }
        };
        self.transaction(|store| {
            if is_empty_object(&tables) {
                store.del_tables_schema();
            } else {
                store.set_tables_schema(tables);
            }
            if is_empty_object(&values) {
                store.del_values_schema();
            } else {
                store.set_values_schema(values);
            }
        });
        self
    }

    pub fn get_content(&self) -> Content {
        (self.get_tables(), self.get_values())
    }

    /// Replace tables and values in one transaction. An empty part deletes
    /// everything of that kind.
    pub fn set_content(&self, (tables, values): (Value, Value)) -> &Self {
        self.transaction(|store| {
            if is_empty_object(&tables) {
                store.del_tables();
            } else {
                store.set_tables(tables);
            }
            if is_empty_object(&values) {
                store.del_values();
            } else {
                store.set_values(values);
            }
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_get_json() {
        let store = Store::new();
        store
            .set_cell("pets", "fido", "legs", 4)
            .set_cell("pets", "fido", "weight", 12.5)
            .set_value("open", true);

        assert_eq!(
            store.get_json(),
            r#"[{"pets":{"fido":{"legs":4,"weight":12.5}}},{"open":true}]"#
        );
        assert_eq!(store.get_values_json(), r#"{"open":true}"#);
    }

    #[test]
    fn test_set_json_round_trip() {
        let store = Store::new();
        store.set_json(r#"[{"pets":{"fido":{"species":"dog"}}},{"open":true}]"#);

        let copy = Store::new();
        copy.set_json(&store.get_json());
        assert_eq!(copy.get_content(), store.get_content());
    }

    #[test]
    fn test_set_json_accepts_legacy_tables_object() {
        let store = Store::new();
        store.set_value("stale", 1);
        store.set_json(r#"{"pets":{"fido":{"species":"dog"}}}"#);

        assert_eq!(store.get_cell("pets", "fido", "species"), Some(Scalar::from("dog")));
        assert!(!store.has_values());
    }

    #[test]
    fn test_malformed_json_is_a_no_op() {
        let store = Store::new();
        store.set_cell("t", "r", "c", 1);
        store.set_json("[{\"t\":");
        store.set_json("42");
        store.set_tables_json("{not json");
        assert_eq!(store.get_tables_json(), r#"{"t":{"r":{"c":1}}}"#);
    }

    #[test]
    fn test_set_content_empty_part_deletes() {
        let store = Store::new();
        store.set_cell("t", "r", "c", 1).set_value("v", 1);
        store.set_content((json!({}), json!({"w": 2})));

        assert!(!store.has_tables());
        assert_eq!(store.get_value_ids(), vec!["w"]);
    }

    #[test]
    fn test_schema_json() {
        let store = Store::new();
        store.set_schema_json(r#"[{"pets":{"sold":{"type":"boolean","default":false}}},{}]"#);
        assert_eq!(
            store.get_schema_json(),
            r#"[{"pets":{"sold":{"default":false,"type":"boolean"}}},{}]"#
        );

        store.set_schema_json("[{},{}]");
        assert!(store.get_tables_schema().is_none());
    }

    #[test]
    fn test_parse_content_rejects_other_shapes() {
        assert!(parse_content("[1]").is_err());
        assert!(parse_content("\"x\"").is_err());
        assert!(parse_content("nope").is_err());
    }
}
