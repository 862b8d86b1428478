use crate::schema::{CellSchema, TablesSchema, ValuesSchema};
use crate::transaction::{InvalidCells, InvalidValues};
use crate::types::{Row, Scalar, Table, Tables, Values};
use std::collections::BTreeMap;

/// Write-time validator. Holds the installed schemas and the default cells
/// and values derived from them.
///
/// Every check prunes rather than fails: an invalid leaf is dropped (or
/// replaced by its schema default) and reported into the invalid log, and a
/// candidate is rejected only when nothing valid is left of it.
#[derive(Debug, Default)]
pub(crate) struct Validator {
    tables_schema: Option<TablesSchema>,
    default_rows: BTreeMap<String, Row>,
    values_schema: Option<ValuesSchema>,
    default_values: Values,
}

impl Validator {
    pub fn tables_schema(&self) -> Option<&TablesSchema> {
        self.tables_schema.as_ref()
    }

    pub fn values_schema(&self) -> Option<&ValuesSchema> {
        self.values_schema.as_ref()
    }

    pub fn set_tables_schema(&mut self, schema: Option<TablesSchema>) {
        self.default_rows = schema
            .iter()
            .flatten()
            .map(|(table_id, table)| (table_id.clone(), defaults_of(table)))
            .filter(|(_, defaults)| !defaults.is_empty())
            .collect();
        self.tables_schema = schema;
    }

    pub fn set_values_schema(&mut self, schema: Option<ValuesSchema>) {
        self.default_values = schema.as_ref().map(defaults_of).unwrap_or_default();
        self.values_schema = schema;
    }

    pub fn default_cell(&self, table_id: &str, cell_id: &str) -> Option<&Scalar> {
        self.default_rows.get(table_id)?.get(cell_id)
    }

    /// Every defaulted cell of a table, as a freshly created row would get them.
    pub fn default_row(&self, table_id: &str) -> Row {
        self.default_rows.get(table_id).cloned().unwrap_or_default()
    }

    pub fn default_value(&self, value_id: &str) -> Option<&Scalar> {
        self.default_values.get(value_id)
    }

    pub fn default_values(&self) -> &Values {
        &self.default_values
    }

    pub fn cell(
        &self,
        table_id: &str,
        row_id: Option<&str>,
        cell_id: &str,
        candidate: &serde_json::Value,
        invalid: &mut InvalidCells,
    ) -> Option<Scalar> {
        let path = (Some(table_id), row_id, Some(cell_id));
        match &self.tables_schema {
            Some(schema) => match schema.get(table_id).and_then(|table| table.get(cell_id)) {
                Some(cell_schema) => match Scalar::from_json(candidate) {
                    Some(cell) if cell.scalar_type() == cell_schema.scalar_type => Some(cell),
                    _ => {
                        record_cell(invalid, path, candidate);
                        cell_schema.default.clone()
                    }
                },
                None => {
                    record_cell(invalid, path, candidate);
                    None
                }
            },
            None => Scalar::from_json(candidate).or_else(|| {
                record_cell(invalid, path, candidate);
                None
            }),
        }
    }

    /// Validate a row candidate. Unless `skip_defaults` is set, schema default
    /// cells missing from both the candidate and the `existing` row are added.
    pub fn row(
        &self,
        table_id: &str,
        row_id: Option<&str>,
        candidate: &serde_json::Value,
        existing: Option<&Row>,
        skip_defaults: bool,
        invalid: &mut InvalidCells,
    ) -> Option<Row> {
        let Some(cells) = candidate.as_object() else {
            record_cell(invalid, (Some(table_id), row_id, None), candidate);
            return None;
        };

        let mut row = Row::new();
        if !skip_defaults {
            if let Some(defaults) = self.default_rows.get(table_id) {
                for (cell_id, default) in defaults {
                    let present = cells.contains_key(cell_id)
                        || existing.is_some_and(|row| row.contains_key(cell_id));
                    if !present {
                        row.insert(cell_id.clone(), default.clone());
                    }
                }
            }
        }

        if cells.is_empty() && row.is_empty() {
            record_cell(invalid, (Some(table_id), row_id, None), candidate);
            return None;
        }

        for (cell_id, cell_candidate) in cells {
            if let Some(cell) = self.cell(table_id, row_id, cell_id, cell_candidate, invalid) {
                row.insert(cell_id.clone(), cell);
            }
        }

        (!row.is_empty()).then_some(row)
    }

    pub fn table(
        &self,
        table_id: &str,
        candidate: &serde_json::Value,
        existing: Option<&Table>,
        invalid: &mut InvalidCells,
    ) -> Option<Table> {
        let known = self
            .tables_schema
            .as_ref()
            .map_or(true, |schema| schema.contains_key(table_id));
        let rows = candidate.as_object().filter(|rows| !rows.is_empty());
        let (true, Some(rows)) = (known, rows) else {
            record_cell(invalid, (Some(table_id), None, None), candidate);
            return None;
        };

        let table: Table = rows
            .iter()
            .filter_map(|(row_id, row_candidate)| {
                let existing_row = existing.and_then(|table| table.get(row_id));
                self.row(table_id, Some(row_id), row_candidate, existing_row, false, invalid)
                    .map(|row| (row_id.clone(), row))
            })
            .collect();

        (!table.is_empty()).then_some(table)
    }

    pub fn tables(
        &self,
        candidate: &serde_json::Value,
        existing: &Tables,
        invalid: &mut InvalidCells,
    ) -> Option<Tables> {
        let Some(tables) = candidate.as_object().filter(|tables| !tables.is_empty()) else {
            record_cell(invalid, (None, None, None), candidate);
            return None;
        };

        let validated: Tables = tables
            .iter()
            .filter_map(|(table_id, table_candidate)| {
                self.table(table_id, table_candidate, existing.get(table_id), invalid)
                    .map(|table| (table_id.clone(), table))
            })
            .collect();

        (!validated.is_empty()).then_some(validated)
    }

    pub fn value(
        &self,
        value_id: &str,
        candidate: &serde_json::Value,
        invalid: &mut InvalidValues,
    ) -> Option<Scalar> {
        match &self.values_schema {
            Some(schema) => match schema.get(value_id) {
                Some(value_schema) => match Scalar::from_json(candidate) {
                    Some(value) if value.scalar_type() == value_schema.scalar_type => Some(value),
                    _ => {
                        record_value(invalid, Some(value_id), candidate);
                        value_schema.default.clone()
                    }
                },
                None => {
                    record_value(invalid, Some(value_id), candidate);
                    None
                }
            },
            None => Scalar::from_json(candidate).or_else(|| {
                record_value(invalid, Some(value_id), candidate);
                None
            }),
        }
    }

    /// Validate a values candidate. Unless `skip_defaults` is set, schema
    /// default values missing from the candidate are added.
    pub fn values(
        &self,
        candidate: &serde_json::Value,
        skip_defaults: bool,
        invalid: &mut InvalidValues,
    ) -> Option<Values> {
        let Some(values) = candidate.as_object() else {
            record_value(invalid, None, candidate);
            return None;
        };

        let mut validated = Values::new();
        if !skip_defaults {
            for (value_id, default) in &self.default_values {
                if !values.contains_key(value_id) {
                    validated.insert(value_id.clone(), default.clone());
                }
            }
        }

        if values.is_empty() && validated.is_empty() {
            record_value(invalid, None, candidate);
            return None;
        }

        for (value_id, value_candidate) in values {
            if let Some(value) = self.value(value_id, value_candidate, invalid) {
                validated.insert(value_id.clone(), value);
            }
        }

        (!validated.is_empty()).then_some(validated)
    }
}

fn defaults_of(schemas: &BTreeMap<String, CellSchema>) -> BTreeMap<String, Scalar> {
    schemas
        .iter()
        .filter_map(|(id, schema)| schema.default.clone().map(|default| (id.clone(), default)))
        .collect()
}

fn record_cell(
    invalid: &mut InvalidCells,
    (table_id, row_id, cell_id): (Option<&str>, Option<&str>, Option<&str>),
    candidate: &serde_json::Value,
) {
    invalid
        .entry((
            table_id.map(str::to_string),
            row_id.map(str::to_string),
            cell_id.map(str::to_string),
        ))
        .or_default()
        .push(candidate.clone());
}

fn record_value(invalid: &mut InvalidValues, value_id: Option<&str>, candidate: &serde_json::Value) {
    invalid
        .entry(value_id.map(str::to_string))
        .or_default()
        .push(candidate.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{validate_tables_schema, validate_values_schema};
    use serde_json::json;

    fn key(
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
    ) -> (Option<String>, Option<String>, Option<String>) {
        (
            table_id.map(str::to_string),
            row_id.map(str::to_string),
            cell_id.map(str::to_string),
        )
    }

    fn test_validator() -> Validator {
        let mut validator = Validator::default();
        validator.set_tables_schema(validate_tables_schema(&json!({
            "pets": {
                "species": {"type": "string"},
                "sold": {"type": "boolean", "default": false},
                "legs": {"type": "number", "default": 4}
            }
        })));
        validator.set_values_schema(validate_values_schema(&json!({
            "open": {"type": "boolean", "default": true},
            "name": {"type": "string"}
        })));
        validator
    }

    #[test]
    fn test_no_schema_accepts_any_scalar() {
        let validator = Validator::default();
        let mut invalid = InvalidCells::new();
        let row = validator
            .row("t", Some("r"), &json!({"a": 1, "b": "x", "c": [1]}), None, false, &mut invalid)
            .unwrap();

        assert_eq!(row.len(), 2);
        assert_eq!(
            invalid[&key(Some("t"), Some("r"), Some("c"))],
            vec![json!([1])]
        );
    }

    #[test]
    fn test_invalid_cell_replaced_by_default() {
        let validator = test_validator();
        let mut invalid = InvalidCells::new();
        let cell = validator.cell("pets", None, "sold", &json!("maybe"), &mut invalid);

        assert_eq!(cell, Some(Scalar::Boolean(false)));
        assert_eq!(invalid[&key(Some("pets"), None, Some("sold"))], vec![json!("maybe")]);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let validator = test_validator();
        let mut invalid = InvalidCells::new();
        let table = validator.table("cars", &json!({"r": {"species": "dog"}}), None, &mut invalid);

        assert!(table.is_none());
        assert!(invalid.contains_key(&key(Some("cars"), None, None)));
    }

    #[test]
    fn test_row_gets_defaults() {
        let validator = test_validator();
        let mut invalid = InvalidCells::new();
        let row = validator
            .row("pets", Some("fido"), &json!({"species": "dog"}), None, false, &mut invalid)
            .unwrap();

        assert_eq!(row["species"], Scalar::from("dog"));
        assert_eq!(row["sold"], Scalar::Boolean(false));
        assert_eq!(row["legs"], Scalar::Number(4.0));
        assert!(invalid.is_empty());
    }

    #[test]
    fn test_row_defaults_skip_existing_cells() {
        let validator = test_validator();
        let mut invalid = InvalidCells::new();
        let existing: Row = [("legs".to_string(), Scalar::Number(3.0))].into();
        let row = validator
            .row("pets", Some("fido"), &json!({"species": "dog"}), Some(&existing), false, &mut invalid)
            .unwrap();

        assert!(!row.contains_key("legs"));
        assert!(row.contains_key("sold"));
    }

    #[test]
    fn test_partial_row_skips_defaults() {
        let validator = test_validator();
        let mut invalid = InvalidCells::new();
        let row = validator
            .row("pets", Some("fido"), &json!({"species": "cat"}), None, true, &mut invalid)
            .unwrap();
        assert_eq!(row.len(), 1);
    }

    #[test]
    fn test_empty_row_rejected_without_defaults() {
        let validator = Validator::default();
        let mut invalid = InvalidCells::new();
        assert!(validator.row("t", Some("r"), &json!({}), None, false, &mut invalid).is_none());
        assert!(validator.row("t", Some("r"), &json!({"a": null}), None, false, &mut invalid).is_none());
        assert!(validator.row("t", Some("r"), &json!("x"), None, false, &mut invalid).is_none());
        assert_eq!(invalid.len(), 2);
    }

    #[test]
    fn test_tables_rejects_non_object() {
        let validator = Validator::default();
        let mut invalid = InvalidCells::new();
        assert!(validator.tables(&json!(42), &Tables::new(), &mut invalid).is_none());
        assert_eq!(invalid[&key(None, None, None)], vec![json!(42)]);
    }

    #[test]
    fn test_values_with_schema() {
        let validator = test_validator();
        let mut invalid = InvalidValues::new();
        let values = validator
            .values(&json!({"name": 7, "extra": "x"}), false, &mut invalid)
            .unwrap();

        // name has no default, so the wrong type is dropped; open is defaulted
        assert_eq!(values.len(), 1);
        assert_eq!(values["open"], Scalar::Boolean(true));
        assert_eq!(invalid[&Some("name".to_string())], vec![json!(7)]);
        assert_eq!(invalid[&Some("extra".to_string())], vec![json!("x")]);
    }
}
