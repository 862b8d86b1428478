use super::Data;
use crate::listeners::IdPool;
use crate::transaction::{IdChange, TransactionLog};
use crate::types::{Row, RowId, Scalar, Table, Tables, Values};

/// Applies already-validated writes to the data, recording every id and
/// cell/value change in the transaction log as it goes.
///
/// Rows and tables follow the existence rule: removing the last cell of a row
/// removes the row, and removing the last row of a table removes the table.
pub(crate) struct Writer<'a> {
    pub data: &'a mut Data,
    pub log: &'a mut TransactionLog,
}

impl<'a> Writer<'a> {
    pub fn new(data: &'a mut Data, log: &'a mut TransactionLog) -> Self {
        Writer { data, log }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate_tables(&mut self, candidate: &serde_json::Value) -> Option<Tables> {
        self.data
            .validator
            .tables(candidate, &self.data.tables, &mut self.log.invalid_cells)
    }

    pub fn validate_table(&mut self, table_id: &str, candidate: &serde_json::Value) -> Option<Table> {
        self.data.validator.table(
            table_id,
            candidate,
            self.data.tables.get(table_id),
            &mut self.log.invalid_cells,
        )
    }

    pub fn validate_row(
        &mut self,
        table_id: &str,
        row_id: Option<&str>,
        candidate: &serde_json::Value,
        skip_defaults: bool,
    ) -> Option<Row> {
        let existing = row_id.and_then(|row_id| self.data.tables.get(table_id)?.get(row_id));
        self.data.validator.row(
            table_id,
            row_id,
            candidate,
            existing,
            skip_defaults,
            &mut self.log.invalid_cells,
        )
    }

    pub fn validate_cell(
        &mut self,
        table_id: &str,
        row_id: Option<&str>,
        cell_id: &str,
        candidate: &serde_json::Value,
    ) -> Option<Scalar> {
        self.data
            .validator
            .cell(table_id, row_id, cell_id, candidate, &mut self.log.invalid_cells)
    }

    pub fn validate_values(&mut self, candidate: &serde_json::Value, skip_defaults: bool) -> Option<Values> {
        self.data
            .validator
            .values(candidate, skip_defaults, &mut self.log.invalid_values)
    }

    pub fn validate_value(&mut self, value_id: &str, candidate: &serde_json::Value) -> Option<Scalar> {
        self.data
            .validator
            .value(value_id, candidate, &mut self.log.invalid_values)
    }

    // ── Tables ──────────────────────────────────────────────────────

    fn ensure_row(&mut self, table_id: &str, row_id: &str) {
        if !self.data.tables.contains_key(table_id) {
            self.data.tables.insert(table_id.to_string(), Table::new());
            self.data.row_id_pools.insert(table_id.to_string(), IdPool::default());
            self.log.table_ids_changed(table_id, IdChange::Added);
        }
        let rows = self.data.tables.entry(table_id.to_string()).or_default();
        if !rows.contains_key(row_id) {
            rows.insert(row_id.to_string(), Row::new());
            self.log.row_ids_changed(table_id, row_id, IdChange::Added);
        }
    }

    /// Replace all tables. Tables missing from `tables` are deleted.
    pub fn set_valid_tables(&mut self, tables: Tables) {
        let stale: Vec<_> = self
            .data
            .tables
            .keys()
            .filter(|table_id| !tables.contains_key(*table_id))
            .cloned()
            .collect();
        for (table_id, table) in tables {
            self.set_valid_table(&table_id, table);
        }
        for table_id in stale {
            self.del_valid_table(&table_id);
        }
    }

    /// Replace one table. Rows missing from `table` are deleted.
    pub fn set_valid_table(&mut self, table_id: &str, table: Table) {
        let stale: Vec<_> = self
            .data
            .tables
            .get(table_id)
            .into_iter()
            .flat_map(|rows| rows.keys())
            .filter(|row_id| !table.contains_key(*row_id))
            .cloned()
            .collect();
        for (row_id, row) in table {
            self.set_valid_row(table_id, &row_id, row);
        }
        for row_id in stale {
            self.del_valid_row(table_id, &row_id);
        }
    }

    /// Replace one row. Cells missing from `row` are deleted, or reset to
    /// their default.
    pub fn set_valid_row(&mut self, table_id: &str, row_id: &str, row: Row) {
        let stale: Vec<_> = self
            .data
            .tables
            .get(table_id)
            .and_then(|rows| rows.get(row_id))
            .into_iter()
            .flat_map(|cells| cells.keys())
            .filter(|cell_id| !row.contains_key(*cell_id))
            .cloned()
            .collect();
        for (cell_id, cell) in row {
            self.set_valid_cell(table_id, row_id, &cell_id, cell);
        }
        for cell_id in stale {
            self.del_valid_cell(table_id, row_id, &cell_id, false);
        }
    }

    pub fn set_valid_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, cell: Scalar) {
        self.ensure_row(table_id, row_id);
        let Some(row) = self
            .data
            .tables
            .get_mut(table_id)
            .and_then(|rows| rows.get_mut(row_id))
        else {
            return;
        };
        if row.get(cell_id) == Some(&cell) {
            return;
        }
        let old = row.insert(cell_id.to_string(), cell.clone());
        if old.is_none() {
            self.log
                .cell_ids_changed(table_id, row_id, cell_id, IdChange::Added);
        }
        self.log.cell_changed(table_id, row_id, cell_id, old, Some(cell));
    }

    /// Write a single cell. A row that does not exist yet is created with all
    /// of its default cells as well.
    pub fn set_cell_into_default_row(&mut self, table_id: &str, row_id: &str, cell_id: &str, cell: Scalar) {
        let row_exists = self
            .data
            .tables
            .get(table_id)
            .is_some_and(|rows| rows.contains_key(row_id));
        if row_exists {
            self.set_valid_cell(table_id, row_id, cell_id, cell);
        } else {
            let mut row = self.data.validator.default_row(table_id);
            row.insert(cell_id.to_string(), cell);
            self.set_valid_row(table_id, row_id, row);
        }
    }

    pub fn del_valid_tables(&mut self) {
        self.set_valid_tables(Tables::new());
    }

    pub fn del_valid_table(&mut self, table_id: &str) {
        let row_ids: Vec<_> = match self.data.tables.get(table_id) {
            Some(rows) => rows.keys().cloned().collect(),
            None => return,
        };
        for row_id in row_ids {
            self.del_valid_row(table_id, &row_id);
        }
    }

    pub fn del_valid_row(&mut self, table_id: &str, row_id: &str) {
        let cell_ids: Vec<_> = match self.data.tables.get(table_id).and_then(|rows| rows.get(row_id)) {
            Some(row) => row.keys().cloned().collect(),
            None => return,
        };
        for cell_id in cell_ids {
            self.del_valid_cell(table_id, row_id, &cell_id, true);
        }
    }

    /// Delete a cell. A cell with a schema default is reset to it, unless
    /// `force_del` is set, in which case the whole row is deleted so it never
    /// exists without its defaulted cells.
    pub fn del_valid_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, force_del: bool) {
        let Some(row) = self.data.tables.get(table_id).and_then(|rows| rows.get(row_id)) else {
            return;
        };
        if !row.contains_key(cell_id) {
            return;
        }

        match self.data.validator.default_cell(table_id, cell_id).cloned() {
            Some(default) if !force_del => {
                self.set_valid_cell(table_id, row_id, cell_id, default);
                return;
            }
            Some(_) => {
                let cell_ids: Vec<_> = row.keys().cloned().collect();
                for cell_id in cell_ids {
                    self.remove_cell(table_id, row_id, &cell_id);
                }
            }
            None => self.remove_cell(table_id, row_id, cell_id),
        }

        self.prune(table_id, row_id);
    }

    fn remove_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) {
        let old = self
            .data
            .tables
            .get_mut(table_id)
            .and_then(|rows| rows.get_mut(row_id))
            .and_then(|row| row.remove(cell_id));
        if let Some(old) = old {
            self.log
                .cell_ids_changed(table_id, row_id, cell_id, IdChange::Removed);
            self.log.cell_changed(table_id, row_id, cell_id, Some(old), None);
        }
    }

    /// Remove the row if it has no cells left, then the table if it has no
    /// rows left.
    fn prune(&mut self, table_id: &str, row_id: &str) {
        let Some(rows) = self.data.tables.get_mut(table_id) else {
            return;
        };
        if rows.get(row_id).is_some_and(|row| row.is_empty()) {
            rows.remove(row_id);
            self.log.row_ids_changed(table_id, row_id, IdChange::Removed);
            if let Some(pool) = self.data.row_id_pools.get_mut(table_id) {
                pool.release_str(row_id);
            }
        }
        if rows.is_empty() {
            self.data.tables.remove(table_id);
            self.data.row_id_pools.remove(table_id);
            self.log.table_ids_changed(table_id, IdChange::Removed);
        }
    }

    /// A row id not currently used in the table, drawn from the table's pool.
    pub fn next_row_id(&mut self, table_id: &str, reuse: bool) -> RowId {
        let pool = self
            .data
            .row_id_pools
            .entry(table_id.to_string())
            .or_default();
        loop {
            let row_id = pool.next_id(reuse).to_string();
            let taken = self
                .data
                .tables
                .get(table_id)
                .is_some_and(|rows| rows.contains_key(&row_id));
            if !taken {
                return row_id;
            }
        }
    }

    // ── Values ──────────────────────────────────────────────────────

    /// Replace all values. Values missing from `values` are deleted, or reset
    /// to their default.
    pub fn set_valid_values(&mut self, values: Values) {
        let stale: Vec<_> = self
            .data
            .values
            .keys()
            .filter(|value_id| !values.contains_key(*value_id))
            .cloned()
            .collect();
        for (value_id, value) in values {
            self.set_valid_value(&value_id, value);
        }
        for value_id in stale {
            self.del_valid_value(&value_id);
        }
    }

    pub fn set_valid_value(&mut self, value_id: &str, value: Scalar) {
        if self.data.values.get(value_id) == Some(&value) {
            return;
        }
        let old = self.data.values.insert(value_id.to_string(), value.clone());
        if old.is_none() {
            self.log.value_ids_changed(value_id, IdChange::Added);
        }
        self.log.value_changed(value_id, old, Some(value));
    }

    pub fn del_valid_values(&mut self) {
        self.set_valid_values(Values::new());
    }

    pub fn del_valid_value(&mut self, value_id: &str) {
        match self.data.validator.default_value(value_id).cloned() {
            Some(default) => self.set_valid_value(value_id, default),
            None => self.remove_value(value_id),
        }
    }

    /// Remove a value outright, ignoring any default.
    pub fn remove_value(&mut self, value_id: &str) {
        if let Some(old) = self.data.values.remove(value_id) {
            self.log.value_ids_changed(value_id, IdChange::Removed);
            self.log.value_changed(value_id, Some(old), None);
        }
    }

    // ── Rollback ────────────────────────────────────────────────────

    /// Put every cell and value recorded in `log` back to the state it had
    /// when the transaction started.
    pub fn revert(&mut self, log: &TransactionLog) {
        let cells = log.cells.iter().flat_map(|(table_id, rows)| {
            rows.iter().flat_map(move |(row_id, cells)| {
                cells
                    .iter()
                    .map(move |(cell_id, (old, _))| (table_id, row_id, cell_id, old))
            })
        });
        let (deleted, restored): (Vec<_>, Vec<_>) = cells.partition(|(_, _, _, old)| old.is_none());

        for (table_id, row_id, cell_id, _) in deleted {
            self.del_valid_cell(table_id, row_id, cell_id, true);
        }
        for (table_id, row_id, cell_id, old) in restored {
            if let Some(old) = old {
                self.set_valid_cell(table_id, row_id, cell_id, old.clone());
            }
        }

        for (value_id, (old, _)) in &log.values {
            match old {
                Some(old) => self.set_valid_value(value_id, old.clone()),
                None => self.remove_value(value_id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate_tables_schema;
    use serde_json::json;

    fn row(cells: &[(&str, Scalar)]) -> Row {
        cells
            .iter()
            .map(|(id, cell)| (id.to_string(), cell.clone()))
            .collect()
    }

    #[test]
    fn test_last_cell_removal_cascades() {
        let mut data = Data::default();
        let mut log = TransactionLog::default();
        let mut writer = Writer::new(&mut data, &mut log);

        writer.set_valid_cell("t", "r", "c", Scalar::from(1));
        writer.del_valid_cell("t", "r", "c", false);

        assert!(writer.data.tables.is_empty());
        assert!(writer.data.row_id_pools.is_empty());
        assert!(writer.log.table_ids.is_empty());
        assert!(writer.log.row_ids["t"].is_empty());
        assert!(!writer.log.cells_touched());
    }

    #[test]
    fn test_set_valid_row_deletes_stale_cells() {
        let mut data = Data::default();
        let mut log = TransactionLog::default();
        let mut writer = Writer::new(&mut data, &mut log);

        writer.set_valid_row("t", "r", row(&[("a", 1.into()), ("b", 2.into())]));
        writer.set_valid_row("t", "r", row(&[("b", 3.into())]));

        assert_eq!(writer.data.tables["t"]["r"], row(&[("b", 3.into())]));
        assert_eq!(writer.log.cell_ids["t"]["r"]["b"], IdChange::Added);
        assert!(!writer.log.cell_ids["t"]["r"].contains_key("a"));
    }

    #[test]
    fn test_del_cell_with_default() {
        let mut data = Data::default();
        data.validator.set_tables_schema(validate_tables_schema(&json!({
            "pets": {
                "species": {"type": "string"},
                "sold": {"type": "boolean", "default": false}
            }
        })));
        let mut log = TransactionLog::default();
        let mut writer = Writer::new(&mut data, &mut log);
        writer.set_valid_row(
            "pets",
            "fido",
            row(&[("species", "dog".into()), ("sold", true.into())]),
        );

        writer.del_valid_cell("pets", "fido", "sold", false);
        assert_eq!(writer.data.tables["pets"]["fido"]["sold"], Scalar::Boolean(false));

        writer.del_valid_cell("pets", "fido", "sold", true);
        assert!(!writer.data.tables.contains_key("pets"));
    }

    #[test]
    fn test_next_row_id_skips_taken_ids() {
        let mut data = Data::default();
        let mut log = TransactionLog::default();
        let mut writer = Writer::new(&mut data, &mut log);

        writer.set_valid_cell("t", "1", "c", 1.into());
        assert_eq!(writer.next_row_id("t", true), "0");
        assert_eq!(writer.next_row_id("t", true), "2");
    }

    #[test]
    fn test_released_row_id_is_reused() {
        let mut data = Data::default();
        let mut log = TransactionLog::default();
        let mut writer = Writer::new(&mut data, &mut log);

        for row_id in ["0", "1"] {
            let next = writer.next_row_id("t", true);
            assert_eq!(next, row_id);
            writer.set_valid_cell("t", &next, "c", 1.into());
        }
        writer.del_valid_row("t", "0");

        assert_eq!(writer.next_row_id("t", false), "2");
        assert_eq!(writer.next_row_id("t", true), "0");
    }

    #[test]
    fn test_revert_restores_start_state() {
        let mut data = Data::default();
        let mut log = TransactionLog::default();
        Writer::new(&mut data, &mut log).set_valid_row("t", "r", row(&[("a", 1.into())]));
        data.values.insert("v".into(), "x".into());
        let before = (data.tables.clone(), data.values.clone());

        let mut log = TransactionLog::default();
        let mut writer = Writer::new(&mut data, &mut log);
        writer.del_valid_table("t");
        writer.set_valid_cell("u", "r", "b", true.into());
        writer.set_valid_value("v", "y".into());
        writer.set_valid_value("w", 2.into());

        let recorded = writer.log.clone();
        writer.revert(&recorded);
        assert_eq!((writer.data.tables.clone(), writer.data.values.clone()), before);
    }
}
