mod dispatch;
mod listeners;
mod mutate;

use crate::listeners::{IdPool, Listeners};
use crate::schema::{validate_tables_schema, validate_values_schema, TablesSchema, ValuesSchema};
use crate::serialization::{tables_to_json, values_to_json};
use crate::transaction::{Change, Changes, TransactionLog};
use crate::types::{
    compare_sort_keys, CellId, Row, RowId, Scalar, SortedRowIdsArgs, Table, TableId, Tables,
    ValueId, Values,
};
use crate::validation::Validator;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub(crate) use mutate::Writer;

/// Predicate deciding, once a transaction body has run, whether to undo it.
pub(crate) type RollbackFn<'a> = Box<dyn FnOnce(&Store, &TransactionLog) -> bool + 'a>;

/// Everything a store holds, behind the store's interior mutability.
#[derive(Debug, Default)]
pub(crate) struct Data {
    pub tables: Tables,
    pub values: Values,
    pub validator: Validator,
    pub row_id_pools: HashMap<TableId, IdPool>,
}

struct StoreInner {
    data: RefCell<Data>,
    log: RefCell<TransactionLog>,
    listeners: RefCell<Listeners>,
    transactions: Cell<usize>,
    non_mutator_pass: Cell<bool>,
    /// Schemas as they were before the first schema change of the open
    /// transaction.
    schema_checkpoint: RefCell<Option<SchemaCheckpoint>>,
}

type SchemaCheckpoint = (Option<TablesSchema>, Option<ValuesSchema>);

/// A reactive, in-memory store of tables and keyed values.
///
/// `Store` is a cheap handle: clones share the same data. It is
/// single-threaded; listeners receive the handle and may read from or write
/// back into the store while they run.
///
/// Writes never fail. Candidates that are not valid scalars, or that the
/// installed schema rejects, are dropped and reported to invalid-cell and
/// invalid-value listeners instead.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.data.borrow();
        f.debug_struct("Store")
            .field("tables", &data.tables)
            .field("values", &data.values)
            .finish()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            inner: Rc::new(StoreInner {
                data: RefCell::new(Data::default()),
                log: RefCell::new(TransactionLog::default()),
                listeners: RefCell::new(Listeners::default()),
                transactions: Cell::new(0),
                non_mutator_pass: Cell::new(false),
                schema_checkpoint: RefCell::new(None),
            }),
        }
    }

    /// Whether two handles refer to the same store.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` against the data and the transaction log inside a
    /// transaction. Returns `None` without running `f` when writes are not
    /// allowed (while non-mutator listeners are being called).
    fn write<R>(&self, f: impl FnOnce(&mut Writer<'_>) -> R) -> Option<R> {
        if self.inner.non_mutator_pass.get() {
            log::debug!("Ignoring write from a non-mutator listener");
            return None;
        }
        self.start_transaction();
        let result = {
            let mut data = self.inner.data.borrow_mut();
            let mut log = self.inner.log.borrow_mut();
            f(&mut Writer::new(&mut data, &mut log))
        };
        self.finish_transaction();
        Some(result)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get_tables(&self) -> Tables {
        self.inner.data.borrow().tables.clone()
    }

    pub fn get_table_ids(&self) -> Vec<TableId> {
        self.inner.data.borrow().tables.keys().cloned().collect()
    }

    /// A copy of the table, empty if it does not exist.
    pub fn get_table(&self, table_id: &str) -> Table {
        self.inner
            .data
            .borrow()
            .tables
            .get(table_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_row_ids(&self, table_id: &str) -> Vec<RowId> {
        self.inner
            .data
            .borrow()
            .tables
            .get(table_id)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Row ids of a table sorted by a cell (or by id), then sliced.
    ///
    /// Rows missing the sort cell come first; rows with equal sort cells keep
    /// row id order in both directions.
    pub fn get_sorted_row_ids(&self, args: &SortedRowIdsArgs) -> Vec<RowId> {
        let data = self.inner.data.borrow();
        let Some(rows) = data.tables.get(&args.table_id) else {
            return Vec::new();
        };

        let mut keyed: Vec<(&RowId, Option<&Scalar>)> = rows
            .iter()
            .map(|(row_id, row)| (row_id, args.cell_id.as_ref().and_then(|cell_id| row.get(cell_id))))
            .collect();
        keyed.sort_by(|(a_id, a), (b_id, b)| {
            let order = match args.cell_id {
                Some(_) => compare_sort_keys(*a, *b),
                None => a_id.cmp(b_id),
            };
            if args.descending {
                order.reverse()
            } else {
                order
            }
        });

        let limit = args.limit.unwrap_or(usize::MAX);
        let sorted: Vec<RowId> = keyed
            .into_iter()
            .skip(args.offset)
            .take(limit)
            .map(|(row_id, _)| row_id.clone())
            .collect();
        sorted
    }

    /// A copy of the row, empty if it does not exist.
    pub fn get_row(&self, table_id: &str, row_id: &str) -> Row {
        self.inner
            .data
            .borrow()
            .tables
            .get(table_id)
            .and_then(|rows| rows.get(row_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_cell_ids(&self, table_id: &str, row_id: &str) -> Vec<CellId> {
        self.inner
            .data
            .borrow()
            .tables
            .get(table_id)
            .and_then(|rows| rows.get(row_id))
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<Scalar> {
        self.inner
            .data
            .borrow()
            .tables
            .get(table_id)?
            .get(row_id)?
            .get(cell_id)
            .cloned()
    }

    pub fn get_values(&self) -> Values {
        self.inner.data.borrow().values.clone()
    }

    pub fn get_value_ids(&self) -> Vec<ValueId> {
        self.inner.data.borrow().values.keys().cloned().collect()
    }

    pub fn get_value(&self, value_id: &str) -> Option<Scalar> {
        self.inner.data.borrow().values.get(value_id).cloned()
    }

    pub fn has_tables(&self) -> bool {
        !self.inner.data.borrow().tables.is_empty()
    }

    pub fn has_table(&self, table_id: &str) -> bool {
        self.inner.data.borrow().tables.contains_key(table_id)
    }

    pub fn has_row(&self, table_id: &str, row_id: &str) -> bool {
        self.inner
            .data
            .borrow()
            .tables
            .get(table_id)
            .is_some_and(|rows| rows.contains_key(row_id))
    }

    pub fn has_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> bool {
        self.get_cell(table_id, row_id, cell_id).is_some()
    }

    pub fn has_values(&self) -> bool {
        !self.inner.data.borrow().values.is_empty()
    }

    pub fn has_value(&self, value_id: &str) -> bool {
        self.inner.data.borrow().values.contains_key(value_id)
    }

    /// Call `f` once per table, over a copy taken before the first call.
    pub fn for_each_table(&self, mut f: impl FnMut(&str, &Table)) {
        for (table_id, table) in self.get_tables() {
            f(&table_id, &table);
        }
    }

    pub fn for_each_row(&self, table_id: &str, mut f: impl FnMut(&str, &Row)) {
        for (row_id, row) in self.get_table(table_id) {
            f(&row_id, &row);
        }
    }

    pub fn for_each_cell(&self, table_id: &str, row_id: &str, mut f: impl FnMut(&str, &Scalar)) {
        for (cell_id, cell) in self.get_row(table_id, row_id) {
            f(&cell_id, &cell);
        }
    }

    pub fn for_each_value(&self, mut f: impl FnMut(&str, &Scalar)) {
        for (value_id, value) in self.get_values() {
            f(&value_id, &value);
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Replace all tables with a candidate `{tableId: {rowId: {cellId: cell}}}`.
    pub fn set_tables(&self, tables: serde_json::Value) -> &Self {
        self.write(|writer| {
            if let Some(tables) = writer.validate_tables(&tables) {
                writer.set_valid_tables(tables);
            }
        });
        self
    }

    pub fn set_table(&self, table_id: &str, table: serde_json::Value) -> &Self {
        self.write(|writer| {
            if let Some(table) = writer.validate_table(table_id, &table) {
                writer.set_valid_table(table_id, table);
            }
        });
        self
    }

    pub fn set_row(&self, table_id: &str, row_id: &str, row: serde_json::Value) -> &Self {
        self.write(|writer| {
            if let Some(row) = writer.validate_row(table_id, Some(row_id), &row, false) {
                writer.set_valid_row(table_id, row_id, row);
            }
        });
        self
    }

    /// Add a row under a fresh numeric row id. Returns the id, or `None` when
    /// the row was rejected.
    ///
    /// With `reuse_row_ids`, ids of deleted rows are handed out again.
    pub fn add_row(&self, table_id: &str, row: serde_json::Value, reuse_row_ids: bool) -> Option<RowId> {
        self.write(|writer| {
            let row = writer.validate_row(table_id, None, &row, false)?;
            let row_id = writer.next_row_id(table_id, reuse_row_ids);
            writer.set_valid_row(table_id, &row_id, row);
            Some(row_id)
        })
        .flatten()
    }

    /// Write the given cells, leaving the row's other cells untouched.
    pub fn set_partial_row(&self, table_id: &str, row_id: &str, partial_row: serde_json::Value) -> &Self {
        self.write(|writer| {
            if let Some(row) = writer.validate_row(table_id, Some(row_id), &partial_row, true) {
                for (cell_id, cell) in row {
                    writer.set_cell_into_default_row(table_id, row_id, &cell_id, cell);
                }
            }
        });
        self
    }

    pub fn set_cell(
        &self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        cell: impl Into<serde_json::Value>,
    ) -> &Self {
        let cell = cell.into();
        self.write(|writer| {
            if let Some(cell) = writer.validate_cell(table_id, Some(row_id), cell_id, &cell) {
                writer.set_cell_into_default_row(table_id, row_id, cell_id, cell);
            }
        });
        self
    }

    /// Set a cell from its current value.
    pub fn set_cell_with<V: Into<serde_json::Value>>(
        &self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        f: impl FnOnce(Option<&Scalar>) -> V,
    ) -> &Self {
        let current = self.get_cell(table_id, row_id, cell_id);
        self.set_cell(table_id, row_id, cell_id, f(current.as_ref()))
    }

    /// Replace all values with a candidate `{valueId: value}`.
    pub fn set_values(&self, values: serde_json::Value) -> &Self {
        self.write(|writer| {
            if let Some(values) = writer.validate_values(&values, false) {
                writer.set_valid_values(values);
            }
        });
        self
    }

    pub fn set_partial_values(&self, partial_values: serde_json::Value) -> &Self {
        self.write(|writer| {
            if let Some(values) = writer.validate_values(&partial_values, true) {
                for (value_id, value) in values {
                    writer.set_valid_value(&value_id, value);
                }
            }
        });
        self
    }

    pub fn set_value(&self, value_id: &str, value: impl Into<serde_json::Value>) -> &Self {
        let value = value.into();
        self.write(|writer| {
            if let Some(value) = writer.validate_value(value_id, &value) {
                writer.set_valid_value(value_id, value);
            }
        });
        self
    }

    /// Set a value from its current value.
    pub fn set_value_with<V: Into<serde_json::Value>>(
        &self,
        value_id: &str,
        f: impl FnOnce(Option<&Scalar>) -> V,
    ) -> &Self {
        let current = self.get_value(value_id);
        self.set_value(value_id, f(current.as_ref()))
    }

    pub fn del_tables(&self) -> &Self {
        self.write(|writer| writer.del_valid_tables());
        self
    }

    pub fn del_table(&self, table_id: &str) -> &Self {
        if self.has_table(table_id) {
            self.write(|writer| writer.del_valid_table(table_id));
        }
        self
    }

    pub fn del_row(&self, table_id: &str, row_id: &str) -> &Self {
        if self.has_row(table_id, row_id) {
            self.write(|writer| writer.del_valid_row(table_id, row_id));
        }
        self
    }

    /// Delete a cell. If the schema defaults it, the cell is reset to the
    /// default instead, unless `force_del` is set, which deletes the whole row.
    pub fn del_cell(&self, table_id: &str, row_id: &str, cell_id: &str, force_del: bool) -> &Self {
        if self.has_cell(table_id, row_id, cell_id) {
            self.write(|writer| writer.del_valid_cell(table_id, row_id, cell_id, force_del));
        }
        self
    }

    /// Delete all values. Values with a schema default are reset to it.
    pub fn del_values(&self) -> &Self {
        self.write(|writer| writer.del_valid_values());
        self
    }

    pub fn del_value(&self, value_id: &str) -> &Self {
        if self.has_value(value_id) {
            self.write(|writer| writer.del_valid_value(value_id));
        }
        self
    }

    // ── Schema ──────────────────────────────────────────────────────

    pub fn get_tables_schema(&self) -> Option<TablesSchema> {
        self.inner.data.borrow().validator.tables_schema().cloned()
    }

    pub fn get_values_schema(&self) -> Option<ValuesSchema> {
        self.inner.data.borrow().validator.values_schema().cloned()
    }

    /// Install a tables schema and revalidate every existing table against
    /// it. A candidate with nothing valid in it is rejected and leaves the
    /// store untouched.
    pub fn set_tables_schema(&self, schema: serde_json::Value) -> &Self {
        match validate_tables_schema(&schema) {
            Some(schema) => self.install_tables_schema(Some(schema)),
            None => log::warn!("Rejected tables schema: {schema}"),
        }
        self
    }

    /// Install a values schema and revalidate every existing value against
    /// it. A candidate with nothing valid in it is rejected and leaves the
    /// store untouched.
    pub fn set_values_schema(&self, schema: serde_json::Value) -> &Self {
        match validate_values_schema(&schema) {
            Some(schema) => self.install_values_schema(Some(schema)),
            None => log::warn!("Rejected values schema: {schema}"),
        }
        self
    }

    /// Install either or both schemas in one transaction.
    pub fn set_schema(
        &self,
        tables_schema: Option<serde_json::Value>,
        values_schema: Option<serde_json::Value>,
    ) -> &Self {
        self.transaction(|store| {
            if let Some(schema) = tables_schema {
                store.set_tables_schema(schema);
            }
            if let Some(schema) = values_schema {
                store.set_values_schema(schema);
            }
        });
        self
    }

    pub fn del_tables_schema(&self) -> &Self {
        self.install_tables_schema(None);
        self
    }

    pub fn del_values_schema(&self) -> &Self {
        self.install_values_schema(None);
        self
    }

    pub fn del_schema(&self) -> &Self {
        self.transaction(|store| {
            store.del_tables_schema();
            store.del_values_schema();
        });
        self
    }

    fn checkpoint_schemas(&self, validator: &Validator) {
        self.inner
            .schema_checkpoint
            .borrow_mut()
            .get_or_insert_with(|| {
                (
                    validator.tables_schema().cloned(),
                    validator.values_schema().cloned(),
                )
            });
    }

    fn install_tables_schema(&self, schema: Option<TablesSchema>) {
        let tables = tables_to_json(&self.get_tables());
        let installed = self.write(|writer| {
            self.checkpoint_schemas(&writer.data.validator);
            writer.data.validator.set_tables_schema(schema);
            writer.del_valid_tables();
            if tables.as_object().is_some_and(|tables| !tables.is_empty()) {
                if let Some(tables) = writer.validate_tables(&tables) {
                    writer.set_valid_tables(tables);
                }
            }
        });
        if installed.is_some() {
            log::debug!("Installed tables schema");
        }
    }

    fn install_values_schema(&self, schema: Option<ValuesSchema>) {
        let values = values_to_json(&self.get_values());
        let installed = self.write(|writer| {
            self.checkpoint_schemas(&writer.data.validator);
            writer.data.validator.set_values_schema(schema);
            writer.del_valid_values();
            let has_defaults = !writer.data.validator.default_values().is_empty();
            if has_defaults || values.as_object().is_some_and(|values| !values.is_empty()) {
                if let Some(values) = writer.validate_values(&values, false) {
                    writer.set_valid_values(values);
                }
            }
        });
        if installed.is_some() {
            log::debug!("Installed values schema");
        }
    }

    // ── Transactions ────────────────────────────────────────────────

    /// Run `body` as one transaction: listeners are called once, after it
    /// returns, with the net changes it made.
    pub fn transaction<R>(&self, body: impl FnOnce(&Store) -> R) -> R {
        self.start_transaction();
        let result = body(self);
        self.finish_transaction();
        result
    }

    /// Like [`Store::transaction`], but `rollback` is consulted after `body`
    /// returns. If it returns true every change is undone and no listener is
    /// called. Ignored when nested inside another transaction.
    pub fn transaction_with_rollback<R>(
        &self,
        body: impl FnOnce(&Store) -> R,
        rollback: impl FnOnce(&Store, &TransactionLog) -> bool,
    ) -> R {
        self.start_transaction();
        let result = body(self);
        self.finish_transaction_with_rollback(rollback);
        result
    }

    /// Open a transaction explicitly. Must be paired with
    /// [`Store::finish_transaction`].
    pub fn start_transaction(&self) -> &Self {
        self.inner.transactions.set(self.inner.transactions.get() + 1);
        self
    }

    pub fn finish_transaction(&self) -> &Self {
        self.finish(None)
    }

    pub fn finish_transaction_with_rollback(
        &self,
        rollback: impl FnOnce(&Store, &TransactionLog) -> bool,
    ) -> &Self {
        self.finish(Some(Box::new(rollback)))
    }

    fn finish(&self, rollback: Option<RollbackFn<'_>>) -> &Self {
        match self.inner.transactions.get() {
            0 => log::warn!("finish_transaction called without a matching start_transaction"),
            1 => {
                dispatch::commit(self, rollback);
                self.inner.transactions.set(0);
            }
            depth => self.inner.transactions.set(depth - 1),
        }
        self
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.inner.transactions.get() > 0
    }

    // ── Changes ─────────────────────────────────────────────────────

    /// How a cell changed in the current transaction. Outside a transaction,
    /// or for an untouched cell, reports the current cell as unchanged.
    pub fn get_cell_change(&self, table_id: &str, row_id: &str, cell_id: &str) -> Change {
        let change = self.inner.log.borrow().cell_change(table_id, row_id, cell_id);
        change.unwrap_or_else(|| {
            let cell = self.get_cell(table_id, row_id, cell_id);
            Change {
                changed: false,
                old: cell.clone(),
                new: cell,
            }
        })
    }

    pub fn get_value_change(&self, value_id: &str) -> Change {
        let change = self.inner.log.borrow().value_change(value_id);
        change.unwrap_or_else(|| {
            let value = self.get_value(value_id);
            Change {
                changed: false,
                old: value.clone(),
                new: value,
            }
        })
    }

    /// Everything recorded so far in the current transaction.
    pub fn get_transaction_log(&self) -> TransactionLog {
        self.inner.log.borrow().clone()
    }

    /// The net diff of the current transaction.
    pub fn get_transaction_changes(&self) -> Changes {
        self.inner.log.borrow().changes()
    }

    /// Replay a diff, as produced by [`Store::get_transaction_changes`], in
    /// one transaction.
    pub fn apply_changes(&self, changes: &Changes) -> &Self {
        self.transaction(|store| {
            for (table_id, table) in &changes.tables {
                let Some(rows) = table else {
                    store.del_table(table_id);
                    continue;
                };
                for (row_id, row) in rows {
                    let Some(cells) = row else {
                        store.del_row(table_id, row_id);
                        continue;
                    };
                    for (cell_id, cell) in cells {
                        match cell {
                            Some(cell) => store.set_cell(table_id, row_id, cell_id, cell),
                            None => store.del_cell(table_id, row_id, cell_id, false),
                        };
                    }
                }
            }
            for (value_id, value) in &changes.values {
                match value {
                    Some(value) => store.set_value(value_id, value),
                    None => store.del_value(value_id),
                };
            }
        });
        self
    }
}
