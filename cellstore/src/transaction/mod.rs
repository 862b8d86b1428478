use crate::types::{CellId, Id, RowId, Scalar, TableId, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether an id was added to or removed from its parent during a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdChange {
    Added,
    Removed,
}

impl IdChange {
    fn opposite(self) -> Self {
        match self {
            IdChange::Added => IdChange::Removed,
            IdChange::Removed => IdChange::Added,
        }
    }
}

/// Value at transaction start, and latest value, of a changed cell or value.
pub type ChangedPair = (Option<Scalar>, Option<Scalar>);

pub type ChangedIds = BTreeMap<Id, IdChange>;
pub type ChangedCells = BTreeMap<TableId, BTreeMap<RowId, BTreeMap<CellId, ChangedPair>>>;
pub type ChangedValues = BTreeMap<ValueId, ChangedPair>;

/// Rejected candidates keyed by the (table, row, cell) path they were written
/// to. A `None` component means the write was rejected above that level.
pub type InvalidCells =
    BTreeMap<(Option<TableId>, Option<RowId>, Option<CellId>), Vec<serde_json::Value>>;
pub type InvalidValues = BTreeMap<Option<ValueId>, Vec<serde_json::Value>>;

/// Everything recorded while a transaction is open. Drained after the
/// outermost transaction finishes dispatching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionLog {
    pub table_ids: ChangedIds,
    pub row_ids: BTreeMap<TableId, ChangedIds>,
    pub cell_ids: BTreeMap<TableId, BTreeMap<RowId, ChangedIds>>,
    pub cells: ChangedCells,
    pub invalid_cells: InvalidCells,
    pub value_ids: ChangedIds,
    pub values: ChangedValues,
    pub invalid_values: InvalidValues,
}

/// A cell or value as it was at transaction start and as it is now.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub changed: bool,
    pub old: Option<Scalar>,
    pub new: Option<Scalar>,
}

/// Net effect of a transaction. `None` at any level means deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Changes {
    pub tables: BTreeMap<TableId, Option<BTreeMap<RowId, Option<BTreeMap<CellId, Option<Scalar>>>>>>,
    pub values: BTreeMap<ValueId, Option<Scalar>>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.values.is_empty()
    }
}

/// Record an id add/remove. An opposite event for the same id cancels the
/// earlier one instead of stacking.
fn ids_changed(ids: &mut ChangedIds, id: &str, change: IdChange) {
    if ids.get(id) == Some(&change.opposite()) {
        ids.remove(id);
    } else {
        ids.insert(id.to_string(), change);
    }
}

impl TransactionLog {
    pub fn is_empty(&self) -> bool {
        *self == TransactionLog::default()
    }

    pub(crate) fn clear(&mut self) {
        *self = TransactionLog::default();
    }

    pub(crate) fn table_ids_changed(&mut self, table_id: &str, change: IdChange) {
        ids_changed(&mut self.table_ids, table_id, change);
    }

    pub(crate) fn row_ids_changed(&mut self, table_id: &str, row_id: &str, change: IdChange) {
        let ids = self.row_ids.entry(table_id.to_string()).or_default();
        ids_changed(ids, row_id, change);
    }

    pub(crate) fn cell_ids_changed(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        change: IdChange,
    ) {
        let ids = self
            .cell_ids
            .entry(table_id.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default();
        ids_changed(ids, cell_id, change);
    }

    /// Record a cell write. The first write in a transaction fixes the old
    /// value; later writes only move the new value.
    pub(crate) fn cell_changed(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        old: Option<Scalar>,
        new: Option<Scalar>,
    ) {
        self.cells
            .entry(table_id.to_string())
            .or_default()
            .entry(row_id.to_string())
            .or_default()
            .entry(cell_id.to_string())
            .or_insert((old, None))
            .1 = new;
    }

    pub(crate) fn value_ids_changed(&mut self, value_id: &str, change: IdChange) {
        ids_changed(&mut self.value_ids, value_id, change);
    }

    pub(crate) fn value_changed(&mut self, value_id: &str, old: Option<Scalar>, new: Option<Scalar>) {
        self.values
            .entry(value_id.to_string())
            .or_insert((old, None))
            .1 = new;
    }

    /// Whether any cell ended the transaction different from how it started.
    pub fn cells_touched(&self) -> bool {
        self.cells
            .values()
            .flat_map(|rows| rows.values())
            .flat_map(|cells| cells.values())
            .any(|(old, new)| old != new)
    }

    /// Whether any value ended the transaction different from how it started.
    pub fn values_touched(&self) -> bool {
        self.values.values().any(|(old, new)| old != new)
    }

    pub fn cell_change(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<Change> {
        let (old, new) = self.cells.get(table_id)?.get(row_id)?.get(cell_id)?;
        Some(Change {
            changed: old != new,
            old: old.clone(),
            new: new.clone(),
        })
    }

    pub fn value_change(&self, value_id: &str) -> Option<Change> {
        let (old, new) = self.values.get(value_id)?;
        Some(Change {
            changed: old != new,
            old: old.clone(),
            new: new.clone(),
        })
    }

    /// Collapse the log into the net diff of the transaction.
    pub fn changes(&self) -> Changes {
        let mut changes = Changes::default();

        for (table_id, rows) in &self.cells {
            if self.table_ids.get(table_id) == Some(&IdChange::Removed) {
                changes.tables.insert(table_id.clone(), None);
                continue;
            }
            let removed_rows = self.row_ids.get(table_id);
            let mut table = BTreeMap::new();
            for (row_id, cells) in rows {
                if removed_rows.and_then(|ids| ids.get(row_id)) == Some(&IdChange::Removed) {
                    table.insert(row_id.clone(), None);
                    continue;
                }
                let row: BTreeMap<CellId, Option<Scalar>> = cells
                    .iter()
                    .filter(|(_, (old, new))| old != new)
                    .map(|(cell_id, (_, new))| (cell_id.clone(), new.clone()))
                    .collect();
                if !row.is_empty() {
                    table.insert(row_id.clone(), Some(row));
                }
            }
            if !table.is_empty() {
                changes.tables.insert(table_id.clone(), Some(table));
            }
        }

        changes.values = self
            .values
            .iter()
            .filter(|(_, (old, new))| old != new)
            .map(|(value_id, (_, new))| (value_id.clone(), new.clone()))
            .collect();

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_id_changes_cancel() {
        let mut log = TransactionLog::default();
        log.cell_ids_changed("t", "r", "c", IdChange::Added);
        log.cell_ids_changed("t", "r", "c", IdChange::Removed);
        assert!(log.cell_ids["t"]["r"].is_empty());

        log.table_ids_changed("t", IdChange::Removed);
        log.table_ids_changed("t", IdChange::Removed);
        assert_eq!(log.table_ids["t"], IdChange::Removed);
    }

    #[test]
    fn test_first_old_value_is_kept() {
        let mut log = TransactionLog::default();
        log.cell_changed("t", "r", "c", None, Some("black".into()));
        log.cell_changed("t", "r", "c", Some("black".into()), Some("brown".into()));

        let change = log.cell_change("t", "r", "c").unwrap();
        assert!(change.changed);
        assert_eq!(change.old, None);
        assert_eq!(change.new, Some(Scalar::from("brown")));
    }

    #[test]
    fn test_returning_to_start_is_not_a_change() {
        let mut log = TransactionLog::default();
        log.value_changed("v", Some(1.into()), Some(2.into()));
        log.value_changed("v", Some(2.into()), Some(1.into()));
        assert!(!log.values_touched());
        assert!(!log.value_change("v").unwrap().changed);
        assert!(log.changes().is_empty());
    }

    #[test]
    fn test_changes_marks_deleted_rows_and_tables() {
        let mut log = TransactionLog::default();
        log.cell_changed("gone", "r", "c", Some(1.into()), None);
        log.table_ids_changed("gone", IdChange::Removed);
        log.cell_changed("t", "old", "c", Some(1.into()), None);
        log.row_ids_changed("t", "old", IdChange::Removed);
        log.cell_changed("t", "new", "c", None, Some(2.into()));

        let changes = log.changes();
        assert_eq!(changes.tables["gone"], None);
        let table = changes.tables["t"].as_ref().unwrap();
        assert_eq!(table["old"], None);
        assert_eq!(table["new"].as_ref().unwrap()["c"], Some(Scalar::Number(2.0)));
    }
}
