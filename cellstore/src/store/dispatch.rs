use super::{RollbackFn, Store, Writer};
use crate::listeners::{Callback, ListenerKind};
use crate::transaction::TransactionLog;

/// Finish the outermost transaction: roll it back (schemas included) if asked
/// to, otherwise call mutator listeners, then will-finish listeners, then
/// non-mutator listeners, then did-finish listeners, and clear the log.
pub(super) fn commit(store: &Store, rollback: Option<RollbackFn<'_>>) {
    if let Some(rollback) = rollback {
        let log = store.get_transaction_log();
        if rollback(store, &log) {
            log::debug!("Rolling back transaction");
            let checkpoint = store.inner.schema_checkpoint.borrow_mut().take();
            {
                let mut data = store.inner.data.borrow_mut();
                if let Some((tables_schema, values_schema)) = checkpoint {
                    data.validator.set_tables_schema(tables_schema);
                    data.validator.set_values_schema(values_schema);
                }
                let mut current = store.inner.log.borrow_mut();
                Writer::new(&mut data, &mut current).revert(&log);
            }
            store.inner.log.borrow_mut().clear();
            return;
        }
    }

    let log = store.get_transaction_log();
    if !log.is_empty() {
        call_changes(store, &log, true);
    }
    call_transaction_listeners(store, ListenerKind::WillFinishTransaction);

    store.inner.non_mutator_pass.set(true);
    let log = store.get_transaction_log();
    if !log.is_empty() {
        call_changes(store, &log, false);
    }
    call_transaction_listeners(store, ListenerKind::DidFinishTransaction);

    store.inner.log.borrow_mut().clear();
    *store.inner.schema_checkpoint.borrow_mut() = None;
    store.inner.non_mutator_pass.set(false);
}

/// Callbacks matching `path`, skipping any whose listener is deleted by an
/// earlier callback in the same batch.
fn matching<'s>(
    store: &'s Store,
    kind: ListenerKind,
    mutator: bool,
    path: &[Option<&str>],
) -> impl Iterator<Item = Callback> + 's {
    let matched = store.inner.listeners.borrow().matching(kind, mutator, path);
    matched.into_iter().filter_map(move |matched| {
        store
            .inner
            .listeners
            .borrow()
            .is_live(&matched)
            .then_some(matched.callback)
    })
}

fn call_transaction_listeners(store: &Store, kind: ListenerKind) {
    for callback in matching(store, kind, false, &[]) {
        match callback {
            Callback::WillFinishTransaction(listener) | Callback::DidFinishTransaction(listener) => {
                listener(store)
            }
            _ => {}
        }
    }
}

/// One dispatch pass over a snapshot of the log.
fn call_changes(store: &Store, log: &TransactionLog, mutator: bool) {
    call_table_changes(store, log, mutator);
    call_value_changes(store, log, mutator);
}

fn call_table_changes(store: &Store, log: &TransactionLog, mutator: bool) {
    for ((table_id, row_id, cell_id), invalid) in &log.invalid_cells {
        let path = [table_id.as_deref(), row_id.as_deref(), cell_id.as_deref()];
        for callback in matching(store, ListenerKind::InvalidCell, mutator, &path) {
            if let Callback::InvalidCell(listener) = callback {
                listener(store, path[0], path[1], path[2], invalid);
            }
        }
    }

    if !log.table_ids.is_empty() {
        for callback in matching(store, ListenerKind::TableIds, mutator, &[]) {
            if let Callback::TableIds(listener) = callback {
                listener(store);
            }
        }
    }

    for (table_id, row_ids) in &log.row_ids {
        if row_ids.is_empty() {
            continue;
        }
        for callback in matching(store, ListenerKind::RowIds, mutator, &[Some(table_id.as_str())]) {
            if let Callback::RowIds(listener) = callback {
                listener(store, table_id);
            }
        }
    }

    let has_sorted = store.inner.listeners.borrow().has(ListenerKind::SortedRowIds, mutator);
    if has_sorted {
        for table_id in log.cells.keys() {
            for callback in matching(store, ListenerKind::SortedRowIds, mutator, &[Some(table_id.as_str())]) {
                call_sorted_row_ids(store, callback, false);
            }
        }
    }

    for (table_id, rows) in &log.cell_ids {
        for (row_id, cell_ids) in rows {
            if cell_ids.is_empty() {
                continue;
            }
            let path = [Some(table_id.as_str()), Some(row_id.as_str())];
            for callback in matching(store, ListenerKind::CellIds, mutator, &path) {
                if let Callback::CellIds(listener) = callback {
                    listener(store, table_id, row_id);
                }
            }
        }
    }

    let mut tables_changed = false;
    for (table_id, rows) in &log.cells {
        let mut table_changed = false;
        for (row_id, cells) in rows {
            let mut row_changed = false;
            for (cell_id, (old, new)) in cells {
                if old == new {
                    continue;
                }
                row_changed = true;
                let path = [Some(table_id.as_str()), Some(row_id.as_str()), Some(cell_id.as_str())];
                for callback in matching(store, ListenerKind::Cell, mutator, &path) {
                    if let Callback::Cell(listener) = callback {
                        listener(store, table_id, row_id, cell_id, new.as_ref(), old.as_ref());
                    }
                }
            }
            if row_changed {
                table_changed = true;
                let path = [Some(table_id.as_str()), Some(row_id.as_str())];
                for callback in matching(store, ListenerKind::Row, mutator, &path) {
                    if let Callback::Row(listener) = callback {
                        listener(store, table_id, row_id);
                    }
                }
            }
        }
        if table_changed {
            tables_changed = true;
            for callback in matching(store, ListenerKind::Table, mutator, &[Some(table_id.as_str())]) {
                if let Callback::Table(listener) = callback {
                    listener(store, table_id);
                }
            }
        }
    }

    if tables_changed {
        for callback in matching(store, ListenerKind::Tables, mutator, &[]) {
            if let Callback::Tables(listener) = callback {
                listener(store);
            }
        }
    }
}

fn call_value_changes(store: &Store, log: &TransactionLog, mutator: bool) {
    for (value_id, invalid) in &log.invalid_values {
        let path = [value_id.as_deref()];
        for callback in matching(store, ListenerKind::InvalidValue, mutator, &path) {
            if let Callback::InvalidValue(listener) = callback {
                listener(store, path[0], invalid);
            }
        }
    }

    if !log.value_ids.is_empty() {
        for callback in matching(store, ListenerKind::ValueIds, mutator, &[]) {
            if let Callback::ValueIds(listener) = callback {
                listener(store);
            }
        }
    }

    let mut values_changed = false;
    for (value_id, (old, new)) in &log.values {
        if old == new {
            continue;
        }
        values_changed = true;
        for callback in matching(store, ListenerKind::Value, mutator, &[Some(value_id.as_str())]) {
            if let Callback::Value(listener) = callback {
                listener(store, value_id, new.as_ref(), old.as_ref());
            }
        }
    }

    if values_changed {
        for callback in matching(store, ListenerKind::Values, mutator, &[]) {
            if let Callback::Values(listener) = callback {
                listener(store);
            }
        }
    }
}

/// Recompute a sorted-row-ids registration and call it if the result differs
/// from the one it last saw, or unconditionally when `force` is set.
pub(super) fn call_sorted_row_ids(store: &Store, callback: Callback, force: bool) {
    let Callback::SortedRowIds {
        args,
        last,
        listener,
    } = callback
    else {
        return;
    };
    let sorted = store.get_sorted_row_ids(&args);
    if !force && *last.borrow() == sorted {
        return;
    }
    *last.borrow_mut() = sorted.clone();
    listener(store, &args, &sorted);
}
