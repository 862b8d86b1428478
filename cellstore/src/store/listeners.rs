use super::{dispatch, Store};
use crate::listeners::{Callback, ListenerId};
use crate::types::{Id, RowId, Scalar, SortedRowIdsArgs};
use std::cell::RefCell;
use std::rc::Rc;

fn path(ids: &[Option<&str>]) -> Vec<Option<Id>> {
    ids.iter().map(|id| id.map(str::to_string)).collect()
}

/// Concrete ids to fan a manual call out over: the id itself, or every
/// current id when it is a wildcard.
fn ids_or(id: &Option<Id>, current: impl FnOnce() -> Vec<Id>) -> Vec<Id> {
    match id {
        Some(id) => vec![id.clone()],
        None => current(),
    }
}

/// Listener registration. Every `add_*` method takes concrete ids or `None`
/// as a wildcard, and a `mutator` flag: mutator listeners run first and may
/// write to the store, the rest run afterwards and their writes are ignored.
impl Store {
    fn add_listener(&self, callback: Callback, ids: &[Option<&str>], mutator: bool) -> ListenerId {
        self.inner
            .listeners
            .borrow_mut()
            .add(callback, path(ids), mutator)
    }

    /// Called when any cell in any table changes.
    pub fn add_tables_listener(&self, listener: impl Fn(&Store) + 'static, mutator: bool) -> ListenerId {
        self.add_listener(Callback::Tables(Rc::new(listener)), &[], mutator)
    }

    /// Called when a table is added or removed.
    pub fn add_table_ids_listener(&self, listener: impl Fn(&Store) + 'static, mutator: bool) -> ListenerId {
        self.add_listener(Callback::TableIds(Rc::new(listener)), &[], mutator)
    }

    pub fn add_table_listener(
        &self,
        table_id: Option<&str>,
        listener: impl Fn(&Store, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(Callback::Table(Rc::new(listener)), &[table_id], mutator)
    }

    /// Called when a row is added to or removed from a table.
    pub fn add_row_ids_listener(
        &self,
        table_id: Option<&str>,
        listener: impl Fn(&Store, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(Callback::RowIds(Rc::new(listener)), &[table_id], mutator)
    }

    /// Called with the new sorted slice whenever it differs from the slice
    /// at registration or at the previous call.
    pub fn add_sorted_row_ids_listener(
        &self,
        args: SortedRowIdsArgs,
        listener: impl Fn(&Store, &SortedRowIdsArgs, &[RowId]) + 'static,
        mutator: bool,
    ) -> ListenerId {
        let last = Rc::new(RefCell::new(self.get_sorted_row_ids(&args)));
        let table_id = args.table_id.clone();
        let callback = Callback::SortedRowIds {
            args,
            last,
            listener: Rc::new(listener),
        };
        self.add_listener(callback, &[Some(table_id.as_str())], mutator)
    }

    pub fn add_row_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        listener: impl Fn(&Store, &str, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(Callback::Row(Rc::new(listener)), &[table_id, row_id], mutator)
    }

    /// Called when a cell is added to or removed from a row.
    pub fn add_cell_ids_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        listener: impl Fn(&Store, &str, &str) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(Callback::CellIds(Rc::new(listener)), &[table_id, row_id], mutator)
    }

    /// Called with `(store, table_id, row_id, cell_id, new_cell, old_cell)`
    /// once per transaction in which the cell ends up different.
    pub fn add_cell_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        listener: impl Fn(&Store, &str, &str, &str, Option<&Scalar>, Option<&Scalar>) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            Callback::Cell(Rc::new(listener)),
            &[table_id, row_id, cell_id],
            mutator,
        )
    }

    /// Called with the candidates rejected for a cell path. Components are
    /// `None` when the write was rejected above that level.
    pub fn add_invalid_cell_listener(
        &self,
        table_id: Option<&str>,
        row_id: Option<&str>,
        cell_id: Option<&str>,
        listener: impl Fn(&Store, Option<&str>, Option<&str>, Option<&str>, &[serde_json::Value]) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(
            Callback::InvalidCell(Rc::new(listener)),
            &[table_id, row_id, cell_id],
            mutator,
        )
    }

    pub fn add_values_listener(&self, listener: impl Fn(&Store) + 'static, mutator: bool) -> ListenerId {
        self.add_listener(Callback::Values(Rc::new(listener)), &[], mutator)
    }

    pub fn add_value_ids_listener(&self, listener: impl Fn(&Store) + 'static, mutator: bool) -> ListenerId {
        self.add_listener(Callback::ValueIds(Rc::new(listener)), &[], mutator)
    }

    /// Called with `(store, value_id, new_value, old_value)`.
    pub fn add_value_listener(
        &self,
        value_id: Option<&str>,
        listener: impl Fn(&Store, &str, Option<&Scalar>, Option<&Scalar>) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(Callback::Value(Rc::new(listener)), &[value_id], mutator)
    }

    pub fn add_invalid_value_listener(
        &self,
        value_id: Option<&str>,
        listener: impl Fn(&Store, Option<&str>, &[serde_json::Value]) + 'static,
        mutator: bool,
    ) -> ListenerId {
        self.add_listener(Callback::InvalidValue(Rc::new(listener)), &[value_id], mutator)
    }

    /// Called after mutator listeners have run. Writes are still allowed.
    pub fn add_will_finish_transaction_listener(&self, listener: impl Fn(&Store) + 'static) -> ListenerId {
        self.add_listener(Callback::WillFinishTransaction(Rc::new(listener)), &[], false)
    }

    /// Called once every listener has run, just before the transaction log
    /// is cleared.
    pub fn add_did_finish_transaction_listener(&self, listener: impl Fn(&Store) + 'static) -> ListenerId {
        self.add_listener(Callback::DidFinishTransaction(Rc::new(listener)), &[], false)
    }

    /// Number of listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    pub fn del_listener(&self, id: ListenerId) -> &Self {
        self.inner.listeners.borrow_mut().remove(id);
        self
    }

    /// Call a listener now, as if what it listens to had changed. Wildcard
    /// ids are expanded to every id currently in the store, so the listener
    /// is called once per matching table, row, cell or value. Cell and value
    /// listeners receive the current contents as both new and old.
    pub fn call_listener(&self, id: ListenerId) -> &Self {
        let registration = self
            .inner
            .listeners
            .borrow()
            .get(id)
            .map(|registration| (registration.callback.clone(), registration.path.clone()));
        let Some((callback, path)) = registration else {
            return self;
        };
        let at = |depth: usize| path.get(depth).cloned().flatten();

        match callback {
            Callback::Tables(listener)
            | Callback::TableIds(listener)
            | Callback::Values(listener)
            | Callback::ValueIds(listener)
            | Callback::WillFinishTransaction(listener)
            | Callback::DidFinishTransaction(listener) => listener(self),
            Callback::Table(listener) | Callback::RowIds(listener) => {
                for table_id in ids_or(&at(0), || self.get_table_ids()) {
                    listener(self, &table_id);
                }
            }
            callback @ Callback::SortedRowIds { .. } => dispatch::call_sorted_row_ids(self, callback, true),
            Callback::Row(listener) | Callback::CellIds(listener) => {
                for table_id in ids_or(&at(0), || self.get_table_ids()) {
                    for row_id in ids_or(&at(1), || self.get_row_ids(&table_id)) {
                        listener(self, &table_id, &row_id);
                    }
                }
            }
            Callback::Cell(listener) => {
                for table_id in ids_or(&at(0), || self.get_table_ids()) {
                    for row_id in ids_or(&at(1), || self.get_row_ids(&table_id)) {
                        for cell_id in ids_or(&at(2), || self.get_cell_ids(&table_id, &row_id)) {
                            let cell = self.get_cell(&table_id, &row_id, &cell_id);
                            listener(self, &table_id, &row_id, &cell_id, cell.as_ref(), cell.as_ref());
                        }
                    }
                }
            }
            Callback::Value(listener) => {
                for value_id in ids_or(&at(0), || self.get_value_ids()) {
                    let value = self.get_value(&value_id);
                    listener(self, &value_id, value.as_ref(), value.as_ref());
                }
            }
            Callback::InvalidCell(listener) => {
                listener(self, at(0).as_deref(), at(1).as_deref(), at(2).as_deref(), &[])
            }
            Callback::InvalidValue(listener) => listener(self, at(0).as_deref(), &[]),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, Rc<RefCell<Vec<String>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        (calls.clone(), calls)
    }

    #[test]
    fn test_call_listener_fans_out_wildcards() {
        let store = Store::new();
        store.set_tables(json!({"t": {"r1": {"a": 1, "b": 2}, "r2": {"a": 3}}}));
        let (calls, seen) = recorder();
        let id = store.add_cell_listener(
            Some("t"),
            None,
            Some("a"),
            move |_, table_id, row_id, cell_id, new, old| {
                assert_eq!(new, old);
                calls.borrow_mut().push(format!("{table_id}/{row_id}/{cell_id}"));
            },
            false,
        );

        store.call_listener(id);
        assert_eq!(*seen.borrow(), vec!["t/r1/a", "t/r2/a"]);
    }

    #[test]
    fn test_call_listener_with_concrete_missing_ids() {
        let store = Store::new();
        let (calls, seen) = recorder();
        let id = store.add_row_listener(
            Some("t"),
            Some("r"),
            move |_, table_id, row_id| calls.borrow_mut().push(format!("{table_id}/{row_id}")),
            false,
        );
        store.call_listener(id);
        assert_eq!(*seen.borrow(), vec!["t/r"]);
    }

    #[test]
    fn test_del_listener_stops_calls() {
        let store = Store::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let id = store.add_tables_listener(move |_| counter.set(counter.get() + 1), false);

        store.set_cell("t", "r", "c", 1);
        store.del_listener(id);
        store.set_cell("t", "r", "c", 2);
        assert_eq!(count.get(), 1);
        assert_eq!(store.listener_count(), 0);

        store.call_listener(id);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_sorted_row_ids_listener_fires_on_order_change() {
        let store = Store::new();
        store.set_table("t", json!({"a": {"n": 1}, "b": {"n": 2}}));
        let (calls, seen) = recorder();
        store.add_sorted_row_ids_listener(
            SortedRowIdsArgs::new("t").by("n"),
            move |_, _, row_ids| calls.borrow_mut().push(row_ids.join(",")),
            false,
        );

        store.set_cell("t", "a", "other", "x");
        store.set_cell("t", "a", "n", 3);
        store.set_cell("t", "a", "n", 4);
        assert_eq!(*seen.borrow(), vec!["b,a"]);
    }
}
