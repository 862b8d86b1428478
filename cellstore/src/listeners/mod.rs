mod pool;
mod tree;

pub use pool::{IdPool, LISTENER_ID_POOL_CAP};

use crate::store::Store;
use crate::types::{Id, RowId, Scalar, SortedRowIdsArgs};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tree::ListenerTree;

/// Handle returned when a listener is registered. Ids are recycled after
/// [`Store::del_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type StoreListener = dyn Fn(&Store);
pub type TableListener = dyn Fn(&Store, &str);
pub type RowListener = dyn Fn(&Store, &str, &str);
/// Receives `(store, table_id, row_id, cell_id, new_cell, old_cell)`.
pub type CellListener = dyn Fn(&Store, &str, &str, &str, Option<&Scalar>, Option<&Scalar>);
/// Receives `(store, value_id, new_value, old_value)`.
pub type ValueListener = dyn Fn(&Store, &str, Option<&Scalar>, Option<&Scalar>);
pub type SortedRowIdsListener = dyn Fn(&Store, &SortedRowIdsArgs, &[RowId]);
/// Receives the path the rejected candidates were written to, and the
/// candidates themselves.
pub type InvalidCellListener =
    dyn Fn(&Store, Option<&str>, Option<&str>, Option<&str>, &[serde_json::Value]);
pub type InvalidValueListener = dyn Fn(&Store, Option<&str>, &[serde_json::Value]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ListenerKind {
    Tables,
    TableIds,
    Table,
    RowIds,
    SortedRowIds,
    Row,
    CellIds,
    Cell,
    InvalidCell,
    Values,
    ValueIds,
    Value,
    InvalidValue,
    WillFinishTransaction,
    DidFinishTransaction,
}

impl ListenerKind {
    /// Number of id components in a registration path of this kind.
    pub fn depth(self) -> usize {
        match self {
            ListenerKind::Tables
            | ListenerKind::TableIds
            | ListenerKind::Values
            | ListenerKind::ValueIds
            | ListenerKind::WillFinishTransaction
            | ListenerKind::DidFinishTransaction => 0,
            ListenerKind::Table
            | ListenerKind::RowIds
            | ListenerKind::SortedRowIds
            | ListenerKind::Value
            | ListenerKind::InvalidValue => 1,
            ListenerKind::Row | ListenerKind::CellIds => 2,
            ListenerKind::Cell | ListenerKind::InvalidCell => 3,
        }
    }
}

/// A registered callback, tagged with the shape of arguments it takes.
#[derive(Clone)]
pub(crate) enum Callback {
    Tables(Rc<StoreListener>),
    TableIds(Rc<StoreListener>),
    Table(Rc<TableListener>),
    RowIds(Rc<TableListener>),
    SortedRowIds {
        args: SortedRowIdsArgs,
        last: Rc<RefCell<Vec<RowId>>>,
        listener: Rc<SortedRowIdsListener>,
    },
    Row(Rc<RowListener>),
    CellIds(Rc<RowListener>),
    Cell(Rc<CellListener>),
    InvalidCell(Rc<InvalidCellListener>),
    Values(Rc<StoreListener>),
    ValueIds(Rc<StoreListener>),
    Value(Rc<ValueListener>),
    InvalidValue(Rc<InvalidValueListener>),
    WillFinishTransaction(Rc<StoreListener>),
    DidFinishTransaction(Rc<StoreListener>),
}

impl Callback {
    pub fn kind(&self) -> ListenerKind {
        match self {
            Callback::Tables(_) => ListenerKind::Tables,
            Callback::TableIds(_) => ListenerKind::TableIds,
            Callback::Table(_) => ListenerKind::Table,
            Callback::RowIds(_) => ListenerKind::RowIds,
            Callback::SortedRowIds { .. } => ListenerKind::SortedRowIds,
            Callback::Row(_) => ListenerKind::Row,
            Callback::CellIds(_) => ListenerKind::CellIds,
            Callback::Cell(_) => ListenerKind::Cell,
            Callback::InvalidCell(_) => ListenerKind::InvalidCell,
            Callback::Values(_) => ListenerKind::Values,
            Callback::ValueIds(_) => ListenerKind::ValueIds,
            Callback::Value(_) => ListenerKind::Value,
            Callback::InvalidValue(_) => ListenerKind::InvalidValue,
            Callback::WillFinishTransaction(_) => ListenerKind::WillFinishTransaction,
            Callback::DidFinishTransaction(_) => ListenerKind::DidFinishTransaction,
        }
    }
}

pub(crate) struct Registration {
    pub callback: Callback,
    pub path: Vec<Option<Id>>,
    pub mutator: bool,
    serial: u64,
}

/// A callback picked for dispatch, tagged with the registration it came from.
pub(crate) struct Matched {
    pub id: ListenerId,
    pub serial: u64,
    pub callback: Callback,
}

/// Every listener registered on one store, indexed per kind and dispatch
/// pass by their wildcard path.
#[derive(Default)]
pub(crate) struct Listeners {
    pool: IdPool,
    registrations: HashMap<ListenerId, Registration>,
    trees: HashMap<(ListenerKind, bool), ListenerTree>,
    next_serial: u64,
}

impl Listeners {
    pub fn add(&mut self, callback: Callback, path: Vec<Option<Id>>, mutator: bool) -> ListenerId {
        let id = ListenerId(self.pool.next_id(true));
        let kind = callback.kind();
        self.trees
            .entry((kind, mutator))
            .or_insert_with(|| ListenerTree::new(kind.depth()))
            .add(&path, id);
        let serial = self.next_serial;
        self.next_serial += 1;
        self.registrations.insert(
            id,
            Registration {
                callback,
                path,
                mutator,
                serial,
            },
        );
        id
    }

    /// Unregister a listener. Returns false for an unknown id.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let Some(registration) = self.registrations.remove(&id) else {
            return false;
        };
        let key = (registration.callback.kind(), registration.mutator);
        if let Some(tree) = self.trees.get_mut(&key) {
            tree.remove(&registration.path, id);
            if tree.is_empty() {
                self.trees.remove(&key);
            }
        }
        self.pool.release(id.0);
        true
    }

    pub fn get(&self, id: ListenerId) -> Option<&Registration> {
        self.registrations.get(&id)
    }

    pub fn has(&self, kind: ListenerKind, mutator: bool) -> bool {
        self.trees.contains_key(&(kind, mutator))
    }

    /// Callbacks of `kind` in the given pass whose path matches `path`, in
    /// dispatch order.
    pub fn matching(&self, kind: ListenerKind, mutator: bool, path: &[Option<&str>]) -> Vec<Matched> {
        let Some(tree) = self.trees.get(&(kind, mutator)) else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        tree.collect(path, &mut ids);
        ids.into_iter()
            .filter_map(|id| {
                self.registrations.get(&id).map(|registration| Matched {
                    id,
                    serial: registration.serial,
                    callback: registration.callback.clone(),
                })
            })
            .collect()
    }

    /// Whether a matched callback is still registered. False once it has been
    /// removed, even if its id was handed out again since.
    pub fn is_live(&self, matched: &Matched) -> bool {
        self.registrations
            .get(&matched.id)
            .is_some_and(|registration| registration.serial == matched.serial)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }
}
