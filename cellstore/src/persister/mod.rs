mod file;
mod sqlite;

pub use file::FileStorage;
pub use sqlite::{SqliteStorage, DEFAULT_POLL_INTERVAL};

use crate::error::Result;
use crate::listeners::ListenerId;
use crate::store::Store;
use crate::transaction::Changes;
use crate::types::Content;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::mpsc;

/// An external medium a store can be loaded from and saved to.
pub trait Storage {
    /// Read the stored `(tables, values)`, or `None` if nothing is stored yet.
    fn load(&mut self) -> Result<Option<(serde_json::Value, serde_json::Value)>>;

    /// Write the store's content. `changes` is the net diff of the
    /// transaction that triggered the save, when there is one; storages that
    /// can apply it incrementally should prefer it over `content`.
    fn save(&mut self, content: &Content, changes: Option<&Changes>) -> Result<()>;

    /// Start calling `notify` whenever the medium is changed externally.
    fn watch(&mut self, notify: Box<dyn Fn() + Send>) -> Result<()>;

    fn unwatch(&mut self) -> Result<()>;
}

/// What a persister is doing. Loads and saves never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Loading,
    Saving,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersisterStats {
    pub loads: u64,
    pub saves: u64,
}

struct PersisterInner<S: Storage> {
    store: Store,
    storage: RefCell<S>,
    status: Cell<Status>,
    stats: Cell<PersisterStats>,
    auto_save: Cell<Option<ListenerId>>,
    auto_load: RefCell<Option<mpsc::Receiver<()>>>,
}

impl<S: Storage> Drop for PersisterInner<S> {
    fn drop(&mut self) {
        if let Some(id) = self.auto_save.take() {
            self.store.del_listener(id);
        }
    }
}

/// Keeps a store and a [`Storage`] in sync.
///
/// Auto-saving hooks a did-finish-transaction listener on the store; auto-
/// loading asks the storage to watch for external changes, which are picked
/// up on the store's thread by [`Persister::poll_auto_load`].
pub struct Persister<S: Storage + 'static> {
    inner: Rc<PersisterInner<S>>,
}

impl<S: Storage + 'static> Persister<S> {
    pub fn new(store: &Store, storage: S) -> Self {
        Persister {
            inner: Rc::new(PersisterInner {
                store: store.clone(),
                storage: RefCell::new(storage),
                status: Cell::new(Status::Idle),
                stats: Cell::new(PersisterStats::default()),
                auto_save: Cell::new(None),
                auto_load: RefCell::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    pub fn stats(&self) -> PersisterStats {
        self.inner.stats.get()
    }

    /// Run `f` with the status set, unless another load or save is already
    /// running, in which case `f` is skipped and `None` returned.
    fn exclusive<R>(&self, status: Status, f: impl FnOnce() -> Result<R>) -> Result<Option<R>> {
        if self.inner.status.get() != Status::Idle {
            log::debug!("Skipping {status:?}: persister is {:?}", self.inner.status.get());
            return Ok(None);
        }
        self.inner.status.set(status);
        let result = f();
        self.inner.status.set(Status::Idle);
        result.map(Some)
    }

    /// Replace the store's content with what the storage holds. Returns
    /// whether anything was found.
    pub fn load(&self) -> Result<bool> {
        let loaded = self.exclusive(Status::Loading, || {
            let content = self.inner.storage.borrow_mut().load()?;
            let found = content.is_some();
            if let Some(content) = content {
                self.inner.store.set_content(content);
            }
            let mut stats = self.inner.stats.get();
            stats.loads += 1;
            self.inner.stats.set(stats);
            Ok(found)
        })?;
        Ok(loaded.unwrap_or(false))
    }

    /// Load, or if the storage is empty, set `initial` on the store and save
    /// it.
    pub fn load_or_init(&self, initial: (serde_json::Value, serde_json::Value)) -> Result<()> {
        if !self.load()? {
            self.inner.store.set_content(initial);
            self.save()?;
        }
        Ok(())
    }

    /// Write the store's full content to the storage.
    pub fn save(&self) -> Result<()> {
        self.save_changes(None)
    }

    fn save_changes(&self, changes: Option<&Changes>) -> Result<()> {
        self.exclusive(Status::Saving, || {
            let content = self.inner.store.get_content();
            self.inner.storage.borrow_mut().save(&content, changes)?;
            let mut stats = self.inner.stats.get();
            stats.saves += 1;
            self.inner.stats.set(stats);
            Ok(())
        })?;
        Ok(())
    }

    /// Save now, and then after every transaction that changes the store.
    pub fn start_auto_save(&self) -> Result<()> {
        if self.inner.auto_save.get().is_some() {
            return Ok(());
        }
        self.save()?;

        let weak: Weak<PersisterInner<S>> = Rc::downgrade(&self.inner);
        let id = self
            .inner
            .store
            .add_did_finish_transaction_listener(move |store| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let changes = store.get_transaction_changes();
                if changes.is_empty() {
                    return;
                }
                let persister = Persister { inner };
                if let Err(e) = persister.save_changes(Some(&changes)) {
                    log::warn!("Auto-save failed: {e}");
                }
            });
        self.inner.auto_save.set(Some(id));
        Ok(())
    }

    pub fn stop_auto_save(&self) {
        if let Some(id) = self.inner.auto_save.take() {
            self.inner.store.del_listener(id);
        }
    }

    pub fn is_auto_saving(&self) -> bool {
        self.inner.auto_save.get().is_some()
    }

    /// Load now (initialising the storage from `initial` if it is empty),
    /// then watch the storage for external changes. Changes are applied by
    /// [`Persister::poll_auto_load`].
    pub fn start_auto_load(&self, initial: (serde_json::Value, serde_json::Value)) -> Result<()> {
        if self.is_auto_loading() {
            return Ok(());
        }
        self.load_or_init(initial)?;

        let (tx, rx) = mpsc::channel();
        self.inner.storage.borrow_mut().watch(Box::new(move || {
            let _ = tx.send(());
        }))?;
        *self.inner.auto_load.borrow_mut() = Some(rx);
        Ok(())
    }

    /// Reload if the storage reported a change since the last poll. Returns
    /// whether a reload happened.
    pub fn poll_auto_load(&self) -> Result<bool> {
        let changed = match self.inner.auto_load.borrow().as_ref() {
            Some(rx) => rx.try_iter().count() > 0,
            None => false,
        };
        if changed {
            self.load()?;
        }
        Ok(changed)
    }

    pub fn stop_auto_load(&self) -> Result<()> {
        if self.inner.auto_load.borrow_mut().take().is_some() {
            self.inner.storage.borrow_mut().unwatch()?;
        }
        Ok(())
    }

    pub fn is_auto_loading(&self) -> bool {
        self.inner.auto_load.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// In-memory storage recording what it was asked to do.
    #[derive(Default, Clone)]
    struct MemoryStorage {
        stored: Arc<Mutex<Option<(serde_json::Value, serde_json::Value)>>>,
        saved_changes: Arc<Mutex<Vec<Option<Changes>>>>,
        notify: Arc<Mutex<Option<Box<dyn Fn() + Send>>>>,
    }

    impl MemoryStorage {
        fn external_write(&self, content: (serde_json::Value, serde_json::Value)) {
            *self.stored.lock().unwrap() = Some(content);
            if let Some(notify) = self.notify.lock().unwrap().as_ref() {
                notify();
            }
        }
    }

    impl Storage for MemoryStorage {
        fn load(&mut self) -> Result<Option<(serde_json::Value, serde_json::Value)>> {
            Ok(self.stored.lock().unwrap().clone())
        }

        fn save(&mut self, content: &Content, changes: Option<&Changes>) -> Result<()> {
            let json = crate::serialization::content_to_json(content);
            *self.stored.lock().unwrap() = Some((json[0].clone(), json[1].clone()));
            self.saved_changes.lock().unwrap().push(changes.cloned());
            Ok(())
        }

        fn watch(&mut self, notify: Box<dyn Fn() + Send>) -> Result<()> {
            *self.notify.lock().unwrap() = Some(notify);
            Ok(())
        }

        fn unwatch(&mut self) -> Result<()> {
            *self.notify.lock().unwrap() = None;
            Ok(())
        }
    }

    #[test]
    fn test_load_or_init_initialises_empty_storage() {
        let storage = MemoryStorage::default();
        let store = Store::new();
        let persister = Persister::new(&store, storage.clone());

        persister
            .load_or_init((json!({"t": {"r": {"c": 1}}}), json!({})))
            .unwrap();
        assert!(store.has_table("t"));
        assert_eq!(storage.stored.lock().unwrap().as_ref().unwrap().0, json!({"t": {"r": {"c": 1}}}));
        assert_eq!(persister.stats(), PersisterStats { loads: 1, saves: 1 });
    }

    #[test]
    fn test_auto_save_passes_transaction_changes() {
        let storage = MemoryStorage::default();
        let store = Store::new();
        let persister = Persister::new(&store, storage.clone());
        persister.start_auto_save().unwrap();

        store.set_cell("t", "r", "c", 1);
        store.set_cell("t", "r", "c", 1);
        store.set_value("v", "x");

        let saved = storage.saved_changes.lock().unwrap();
        assert_eq!(saved.len(), 3);
        assert!(saved[0].is_none());
        assert!(saved[1].as_ref().unwrap().tables.contains_key("t"));
        assert!(saved[2].as_ref().unwrap().values.contains_key("v"));
        assert_eq!(persister.status(), Status::Idle);
    }

    #[test]
    fn test_loading_does_not_trigger_auto_save() {
        let storage = MemoryStorage::default();
        *storage.stored.lock().unwrap() = Some((json!({"t": {"r": {"c": 1}}}), json!({})));
        let store = Store::new();
        let persister = Persister::new(&store, storage.clone());
        persister.start_auto_save().unwrap();
        let saves = persister.stats().saves;

        storage.external_write((json!({"t": {"r": {"c": 2}}}), json!({})));
        persister.load().unwrap();

        assert_eq!(store.get_cell("t", "r", "c"), Some(2.into()));
        assert_eq!(persister.stats().saves, saves);
    }

    #[test]
    fn test_auto_load_picks_up_external_changes() {
        let storage = MemoryStorage::default();
        let store = Store::new();
        let persister = Persister::new(&store, storage.clone());
        persister.start_auto_load((json!({}), json!({"open": true}))).unwrap();
        assert_eq!(store.get_value("open"), Some(true.into()));
        assert!(!persister.poll_auto_load().unwrap());

        storage.external_write((json!({}), json!({"open": false})));
        assert!(persister.poll_auto_load().unwrap());
        assert_eq!(store.get_value("open"), Some(false.into()));

        persister.stop_auto_load().unwrap();
        assert!(storage.notify.lock().unwrap().is_none());
    }

    #[test]
    fn test_dropping_persister_removes_auto_save_listener() {
        let storage = MemoryStorage::default();
        let store = Store::new();
        {
            let persister = Persister::new(&store, storage.clone());
            persister.start_auto_save().unwrap();
        }
        store.set_cell("t", "r", "c", 1);
        assert_eq!(storage.saved_changes.lock().unwrap().len(), 1);
    }
}
