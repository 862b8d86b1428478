use super::Storage;
use crate::error::Result;
use crate::serialization::{content_to_json, parse_content};
use crate::transaction::Changes;
use crate::types::Content;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Stores content as a `[tables, values]` JSON file.
pub struct FileStorage {
    path: PathBuf,
    watcher: Option<FileWatcher>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStorage {
            path: path.into(),
            watcher: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn load(&mut self) -> Result<Option<(serde_json::Value, serde_json::Value)>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&self.path)?;
        if json.trim().is_empty() {
            return Ok(None);
        }
        parse_content(&json).map(Some)
    }

    fn save(&mut self, content: &Content, _changes: Option<&Changes>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content_to_json(content).to_string())?;
        Ok(())
    }

    fn watch(&mut self, notify: Box<dyn Fn() + Send>) -> Result<()> {
        self.watcher = Some(FileWatcher::start(&self.path, notify)?);
        Ok(())
    }

    fn unwatch(&mut self) -> Result<()> {
        self.watcher = None;
        Ok(())
    }
}

/// Watches one file through its parent directory and calls `notify` once per
/// burst of changes to it.
struct FileWatcher {
    _watcher: RecommendedWatcher,
    _thread: std::thread::JoinHandle<()>,
}

impl FileWatcher {
    fn start(path: &Path, notify: Box<dyn Fn() + Send>) -> Result<Self> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name: Option<OsString> = path.file_name().map(|name| name.to_os_string());
        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let thread = std::thread::spawn(move || {
            let mut pending = false;
            let mut last_event = Instant::now();

            loop {
                match event_rx.recv_timeout(DEBOUNCE) {
                    Ok(Ok(event)) => {
                        let relevant = matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) && event
                            .paths
                            .iter()
                            .any(|changed| changed.file_name().map(|n| n.to_os_string()) == file_name);
                        if relevant {
                            pending = true;
                            last_event = Instant::now();
                        }
                    }
                    Ok(Err(e)) => {
                        log::warn!("File watcher error: {e}");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if pending && last_event.elapsed() >= DEBOUNCE {
                            pending = false;
                            notify();
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(FileWatcher {
            _watcher: watcher,
            _thread: thread,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;
    use serde_json::json;
    use std::sync::mpsc::RecvTimeoutError;

    #[test]
    fn test_missing_file_loads_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut storage = FileStorage::new(tmp.path().join("store.json"));
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut storage = FileStorage::new(tmp.path().join("nested").join("store.json"));
        let mut content = Content::default();
        content
            .0
            .entry("pets".into())
            .or_default()
            .entry("fido".into())
            .or_default()
            .insert("legs".into(), Scalar::from(4));
        content.1.insert("open".into(), Scalar::from(true));

        storage.save(&content, None).unwrap();
        let (tables, values) = storage.load().unwrap().unwrap();
        assert_eq!(tables, json!({"pets": {"fido": {"legs": 4}}}));
        assert_eq!(values, json!({"open": true}));
    }

    #[test]
    fn test_load_legacy_and_malformed_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("store.json");
        let mut storage = FileStorage::new(&path);

        std::fs::write(&path, r#"{"t": {"r": {"c": "x"}}}"#).unwrap();
        let (tables, values) = storage.load().unwrap().unwrap();
        assert_eq!(tables["t"]["r"]["c"], "x");
        assert_eq!(values, json!({}));

        std::fs::write(&path, "not json").unwrap();
        assert!(storage.load().is_err());
    }

    #[test]
    fn test_watch_reports_external_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("store.json");
        std::fs::write(&path, "[{},{}]").unwrap();

        let mut storage = FileStorage::new(&path);
        let (tx, rx) = mpsc::channel();
        storage
            .watch(Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(&path, r#"[{},{"open":true}]"#).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        while rx.recv_timeout(Duration::from_millis(300)).is_ok() {}

        storage.unwatch().unwrap();
        std::fs::write(&path, r#"[{},{"open":false}]"#).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(500)),
            Err(RecvTimeoutError::Disconnected) | Err(RecvTimeoutError::Timeout)
        ));
    }
}
