use super::{Observer, PreferenceStore, Result, Transaction, ValueKind, validate_key};
use crate::error::ErrorCode;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// File-backed preference store: one regular file per key under `root`,
/// the key path mapped directly onto a relative file path (spec §6
/// "Preference-store layout"). A sibling `<root>_tmp` directory implements
/// the atomic multi-key transaction described in spec §4.1.
///
/// Type pinning (spec §4.1: "type is pinned on first set") is enforced
/// in-memory for the lifetime of this `FileStore` instance. The on-disk
/// format is plain text with no type tag, so pinning cannot be recovered
/// across a process restart; a fresh process re-pins on first access. This
/// mirrors how a plain key-per-file store behaves in practice and is
/// recorded as a deliberate choice in DESIGN.md.
pub struct FileStore {
    root: PathBuf,
    observers: Mutex<HashMap<String, Vec<Arc<dyn Observer>>>>,
    type_cache: Mutex<HashMap<String, ValueKind>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        Self::recover(&root)?;
        fs::create_dir_all(&root).map_err(io_err)?;
        Ok(Self {
            root,
            observers: Mutex::new(HashMap::new()),
            type_cache: Mutex::new(HashMap::new()),
        })
    }

    fn tmp_root(root: &Path) -> PathBuf {
        let mut name = root
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push("_tmp");
        match root.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Resolves the interrupted-commit / interrupted-prepare states spec
    /// §4.1 names: if `root` is missing but `_tmp` exists, promote it; if
    /// both exist, the prepare never completed, so discard `_tmp`.
    fn recover(root: &Path) -> Result<()> {
        let tmp = Self::tmp_root(root);
        match (root.exists(), tmp.exists()) {
            (false, true) => fs::rename(&tmp, root).map_err(io_err),
            (true, true) => fs::remove_dir_all(&tmp).map_err(io_err),
            _ => Ok(()),
        }
    }

    fn key_path(root: &Path, key: &str) -> PathBuf {
        root.join(key)
    }

    fn read_raw(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp_path = path.with_file_name(format!(
            "{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("pref")
        ));
        fs::write(&tmp_path, contents).map_err(io_err)?;
        fs::rename(&tmp_path, path).map_err(io_err)
    }

    /// Removes `key`'s file under `root` and prunes now-empty parent
    /// directories back up to (but not including) `root`.
    fn delete_and_prune(root: &Path, key: &str) -> Result<()> {
        let path = Self::key_path(root, key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(e)),
        }
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == root {
                break;
            }
            match fs::read_dir(&d) {
                Ok(mut entries) => {
                    if entries.next().is_none() {
                        let _ = fs::remove_dir(&d);
                        dir = d.parent().map(Path::to_path_buf);
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
        fs::create_dir_all(dst).map_err(io_err)?;
        for entry in fs::read_dir(src).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let ty = entry.file_type().map_err(io_err)?;
            let target = dst.join(entry.file_name());
            if ty.is_dir() {
                Self::copy_dir_all(&entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target).map_err(io_err)?;
            }
        }
        Ok(())
    }

    fn notify(observers: &Mutex<HashMap<String, Vec<Arc<dyn Observer>>>>, key: &str) {
        let list = observers.lock().unwrap().get(key).cloned();
        if let Some(list) = list {
            for obs in list {
                obs.on_changed(key);
            }
        }
    }

    fn check_pin(&self, key: &str, kind: ValueKind) -> Result<()> {
        let mut cache = self.type_cache.lock().unwrap();
        match cache.get(key) {
            Some(existing) if *existing != kind => Err(ErrorCode::DownloadStateInitializationError(
                format!("preference key '{key}' already pinned to a different type"),
            )),
            Some(_) => Ok(()),
            None => {
                cache.insert(key.to_string(), kind);
                Ok(())
            }
        }
    }
}

fn io_err(e: std::io::Error) -> ErrorCode {
    ErrorCode::DownloadStateInitializationError(e.to_string())
}

impl PreferenceStore for FileStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Self::read_raw(&Self::key_path(&self.root, key))
    }

    fn get_int64(&self, key: &str) -> Result<Option<i64>> {
        validate_key(key)?;
        match Self::read_raw(&Self::key_path(&self.root, key))? {
            Some(s) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ErrorCode::DownloadStateInitializationError(format!(
                    "preference key '{key}' is not a valid int64"
                ))),
            None => Ok(None),
        }
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        validate_key(key)?;
        match Self::read_raw(&Self::key_path(&self.root, key))? {
            Some(s) => match s.trim() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(ErrorCode::DownloadStateInitializationError(format!(
                    "preference key '{key}' is not a valid bool"
                ))),
            },
            None => Ok(None),
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.check_pin(key, ValueKind::String)?;
        Self::write_atomic(&Self::key_path(&self.root, key), value)?;
        Self::notify(&self.observers, key);
        Ok(())
    }

    fn set_int64(&self, key: &str, value: i64) -> Result<()> {
        validate_key(key)?;
        self.check_pin(key, ValueKind::Int64)?;
        Self::write_atomic(&Self::key_path(&self.root, key), &value.to_string())?;
        Self::notify(&self.observers, key);
        Ok(())
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        validate_key(key)?;
        self.check_pin(key, ValueKind::Bool)?;
        Self::write_atomic(
            &Self::key_path(&self.root, key),
            if value { "true" } else { "false" },
        )?;
        Self::notify(&self.observers, key);
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        validate_key(key).is_ok() && Self::key_path(&self.root, key).is_file()
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        Self::delete_and_prune(&self.root, key)?;
        self.type_cache.lock().unwrap().remove(key);
        Ok(())
    }

    fn sub_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    walk(root, &path, out)?;
                } else if let Ok(rel) = path.strip_prefix(root) {
                    if let Some(s) = rel.to_str() {
                        out.push(s.replace(std::path::MAIN_SEPARATOR, "/"));
                    }
                }
            }
            Ok(())
        }
        if self.root.is_dir() {
            walk(&self.root, &self.root, &mut out).map_err(io_err)?;
        }
        out.retain(|k| k.starts_with(namespace));
        Ok(out)
    }

    fn add_observer(&self, key: &str, observer: Arc<dyn Observer>) {
        self.observers
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(observer);
    }

    fn remove_observer(&self, key: &str, observer: &Arc<dyn Observer>) {
        if let Some(list) = self.observers.lock().unwrap().get_mut(key) {
            list.retain(|o| !Arc::ptr_eq(o, observer));
        }
    }

    fn begin_transaction(&self) -> Result<Box<dyn Transaction + '_>> {
        let tmp_root = Self::tmp_root(&self.root);
        if tmp_root.exists() {
            fs::remove_dir_all(&tmp_root).map_err(io_err)?;
        }
        if self.root.is_dir() {
            Self::copy_dir_all(&self.root, &tmp_root)?;
        } else {
            fs::create_dir_all(&tmp_root).map_err(io_err)?;
        }
        Ok(Box::new(FileTransaction {
            store: self,
            tmp_root,
            touched: Vec::new(),
        }))
    }
}

struct FileTransaction<'a> {
    store: &'a FileStore,
    tmp_root: PathBuf,
    touched: Vec<String>,
}

impl FileTransaction<'_> {
    fn write(&mut self, key: &str, contents: &str) -> Result<()> {
        validate_key(key)?;
        FileStore::write_atomic(&FileStore::key_path(&self.tmp_root, key), contents)?;
        self.touched.push(key.to_string());
        Ok(())
    }
}

impl Transaction for FileTransaction<'_> {
    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.write(key, value)
    }

    fn set_int64(&mut self, key: &str, value: i64) -> Result<()> {
        self.write(key, &value.to_string())
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.write(key, if value { "true" } else { "false" })
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        validate_key(key)?;
        FileStore::delete_and_prune(&self.tmp_root, key)?;
        self.touched.push(key.to_string());
        Ok(())
    }

    fn cancel(self: Box<Self>) -> Result<()> {
        fs::remove_dir_all(&self.tmp_root).ok();
        Ok(())
    }

    fn submit(self: Box<Self>) -> Result<()> {
        if self.store.root.is_dir() {
            fs::remove_dir_all(&self.store.root).map_err(io_err)?;
        }
        fs::rename(&self.tmp_root, &self.store.root).map_err(io_err)?;
        if let Some(parent) = self.store.root.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        for key in &self.touched {
            FileStore::notify(&self.store.observers, key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::test_support::RecordingObserver;

    #[test]
    fn set_get_roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("prefs")).unwrap();
        store.set_int64("update/next_op_index", 7).unwrap();
        assert_eq!(store.get_int64("update/next_op_index").unwrap(), Some(7));
        assert!(
            dir.path()
                .join("prefs")
                .join("update")
                .join("next_op_index")
                .is_file()
        );
    }

    #[test]
    fn type_pinning_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("prefs")).unwrap();
        store.set_bool("flag", true).unwrap();
        assert!(store.set_string("flag", "x").is_err());
    }

    #[test]
    fn delete_prunes_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("prefs");
        let store = FileStore::new(&root).unwrap();
        store.set_int64("a/b/c", 1).unwrap();
        store.delete("a/b/c").unwrap();
        assert!(!root.join("a").exists());
    }

    #[test]
    fn observer_fires_on_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("prefs")).unwrap();
        let obs = RecordingObserver::new();
        store.add_observer("k", obs.clone());
        store.set_string("k", "v").unwrap();
        assert_eq!(obs.seen.lock().unwrap().as_slice(), &["k".to_string()]);
    }

    #[test]
    fn transaction_commit_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("prefs");
        let store = FileStore::new(&root).unwrap();
        store.set_int64("a", 1).unwrap();

        let mut txn = store.begin_transaction().unwrap();
        txn.set_int64("a", 2).unwrap();
        txn.set_int64("b", 3).unwrap();
        txn.submit().unwrap();

        assert_eq!(store.get_int64("a").unwrap(), Some(2));
        assert_eq!(store.get_int64("b").unwrap(), Some(3));
        assert!(!Path::new(&format!("{}_tmp", root.display())).exists());
    }

    #[test]
    fn transaction_cancel_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("prefs");
        let store = FileStore::new(&root).unwrap();
        store.set_int64("a", 1).unwrap();

        let mut txn = store.begin_transaction().unwrap();
        txn.set_int64("a", 2).unwrap();
        txn.cancel().unwrap();

        assert_eq!(store.get_int64("a").unwrap(), Some(1));
    }

    #[test]
    fn interrupted_commit_is_promoted_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("prefs");
        {
            let store = FileStore::new(&root).unwrap();
            store.set_int64("a", 1).unwrap();
        }
        let tmp_root = FileStore::tmp_root(&root);
        FileStore::copy_dir_all(&root, &tmp_root).unwrap();
        fs::remove_dir_all(&root).unwrap();

        let store = FileStore::new(&root).unwrap();
        assert_eq!(store.get_int64("a").unwrap(), Some(1));
    }
}
