use super::{Observer, PreferenceStore, Result, Transaction, Value, validate_key};
use crate::error::ErrorCode;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Value>,
    observers: std::collections::HashMap<String, Vec<Arc<dyn Observer>>>,
}

/// In-memory backend: an ordered map plus a prefix-range `sub_keys`. Used
/// for tests and for ephemeral state that must not survive a reboot.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn notify(inner: &Inner, key: &str) {
        if let Some(observers) = inner.observers.get(key) {
            for obs in observers.clone() {
                obs.on_changed(key);
            }
        }
    }

    fn set_typed(&self, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        let mut guard = self.inner.lock().unwrap();
        if let Some(existing) = guard.data.get(key) {
            if existing.kind() != value.kind() {
                return Err(ErrorCode::DownloadStateInitializationError(format!(
                    "preference key '{key}' already pinned to a different type"
                )));
            }
        }
        guard.data.insert(key.to_string(), value);
        Self::notify(&guard, key);
        Ok(())
    }
}

impl PreferenceStore for MemoryStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let guard = self.inner.lock().unwrap();
        match guard.data.get(key) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ErrorCode::DownloadStateInitializationError(format!(
                "preference key '{key}' is not a string"
            ))),
            None => Ok(None),
        }
    }

    fn get_int64(&self, key: &str) -> Result<Option<i64>> {
        validate_key(key)?;
        let guard = self.inner.lock().unwrap();
        match guard.data.get(key) {
            Some(Value::Int64(i)) => Ok(Some(*i)),
            Some(_) => Err(ErrorCode::DownloadStateInitializationError(format!(
                "preference key '{key}' is not an int64"
            ))),
            None => Ok(None),
        }
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        validate_key(key)?;
        let guard = self.inner.lock().unwrap();
        match guard.data.get(key) {
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(ErrorCode::DownloadStateInitializationError(format!(
                "preference key '{key}' is not a bool"
            ))),
            None => Ok(None),
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set_typed(key, Value::String(value.to_string()))
    }

    fn set_int64(&self, key: &str, value: i64) -> Result<()> {
        self.set_typed(key, Value::Int64(value))
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set_typed(key, Value::Bool(value))
    }

    fn exists(&self, key: &str) -> bool {
        validate_key(key).is_ok() && self.inner.lock().unwrap().data.contains_key(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let mut guard = self.inner.lock().unwrap();
        guard.data.remove(key);
        Ok(())
    }

    fn sub_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let guard = self.inner.lock().unwrap();
        Ok(guard
            .data
            .keys()
            .filter(|k| k.starts_with(namespace))
            .cloned()
            .collect())
    }

    fn add_observer(&self, key: &str, observer: Arc<dyn Observer>) {
        let mut guard = self.inner.lock().unwrap();
        guard
            .observers
            .entry(key.to_string())
            .or_default()
            .push(observer);
    }

    fn remove_observer(&self, key: &str, observer: &Arc<dyn Observer>) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(list) = guard.observers.get_mut(key) {
            list.retain(|o| !Arc::ptr_eq(o, observer));
        }
    }

    fn begin_transaction(&self) -> Result<Box<dyn Transaction + '_>> {
        let snapshot = self.inner.lock().unwrap().data.clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            pending: snapshot,
            touched: Vec::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    pending: BTreeMap<String, Value>,
    touched: Vec<String>,
}

impl MemoryTransaction<'_> {
    fn set_typed(&mut self, key: &str, value: Value) -> Result<()> {
        validate_key(key)?;
        if let Some(existing) = self.pending.get(key) {
            if existing.kind() != value.kind() {
                return Err(ErrorCode::DownloadStateInitializationError(format!(
                    "preference key '{key}' already pinned to a different type"
                )));
            }
        }
        self.pending.insert(key.to_string(), value);
        self.touched.push(key.to_string());
        Ok(())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_typed(key, Value::String(value.to_string()))
    }

    fn set_int64(&mut self, key: &str, value: i64) -> Result<()> {
        self.set_typed(key, Value::Int64(value))
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.set_typed(key, Value::Bool(value))
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.pending.remove(key);
        self.touched.push(key.to_string());
        Ok(())
    }

    fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn submit(self: Box<Self>) -> Result<()> {
        let mut guard = self.store.inner.lock().unwrap();
        guard.data = self.pending;
        for key in &self.touched {
            MemoryStore::notify(&guard, key);
        }
        Ok(())
    }
}
