//! Preference Store (C1): durable key/value storage for checkpoint cursors,
//! hashes, and version counters, with observers and an atomic multi-key
//! transaction.
//!
//! Grounded on the teacher's variant-style backends (`local_zip`/
//! `remote_zip` readers behind one `PayloadReader` trait in
//! `payload/payload_dumper.rs`): here the two storage backends, file and
//! memory, sit behind one `PreferenceStore` trait instead.

mod file_store;
mod memory_store;

pub use file_store::FileStore;
pub use memory_store::MemoryStore;

use crate::error::ErrorCode;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, ErrorCode>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int64(i64),
    Bool(bool),
}

impl Value {
    fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Int64(_) => ValueKind::Int64,
            Value::Bool(_) => ValueKind::Bool,
        }
    }

    fn encode(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Int64(i) => i.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    String,
    Int64,
    Bool,
}

/// Validates a key per spec §3: nonempty, `/`-separated segments drawn
/// from `[A-Za-z0-9_\-/]`, no empty segments (so no leading/trailing/
/// doubled separators).
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ErrorCode::DownloadStateInitializationError(
            "empty preference key".into(),
        ));
    }
    let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/';
    if !key.chars().all(valid_char) {
        return Err(ErrorCode::DownloadStateInitializationError(format!(
            "invalid character in preference key '{key}'"
        )));
    }
    if key.split('/').any(|segment| segment.is_empty()) {
        return Err(ErrorCode::DownloadStateInitializationError(format!(
            "empty path segment in preference key '{key}'"
        )));
    }
    Ok(())
}

pub trait Observer: Send + Sync {
    fn on_changed(&self, key: &str);
}

/// A pending, all-or-nothing batch of writes. Dropping without calling
/// `submit` behaves like `cancel` (spec's "atomically swaps the entire
/// store on commit").
pub trait Transaction: Send {
    fn set_string(&mut self, key: &str, value: &str) -> Result<()>;
    fn set_int64(&mut self, key: &str, value: i64) -> Result<()>;
    fn set_bool(&mut self, key: &str, value: bool) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn cancel(self: Box<Self>) -> Result<()>;
    fn submit(self: Box<Self>) -> Result<()>;
}

pub trait PreferenceStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    fn get_int64(&self, key: &str) -> Result<Option<i64>>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>>;

    fn set_string(&self, key: &str, value: &str) -> Result<()>;
    fn set_int64(&self, key: &str, value: i64) -> Result<()>;
    fn set_bool(&self, key: &str, value: bool) -> Result<()>;

    fn exists(&self, key: &str) -> bool;
    fn delete(&self, key: &str) -> Result<()>;

    /// Deletes `key` and, for each of `namespaces`, `<ns>/key` as well.
    fn delete_with_namespaces(&self, key: &str, namespaces: &[&str]) -> Result<()> {
        self.delete(key)?;
        for ns in namespaces {
            let namespaced = format!("{ns}/{key}");
            // A missing namespaced key is not an error: the namespace may
            // simply never have shadowed this key.
            let _ = self.delete(&namespaced);
        }
        Ok(())
    }

    /// Every key whose path starts with `namespace` (a plain string
    /// prefix, not a regex).
    fn sub_keys(&self, namespace: &str) -> Result<Vec<String>>;

    fn add_observer(&self, key: &str, observer: Arc<dyn Observer>);
    fn remove_observer(&self, key: &str, observer: &Arc<dyn Observer>);

    fn begin_transaction(&self) -> Result<Box<dyn Transaction + '_>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    pub struct RecordingObserver {
        pub seen: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Observer for RecordingObserver {
        fn on_changed(&self, key: &str) {
            self.seen.lock().unwrap().push(key.to_string());
        }
    }
}
