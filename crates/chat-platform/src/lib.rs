//! Durable keyed storage used for the chat session snapshot.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("value not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Namespaced string storage, the local equivalent of browser `localStorage`.
pub trait KeyValueStore: Send + Sync {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError>;

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StorageError>;

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set_value(namespace, key, value)
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StorageError> {
        (**self).get_value(namespace, key)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        (**self).delete_value(namespace, key)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.insert((namespace.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.get(&(namespace.to_owned(), key.to_owned()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        if data
            .remove(&(namespace.to_owned(), key.to_owned()))
            .is_none()
        {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

/// One file per key under `<root>/<namespace>/<key>.json`.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// mid-write never leaves a truncated value behind.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root
            .join(sanitize_component(namespace))
            .join(format!("{}.json", sanitize_component(key)))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(namespace, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StorageError::Unavailable(format!(
                    "failed creating storage directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        write_atomically(&path, value.as_bytes())?;
        debug!(path = %path.display(), bytes = value.len(), "stored value");
        Ok(())
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StorageError> {
        let path = self.path_for(namespace, key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(StorageError::Backend(format!(
                "failed reading {}: {err}",
                path.display()
            ))),
        }
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(namespace, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(StorageError::Backend(format!(
                "failed deleting {}: {err}",
                path.display()
            ))),
        }
    }
}

/// A store bound to one namespace.
#[derive(Clone)]
pub struct ScopedKeyValueStore<S: KeyValueStore> {
    inner: S,
    namespace: String,
}

impl<S: KeyValueStore> ScopedKeyValueStore<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set_value(&self.namespace, key, value)
    }

    pub fn get(&self, key: &str) -> Result<String, StorageError> {
        self.inner.get_value(&self.namespace, key)
    }

    /// Like [`Self::get`], mapping a missing key to `None`.
    pub fn get_optional(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete_value(&self.namespace, key)
    }

    /// Delete a key, treating an already-missing key as success.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        match self.delete(key) {
            Ok(()) | Err(StorageError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes).map_err(|err| {
        StorageError::Backend(format!("failed writing {}: {err}", temp_path.display()))
    })?;

    if let Err(rename_err) = fs::rename(&temp_path, path) {
        // Windows does not allow replacing existing files via rename.
        warn!(path = %path.display(), error = %rename_err, "rename over existing value failed, retrying");
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(StorageError::Backend(format!(
                    "failed replacing {} after rename error ({rename_err}): {err}",
                    path.display()
                )));
            }
        }
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            StorageError::Backend(format!("failed moving value into {}: {err}", path.display()))
        })?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("value.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

fn sanitize_component(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_owned()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn unique_temp_dir(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        env::temp_dir().join(format!("chat-platform-{label}-{now_nanos}"))
    }

    #[test]
    fn in_memory_roundtrip() {
        let store = InMemoryKeyValueStore::default();
        store
            .set_value("dogymorbis", "chat_last_sync", "42")
            .expect("set should work");

        let got = store
            .get_value("dogymorbis", "chat_last_sync")
            .expect("get should work");
        assert_eq!(got, "42");

        store
            .delete_value("dogymorbis", "chat_last_sync")
            .expect("delete should work");
        assert_eq!(
            store.get_value("dogymorbis", "chat_last_sync"),
            Err(StorageError::NotFound)
        );
    }

    #[test]
    fn scoped_store_isolates_namespaces() {
        let base = InMemoryKeyValueStore::default();
        let a = ScopedKeyValueStore::new(base.clone(), "user-a");
        let b = ScopedKeyValueStore::new(base.clone(), "user-b");

        a.set("chat_messages", "one").expect("set a");
        b.set("chat_messages", "two").expect("set b");

        assert_eq!(a.get("chat_messages").expect("get a"), "one");
        assert_eq!(b.get("chat_messages").expect("get b"), "two");
    }

    #[test]
    fn optional_get_and_remove_tolerate_missing_keys() {
        let scoped = ScopedKeyValueStore::new(InMemoryKeyValueStore::default(), "s");
        assert_eq!(scoped.get_optional("missing").expect("lookup"), None);
        scoped.remove("missing").expect("removing a missing key is fine");
        assert_eq!(scoped.delete("missing"), Err(StorageError::NotFound));
    }

    #[test]
    fn file_store_roundtrip_and_overwrite() {
        let root = unique_temp_dir("file-roundtrip");
        let store = FileKeyValueStore::new(&root);

        store
            .set_value("session", "chat_messages", r#"{"a":[]}"#)
            .expect("first write");
        store
            .set_value("session", "chat_messages", r#"{"b":[]}"#)
            .expect("overwrite");
        assert_eq!(
            store
                .get_value("session", "chat_messages")
                .expect("read back"),
            r#"{"b":[]}"#
        );

        store
            .delete_value("session", "chat_messages")
            .expect("delete");
        assert_eq!(
            store.get_value("session", "chat_messages"),
            Err(StorageError::NotFound)
        );

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn file_store_keeps_keys_inside_root() {
        let store = FileKeyValueStore::new("/tmp/chat-root");
        let path = store.path_for("../escape", "a/b");
        assert!(path.starts_with("/tmp/chat-root"));
        assert_eq!(path, Path::new("/tmp/chat-root/___escape/a_b.json"));
    }

    #[derive(Default)]
    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn set_value(&self, _namespace: &str, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("mock outage".to_owned()))
        }

        fn get_value(&self, _namespace: &str, _key: &str) -> Result<String, StorageError> {
            Err(StorageError::Unavailable("mock outage".to_owned()))
        }

        fn delete_value(&self, _namespace: &str, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn mock_failure_propagates_through_scoped_store() {
        let scoped = ScopedKeyValueStore::new(FailingStore, "dogymorbis");
        let err = scoped.set("chat_messages", "{}").expect_err("set must fail");
        assert_eq!(err, StorageError::Unavailable("mock outage".to_owned()));
        assert!(scoped.get_optional("chat_messages").is_err());
    }
}
