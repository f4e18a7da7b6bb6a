//! Byte-level object store
//!
//! Objects are opaque byte blobs addressed by [`StorageKey`]. The disk
//! implementation mirrors the key hierarchy as directories, so a collection
//! root is a directory and every object below it is a file.

use async_trait::async_trait;
use bytes::Bytes;
use hub_core::StorageKey;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::{Result, StorageError};

/// Persistent store of serialized objects
#[async_trait]
pub trait Store: Send + Sync {
    /// Store a new object; fails with `KeyExists` if it is already present
    async fn create(&self, key: &StorageKey, content: Bytes) -> Result<()>;

    /// Fetch one object
    async fn get(&self, key: &StorageKey) -> Result<Bytes>;

    /// Every object below a root; `NotFound` if the root was never stored
    async fn list(&self, root: &StorageKey) -> Result<Vec<(StorageKey, Bytes)>>;

    /// Keys of every object below a root
    async fn list_keys(&self, root: &StorageKey) -> Result<Vec<StorageKey>>;

    /// Write an object, creating it if absent
    async fn update(&self, key: &StorageKey, content: Bytes) -> Result<()>;

    /// Make the set of objects below `root` exactly `contents`
    async fn replace(&self, root: &StorageKey, contents: HashMap<StorageKey, Bytes>) -> Result<()>;

    /// Remove one object; removing an absent object succeeds
    async fn delete(&self, key: &StorageKey) -> Result<()>;

    /// Remove a root and everything below it
    async fn delete_collection(&self, root: &StorageKey) -> Result<()>;

    /// Components that have anything stored
    async fn components(&self) -> Result<Vec<String>>;

    /// Resources stored for one component
    async fn resources(&self, component: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed [`Store`]
///
/// Writes go to a hidden temporary file beside the target and are renamed
/// into place, so readers never observe a partially written object.
pub struct DiskStore {
    base: PathBuf,
}

impl DiskStore {
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base).await?;
        remove_stale_temp_files(&base).await;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        key.segments()
            .iter()
            .fold(self.base.clone(), |path, segment| path.join(segment))
    }

    fn object_path(&self, key: &StorageKey) -> Result<PathBuf> {
        if key.is_root() {
            return Err(StorageError::InvalidKey(format!("{} is a collection root", key)));
        }
        Ok(self.path_for(key))
    }

    async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
        fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Walk a root directory collecting object files
    async fn walk(&self, root: &StorageKey) -> Result<Vec<StorageKey>> {
        let root_path = self.path_for(root);
        match fs::metadata(&root_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::InvalidKey(format!("{} is not a collection", root)));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(root.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut keys = Vec::new();
        let mut pending = vec![root_path];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                match self.key_for_path(&path) {
                    Some(key) => keys.push(key),
                    None => warn!("Ignoring unexpected file in cache: {}", path.display()),
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn key_for_path(&self, path: &Path) -> Option<StorageKey> {
        let relative = path.strip_prefix(&self.base).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        StorageKey::from_object_segments(&segments).ok()
    }

    async fn list_dirs(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.file_type().await?.is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn create(&self, key: &StorageKey, content: Bytes) -> Result<()> {
        let path = self.object_path(key)?;
        if fs::try_exists(&path).await? {
            return Err(StorageError::KeyExists(key.to_string()));
        }
        self.write_atomic(&path, &content).await
    }

    async fn get(&self, key: &StorageKey) -> Result<Bytes> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, root: &StorageKey) -> Result<Vec<(StorageKey, Bytes)>> {
        let keys = self.walk(root).await?;
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(&key).await {
                Ok(content) => objects.push((key, content)),
                // Deleted between the walk and the read.
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(objects)
    }

    async fn list_keys(&self, root: &StorageKey) -> Result<Vec<StorageKey>> {
        self.walk(root).await
    }

    async fn update(&self, key: &StorageKey, content: Bytes) -> Result<()> {
        let path = self.object_path(key)?;
        self.write_atomic(&path, &content).await
    }

    async fn replace(&self, root: &StorageKey, contents: HashMap<StorageKey, Bytes>) -> Result<()> {
        if let Some(outside) = contents.keys().find(|key| !root.contains(key) || key.is_root()) {
            return Err(StorageError::InvalidKey(format!("{} is not below {}", outside, root)));
        }

        let existing = match self.walk(root).await {
            Ok(keys) => keys,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        fs::create_dir_all(self.path_for(root)).await?;
        for (key, content) in &contents {
            self.write_atomic(&self.path_for(key), content).await?;
        }
        for stale in existing.iter().filter(|key| !contents.contains_key(key)) {
            self.delete(stale).await?;
        }

        debug!(
            "Replaced {} with {} objects ({} stale removed)",
            root,
            contents.len(),
            existing.iter().filter(|key| !contents.contains_key(key)).count()
        );
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_collection(&self, root: &StorageKey) -> Result<()> {
        let path = self.path_for(root);
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn components(&self) -> Result<Vec<String>> {
        self.list_dirs(&self.base).await
    }

    async fn resources(&self, component: &str) -> Result<Vec<String>> {
        self.list_dirs(&self.base.join(component)).await
    }
}

/// Remove temporary files left behind by an interrupted write
async fn remove_stale_temp_files(base: &Path) {
    let mut pending = vec![base.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type().await {
                Ok(t) if t.is_dir() => pending.push(path),
                Ok(_) if name.starts_with('.') && name.ends_with(".tmp") => {
                    debug!("Removing stale temporary file {}", path.display());
                    let _ = fs::remove_file(&path).await;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ns: &str, name: &str) -> StorageKey {
        StorageKey::object("kubelet", "pods", Some(ns), name).unwrap()
    }

    fn root() -> StorageKey {
        StorageKey::collection("kubelet", "pods", None).unwrap()
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        let k = key("default", "web-0");

        store.create(&k, Bytes::from_static(b"{}")).await.unwrap();
        assert!(matches!(
            store.create(&k, Bytes::from_static(b"{}")).await,
            Err(StorageError::KeyExists(_))
        ));
        assert_eq!(store.get(&k).await.unwrap(), Bytes::from_static(b"{}"));
        assert!(dir.path().join("kubelet/pods/default/web-0").is_file());

        store.delete(&k).await.unwrap();
        assert!(store.get(&k).await.unwrap_err().is_not_found());
        store.delete(&k).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        assert!(store.list(&root()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_replace_removes_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        store.update(&key("a", "old"), Bytes::from_static(b"1")).await.unwrap();
        store.update(&key("b", "kept"), Bytes::from_static(b"1")).await.unwrap();

        let mut contents = HashMap::new();
        contents.insert(key("b", "kept"), Bytes::from_static(b"2"));
        contents.insert(key("c", "new"), Bytes::from_static(b"3"));
        store.replace(&root(), contents).await.unwrap();

        let keys = store.list_keys(&root()).await.unwrap();
        assert_eq!(keys, vec![key("b", "kept"), key("c", "new")]);
        assert_eq!(store.get(&key("b", "kept")).await.unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_replace_rejects_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        let mut contents = HashMap::new();
        contents.insert(
            StorageKey::object("kube-proxy", "pods", Some("a"), "x").unwrap(),
            Bytes::from_static(b"{}"),
        );
        assert!(matches!(
            store.replace(&root(), contents).await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_with_empty_set_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        store.update(&key("a", "x"), Bytes::from_static(b"1")).await.unwrap();
        store.replace(&root(), HashMap::new()).await.unwrap();
        assert!(store.list(&root()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_collection_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).await.unwrap();
        store.update(&key("a", "x"), Bytes::from_static(b"1")).await.unwrap();
        let node = StorageKey::object("kube-proxy", "nodes", None, "node-a").unwrap();
        store.update(&node, Bytes::from_static(b"1")).await.unwrap();

        assert_eq!(store.components().await.unwrap(), vec!["kube-proxy", "kubelet"]);
        assert_eq!(store.resources("kubelet").await.unwrap(), vec!["pods"]);

        store.delete_collection(&root()).await.unwrap();
        assert!(store.resources("kubelet").await.unwrap().is_empty());
        assert_eq!(
            store.list_keys(&StorageKey::collection("kube-proxy", "nodes", None).unwrap())
                .await
                .unwrap(),
            vec![node]
        );
    }

    #[tokio::test]
    async fn test_stale_temp_files_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let pods = dir.path().join("kubelet/pods/default");
        std::fs::create_dir_all(&pods).unwrap();
        std::fs::write(pods.join(".web-0.123.tmp"), b"partial").unwrap();

        let store = DiskStore::new(dir.path()).await.unwrap();
        assert!(!pods.join(".web-0.123.tmp").exists());
        assert!(store.list(&root()).await.unwrap().is_empty());
    }
}
