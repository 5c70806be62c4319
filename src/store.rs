use std::{collections::HashMap, path::Path, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    config::StoreConfig,
    error::{Error, Result},
    har::Har,
};

/// Durable read/write contract for recordings.
///
/// Absence is a normal `Ok(None)`, never an error; implementations fail only
/// on transport or storage problems. Backends do not synchronize access;
/// the recording cache owns that.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend identity, recorded into the creator metadata of new
    /// recordings.
    fn name(&self) -> &'static str;

    async fn find(&self, recording_id: &str) -> anyhow::Result<Option<Har>>;

    async fn save(&self, recording_id: &str, recording: &Har) -> anyhow::Result<()>;

    async fn delete(&self, recording_id: &str) -> anyhow::Result<()>;
}

/// Filesystem-backed store: one pretty-printed JSON document per recording
/// id under a root directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn recording_path(&self, recording_id: &str) -> anyhow::Result<PathBuf> {
        validate_recording_id(recording_id)?;
        Ok(self.root.join(format!("{recording_id}.har.json")))
    }
}

#[async_trait]
impl Store for FsStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn find(&self, recording_id: &str) -> anyhow::Result<Option<Har>> {
        let path = self.recording_path(recording_id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read recording {}", path.display()));
            }
        };

        let recording = serde_json::from_slice(&raw)
            .with_context(|| format!("parse recording {}", path.display()))?;
        Ok(Some(recording))
    }

    async fn save(&self, recording_id: &str, recording: &Har) -> anyhow::Result<()> {
        let path = self.recording_path(recording_id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("create recordings dir {}", self.root.display()))?;

        let mut raw = serde_json::to_vec_pretty(recording).context("serialize recording")?;
        raw.push(b'\n');
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("write recording {}", path.display()))?;
        Ok(())
    }

    async fn delete(&self, recording_id: &str) -> anyhow::Result<()> {
        let path = self.recording_path(recording_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete recording {}", path.display())),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    recordings: Mutex<HashMap<String, Har>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a recording without going through `save`.
    pub fn insert(&self, recording_id: impl Into<String>, recording: Har) {
        self.recordings.lock().insert(recording_id.into(), recording);
    }

    pub fn len(&self) -> usize {
        self.recordings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.lock().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn find(&self, recording_id: &str) -> anyhow::Result<Option<Har>> {
        Ok(self.recordings.lock().get(recording_id).cloned())
    }

    async fn save(&self, recording_id: &str, recording: &Har) -> anyhow::Result<()> {
        self.recordings
            .lock()
            .insert(recording_id.to_owned(), recording.clone());
        Ok(())
    }

    async fn delete(&self, recording_id: &str) -> anyhow::Result<()> {
        self.recordings.lock().remove(recording_id);
        Ok(())
    }
}

fn validate_recording_id(recording_id: &str) -> anyhow::Result<()> {
    if recording_id.trim().is_empty() {
        anyhow::bail!("recording id cannot be empty");
    }
    if recording_id != recording_id.trim() {
        anyhow::bail!("recording id cannot have leading or trailing whitespace");
    }
    if recording_id.contains('/') || recording_id.contains('\\') {
        anyhow::bail!("recording id cannot contain path separators");
    }
    if recording_id == "." || recording_id == ".." {
        anyhow::bail!("recording id cannot be `.` or `..`");
    }
    Ok(())
}

type StoreConstructor = Box<dyn Fn(&StoreConfig) -> anyhow::Result<Arc<dyn Store>> + Send + Sync>;

/// Explicit registry of store backends, constructed at startup and passed to
/// whoever wires up the engine. No process-global registration step.
pub struct StoreRegistry {
    factories: HashMap<String, StoreConstructor>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in `fs` and `memory` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("fs", |config| {
            let root = config
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("`store.path` is required for the fs backend"))?;
            Ok(Arc::new(FsStore::new(root)) as Arc<dyn Store>)
        });
        registry.register("memory", |_config| {
            Ok(Arc::new(MemoryStore::new()) as Arc<dyn Store>)
        });
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn(&StoreConfig) -> anyhow::Result<Arc<dyn Store>> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(constructor));
    }

    pub fn create(&self, config: &StoreConfig) -> Result<Arc<dyn Store>> {
        let constructor =
            self.factories
                .get(&config.backend)
                .ok_or_else(|| Error::UnknownBackend {
                    name: config.backend.clone(),
                })?;
        constructor(config).map_err(Error::Store)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{FsStore, MemoryStore, Store, StoreRegistry, validate_recording_id};
    use crate::{
        config::StoreConfig,
        har::{Creator, Har},
    };

    #[tokio::test]
    async fn fs_store_round_trips_a_recording() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        assert_eq!(store.find("suite").await.unwrap(), None);

        let recording = Har::new(Creator::this_producer(store.name()), "suite");
        store.save("suite", &recording).await.unwrap();

        let found = store.find("suite").await.unwrap().expect("saved recording");
        assert_eq!(found, recording);
        assert!(dir.path().join("suite.har.json").exists());

        store.delete("suite").await.unwrap();
        assert_eq!(store.find("suite").await.unwrap(), None);
        // Deleting an absent recording is not an error.
        store.delete("suite").await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_rejects_unsafe_recording_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());

        for id in ["", " padded", "../escape", r"a\b", ".", ".."] {
            assert!(store.find(id).await.is_err(), "id `{id}` should fail");
        }
    }

    #[tokio::test]
    async fn fs_store_surfaces_corrupt_documents_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("bad.har.json"), b"not json")
            .await
            .unwrap();

        let store = FsStore::new(dir.path());
        let err = store.find("bad").await.unwrap_err();
        assert!(err.to_string().contains("parse recording"), "err: {err}");
    }

    #[tokio::test]
    async fn memory_store_round_trips_a_recording() {
        let store = MemoryStore::new();
        let recording = Har::new(Creator::this_producer(store.name()), "suite");

        store.save("suite", &recording).await.unwrap();
        assert_eq!(store.find("suite").await.unwrap(), Some(recording));

        store.delete("suite").await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn recording_id_validation_matches_filesystem_rules() {
        assert!(validate_recording_id("suite-one_2").is_ok());
        assert!(validate_recording_id("a/b").is_err());
        assert!(validate_recording_id("..").is_err());
    }

    #[tokio::test]
    async fn registry_creates_registered_backends() {
        let registry = StoreRegistry::with_defaults();
        let dir = tempfile::tempdir().unwrap();

        let fs = registry
            .create(&StoreConfig {
                backend: "fs".to_owned(),
                path: Some(dir.path().to_path_buf()),
            })
            .unwrap();
        assert_eq!(fs.name(), "fs");

        let memory = registry
            .create(&StoreConfig {
                backend: "memory".to_owned(),
                path: None,
            })
            .unwrap();
        assert_eq!(memory.name(), "memory");

        let err = match registry.create(&StoreConfig {
            backend: "redis".to_owned(),
            path: None,
        }) {
            Ok(_) => panic!("expected error for unknown backend"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("unknown store backend"), "err: {err}");
    }

    #[tokio::test]
    async fn registry_accepts_custom_backends() {
        let mut registry = StoreRegistry::new();
        registry.register("custom", |_config| {
            Ok(Arc::new(MemoryStore::new()) as Arc<dyn Store>)
        });

        let store = registry
            .create(&StoreConfig {
                backend: "custom".to_owned(),
                path: None,
            })
            .unwrap();
        assert_eq!(store.name(), "memory");
    }
}
