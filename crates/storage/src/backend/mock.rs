//! In-memory storage for testing.

use crate::backend::{
    ArtifactStore, CacheInvalidator, ContentStore, HealthCheck, ModuleReader, ModuleWriter, VersionReader,
    VersionWriter,
};
use crate::compare;
use crate::error::{ErrorKind, Result};
use crate::models::{self, LATEST, Module, Page, PageRequest, ProtoFile, Version};
use crate::path::normalize as normalize_path;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    modules: BTreeMap<String, Module>,
    /// Keyed by module, then version label.
    versions: HashMap<String, BTreeMap<String, Version>>,
    compiled: HashMap<(String, String, String), Vec<u8>>,
    invalidations: Vec<String>,
}

/// In-memory storage for testing.
///
/// Behaves like the filesystem backend (no content store, cache
/// invalidation is recorded but otherwise a no-op) and counts how often each
/// capability call reached it, so cache tests can assert hits and misses.
///
/// # Examples
///
/// ```
/// use protoreg_storage::backend::{MockStorage, ModuleReader};
/// use protoreg_storage::models::Module;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = MockStorage::with_modules([Module::new("acme.users", "")]);
/// storage.get_module("acme.users").await?;
/// assert_eq!(storage.calls("get_module"), 1);
/// # Ok(())
/// # }
/// ```
pub struct MockStorage {
    name: String,
    state: RwLock<State>,
    calls: Mutex<HashMap<&'static str, usize>>,
    healthy: AtomicBool,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            state: RwLock::new(State::default()),
            calls: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock pre-populated with modules.
    pub fn with_modules(modules: impl IntoIterator<Item = Module>) -> Self {
        let state = State {
            modules: modules.into_iter().map(|module| (module.name.clone(), module)).collect(),
            ..State::default()
        };
        Self {
            state: RwLock::new(state),
            ..Self::default()
        }
    }

    /// How many times the named capability call reached this backend.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().map(|calls| calls.get(operation).copied().unwrap_or(0)).unwrap_or(0)
    }

    /// Every pattern passed to [`invalidate_cache`](CacheInvalidator::invalidate_cache).
    pub async fn invalidations(&self) -> Vec<String> {
        self.state.read().await.invalidations.clone()
    }

    /// Make subsequent health checks fail.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn record(&self, operation: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(operation).or_default() += 1;
        }
    }

    fn resolve<'a>(state: &'a State, module: &str, version: &str) -> Result<&'a Version> {
        if !state.modules.contains_key(module) {
            exn::bail!(ErrorKind::NotFound(format!("module `{module}`")));
        }
        let versions = state.versions.get(module);
        let found = match version {
            LATEST => versions.and_then(|v| compare::latest(v.values())),
            label => versions.and_then(|v| v.get(label)),
        };
        match found {
            Some(version) => Ok(version),
            None => exn::bail!(ErrorKind::NotFound(format!("version `{module}@{version}`"))),
        }
    }

    fn normalized_files(files: &[ProtoFile]) -> Result<Vec<ProtoFile>> {
        models::validate_files(files)?;
        files
            .iter()
            .map(|file| Ok(ProtoFile::new(normalize_path(&file.path)?, file.content.clone())))
            .collect()
    }
}

#[async_trait]
impl ModuleReader for MockStorage {
    async fn get_module(&self, name: &str) -> Result<Module> {
        self.record("get_module");
        match self.state.read().await.modules.get(name) {
            Some(module) => Ok(module.clone()),
            None => exn::bail!(ErrorKind::NotFound(format!("module `{name}`"))),
        }
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        self.record("list_modules");
        Ok(self.state.read().await.modules.values().cloned().collect())
    }

    async fn list_modules_paginated(&self, page: PageRequest) -> Result<Page<Module>> {
        self.record("list_modules_paginated");
        Ok(page.slice(self.state.read().await.modules.values().cloned().collect()))
    }
}

#[async_trait]
impl ModuleWriter for MockStorage {
    async fn create_module(&self, module: &Module) -> Result<()> {
        self.record("create_module");
        module.validate()?;
        self.state.write().await.modules.insert(module.name.clone(), module.clone());
        Ok(())
    }
}

#[async_trait]
impl VersionReader for MockStorage {
    async fn get_version(&self, module: &str, version: &str) -> Result<Version> {
        self.record("get_version");
        let state = self.state.read().await;
        let mut found = Self::resolve(&state, module, version)?.clone();
        found.sort_files();
        Ok(found)
    }

    async fn list_versions(&self, module: &str) -> Result<Vec<Version>> {
        self.record("list_versions");
        let state = self.state.read().await;
        if !state.modules.contains_key(module) {
            exn::bail!(ErrorKind::NotFound(format!("module `{module}`")));
        }
        let mut versions: Vec<Version> = state
            .versions
            .get(module)
            .map(|v| v.values().cloned().map(Version::into_summary).collect())
            .unwrap_or_default();
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.version.cmp(&b.version)));
        Ok(versions)
    }

    async fn list_versions_paginated(&self, module: &str, page: PageRequest) -> Result<Page<Version>> {
        self.record("list_versions_paginated");
        let state = self.state.read().await;
        if !state.modules.contains_key(module) {
            exn::bail!(ErrorKind::NotFound(format!("module `{module}`")));
        }
        let mut versions: Vec<Version> = state
            .versions
            .get(module)
            .map(|v| v.values().cloned().map(Version::into_summary).collect())
            .unwrap_or_default();
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.version.cmp(&b.version)));
        Ok(page.slice(versions))
    }

    async fn get_file(&self, module: &str, version: &str, path: &str) -> Result<ProtoFile> {
        self.record("get_file");
        let path = normalize_path(path)?;
        let state = self.state.read().await;
        let found = Self::resolve(&state, module, version)?;
        match found.files.iter().find(|f| f.path == path) {
            Some(file) => Ok(file.clone()),
            None => exn::bail!(ErrorKind::NotFound(format!("file `{path}` in `{}`", found.reference()))),
        }
    }
}

#[async_trait]
impl VersionWriter for MockStorage {
    async fn create_version(&self, version: &Version) -> Result<()> {
        self.record("create_version");
        version.validate()?;
        let mut stored = version.clone();
        stored.files = Self::normalized_files(&version.files)?;
        stored.provenance = stored.provenance.or_unknown();
        let mut state = self.state.write().await;
        if !state.modules.contains_key(&version.module) {
            exn::bail!(ErrorKind::NotFound(format!("module `{}`", version.module)));
        }
        state.versions.entry(version.module.clone()).or_default().insert(version.version.clone(), stored);
        Ok(())
    }

    async fn update_version(&self, module: &str, version: &str, files: &[ProtoFile]) -> Result<()> {
        self.record("update_version");
        let files = Self::normalized_files(files)?;
        let mut state = self.state.write().await;
        match state.versions.get_mut(module).and_then(|v| v.get_mut(version)) {
            Some(existing) => {
                existing.files = files;
                Ok(())
            },
            None => exn::bail!(ErrorKind::NotFound(format!("version `{module}@{version}`"))),
        }
    }
}

#[async_trait]
impl ContentStore for MockStorage {
    async fn store_content(&self, _content: &[u8]) -> Result<String> {
        self.record("store_content");
        exn::bail!(ErrorKind::Unsupported("content-addressed storage"))
    }

    async fn fetch_content(&self, _hash: &str) -> Result<Vec<u8>> {
        self.record("fetch_content");
        exn::bail!(ErrorKind::Unsupported("content-addressed storage"))
    }
}

#[async_trait]
impl ArtifactStore for MockStorage {
    async fn store_compiled(&self, module: &str, version: &str, language: &str, artifact: &[u8]) -> Result<()> {
        self.record("store_compiled");
        let mut state = self.state.write().await;
        let label = Self::resolve(&state, module, version)?.version.clone();
        state.compiled.insert((module.into(), label, language.into()), artifact.to_vec());
        Ok(())
    }

    async fn get_compiled(&self, module: &str, version: &str, language: &str) -> Result<Vec<u8>> {
        self.record("get_compiled");
        let state = self.state.read().await;
        let label = Self::resolve(&state, module, version)?.version.clone();
        let key = (module.to_string(), label, language.to_string());
        match state.compiled.get(&key) {
            Some(artifact) => Ok(artifact.clone()),
            None => exn::bail!(ErrorKind::NotFound(format!("{language} artifact for `{module}@{}`", key.1))),
        }
    }
}

#[async_trait]
impl CacheInvalidator for MockStorage {
    async fn invalidate_cache(&self, patterns: &[String]) -> Result<()> {
        self.record("invalidate_cache");
        self.state.write().await.invalidations.extend(patterns.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for MockStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self, _timeout: Duration) -> Result<()> {
        self.record("health_check");
        match self.healthy.load(Ordering::SeqCst) {
            true => Ok(()),
            false => exn::bail!(ErrorKind::Unavailable("mock storage marked unhealthy".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_calls() {
        let storage = MockStorage::with_modules([Module::new("acme.users", "")]);
        storage.get_module("acme.users").await.unwrap();
        storage.get_module("acme.users").await.unwrap();
        assert!(storage.get_module("nope").await.is_err());
        assert_eq!(storage.calls("get_module"), 3);
        assert_eq!(storage.calls("list_modules"), 0);
    }

    #[tokio::test]
    async fn test_latest_resolution() {
        let storage = MockStorage::with_modules([Module::new("acme.users", "")]);
        for label in ["v1.0.0", "v1.10.0", "v1.2.0"] {
            storage.create_version(&Version::new("acme.users", label, vec![])).await.unwrap();
        }
        assert_eq!(storage.get_version("acme.users", LATEST).await.unwrap().version, "v1.10.0");
    }

    #[tokio::test]
    async fn test_unhealthy() {
        let storage = MockStorage::new();
        storage.set_healthy(false);
        assert!(storage.health_check(Duration::from_secs(1)).await.is_err());
    }
}
