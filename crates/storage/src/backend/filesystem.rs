//! Local filesystem storage backend.
//!
//! A self-contained, single-node implementation of the storage contract,
//! used for development and as the reference for the contract's semantics.
//!
//! # Layout
//!
//! ```text
//! <root>/<module>/module.json
//! <root>/<module>/versions/<version>/version.json
//! <root>/<module>/versions/<version>/<proto files at their relative paths>
//! <root>/<module>/versions/<version>/compiled/<language>.tar.gz
//! ```
//!
//! Versions are assembled in a hidden staging directory next to their final
//! location and renamed into place, so readers never observe a half-written
//! version.

use crate::backend::{
    ArtifactStore, CacheInvalidator, ContentStore, HealthCheck, ModuleReader, ModuleWriter, VersionReader,
    VersionWriter,
};
use crate::compare;
use crate::deadline::with_timeout;
use crate::error::{ErrorKind, Result};
use crate::models::{self, LATEST, Module, Page, PageRequest, ProtoFile, Provenance, Version};
use crate::path::normalize as normalize_path;
use async_trait::async_trait;
use exn::ResultExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;

const MODULE_FILE: &str = "module.json";
const VERSIONS_DIR: &str = "versions";
const VERSION_FILE: &str = "version.json";
const COMPILED_DIR: &str = "compiled";

/// Contents of `version.json`: everything about a version except the file
/// contents, which live next to it as plain files.
#[derive(Debug, Serialize, Deserialize)]
struct VersionManifest {
    module: String,
    version: String,
    files: Vec<String>,
    dependencies: Vec<String>,
    provenance: Provenance,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}
impl VersionManifest {
    fn into_summary(self) -> Version {
        Version {
            module: self.module,
            version: self.version,
            files: Vec::new(),
            dependencies: self.dependencies,
            provenance: self.provenance,
            created_at: self.created_at,
        }
    }
}

/// Filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use protoreg_storage::backend::{FilesystemBackend, ModuleWriter};
/// use protoreg_storage::models::Module;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = FilesystemBackend::new("dev", "/var/lib/protoreg")?;
/// backend.create_module(&Module::new("acme.users", "User service schemas")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    name: String,
    /// Root directory holding one directory per module.
    root: PathBuf,
}
impl FilesystemBackend {
    /// Create a new filesystem backend rooted at an absolute directory,
    /// creating it if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if the path is not
    /// absolute or exists but is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it only happens once at startup and it's
            // not worth making the constructor async.
            sync_create_dir(&root).map_err(ErrorKind::Io)?;
        }
        Ok(Self { name: name.into(), root })
    }

    fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join(module)
    }

    fn versions_dir(&self, module: &str) -> PathBuf {
        self.module_dir(module).join(VERSIONS_DIR)
    }

    fn version_dir(&self, module: &str, version: &str) -> PathBuf {
        self.versions_dir(module).join(version)
    }

    fn map_io_error(e: std::io::Error, what: impl FnOnce() -> String) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(what()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn read_json<T: DeserializeOwned>(path: &Path, what: impl FnOnce() -> String) -> Result<T> {
        let bytes = fs::read(path).await.map_err(|e| Self::map_io_error(e, what))?;
        serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Serialization(path.display().to_string()))
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes =
            serde_json::to_vec_pretty(value).or_raise(|| ErrorKind::Serialization(path.display().to_string()))?;
        Ok(fs::write(path, bytes).await.map_err(ErrorKind::Io)?)
    }

    async fn ensure_module(&self, module: &str) -> Result<()> {
        models::validate_name("module name", module)?;
        match fs::try_exists(self.module_dir(module).join(MODULE_FILE)).await.map_err(ErrorKind::Io)? {
            true => Ok(()),
            false => exn::bail!(ErrorKind::NotFound(format!("module `{module}`"))),
        }
    }

    async fn load_manifest(&self, module: &str, version: &str) -> Result<VersionManifest> {
        models::validate_name("version", version)?;
        let path = self.version_dir(module, version).join(VERSION_FILE);
        Self::read_json(&path, || format!("version `{module}@{version}`")).await
    }

    /// Every stored version of a module, in no particular order.
    async fn load_manifests(&self, module: &str) -> Result<Vec<VersionManifest>> {
        self.ensure_module(module).await?;
        let dir = self.versions_dir(module);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => exn::bail!(ErrorKind::Io(e)),
        };
        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::Io)? {
            let Some(label) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // Staging and retired directories are hidden.
            if label.starts_with('.') || !entry.file_type().await.map_err(ErrorKind::Io)?.is_dir() {
                continue;
            }
            match self.load_manifest(module, &label).await {
                Ok(manifest) => manifests.push(manifest),
                // A directory without a manifest is not a committed version.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(manifests)
    }

    /// Resolve `"latest"` to a concrete label; other labels pass through.
    async fn resolve_label(&self, module: &str, version: &str) -> Result<String> {
        if version != LATEST {
            return Ok(version.to_string());
        }
        let manifests = self.load_manifests(module).await?;
        let summaries: Vec<Version> = manifests.into_iter().map(VersionManifest::into_summary).collect();
        match compare::latest(&summaries) {
            Some(latest) => Ok(latest.version.clone()),
            None => exn::bail!(ErrorKind::NotFound(format!("module `{module}` has no versions"))),
        }
    }

    /// Reject paths that would collide with the backend's own bookkeeping.
    fn file_path(file: &ProtoFile) -> Result<String> {
        let path = normalize_path(&file.path)?;
        if path == VERSION_FILE || path == COMPILED_DIR || path.starts_with(&format!("{COMPILED_DIR}/")) {
            exn::bail!(ErrorKind::Validation(format!("file path `{path}` is reserved")));
        }
        Ok(path)
    }

    /// Write a complete version into a staging directory, then swap it into
    /// place. When `keep_compiled` is set, compiled artifacts of the version
    /// being replaced are carried over.
    async fn write_version(&self, version: &Version, keep_compiled: bool) -> Result<()> {
        let versions_dir = self.versions_dir(&version.module);
        let target = versions_dir.join(&version.version);
        let staging = versions_dir.join(format!(".staging-{}", uuid::Uuid::new_v4()));
        if let Err(e) = self.stage_version(&staging, &target, version, keep_compiled).await {
            Self::discard_staging(&staging, &target).await;
            return Err(e);
        }
        if fs::try_exists(&target).await.map_err(ErrorKind::Io)? {
            let retired = versions_dir.join(format!(".retired-{}", uuid::Uuid::new_v4()));
            fs::rename(&target, &retired).await.map_err(ErrorKind::Io)?;
            if let Err(e) = fs::rename(&staging, &target).await {
                // Put the old version back before reporting the failure.
                _ = fs::rename(&retired, &target).await;
                Self::discard_staging(&staging, &target).await;
                exn::bail!(ErrorKind::Io(e));
            }
            if let Err(e) = fs::remove_dir_all(&retired).await {
                tracing::warn!(path = %retired.display(), error = %e, "Failed to remove retired version directory");
            }
        } else if let Err(e) = fs::rename(&staging, &target).await {
            Self::discard_staging(&staging, &target).await;
            exn::bail!(ErrorKind::Io(e));
        }
        Ok(())
    }

    /// Remove an abandoned staging directory. Compiled artifacts carried over
    /// from `target` are handed back first; if that fails the directory is
    /// left in place so they can be recovered.
    async fn discard_staging(staging: &Path, target: &Path) {
        let compiled = staging.join(COMPILED_DIR);
        if fs::try_exists(&compiled).await.unwrap_or(false)
            && let Err(e) = fs::rename(&compiled, target.join(COMPILED_DIR)).await
        {
            tracing::warn!(path = %staging.display(), error = %e, "Keeping staging directory with compiled artifacts");
            return;
        }
        if let Err(e) = fs::remove_dir_all(staging).await {
            tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
        }
    }

    async fn stage_version(&self, staging: &Path, target: &Path, version: &Version, keep_compiled: bool) -> Result<()> {
        fs::create_dir_all(staging).await.map_err(ErrorKind::Io)?;
        if keep_compiled {
            let compiled = target.join(COMPILED_DIR);
            if fs::try_exists(&compiled).await.map_err(ErrorKind::Io)? {
                fs::rename(&compiled, staging.join(COMPILED_DIR)).await.map_err(ErrorKind::Io)?;
            }
        }
        let mut paths = Vec::with_capacity(version.files.len());
        for file in &version.files {
            let relative = Self::file_path(file)?;
            let absolute = staging.join(&relative);
            if let Some(parent) = absolute.parent() {
                fs::create_dir_all(parent).await.map_err(ErrorKind::Io)?;
            }
            fs::write(&absolute, file.content.as_bytes()).await.map_err(ErrorKind::Io)?;
            paths.push(relative);
        }
        paths.sort();
        let manifest = VersionManifest {
            module: version.module.clone(),
            version: version.version.clone(),
            files: paths,
            dependencies: version.dependencies.clone(),
            provenance: version.provenance.clone().or_unknown(),
            created_at: version.created_at,
        };
        // The manifest goes last: a version directory without one is ignored.
        Self::write_json(&staging.join(VERSION_FILE), &manifest).await
    }

    fn compiled_path(&self, module: &str, version: &str, language: &str) -> Result<PathBuf> {
        models::validate_name("language", language)?;
        Ok(self.version_dir(module, version).join(COMPILED_DIR).join(format!("{language}.tar.gz")))
    }
}

#[async_trait]
impl ModuleReader for FilesystemBackend {
    async fn get_module(&self, name: &str) -> Result<Module> {
        models::validate_name("module name", name)?;
        let path = self.module_dir(name).join(MODULE_FILE);
        Self::read_json(&path, || format!("module `{name}`")).await
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        let mut entries = fs::read_dir(&self.root).await.map_err(ErrorKind::Io)?;
        let mut modules = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::Io)? {
            if !entry.file_type().await.map_err(ErrorKind::Io)?.is_dir() {
                continue;
            }
            let path = entry.path().join(MODULE_FILE);
            match Self::read_json::<Module>(&path, || path.display().to_string()).await {
                Ok(module) => modules.push(module),
                // Directories without metadata are not modules.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(modules)
    }

    async fn list_modules_paginated(&self, page: PageRequest) -> Result<Page<Module>> {
        Ok(page.slice(self.list_modules().await?))
    }
}

#[async_trait]
impl ModuleWriter for FilesystemBackend {
    #[tracing::instrument(skip_all, fields(backend = %self.name, module = %module.name))]
    async fn create_module(&self, module: &Module) -> Result<()> {
        module.validate()?;
        let dir = self.module_dir(&module.name);
        fs::create_dir_all(&dir).await.map_err(ErrorKind::Io)?;
        Self::write_json(&dir.join(MODULE_FILE), module).await?;
        tracing::info!("Module created");
        Ok(())
    }
}

#[async_trait]
impl VersionReader for FilesystemBackend {
    async fn get_version(&self, module: &str, version: &str) -> Result<Version> {
        self.ensure_module(module).await?;
        let label = self.resolve_label(module, version).await?;
        let manifest = self.load_manifest(module, &label).await?;
        let dir = self.version_dir(module, &label);
        let mut files = Vec::with_capacity(manifest.files.len());
        for path in &manifest.files {
            let content = fs::read_to_string(dir.join(path))
                .await
                .map_err(|e| Self::map_io_error(e, || format!("file `{path}` in `{module}@{label}`")))?;
            files.push(ProtoFile::new(path.clone(), content));
        }
        let mut version = manifest.into_summary();
        version.files = files;
        version.sort_files();
        Ok(version)
    }

    async fn list_versions(&self, module: &str) -> Result<Vec<Version>> {
        let mut versions: Vec<Version> =
            self.load_manifests(module).await?.into_iter().map(VersionManifest::into_summary).collect();
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.version.cmp(&b.version)));
        Ok(versions)
    }

    async fn list_versions_paginated(&self, module: &str, page: PageRequest) -> Result<Page<Version>> {
        Ok(page.slice(self.list_versions(module).await?))
    }

    async fn get_file(&self, module: &str, version: &str, path: &str) -> Result<ProtoFile> {
        self.ensure_module(module).await?;
        let label = self.resolve_label(module, version).await?;
        let manifest = self.load_manifest(module, &label).await?;
        let path = normalize_path(path)?;
        if !manifest.files.contains(&path) {
            exn::bail!(ErrorKind::NotFound(format!("file `{path}` in `{module}@{label}`")));
        }
        let content = fs::read_to_string(self.version_dir(module, &label).join(&path))
            .await
            .map_err(|e| Self::map_io_error(e, || format!("file `{path}` in `{module}@{label}`")))?;
        Ok(ProtoFile::new(path, content))
    }
}

#[async_trait]
impl VersionWriter for FilesystemBackend {
    #[tracing::instrument(skip_all, fields(backend = %self.name, version = %version.reference()))]
    async fn create_version(&self, version: &Version) -> Result<()> {
        version.validate()?;
        self.ensure_module(&version.module).await?;
        self.write_version(version, false).await?;
        tracing::info!(files = version.files.len(), "Version created");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(backend = %self.name, version = %format!("{module}@{version}")))]
    async fn update_version(&self, module: &str, version: &str, files: &[ProtoFile]) -> Result<()> {
        self.ensure_module(module).await?;
        models::validate_files(files)?;
        let mut existing = self.load_manifest(module, version).await?.into_summary();
        existing.files = files.to_vec();
        self.write_version(&existing, true).await?;
        tracing::info!(files = files.len(), "Version files replaced");
        Ok(())
    }
}

#[async_trait]
impl ContentStore for FilesystemBackend {
    async fn store_content(&self, _content: &[u8]) -> Result<String> {
        exn::bail!(ErrorKind::Unsupported("content-addressed storage"))
    }

    async fn fetch_content(&self, _hash: &str) -> Result<Vec<u8>> {
        exn::bail!(ErrorKind::Unsupported("content-addressed storage"))
    }
}

#[async_trait]
impl ArtifactStore for FilesystemBackend {
    async fn store_compiled(&self, module: &str, version: &str, language: &str, artifact: &[u8]) -> Result<()> {
        self.ensure_module(module).await?;
        let label = self.resolve_label(module, version).await?;
        self.load_manifest(module, &label).await?;
        let path = self.compiled_path(module, &label, language)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(ErrorKind::Io)?;
        }
        Ok(fs::write(&path, artifact).await.map_err(ErrorKind::Io)?)
    }

    async fn get_compiled(&self, module: &str, version: &str, language: &str) -> Result<Vec<u8>> {
        self.ensure_module(module).await?;
        let label = self.resolve_label(module, version).await?;
        models::validate_name("version", &label)?;
        let path = self.compiled_path(module, &label, language)?;
        Ok(fs::read(&path)
            .await
            .map_err(|e| Self::map_io_error(e, || format!("{language} artifact for `{module}@{label}`")))?)
    }
}

#[async_trait]
impl CacheInvalidator for FilesystemBackend {
    async fn invalidate_cache(&self, _patterns: &[String]) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for FilesystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self, timeout: Duration) -> Result<()> {
        with_timeout(timeout, async {
            let metadata = fs::metadata(&self.root).await.map_err(ErrorKind::Io)?;
            if !metadata.is_dir() {
                let root = self.root.display();
                exn::bail!(ErrorKind::Unavailable(format!("storage root `{root}` is not a directory")));
            }
            Ok(())
        })
        .await
    }
}
