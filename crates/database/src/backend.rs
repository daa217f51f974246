//! Relational storage backend.
//!
//! Metadata lives in the relational store, reached through the
//! [`ConnectionManager`]; file contents live in a content-addressed
//! [`ObjectStore`] and rows reference them by hash. Reads go to a replica,
//! every mutation to the primary.

use crate::manager::ConnectionManager;
use crate::models::{FileRow, ModuleRow, VersionRow};
use crate::repo::{Repository, WriteTx};
use async_trait::async_trait;
use exn::ResultExt;
use futures::future::try_join_all;
use protoreg_objects::ObjectStore;
use protoreg_storage::backend::{
    ArtifactStore, CacheInvalidator, ContentStore, HealthCheck, ModuleReader, ModuleWriter, VersionReader,
    VersionWriter,
};
use protoreg_storage::compare;
use protoreg_storage::deadline::with_timeout;
use protoreg_storage::error::{ErrorKind, Result};
use protoreg_storage::keys;
use protoreg_storage::models::{self, LATEST, Module, Page, PageRequest, ProtoFile, Version};
use protoreg_storage::normalize_path;
use std::sync::Arc;
use std::time::Duration;

const PROTO_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const BLOB_CONTENT_TYPE: &str = "application/octet-stream";
const ARTIFACT_CONTENT_TYPE: &str = "application/gzip";

/// Object key of a compiled artifact.
fn compiled_key(module: &str, version: &str, language: &str) -> String {
    format!("compiled/{module}/{version}/{language}.tar.gz")
}

/// Production storage backend.
pub struct RelationalBackend {
    name: String,
    connections: Arc<ConnectionManager>,
    objects: Arc<dyn ObjectStore>,
    /// Told about every committed write, when set.
    invalidator: Option<Arc<dyn CacheInvalidator>>,
}

impl RelationalBackend {
    pub fn new(name: impl Into<String>, connections: Arc<ConnectionManager>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            connections,
            objects,
            invalidator: None,
        }
    }

    /// Invalidate cache entries through `invalidator` after each commit.
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    async fn reader(&self) -> Repository {
        Repository::new(self.connections.replica().await)
    }

    fn writer(&self) -> Repository {
        Repository::new(self.connections.primary())
    }

    async fn module_id(repo: &Repository, module: &str) -> Result<String> {
        let found = repo
            .get_module(module)
            .await
            .or_raise(|| ErrorKind::Database(format!("look up module `{module}`")))?;
        match found {
            Some(row) => Ok(row.id),
            None => exn::bail!(ErrorKind::NotFound(format!("module `{module}`"))),
        }
    }

    /// Find a version row, resolving `"latest"`.
    async fn resolve_version(repo: &Repository, module: &str, version: &str) -> Result<VersionRow> {
        let context = || ErrorKind::Database(format!("resolve version `{module}@{version}`"));
        let Some(module_row) = repo.get_module(module).await.or_raise(context)? else {
            exn::bail!(ErrorKind::NotFound(format!("module `{module}`")));
        };
        let found = match version {
            LATEST => compare::latest(repo.list_versions(&module_row.id).await.or_raise(context)?),
            label => repo.get_version(&module_row.id, label).await.or_raise(context)?,
        };
        match found {
            Some(row) => Ok(row),
            None => exn::bail!(ErrorKind::NotFound(format!("version `{module}@{version}`"))),
        }
    }

    async fn fetch_blob(&self, row: &FileRow) -> Result<ProtoFile> {
        let bytes = self
            .objects
            .get_object(&row.object_key)
            .await
            .or_raise(|| ErrorKind::ObjectStore(format!("fetch `{}` at `{}`", row.path, row.object_key)))?;
        let content =
            String::from_utf8(bytes).or_raise(|| ErrorKind::Serialization(format!("`{}` is not UTF-8", row.path)))?;
        Ok(ProtoFile::new(row.path.clone(), content))
    }

    /// Upload every file and record it inside `tx`. The caller rolls back
    /// on error.
    async fn write_files(&self, tx: &mut WriteTx, version_id: &str, files: &[ProtoFile]) -> Result<()> {
        let uploads = files.iter().map(|file| async move {
            let path = normalize_path(&file.path)?;
            let hash = self
                .objects
                .put_object_with_hash(file.content.as_bytes(), PROTO_CONTENT_TYPE)
                .await
                .or_raise(|| ErrorKind::ObjectStore(format!("upload `{path}`")))?;
            let key = self
                .objects
                .content_key(&hash)
                .or_raise(|| ErrorKind::ObjectStore(format!("key for `{path}`")))?;
            let size = file.content.len();
            FileRow::new(version_id, path.clone(), hash, key, size)
                .or_raise(|| ErrorKind::Database(format!("file row for `{path}`")))
        });
        for row in try_join_all(uploads).await? {
            tx.insert_file(&row)
                .await
                .or_raise(|| ErrorKind::Database(format!("insert file `{}`", row.path)))?;
        }
        Ok(())
    }

    async fn finish(tx: WriteTx, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => tx.commit().await.or_raise(|| ErrorKind::Database("commit".to_string())),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "Rollback failed");
                }
                Err(e)
            },
        }
    }

    async fn invalidate(&self, keys: Vec<String>) {
        let Some(invalidator) = &self.invalidator else {
            return;
        };
        // The write is committed; a stale cache entry expires on its own.
        if let Err(e) = invalidator.invalidate_cache(&keys).await {
            tracing::warn!(error = %e, "Cache invalidation after commit failed");
        }
    }
}

#[async_trait]
impl ModuleReader for RelationalBackend {
    async fn get_module(&self, name: &str) -> Result<Module> {
        let context = || ErrorKind::Database(format!("get module `{name}`"));
        match self.reader().await.get_module(name).await.or_raise(context)? {
            Some(row) => Module::try_from(row).or_raise(context),
            None => exn::bail!(ErrorKind::NotFound(format!("module `{name}`"))),
        }
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        let context = || ErrorKind::Database("list modules".to_string());
        let rows = self.reader().await.list_modules().await.or_raise(context)?;
        rows.into_iter().map(|row| Module::try_from(row).or_raise(context)).collect()
    }

    async fn list_modules_paginated(&self, page: PageRequest) -> Result<Page<Module>> {
        let context = || ErrorKind::Database(format!("list modules from {}", page.offset));
        let (rows, total) = self
            .reader()
            .await
            .list_modules_page(page.limit, page.offset)
            .await
            .or_raise(context)?;
        let items = rows
            .into_iter()
            .map(|row| Module::try_from(row).or_raise(context))
            .collect::<Result<_>>()?;
        Ok(Page { items, total })
    }
}

#[async_trait]
impl ModuleWriter for RelationalBackend {
    #[tracing::instrument(skip_all, fields(backend = %self.name, module = %module.name))]
    async fn create_module(&self, module: &Module) -> Result<()> {
        module.validate()?;
        let context = || ErrorKind::Database(format!("create module `{}`", module.name));
        let row = ModuleRow::try_from(module).or_raise(context)?;
        self.writer().insert_module(&row).await.or_raise(context)?;
        tracing::info!("Module created");
        self.invalidate(keys::module_write(&module.name)).await;
        Ok(())
    }
}

#[async_trait]
impl VersionReader for RelationalBackend {
    async fn get_version(&self, module: &str, version: &str) -> Result<Version> {
        let repo = self.reader().await;
        let row = Self::resolve_version(&repo, module, version).await?;
        let context = || ErrorKind::Database(format!("get version `{module}@{version}`"));
        let file_rows = repo.list_files(&row.id).await.or_raise(context)?;
        let mut files = try_join_all(file_rows.iter().map(|f| self.fetch_blob(f))).await?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        row.into_version(module, files).or_raise(context)
    }

    async fn list_versions(&self, module: &str) -> Result<Vec<Version>> {
        let repo = self.reader().await;
        let module_id = Self::module_id(&repo, module).await?;
        let context = || ErrorKind::Database(format!("list versions of `{module}`"));
        let rows = repo.list_versions(&module_id).await.or_raise(context)?;
        rows.into_iter().map(|row| row.into_version(module, Vec::new()).or_raise(context)).collect()
    }

    async fn list_versions_paginated(&self, module: &str, page: PageRequest) -> Result<Page<Version>> {
        let repo = self.reader().await;
        let module_id = Self::module_id(&repo, module).await?;
        let context = || ErrorKind::Database(format!("list versions of `{module}` from {}", page.offset));
        let (rows, total) = repo
            .list_versions_page(&module_id, page.limit, page.offset)
            .await
            .or_raise(context)?;
        let items = rows
            .into_iter()
            .map(|row| row.into_version(module, Vec::new()).or_raise(context))
            .collect::<Result<_>>()?;
        Ok(Page { items, total })
    }

    async fn get_file(&self, module: &str, version: &str, path: &str) -> Result<ProtoFile> {
        let path = normalize_path(path)?;
        let repo = self.reader().await;
        let row = Self::resolve_version(&repo, module, version).await?;
        let found = repo
            .get_file(&row.id, &path)
            .await
            .or_raise(|| ErrorKind::Database(format!("get file `{path}` in `{module}@{}`", row.version)))?;
        match found {
            Some(file) => self.fetch_blob(&file).await,
            None => exn::bail!(ErrorKind::NotFound(format!("file `{path}` in `{module}@{}`", row.version))),
        }
    }
}

#[async_trait]
impl VersionWriter for RelationalBackend {
    #[tracing::instrument(skip_all, fields(backend = %self.name, version = %version.reference()))]
    async fn create_version(&self, version: &Version) -> Result<()> {
        version.validate()?;
        let repo = self.writer();
        let module_id = Self::module_id(&repo, &version.module).await?;
        let context = || ErrorKind::Database(format!("create version `{}`", version.reference()));
        let row = VersionRow::new(&module_id, version).or_raise(context)?;
        let mut tx = repo.begin().await.or_raise(context)?;
        let outcome = async {
            tx.insert_version(&row).await.or_raise(context)?;
            self.write_files(&mut tx, &row.id, &version.files).await
        }
        .await;
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Version creation failed, rolling back");
        }
        Self::finish(tx, outcome).await?;
        tracing::info!(files = version.files.len(), "Version created");
        let mut stale = keys::version_write(&version.module, &version.version);
        stale.extend(keys::version_write_patterns(&version.module, &version.version));
        self.invalidate(stale).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(backend = %self.name, version = %format!("{module}@{version}")))]
    async fn update_version(&self, module: &str, version: &str, files: &[ProtoFile]) -> Result<()> {
        models::validate_files(files)?;
        let repo = self.writer();
        let module_id = Self::module_id(&repo, module).await?;
        let context = || ErrorKind::Database(format!("update version `{module}@{version}`"));
        let mut tx = repo.begin().await.or_raise(context)?;
        let outcome = async {
            let Some(row) = tx.get_version(&module_id, version).await.or_raise(context)? else {
                exn::bail!(ErrorKind::NotFound(format!("version `{module}@{version}`")));
            };
            tx.delete_files(&row.id).await.or_raise(context)?;
            self.write_files(&mut tx, &row.id, files).await
        }
        .await;
        Self::finish(tx, outcome).await?;
        tracing::info!(files = files.len(), "Version files replaced");
        let mut stale = keys::version_write(module, version);
        stale.extend(keys::version_write_patterns(module, version));
        self.invalidate(stale).await;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for RelationalBackend {
    async fn store_content(&self, content: &[u8]) -> Result<String> {
        self.objects
            .put_object_with_hash(content, BLOB_CONTENT_TYPE)
            .await
            .or_raise(|| ErrorKind::ObjectStore(format!("store {} bytes of content", content.len())))
    }

    async fn fetch_content(&self, hash: &str) -> Result<Vec<u8>> {
        let key = self
            .objects
            .content_key(hash)
            .or_raise(|| ErrorKind::Validation(format!("`{hash}` is not a SHA-256 hex digest")))?;
        match self.objects.get_object(&key).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_not_found() => Err(e).or_raise(|| ErrorKind::NotFound(format!("content `{hash}`"))),
            Err(e) => Err(e).or_raise(|| ErrorKind::ObjectStore(format!("fetch content `{hash}`"))),
        }
    }
}

#[async_trait]
impl ArtifactStore for RelationalBackend {
    async fn store_compiled(&self, module: &str, version: &str, language: &str, artifact: &[u8]) -> Result<()> {
        models::validate_name("language", language)?;
        let row = Self::resolve_version(&self.writer(), module, version).await?;
        let key = compiled_key(module, &row.version, language);
        self.objects
            .put_object(&key, artifact, ARTIFACT_CONTENT_TYPE)
            .await
            .or_raise(|| ErrorKind::ObjectStore(format!("store {language} artifact at `{key}`")))
    }

    async fn get_compiled(&self, module: &str, version: &str, language: &str) -> Result<Vec<u8>> {
        models::validate_name("language", language)?;
        let row = Self::resolve_version(&self.reader().await, module, version).await?;
        let label = row.version;
        match self.objects.get_object(&compiled_key(module, &label, language)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.is_not_found() => {
                Err(e).or_raise(|| ErrorKind::NotFound(format!("{language} artifact for `{module}@{label}`")))
            },
            Err(e) => {
                Err(e).or_raise(|| ErrorKind::ObjectStore(format!("fetch {language} artifact for `{module}@{label}`")))
            },
        }
    }
}

#[async_trait]
impl CacheInvalidator for RelationalBackend {
    async fn invalidate_cache(&self, patterns: &[String]) -> Result<()> {
        match &self.invalidator {
            Some(invalidator) => invalidator.invalidate_cache(patterns).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HealthCheck for RelationalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self, timeout: Duration) -> Result<()> {
        with_timeout(timeout, async {
            let (database, objects) =
                tokio::join!(self.connections.health_check(timeout), self.objects.health_check(timeout));
            database.or_raise(|| ErrorKind::Unavailable("relational store".to_string()))?;
            objects.or_raise(|| ErrorKind::Unavailable(format!("object store bucket `{}`", self.objects.bucket())))?;
            Ok(())
        })
        .await
    }
}
