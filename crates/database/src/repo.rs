//! Queries against the registry schema.
//!
//! [`Repository`] runs single statements against whichever pool it was
//! handed (a replica for reads, the primary for writes). Multi-statement
//! writes go through a [`WriteTx`], which commits or rolls back as a unit.

use crate::error::{ErrorKind, Result};
use crate::models::{FileRow, ModuleRow, VersionRow};
use exn::ResultExt;
use sqlx::{Any, AnyPool, Transaction};

/// `LIMIT`/`OFFSET` binds. Values past `i64::MAX` already exceed any table.
fn page_bounds(limit: usize, offset: usize) -> (i64, i64) {
    let clamp = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    (clamp(limit), clamp(offset))
}

fn count(total: i64) -> Result<u64> {
    u64::try_from(total).or_raise(|| ErrorKind::InvalidData("row count"))
}

#[derive(Debug, Clone)]
pub(crate) struct Repository {
    pool: AnyPool,
}
impl Repository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Modules
    // =========================================================================

    pub async fn get_module(&self, name: &str) -> Result<Option<ModuleRow>> {
        sqlx::query_as(include_str!("../queries/get_module.sql"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn list_modules(&self) -> Result<Vec<ModuleRow>> {
        sqlx::query_as(include_str!("../queries/list_modules.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn list_modules_page(&self, limit: usize, offset: usize) -> Result<(Vec<ModuleRow>, u64)> {
        let (limit, offset) = page_bounds(limit, offset);
        let rows = sqlx::query_as(include_str!("../queries/list_modules_page.sql"))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let total: i64 = sqlx::query_scalar(include_str!("../queries/count_modules.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok((rows, count(total)?))
    }

    pub async fn insert_module(&self, row: &ModuleRow) -> Result<()> {
        sqlx::query(include_str!("../queries/insert_module.sql"))
            .bind(&row.id)
            .bind(&row.name)
            .bind(&row.description)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Versions
    // =========================================================================

    pub async fn get_version(&self, module_id: &str, label: &str) -> Result<Option<VersionRow>> {
        sqlx::query_as(include_str!("../queries/get_version.sql"))
            .bind(module_id)
            .bind(label)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Every version of a module, oldest first.
    pub async fn list_versions(&self, module_id: &str) -> Result<Vec<VersionRow>> {
        sqlx::query_as(include_str!("../queries/list_versions.sql"))
            .bind(module_id)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn list_versions_page(
        &self,
        module_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<VersionRow>, u64)> {
        let (limit, offset) = page_bounds(limit, offset);
        let rows = sqlx::query_as(include_str!("../queries/list_versions_page.sql"))
            .bind(module_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let total: i64 = sqlx::query_scalar(include_str!("../queries/count_versions.sql"))
            .bind(module_id)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok((rows, count(total)?))
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// File metadata of a version, ordered by path.
    pub async fn list_files(&self, version_id: &str) -> Result<Vec<FileRow>> {
        sqlx::query_as(include_str!("../queries/list_files.sql"))
            .bind(version_id)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn get_file(&self, version_id: &str, path: &str) -> Result<Option<FileRow>> {
        sqlx::query_as(include_str!("../queries/get_file.sql"))
            .bind(version_id)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub async fn begin(&self) -> Result<WriteTx> {
        let tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Ok(WriteTx { tx })
    }
}

/// An open write transaction.
///
/// Dropping it without calling [`commit`](Self::commit) rolls everything
/// back.
pub(crate) struct WriteTx {
    tx: Transaction<'static, Any>,
}
impl WriteTx {
    pub async fn get_version(&mut self, module_id: &str, label: &str) -> Result<Option<VersionRow>> {
        sqlx::query_as(include_str!("../queries/get_version.sql"))
            .bind(module_id)
            .bind(label)
            .fetch_optional(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn insert_version(&mut self, row: &VersionRow) -> Result<()> {
        sqlx::query(include_str!("../queries/insert_version.sql"))
            .bind(&row.id)
            .bind(&row.module_id)
            .bind(&row.version)
            .bind(&row.dependencies)
            .bind(&row.repository)
            .bind(&row.commit_sha)
            .bind(&row.branch)
            .bind(row.created_at)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn insert_file(&mut self, row: &FileRow) -> Result<()> {
        sqlx::query(include_str!("../queries/insert_file.sql"))
            .bind(&row.version_id)
            .bind(&row.path)
            .bind(&row.content_hash)
            .bind(&row.object_key)
            .bind(row.size)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn delete_files(&mut self, version_id: &str) -> Result<()> {
        sqlx::query(include_str!("../queries/delete_files.sql"))
            .bind(version_id)
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.or_raise(|| ErrorKind::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10, 0, (10, 0))]
    #[case(usize::MAX, 0, (i64::MAX, 0))]
    #[case(1, usize::MAX, (1, i64::MAX))]
    fn test_page_bounds_clamp(#[case] limit: usize, #[case] offset: usize, #[case] expected: (i64, i64)) {
        assert_eq!(page_bounds(limit, offset), expected);
    }
}
