//! Row types and their conversions to the registry models.
//!
//! Columns are restricted to types every `sqlx::Any` driver can decode:
//! identifiers are UUID strings, timestamps are Unix nanoseconds and the
//! dependency list is a JSON array in a text column.

use crate::error::{Error, ErrorKind, Result};
use exn::ResultExt;
use protoreg_storage::compare::Versioned;
use protoreg_storage::models::{Module, ProtoFile, Provenance, Version};
use time::OffsetDateTime;

fn to_nanos(at: OffsetDateTime) -> Result<i64> {
    i64::try_from(at.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

fn from_nanos(nanos: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ModuleRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}
impl TryFrom<&Module> for ModuleRow {
    type Error = Error;
    fn try_from(module: &Module) -> Result<Self> {
        Ok(Self {
            id: new_id(),
            name: module.name.clone(),
            description: module.description.clone(),
            created_at: to_nanos(module.created_at)?,
            updated_at: to_nanos(module.updated_at)?,
        })
    }
}
impl TryFrom<ModuleRow> for Module {
    type Error = Error;
    fn try_from(row: ModuleRow) -> Result<Self> {
        Ok(Self {
            name: row.name,
            description: row.description,
            created_at: from_nanos(row.created_at)?,
            updated_at: from_nanos(row.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct VersionRow {
    pub id: String,
    pub module_id: String,
    pub version: String,
    pub dependencies: String,
    pub repository: String,
    pub commit_sha: String,
    pub branch: String,
    pub created_at: i64,
}
impl VersionRow {
    pub fn new(module_id: &str, version: &Version) -> Result<Self> {
        let provenance = version.provenance.clone().or_unknown();
        Ok(Self {
            id: new_id(),
            module_id: module_id.to_string(),
            version: version.version.clone(),
            dependencies: serde_json::to_string(&version.dependencies)
                .or_raise(|| ErrorKind::InvalidData("dependencies"))?,
            repository: provenance.repository,
            commit_sha: provenance.commit,
            branch: provenance.branch,
            created_at: to_nanos(version.created_at)?,
        })
    }

    /// Rebuild the model. `files` is empty for listings.
    pub fn into_version(self, module: &str, files: Vec<ProtoFile>) -> Result<Version> {
        Ok(Version {
            module: module.to_string(),
            version: self.version,
            files,
            dependencies: serde_json::from_str(&self.dependencies).or_raise(|| ErrorKind::InvalidData("dependencies"))?,
            provenance: Provenance {
                repository: self.repository,
                commit: self.commit_sha,
                branch: self.branch,
            },
            created_at: from_nanos(self.created_at)?,
        })
    }
}
impl Versioned for VersionRow {
    fn label(&self) -> &str {
        &self.version
    }

    fn created_at(&self) -> OffsetDateTime {
        from_nanos(self.created_at).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FileRow {
    pub version_id: String,
    pub path: String,
    pub content_hash: String,
    pub object_key: String,
    pub size: i64,
}
impl FileRow {
    pub fn new(version_id: &str, path: String, content_hash: String, object_key: String, size: usize) -> Result<Self> {
        Ok(Self {
            version_id: version_id.to_string(),
            path,
            content_hash,
            object_key,
            size: i64::try_from(size).or_raise(|| ErrorKind::InvalidData("file size"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protoreg_storage::models::UNKNOWN;

    #[test]
    fn test_module_round_trip() {
        let module = Module::new("acme.users", "User schemas");
        let row = ModuleRow::try_from(&module).unwrap();
        assert_eq!(Module::try_from(row).unwrap(), module);
    }

    #[test]
    fn test_version_row_keeps_dependencies_structured() {
        let version = Version::new("acme.users", "v1.0.0", vec![])
            .with_dependencies(["acme.common@v2.0.0", "google.api@v1"]);
        let row = VersionRow::new("module-id", &version).unwrap();
        assert_eq!(row.dependencies, r#"["acme.common@v2.0.0","google.api@v1"]"#);
        let back = row.into_version("acme.users", vec![]).unwrap();
        assert_eq!(back.dependencies, version.dependencies);
        assert_eq!(back.created_at, version.created_at);
    }

    #[test]
    fn test_blank_provenance_defaults_to_unknown() {
        let mut version = Version::new("acme.users", "v1.0.0", vec![]);
        version.provenance.commit = String::new();
        let row = VersionRow::new("module-id", &version).unwrap();
        assert_eq!(row.commit_sha, UNKNOWN);
    }

    #[test]
    fn test_corrupt_dependencies_rejected() {
        let mut row = VersionRow::new("module-id", &Version::new("acme.users", "v1", vec![])).unwrap();
        row.dependencies = "acme.common@v2".into();
        let err = row.into_version("acme.users", vec![]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("dependencies")));
    }
}
