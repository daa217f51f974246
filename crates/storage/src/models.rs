//! Registry models.
//!
//! These types are shared by every backend and are also the payloads that
//! the cache layer serializes, so they all round-trip through `serde`.

use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use time::OffsetDateTime;

/// Reserved version label, resolved at read time to the greatest version.
pub const LATEST: &str = "latest";
/// Provenance placeholder used when a field was not supplied.
pub const UNKNOWN: &str = "unknown";

/// A named collection of schema files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Globally unique, immutable once created.
    pub name: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
impl Module {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            name: name.into(),
            description: description.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the fields every backend requires before a write.
    pub fn validate(&self) -> Result<()> {
        validate_name("module name", &self.name)
    }
}

/// A single schema file inside a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtoFile {
    /// Relative path, unique within its version.
    pub path: String,
    pub content: String,
}
impl ProtoFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self { path: path.into(), content: content.into() }
    }
}

/// Where a version's files came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub repository: String,
    pub commit: String,
    pub branch: String,
}
impl Default for Provenance {
    fn default() -> Self {
        Self {
            repository: UNKNOWN.to_string(),
            commit: UNKNOWN.to_string(),
            branch: UNKNOWN.to_string(),
        }
    }
}
impl Provenance {
    /// Replace blank fields with [`UNKNOWN`].
    pub fn or_unknown(mut self) -> Self {
        for field in [&mut self.repository, &mut self.commit, &mut self.branch] {
            if field.trim().is_empty() {
                *field = UNKNOWN.to_string();
            }
        }
        self
    }
}

/// An immutable snapshot of a module's files.
///
/// Listing operations return summaries of versions: every field is populated
/// except [`files`](Self::files), which is left empty. Use
/// [`get_version`](crate::backend::VersionReader::get_version) for the full
/// file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub module: String,
    pub version: String,
    /// Ordered by path when returned from a backend.
    pub files: Vec<ProtoFile>,
    /// References to other versions, in `module@version` form.
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
impl Version {
    pub fn new(module: impl Into<String>, version: impl Into<String>, files: Vec<ProtoFile>) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
            files,
            dependencies: Vec::new(),
            provenance: Provenance::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// `module@version`, used in log fields and error messages.
    pub fn reference(&self) -> String {
        format!("{}@{}", self.module, self.version)
    }

    /// Strip file contents, leaving the summary that listings return.
    pub fn into_summary(mut self) -> Self {
        self.files.clear();
        self
    }

    /// Sort files by path in place.
    pub fn sort_files(&mut self) {
        self.files.sort_by(|a, b| a.path.cmp(&b.path));
    }

    /// Check the fields every backend requires before a write.
    ///
    /// The reserved label [`LATEST`] can never be stored, and file paths
    /// must be unique after normalization.
    pub fn validate(&self) -> Result<()> {
        validate_name("module name", &self.module)?;
        validate_name("version", &self.version)?;
        if self.version == LATEST {
            exn::bail!(ErrorKind::Validation(format!("version label `{LATEST}` is reserved")));
        }
        validate_files(&self.files)
    }
}

/// Validate a set of files: every path must normalize cleanly and no two
/// files may share a normalized path.
pub fn validate_files(files: &[ProtoFile]) -> Result<()> {
    let mut seen = HashSet::with_capacity(files.len());
    for file in files {
        let normalized = validate_path(&file.path)?;
        if !seen.insert(normalized) {
            exn::bail!(ErrorKind::Validation(format!("duplicate file path `{}`", file.path)));
        }
    }
    Ok(())
}

/// Names double as directory names and cache key segments, so they must be
/// a single non-empty path component. A leading `.` is reserved for the
/// filesystem backend's staging directories.
pub fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        exn::bail!(ErrorKind::Validation(format!("{field} is required")));
    }
    if value.starts_with('.') || value.contains(['/', '\\', '\0']) {
        exn::bail!(ErrorKind::Validation(format!("{field} `{value}` is not a valid identifier")));
    }
    Ok(())
}

/// Limit/offset paging request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}
impl PageRequest {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }

    /// Apply the request to an already materialized, already ordered list.
    pub fn slice<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let items = items.into_iter().skip(self.offset).take(self.limit).collect();
        Page { items, total }
    }
}

/// One page of results plus the total number of items available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("acme.users", true)]
    #[case("", false)]
    #[case("   ", false)]
    #[case("..", false)]
    #[case(".staging", false)]
    #[case("acme/users", false)]
    #[case("acme\\users", false)]
    fn test_module_name_validation(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(Module::new(name, "").validate().is_ok(), valid);
    }

    #[test]
    fn test_latest_is_reserved() {
        let version = Version::new("acme.users", LATEST, vec![]);
        let err = version.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
    }

    #[test]
    fn test_duplicate_paths_rejected_after_normalization() {
        let files = vec![ProtoFile::new("a/user.proto", "x"), ProtoFile::new("a/./user.proto", "y")];
        let err = validate_files(&files).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
    }

    #[test]
    fn test_escaping_path_rejected() {
        let version = Version::new("acme.users", "v1", vec![ProtoFile::new("../evil.proto", "")]);
        let err = version.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_provenance_defaults_blank_fields() {
        let provenance = Provenance {
            repository: "github.com/acme/schemas".into(),
            commit: "".into(),
            branch: " ".into(),
        }
        .or_unknown();
        assert_eq!(provenance.repository, "github.com/acme/schemas");
        assert_eq!(provenance.commit, UNKNOWN);
        assert_eq!(provenance.branch, UNKNOWN);
    }

    #[test]
    fn test_page_slice() {
        let page = PageRequest::new(2, 1).slice(vec![1, 2, 3, 4]);
        assert_eq!(page.items, vec![2, 3]);
        assert_eq!(page.total, 4);
        let past_end = PageRequest::new(10, 10).slice(vec![1, 2]);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 2);
    }

    #[test]
    fn test_version_serde_round_trip() {
        let version = Version::new("acme.users", "v1.0.0", vec![ProtoFile::new("user.proto", "syntax=\"proto3\";")])
            .with_dependencies(["acme.common@v2.0.0"]);
        let json = serde_json::to_string(&version).unwrap();
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, version);
    }
}
