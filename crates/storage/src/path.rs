//! Proto file path validation.
//!
//! File paths inside a version come from clients. Before any backend uses
//! one as a directory entry, an object key segment or a cache key segment, it
//! is normalized here and rejected if it would leave the version root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a version-relative file path and returns its normalized form.
///
/// > **Note:** This does **not** normalize backslashes or non-UTF8 bytes.
/// >           Null bytes are explicitly rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use protoreg_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("user.proto").is_ok());
/// assert!(validate_path("acme/users/v1/user.proto").is_ok());
/// assert!(validate_path("a/../user.proto").is_ok()); // (never leaves the version root)
/// // Invalid paths
/// assert!(validate_path("../module.json").is_err());
/// assert!(validate_path("a/../../b.proto").is_err());
/// assert!(validate_path("a\0b.proto").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/../acme/./user.proto").unwrap(),
///     Path::new("acme/user.proto")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Normalize a file path into the `/`-separated string form used for
/// object keys, cache keys and database rows.
pub fn normalize(path: impl AsRef<Path>) -> Result<String> {
    let validated = validate(path.as_ref())?;
    let mut parts = Vec::new();
    for component in validated.components() {
        let Some(part) = component.as_os_str().to_str() else {
            exn::bail!(ErrorKind::InvalidPath(validated.clone()));
        };
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("user.proto", "user.proto")]
    #[case("acme/users/user.proto", "acme/users/user.proto")]
    #[case("a//b//c.proto", "a/b/c.proto")]
    #[case("a/./b/./c.proto", "a/b/c.proto")]
    #[case("/rooted/user.proto", "rooted/user.proto")]
    #[case("acme/", "acme")]
    #[case("a/b/..", "a")]
    fn test_normalize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input).unwrap(), expected);
    }

    #[rstest]
    #[case("../module.json")]
    #[case("a/../../b.proto")]
    #[case("..")]
    #[case("../..")]
    #[case("a\0b.proto")]
    #[case("")]
    #[case(".")]
    #[case("./.")]
    #[case("//")]
    fn test_rejected(#[case] input: &str) {
        let err = validate(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }
}
