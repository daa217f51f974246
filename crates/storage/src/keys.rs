//! Cache key conventions.
//!
//! Keys are deterministic so that any component (the cache layer itself, or
//! a backend signalling after a commit) can compute exactly which entries a
//! write makes stale.

use crate::models::LATEST;

pub const MODULES_LIST: &str = "modules:list";

pub fn module(name: &str) -> String {
    format!("module:{name}")
}

pub fn version(module: &str, version: &str) -> String {
    format!("version:{module}:{version}")
}

pub fn file(module: &str, version: &str, path: &str) -> String {
    format!("file:{module}:{version}:{path}")
}

pub fn versions_list(module: &str) -> String {
    format!("versions:{module}:list")
}

pub fn compiled(module: &str, version: &str, language: &str) -> String {
    format!("compiled:{module}:{version}:{language}")
}

/// Content-addressed blobs never change, so this key is never invalidated.
pub fn content(hash: &str) -> String {
    format!("content:{hash}")
}

/// Glob matching every cached file of one version.
pub fn files_pattern(module: &str, version: &str) -> String {
    format!("file:{module}:{version}:*")
}

/// Keys made stale by creating (or replacing) a module.
pub fn module_write(name: &str) -> Vec<String> {
    vec![module(name), versions_list(name), MODULES_LIST.to_string()]
}

/// Keys made stale by creating or updating a version.
///
/// Includes the `latest` alias, since any new version may become the
/// latest one.
pub fn version_write(module_name: &str, version_label: &str) -> Vec<String> {
    vec![
        version(module_name, version_label),
        version(module_name, LATEST),
        versions_list(module_name),
        module(module_name),
        MODULES_LIST.to_string(),
    ]
}

/// Glob patterns made stale by a version write, on top of [`version_write`].
pub fn version_write_patterns(module_name: &str, version_label: &str) -> Vec<String> {
    vec![files_pattern(module_name, version_label), files_pattern(module_name, LATEST)]
}
