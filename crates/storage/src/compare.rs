//! Version label ordering and `"latest"` resolution.
//!
//! Labels are free-form, so the comparison is best-effort semantic:
//!
//! 1. A leading `v`/`V` is ignored and the label is split on `.`.
//! 2. Components are compared left to right. When both sides are numeric
//!    they compare as integers (`10 > 2`); a missing component counts as `0`.
//! 3. The first component pair that is *not* numeric on both sides decides
//!    the order by plain lexicographic comparison of the full labels.
//! 4. If every component ties, the more recently created version wins.

use crate::models::Version;
use std::cmp::Ordering;
use time::OffsetDateTime;

/// Anything that carries a version label and a creation timestamp.
///
/// Implemented for [`Version`], and by backends for their own row types so
/// that `"latest"` can be resolved before file contents are loaded.
pub trait Versioned {
    fn label(&self) -> &str;
    fn created_at(&self) -> OffsetDateTime;
}
impl Versioned for Version {
    fn label(&self) -> &str {
        &self.version
    }

    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
}
impl<T: Versioned> Versioned for &T {
    fn label(&self) -> &str {
        (*self).label()
    }

    fn created_at(&self) -> OffsetDateTime {
        (*self).created_at()
    }
}

/// Compare two labels without the timestamp tie-break.
pub fn compare_labels(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = strip_prefix(a).split('.').collect();
    let right: Vec<&str> = strip_prefix(b).split('.').collect();
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or("0");
        let r = right.get(i).copied().unwrap_or("0");
        match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) if l != r => return l.cmp(&r),
            (Ok(_), Ok(_)) => continue,
            _ if l != r => return a.cmp(b),
            _ => continue,
        }
    }
    Ordering::Equal
}

/// Full ordering: labels first, then creation time.
pub fn compare<T: Versioned>(a: &T, b: &T) -> Ordering {
    compare_labels(a.label(), b.label()).then_with(|| a.created_at().cmp(&b.created_at()))
}

/// Pick the greatest version according to [`compare`].
///
/// # Examples
///
/// ```
/// use protoreg_storage::compare::latest;
/// use protoreg_storage::models::Version;
///
/// let versions = ["v1.0.0", "v1.2.0", "v1.10.0"].map(|v| Version::new("acme.users", v, vec![]));
/// assert_eq!(latest(&versions).unwrap().version, "v1.10.0");
/// ```
pub fn latest<T: Versioned>(versions: impl IntoIterator<Item = T>) -> Option<T> {
    versions.into_iter().max_by(|a, b| compare(a, b))
}

fn strip_prefix(label: &str) -> &str {
    label.strip_prefix(['v', 'V']).unwrap_or(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::Duration;

    #[rstest]
    #[case("v1.10.0", "v1.2.0", Ordering::Greater)]
    #[case("v1.2.0", "v1.10.0", Ordering::Less)]
    #[case("1.0.0", "v1.0.0", Ordering::Equal)]
    #[case("v2", "v1.9.9", Ordering::Greater)]
    #[case("v1.2", "v1.2.0", Ordering::Equal)]
    #[case("v1.2.0-beta", "v1.2.0-rc", Ordering::Less)]
    #[case("v1.3.0-beta", "v1.2.0", Ordering::Greater)]
    #[case("main", "develop", Ordering::Greater)]
    fn test_compare_labels(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(compare_labels(a, b), expected);
    }

    #[test]
    fn test_timestamp_breaks_ties() {
        let older = Version::new("acme.users", "v1.0", vec![]);
        let mut newer = Version::new("acme.users", "1.0.0", vec![]);
        newer.created_at = older.created_at + Duration::seconds(5);
        assert_eq!(compare(&newer, &older), Ordering::Greater);
        assert_eq!(latest([&older, &newer]).unwrap().version, "1.0.0");
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        let versions = ["v1.0.0", "v1.2.0", "v1.10.0"].map(|v| Version::new("acme.users", v, vec![]));
        assert_eq!(latest(versions.iter()).unwrap().version, "v1.10.0");
    }

    #[test]
    fn test_latest_of_nothing() {
        let versions: Vec<Version> = Vec::new();
        assert!(latest(&versions).is_none());
    }
}
