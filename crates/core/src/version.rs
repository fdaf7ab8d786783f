//! Version utilities: label form of a version string, its prefixes, and semantic ordering.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::{Error, Result};

/// Stands in for `+` (build metadata separator) in labels and names.
pub const BUILD_SEPARATOR: &str = "---";

/// Label form of a version: a leading `v` is ensured and `+` becomes [`BUILD_SEPARATOR`].
/// `"1.23.5+vmware.1"` and `"v1.23.5+vmware.1"` both map to `"v1.23.5---vmware.1"`.
/// The empty version maps to `"v"`, which is never a prefix of a real version.
pub fn label(version: &str) -> String {
    let mut out = String::with_capacity(version.len() + 3);
    if !version.starts_with('v') {
        out.push('v');
    }
    out.push_str(&version.replace('+', BUILD_SEPARATOR));
    out
}

/// All prefixes of a version label, cut at every `.` and at the build separator, plus the label itself.
///
/// `"v1.23.5---vmware.1"` yields `v1`, `v1.23`, `v1.23.5`, `v1.23.5---vmware`, `v1.23.5---vmware.1`.
/// A pre-release hyphen is not a cut point, so `v1.23.5-zshippable` is not covered by `v1.23.5`.
pub fn prefixes(label: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for (i, c) in label.char_indices() {
        if i == 0 {
            continue;
        }
        if c == '.' || label[i..].starts_with(BUILD_SEPARATOR) {
            out.insert(label[..i].to_string());
        }
    }
    if !label.is_empty() {
        out.insert(label.to_string());
    }
    out
}

/// True if `prefix` (any version string) is a version prefix of `version`.
pub fn has_prefix(version: &str, prefix: &str) -> bool {
    prefixes(&label(version)).contains(&label(prefix))
}

/// Semantic version. Build metadata is kept for display but ignored for ordering and equality.
#[derive(Debug, Clone)]
pub struct Version(semver::Version);

impl Version {
    /// Parse `[v]MAJOR.MINOR.PATCH[-PRE][+BUILD]`.
    pub fn parse(s: &str) -> Result<Self> {
        let raw = s.strip_prefix('v').unwrap_or(s);
        semver::Version::parse(raw)
            .map(Version)
            .map_err(|e| Error::InvalidVersion { version: s.to_string(), reason: e.to_string() })
    }

    pub fn major(&self) -> u64 { self.0.major }
    pub fn minor(&self) -> u64 { self.0.minor }
    pub fn patch(&self) -> u64 { self.0.patch }

    pub fn build(&self) -> &str {
        self.0.build.as_str()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.major, self.0.minor, self.0.patch)
            .cmp(&(other.0.major, other.0.minor, other.0.patch))
            .then_with(|| self.0.pre.cmp(&other.0.pre))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl std::str::FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Compare two version strings; unparseable strings sort below every parseable one.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (Version::parse(a).ok(), Version::parse(b).ok()) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn label_ensures_v_and_replaces_plus() {
        assert_eq!(label("1.23.5+build.2"), "v1.23.5---build.2");
        assert_eq!(label("v1.23"), "v1.23");
        assert_eq!(label(""), "v");
    }

    #[test]
    fn empty_prefix_matches_no_version() {
        assert!(!prefixes(&label("v1.23.5+vmware.1")).contains(&label("")));
        assert!(!has_prefix("v1.23.5+vmware.1", ""));
    }

    #[test]
    fn prefixes_cut_at_dots_and_build_separator() {
        assert_eq!(
            prefixes(&label("1.23.5+build.2")),
            set(&["v1", "v1.23", "v1.23.5", "v1.23.5---build", "v1.23.5---build.2"])
        );
        assert_eq!(prefixes("v1"), set(&["v1"]));
        assert!(prefixes("").is_empty());
    }

    #[test]
    fn pre_release_is_not_a_cut_point() {
        assert!(has_prefix("v1.20.1+vmware.1", "v1.20.1+vmware.1"));
        assert!(!has_prefix("v1.20.1+vmware.1-zshippable", "v1.20.1+vmware.1"));
        assert!(has_prefix("v1.23.5-build1", "1.23"));
        assert!(!has_prefix("v1.23.5-build1", "1.23.5"));
    }

    #[test]
    fn ordering_ignores_build_metadata() {
        let a = Version::parse("v1.21.3+vmware.1").unwrap();
        let b = Version::parse("1.21.3+vmware.2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.build(), "vmware.1");
        assert!(Version::parse("v1.21.3").unwrap() > Version::parse("v1.21.3-rc.1").unwrap());
        assert!(Version::parse("v1.23.9-build1").unwrap() > Version::parse("v1.23.5-build1").unwrap());
        assert!(Version::parse("v1.10.0").unwrap() > Version::parse("v1.9.9").unwrap());
    }

    #[test]
    fn parse_rejects_partial_versions() {
        assert!(Version::parse("v1.21").is_err());
        assert!(matches!(Version::parse("bogus"), Err(Error::InvalidVersion { .. })));
    }

    #[test]
    fn compare_puts_garbage_last() {
        assert_eq!(compare("bogus", "v1.0.0"), Ordering::Less);
        assert_eq!(compare("v1.0.1", "v1.0.0"), Ordering::Greater);
    }
}
