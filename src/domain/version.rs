//! Version normalization and numeric comparison
//!
//! Versions are compared component-wise as numbers, never as strings, with
//! trailing-zero tolerance (`3.43` is the same release as `3.43.0`).
//! Normalization always produces a three-component `X.Y.Z` string and is
//! idempotent.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::domain::engine::Engine;
use crate::domain::errors::{SpinError, SpinResult};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?$").expect("static version regex"));

/// Parsed numeric version with up to three components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// How many components the original string carried (1, 2, or 3)
    pub precision: u8,
}

impl Version {
    /// Parse `X`, `X.Y`, or `X.Y.Z`; anything else is `InvalidVersion`
    pub fn parse(raw: &str) -> SpinResult<Self> {
        let caps = VERSION_RE
            .captures(raw.trim())
            .ok_or_else(|| SpinError::invalid_version(raw))?;
        let major: u32 = caps[1].parse().map_err(|_| SpinError::invalid_version(raw))?;
        let minor = caps.get(2).map(|m| m.as_str().parse::<u32>());
        let patch = caps.get(3).map(|m| m.as_str().parse::<u32>());
        let precision = 1 + u8::from(minor.is_some()) + u8::from(patch.is_some());
        Ok(Self {
            major,
            minor: minor.transpose().map_err(|_| SpinError::invalid_version(raw))?.unwrap_or(0),
            patch: patch.transpose().map_err(|_| SpinError::invalid_version(raw))?.unwrap_or(0),
            precision,
        })
    }

    /// Full three-component rendering
    pub fn to_full_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }

    /// True when both versions agree on their leading (major) component
    pub fn same_major(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Numeric comparison with trailing-zero tolerance: missing components
    /// compare as zero, so `3.43` == `3.43.0` and `10.2.0` > `9.9.9`.
    pub fn compare(&self, other: &Version) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_full_string())
    }
}

/// Latest known patch release per version-map prefix, newest first.
///
/// The prefix is what users type (`16`, `8.0`, `3.46`); the value is the
/// full release the downloader fetches. Unknown prefixes synthesize
/// `{prefix}.0.0` and may fail at download time.
pub fn version_map(engine: Engine) -> &'static [(&'static str, &'static str)] {
    match engine {
        Engine::Postgresql => &[
            ("17", "17.0.0"),
            ("16", "16.4.0"),
            ("15", "15.8.0"),
            ("14", "14.13.0"),
            ("13", "13.16.0"),
        ],
        Engine::Mysql => &[("9.0", "9.0.1"), ("8.4", "8.4.2"), ("8.0", "8.0.39"), ("8", "8.4.2")],
        Engine::Mariadb => &[
            ("11.4", "11.4.3"),
            ("11", "11.4.3"),
            ("10.11", "10.11.9"),
            ("10.6", "10.6.19"),
            ("10", "10.11.9"),
        ],
        Engine::Sqlite => &[("3.46", "3.46.1"), ("3.45", "3.45.3"), ("3.43", "3.43.2"), ("3", "3.46.1")],
        Engine::Duckdb => &[("1.1", "1.1.1"), ("1.0", "1.0.0"), ("1", "1.1.1")],
        Engine::Mongodb => &[("8.0", "8.0.1"), ("8", "8.0.1"), ("7.0", "7.0.14"), ("7", "7.0.14"), ("6.0", "6.0.18")],
        Engine::Redis => &[("7.4", "7.4.0"), ("7.2", "7.2.5"), ("7", "7.4.0"), ("6.2", "6.2.14")],
        Engine::Valkey => &[("8.0", "8.0.0"), ("8", "8.0.0"), ("7.2", "7.2.6"), ("7", "7.2.6")],
        Engine::Clickhouse => &[("24.8", "24.8.4"), ("24.3", "24.3.5"), ("24", "24.8.4"), ("23.8", "23.8.16")],
        Engine::Qdrant => &[("1.12", "1.12.0"), ("1.11", "1.11.3"), ("1", "1.12.0")],
    }
}

/// Resolve a user-supplied version to the full `X.Y.Z` release to install.
///
/// Exact `X.Y.Z` passes through untouched. `X` and `X.Y` resolve through
/// the engine's version map to the latest known patch; a prefix the map
/// has never heard of synthesizes `{prefix}.0.0` with a warning.
pub fn resolve_version(engine: Engine, requested: &str) -> SpinResult<String> {
    let parsed = Version::parse(requested)?;
    if parsed.precision == 3 {
        return Ok(parsed.to_full_string());
    }

    let wanted = requested.trim();
    for (prefix, full) in version_map(engine) {
        if *prefix == wanted {
            return Ok(normalize_full(full));
        }
    }

    let synthesized = parsed.to_full_string();
    warn!(
        "⚠️ Unknown {} version '{}' - synthesizing {} (download may fail)",
        engine.display_name(),
        wanted,
        synthesized
    );
    Ok(synthesized)
}

/// Normalize any known-good version string to three components
pub fn normalize_full(v: &str) -> String {
    match Version::parse(v) {
        Ok(parsed) => parsed.to_full_string(),
        Err(_) => v.to_string(),
    }
}

/// Sort full version strings descending (latest first); unparseable
/// entries sink to the end
pub fn sort_versions_desc(versions: &mut [String]) {
    versions.sort_by(|a, b| match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => vb.compare(&va),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_precision() {
        assert_eq!(Version::parse("16").unwrap().precision, 1);
        assert_eq!(Version::parse("16.4").unwrap().precision, 2);
        assert_eq!(Version::parse("16.4.1").unwrap().precision, 3);
        assert!(Version::parse("16.4.1.2").is_err());
        assert!(Version::parse("v16").is_err());
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn test_numeric_not_string_compare() {
        let a = Version::parse("10.2.0").unwrap();
        let b = Version::parse("9.9.9").unwrap();
        assert_eq!(a.compare(&b), Ordering::Greater);
    }

    #[test]
    fn test_trailing_zero_tolerance() {
        let a = Version::parse("3.43").unwrap();
        let b = Version::parse("3.43.0").unwrap();
        assert_eq!(a.compare(&b), Ordering::Equal);
    }

    #[test]
    fn test_resolve_exact_passthrough() {
        assert_eq!(resolve_version(Engine::Postgresql, "16.4.0").unwrap(), "16.4.0");
        // An exact patch the map does not list still passes through
        assert_eq!(resolve_version(Engine::Postgresql, "16.9.9").unwrap(), "16.9.9");
    }

    #[rstest::rstest]
    #[case(Engine::Postgresql, "16", "16.4.0")]
    #[case(Engine::Postgresql, "14", "14.13.0")]
    #[case(Engine::Mysql, "8.0", "8.0.39")]
    #[case(Engine::Mariadb, "11", "11.4.3")]
    #[case(Engine::Sqlite, "3.43", "3.43.2")]
    #[case(Engine::Mongodb, "7", "7.0.14")]
    #[case(Engine::Valkey, "8", "8.0.0")]
    fn test_resolve_through_map(
        #[case] engine: Engine,
        #[case] requested: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(resolve_version(engine, requested).unwrap(), expected);
    }

    #[test]
    fn test_resolve_unknown_major_synthesizes() {
        assert_eq!(resolve_version(Engine::Postgresql, "99").unwrap(), "99.0.0");
    }

    #[test]
    fn test_sort_descending() {
        let mut vs = vec!["9.9.9".to_string(), "10.2.0".to_string(), "10.1.7".to_string()];
        sort_versions_desc(&mut vs);
        assert_eq!(vs, vec!["10.2.0", "10.1.7", "9.9.9"]);
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(major in 0u32..1000, minor in 0u32..1000, patch in 0u32..1000) {
            let v = format!("{major}.{minor}.{patch}");
            let once = normalize_full(&v);
            prop_assert_eq!(normalize_full(&once), once.clone());
        }

        #[test]
        fn prop_resolve_is_three_components(major in 0u32..100) {
            let resolved = resolve_version(Engine::Postgresql, &major.to_string()).unwrap();
            prop_assert_eq!(resolved.split('.').count(), 3);
        }
    }
}
