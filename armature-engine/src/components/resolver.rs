//! Identifier parsing and version resolution.
//!
//! Accepted identifier shapes, each with an optional `@<version>` pin:
//!
//! - `weather` — short name looked up in the configured catalog
//! - `acme/weather` — GitHub shorthand
//! - `https://host/acme/weather.git`, `ssh://…`, `git@host:acme/weather.git`
//! - `file:///srv/mirror/weather` or `/srv/mirror/weather` — local mirror
//!
//! Without a pin the highest stable semantic version among the source's tags
//! wins; equal versions (`v1.2.0` and `1.2.0`) are ordered by tag timestamp.

use semver::Version;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error::{ComponentError, Result};
use super::manifest::ComponentManifest;
use super::source::{ComponentSource, VersionTag};

const MAX_NAME_LEN: usize = 64;
const MAX_IDENTIFIER_LEN: usize = 512;

/// True if `name` is a valid component (or command) name: `[a-z][a-z0-9_-]{0,63}`.
pub fn is_valid_component_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_NAME_LEN
        && first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// A pin starts with an alphanumeric, so it can never name `.` or `..`.
fn is_valid_pin(pin: &str) -> bool {
    pin.starts_with(|c: char| c.is_ascii_alphanumeric())
        && pin
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
}

fn is_valid_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// A syntactically valid identifier. Produced before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// Short name to be looked up in the catalog.
    Short { name: String, pin: Option<String> },
    /// Explicit source coordinate; `name` is derived from its last segment.
    Coordinate {
        name: String,
        source: String,
        pin: Option<String>,
    },
}

impl Identifier {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| ComponentError::InvalidIdentifier {
            identifier: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("identifier is empty"));
        }
        if input.len() > MAX_IDENTIFIER_LEN {
            return Err(invalid("identifier is too long"));
        }
        if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("identifier contains whitespace or control characters"));
        }

        let (base, pin) = split_pin(input);
        if let Some(pin) = pin
            && !is_valid_pin(pin)
        {
            return Err(invalid("version pin must be [A-Za-z0-9._+-] and non-empty"));
        }
        let pin = pin.map(str::to_string);

        if is_valid_component_name(base) {
            return Ok(Self::Short {
                name: base.to_string(),
                pin,
            });
        }

        let source = canonical_coordinate(base).ok_or_else(|| invalid("unrecognized identifier shape"))?;
        let name = derive_name(&source)
            .ok_or_else(|| invalid("cannot derive a valid component name from the coordinate"))?;
        Ok(Self::Coordinate { name, source, pin })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Short { name, .. } | Self::Coordinate { name, .. } => name,
        }
    }

    pub fn pin(&self) -> Option<&str> {
        match self {
            Self::Short { pin, .. } | Self::Coordinate { pin, .. } => pin.as_deref(),
        }
    }
}

/// Split a trailing `@pin`. The `@` of `git@host:…` is never a pin separator.
fn split_pin(input: &str) -> (&str, Option<&str>) {
    match input.rsplit_once('@') {
        Some((base, pin)) if !base.is_empty() && !pin.contains('/') && !pin.contains(':') => {
            (base, Some(pin))
        }
        _ => (input, None),
    }
}

/// Canonical fetchable form of an explicit coordinate, or `None` if unrecognized.
fn canonical_coordinate(base: &str) -> Option<String> {
    if let Some((scheme, rest)) = base.split_once("://") {
        let path_ok = rest.split('/').filter(|s| !s.is_empty()).count() >= 1;
        return match scheme {
            "https" | "http" | "ssh" | "git" if path_ok && rest.contains('/') => {
                Some(base.to_string())
            }
            "file" if rest.starts_with('/') && path_ok => Some(base.to_string()),
            _ => None,
        };
    }

    if let Some(rest) = base.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        return (!host.is_empty() && path.split('/').all(is_valid_path_segment))
            .then(|| base.to_string());
    }

    if base.starts_with('/') {
        let segments_ok = base
            .split('/')
            .filter(|s| !s.is_empty())
            .all(is_valid_path_segment);
        return segments_ok.then(|| format!("file://{base}"));
    }

    let (owner, repo) = base.split_once('/')?;
    (is_valid_path_segment(owner) && is_valid_path_segment(repo))
        .then(|| format!("https://github.com/{owner}/{repo}"))
}

fn derive_name(source: &str) -> Option<String> {
    let trimmed = source.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    is_valid_component_name(name).then(|| name.to_string())
}

/// Parse a tag as a semantic version, accepting a leading `v`.
pub fn parse_version(tag: &str) -> Option<Version> {
    let trimmed = tag.strip_prefix(['v', 'V']).unwrap_or(tag);
    Version::parse(trimmed).ok()
}

/// Display form of a tag: the parsed semantic version, or the tag verbatim.
pub fn normalize_version(tag: &str) -> String {
    parse_version(tag)
        .map(|v| v.to_string())
        .unwrap_or_else(|| tag.to_string())
}

/// Highest stable semantic version; ties broken by the most recent timestamp.
pub fn select_latest(tags: &[VersionTag]) -> Option<&VersionTag> {
    tags.iter()
        .filter_map(|tag| {
            parse_version(&tag.name)
                .filter(|v| v.pre.is_empty())
                .map(|v| ((v.major, v.minor, v.patch), tag))
        })
        .max_by(|(va, ta), (vb, tb)| va.cmp(vb).then_with(|| ta.timestamp.cmp(&tb.timestamp)))
        .map(|(_, tag)| tag)
}

/// True if `latest` is a newer release than `current`.
///
/// Falls back to plain inequality when either side is not a semantic version.
pub fn is_newer(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(l), Some(c)) => {
            (l.major, l.minor, l.patch, &l.pre) > (c.major, c.minor, c.patch, &c.pre)
        }
        _ => latest != current,
    }
}

/// A concrete, fetchable `(source, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub name: String,
    pub source: String,
    /// Ref handed to the source when fetching (the tag as published).
    pub reference: String,
    /// Normalized version recorded in the registry.
    pub version: String,
    pub pinned: bool,
}

/// Resolves identifiers to fetchable targets.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    source: Arc<dyn ComponentSource>,
    catalog: BTreeMap<String, String>,
    lookup_timeout: Duration,
}

impl ManifestResolver {
    /// Create a resolver.
    ///
    /// # Arguments
    ///
    /// * `source` - Remote access used for tag listing and manifest reads
    /// * `catalog` - Short name to source coordinate
    /// * `lookup_timeout` - Upper bound for each remote lookup
    pub fn new(
        source: Arc<dyn ComponentSource>,
        catalog: BTreeMap<String, String>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            source,
            catalog,
            lookup_timeout,
        }
    }

    pub fn catalog(&self) -> &BTreeMap<String, String> {
        &self.catalog
    }

    /// Resolve a user-supplied identifier.
    ///
    /// # Errors
    ///
    /// - `InvalidIdentifier` if the identifier is malformed (no I/O performed)
    /// - `Fetch` if the short name is unknown, the source is unreachable, or
    ///   no matching version exists
    pub async fn resolve(&self, identifier: &str) -> Result<ResolvedTarget> {
        let parsed = Identifier::parse(identifier)?;
        let pin = parsed.pin().map(str::to_string);
        let (name, source) = match parsed {
            Identifier::Short { name, .. } => {
                let entry = self.catalog.get(&name).ok_or_else(|| {
                    ComponentError::fetch(&name, "not found in the component catalog")
                })?;
                let source = canonical_coordinate(entry).ok_or_else(|| {
                    ComponentError::fetch(&name, format!("catalog coordinate '{entry}' is invalid"))
                })?;
                (name, source)
            }
            Identifier::Coordinate { name, source, .. } => (name, source),
        };
        self.resolve_source(&name, &source, pin.as_deref()).await
    }

    /// Resolve the latest stable version of an already known source.
    pub async fn resolve_latest(&self, name: &str, source: &str) -> Result<ResolvedTarget> {
        self.resolve_source(name, source, None).await
    }

    /// Read the manifest published at a resolved target.
    pub async fn latest_manifest(&self, target: &ResolvedTarget) -> Result<ComponentManifest> {
        tokio::time::timeout(
            self.lookup_timeout,
            self.source.read_manifest(&target.source, &target.reference),
        )
        .await
        .map_err(|_| self.timed_out(&target.name))?
    }

    async fn resolve_source(
        &self,
        name: &str,
        source: &str,
        pin: Option<&str>,
    ) -> Result<ResolvedTarget> {
        let tags = tokio::time::timeout(self.lookup_timeout, self.source.list_tags(source))
            .await
            .map_err(|_| self.timed_out(name))??;
        debug!("{name}: {} tag(s) at {source}", tags.len());

        let reference = match pin {
            Some(pin) => match find_pinned(&tags, pin) {
                Some(tag) => tag.name.clone(),
                None if tags.is_empty() => pin.to_string(),
                None => {
                    return Err(ComponentError::fetch(
                        name,
                        format!("version '{pin}' not found at {source}"),
                    ));
                }
            },
            None => select_latest(&tags)
                .map(|tag| tag.name.clone())
                .ok_or_else(|| {
                    ComponentError::fetch(name, format!("no stable version tags at {source}"))
                })?,
        };

        Ok(ResolvedTarget {
            name: name.to_string(),
            source: source.to_string(),
            version: normalize_version(&reference),
            reference,
            pinned: pin.is_some(),
        })
    }

    fn timed_out(&self, name: &str) -> ComponentError {
        ComponentError::fetch(
            name,
            format!("lookup timed out after {}s", self.lookup_timeout.as_secs()),
        )
    }
}

/// Exact tag match first, then a match on the normalized version.
fn find_pinned<'a>(tags: &'a [VersionTag], pin: &str) -> Option<&'a VersionTag> {
    tags.iter().find(|tag| tag.name == pin).or_else(|| {
        let wanted = parse_version(pin)?;
        tags.iter()
            .find(|tag| parse_version(&tag.name).as_ref() == Some(&wanted))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::testing::FixtureSource;
    use chrono::{TimeZone, Utc};

    fn tag(name: &str, secs: i64) -> VersionTag {
        VersionTag {
            name: name.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).single(),
        }
    }

    #[test]
    fn test_component_names() {
        assert!(is_valid_component_name("weather"));
        assert!(is_valid_component_name("spotify-client_2"));
        assert!(!is_valid_component_name(""));
        assert!(!is_valid_component_name("Weather"));
        assert!(!is_valid_component_name("2weather"));
        assert!(!is_valid_component_name(&"a".repeat(65)));
    }

    #[test]
    fn test_parse_short_names() {
        match Identifier::parse("weather@1.2.0") {
            Ok(Identifier::Short { name, pin }) => {
                assert_eq!(name, "weather");
                assert_eq!(pin.as_deref(), Some("1.2.0"));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_coordinates() {
        let cases = [
            ("acme/weather", "https://github.com/acme/weather", "weather", None),
            (
                "https://git.example.com/acme/weather.git@v2.0.0",
                "https://git.example.com/acme/weather.git",
                "weather",
                Some("v2.0.0"),
            ),
            (
                "git@github.com:acme/weather.git",
                "git@github.com:acme/weather.git",
                "weather",
                None,
            ),
            (
                "git@github.com:acme/weather.git@1.0.0",
                "git@github.com:acme/weather.git",
                "weather",
                Some("1.0.0"),
            ),
            ("/srv/mirror/weather", "file:///srv/mirror/weather", "weather", None),
        ];

        for (input, source, name, pin) in cases {
            match Identifier::parse(input) {
                Ok(Identifier::Coordinate {
                    name: n,
                    source: s,
                    pin: p,
                }) => {
                    assert_eq!(s, source, "source of {input}");
                    assert_eq!(n, name, "name of {input}");
                    assert_eq!(p.as_deref(), pin, "pin of {input}");
                }
                other => panic!("unexpected parse of {input}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_rejects_malformed_identifiers() {
        for input in [
            "",
            "weather@",
            "has space",
            "Weather",
            "ftp://host/acme/weather",
            "acme/weather/extra",
            "acme/../weather",
            "acme/Weather",
            "weather@1.0/evil",
            "weather@.",
            "weather@..",
            "weather@.hidden",
            "/srv/mirror/weather@..",
            "acme/weather@-rc",
        ] {
            assert!(
                matches!(
                    Identifier::parse(input),
                    Err(ComponentError::InvalidIdentifier { .. })
                ),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_select_latest_prefers_semver_over_recency() {
        let tags = vec![tag("v1.10.0", 100), tag("v1.9.0", 500), tag("v2.0.0-rc.1", 900)];
        assert_eq!(select_latest(&tags).map(|t| t.name.as_str()), Some("v1.10.0"));
    }

    #[test]
    fn test_select_latest_tie_breaks_on_timestamp() {
        let tags = vec![tag("v1.2.0", 100), tag("1.2.0", 200), tag("v1.1.0", 300)];
        assert_eq!(select_latest(&tags).map(|t| t.name.as_str()), Some("1.2.0"));
    }

    #[test]
    fn test_select_latest_ignores_non_semver() {
        let tags = vec![tag("nightly", 900), tag("release-1", 800)];
        assert!(select_latest(&tags).is_none());
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("1.3.0", "1.2.0"));
        assert!(!is_newer("1.2.0", "1.2.0"));
        assert!(!is_newer("1.1.0", "1.2.0"));
        assert!(is_newer("1.2.0", "1.2.0-beta.1"));
        assert!(is_newer("main-2", "main-1"));
    }

    #[tokio::test]
    async fn test_resolve_short_name_through_catalog() {
        let source = FixtureSource::new();
        source.add_component_version("weather", "1.0.0");
        source.add_component_version("weather", "v1.1.0");
        let mut catalog = BTreeMap::new();
        catalog.insert("weather".to_string(), "acme/weather".to_string());
        let resolver = ManifestResolver::new(source, catalog, Duration::from_secs(5));

        match resolver.resolve("weather").await {
            Ok(target) => {
                assert_eq!(target.name, "weather");
                assert_eq!(target.source, "https://github.com/acme/weather");
                assert_eq!(target.reference, "v1.1.0");
                assert_eq!(target.version, "1.1.0");
                assert!(!target.pinned);
            }
            Err(e) => panic!("resolve failed: {e}"),
        }

        match resolver.resolve("weather@1.0.0").await {
            Ok(target) => {
                assert_eq!(target.reference, "1.0.0");
                assert!(target.pinned);
            }
            Err(e) => panic!("pinned resolve failed: {e}"),
        }

        assert!(matches!(
            resolver.resolve("weather@3.0.0").await,
            Err(ComponentError::Fetch { .. })
        ));
        assert!(matches!(
            resolver.resolve("unknown").await,
            Err(ComponentError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_identifier_performs_no_lookup() {
        let source = FixtureSource::new();
        let resolver = ManifestResolver::new(source.clone(), BTreeMap::new(), Duration::from_secs(5));
        assert!(matches!(
            resolver.resolve("not a name").await,
            Err(ComponentError::InvalidIdentifier { .. })
        ));
        assert_eq!(source.lookups(), 0);
    }
}
