//! Schema-version range matching.
//!
//! Ranges cover plain `X.Y.Z` versions only; prereleases and build
//! metadata are rejected. Supported operators:
//!
//! - exact `X.Y.Z`
//! - `^X.Y.Z` -- same major, `(minor, patch)` at or above the given pair
//! - `~X.Y.Z` -- same major and minor, patch at or above
//! - `>=`, `>`, `<=`, `<` comparators
//!
//! Anything else is a [`SchemaError::UnsupportedRange`].

use semver::Version;
use tako_types::error::SchemaError;

/// Parse a plain `X.Y.Z` version, rejecting prerelease/build suffixes.
pub fn parse_version(text: &str) -> Result<Version, SchemaError> {
    let version = Version::parse(text.trim()).map_err(|e| SchemaError::InvalidVersion {
        version: text.to_string(),
        reason: e.to_string(),
    })?;
    if !version.pre.is_empty() || !version.build.is_empty() {
        return Err(SchemaError::InvalidVersion {
            version: text.to_string(),
            reason: "prerelease and build metadata are not supported".to_string(),
        });
    }
    Ok(version)
}

/// Whether `version` satisfies `range`.
pub fn version_matches(range: &str, version: &str) -> Result<bool, SchemaError> {
    let range = range.trim();
    let candidate = parse_version(version)?;

    if let Some(rest) = range.strip_prefix('^') {
        let base = parse_version(rest)?;
        return Ok(candidate.major == base.major
            && (candidate.minor, candidate.patch) >= (base.minor, base.patch));
    }
    if let Some(rest) = range.strip_prefix('~') {
        let base = parse_version(rest)?;
        return Ok(candidate.major == base.major
            && candidate.minor == base.minor
            && candidate.patch >= base.patch);
    }
    if let Some(rest) = range.strip_prefix(">=") {
        return Ok(candidate >= parse_version(rest)?);
    }
    if let Some(rest) = range.strip_prefix("<=") {
        return Ok(candidate <= parse_version(rest)?);
    }
    if let Some(rest) = range.strip_prefix('>') {
        return Ok(candidate > parse_version(rest)?);
    }
    if let Some(rest) = range.strip_prefix('<') {
        return Ok(candidate < parse_version(rest)?);
    }

    // Exact match. A malformed range (e.g. "=>1.0.0", "1.x") surfaces as
    // UnsupportedRange rather than InvalidVersion.
    match parse_version(range) {
        Ok(exact) => Ok(candidate == exact),
        Err(_) => Err(SchemaError::UnsupportedRange(range.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caret_same_major_at_or_above() {
        assert!(version_matches("^1.2.3", "1.2.3").unwrap());
        assert!(version_matches("^1.2.3", "1.3.0").unwrap());
        assert!(version_matches("^1.2.3", "1.2.9").unwrap());
        assert!(!version_matches("^1.2.3", "2.0.0").unwrap());
        assert!(!version_matches("^1.2.3", "1.1.9").unwrap());
    }

    #[test]
    fn tilde_same_major_minor() {
        assert!(version_matches("~1.2.3", "1.2.3").unwrap());
        assert!(version_matches("~1.2.3", "1.2.5").unwrap());
        assert!(!version_matches("~1.2.3", "1.3.0").unwrap());
        assert!(!version_matches("~1.2.3", "1.2.2").unwrap());
    }

    #[test]
    fn exact_rejects_all_but_itself() {
        assert!(version_matches("1.2.3", "1.2.3").unwrap());
        assert!(!version_matches("1.2.3", "1.2.4").unwrap());
        assert!(!version_matches("1.2.3", "1.2.2").unwrap());
    }

    #[test]
    fn comparators() {
        assert!(version_matches(">=1.2.0", "1.2.0").unwrap());
        assert!(version_matches(">=1.2.0", "2.0.0").unwrap());
        assert!(!version_matches(">=1.2.0", "1.1.9").unwrap());

        assert!(version_matches(">1.2.0", "1.2.1").unwrap());
        assert!(!version_matches(">1.2.0", "1.2.0").unwrap());

        assert!(version_matches("<=1.2.0", "1.2.0").unwrap());
        assert!(!version_matches("<=1.2.0", "1.2.1").unwrap());

        assert!(version_matches("<2.0.0", "1.9.9").unwrap());
        assert!(!version_matches("<2.0.0", "2.0.0").unwrap());
    }

    #[test]
    fn unsupported_syntax_is_schema_error() {
        for bad in ["=>1.0.0", "1.x", "*", "^1.2", "1.0.0 - 2.0.0", ""] {
            let err = version_matches(bad, "1.0.0").unwrap_err();
            match err {
                SchemaError::UnsupportedRange(_) | SchemaError::InvalidVersion { .. } => {}
            }
        }
    }

    #[test]
    fn prerelease_versions_rejected() {
        assert!(parse_version("1.2.3-rc.1").is_err());
        assert!(parse_version("1.2.3+build5").is_err());
        assert!(version_matches("^1.0.0", "1.2.3-rc.1").is_err());
    }

    #[test]
    fn seed_scenario_semver_filter() {
        // Event schema 1.2.0: ^1.1.0 matches, ~1.1.0 does not.
        assert!(version_matches("^1.1.0", "1.2.0").unwrap());
        assert!(!version_matches("~1.1.0", "1.2.0").unwrap());
    }
}
